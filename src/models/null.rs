//! 确定性规划后端
//!
//! 无需任何外部服务：相同观察必然产出相同计划。用于测试、dry run，
//! 以及没有配置 API key 时的兜底路由。

use async_trait::async_trait;

use crate::core::error::ControlError;
use crate::core::types::{AgentType, PlanProposal, ToolCall};
use crate::models::backend::{PlanBackend, PlanContext};

#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait]
impl PlanBackend for NullBackend {
    fn kind(&self) -> &str {
        "null"
    }

    async fn propose(&self, ctx: &PlanContext) -> Result<PlanProposal, ControlError> {
        // 携带 diff 的任务：提议 diff-first 变更
        if let Some(diff) = ctx.metadata.get("diff").and_then(|v| v.as_str()) {
            let phase = if ctx.intent.to_lowercase().contains("lint") {
                "lint_fix"
            } else {
                "patch"
            };
            return Ok(PlanProposal {
                agent_type: AgentType::Planner,
                tool_calls: vec![ToolCall::new(
                    "git.apply_patch",
                    serde_json::json!({"diff": diff}),
                )],
                diff: Some(diff.to_string()),
                phase: Some(phase.to_string()),
                follow_ups: vec![],
                note: Some("apply provided diff".to_string()),
            });
        }

        // 观察里带 path：读它
        if let Some(path) = ctx
            .observations
            .iter()
            .find_map(|o| o.payload.get("path").and_then(|v| v.as_str()))
        {
            return Ok(PlanProposal {
                agent_type: AgentType::Planner,
                tool_calls: vec![ToolCall::new(
                    "fs.read_file",
                    serde_json::json!({"path": path}),
                )],
                diff: None,
                phase: Some("inspect".to_string()),
                follow_ups: vec![],
                note: Some("read observed file".to_string()),
            });
        }

        Ok(PlanProposal {
            agent_type: AgentType::Planner,
            tool_calls: vec![],
            diff: None,
            phase: Some("noop".to_string()),
            follow_ups: vec![],
            note: Some("no-op".to_string()),
        })
    }
}
