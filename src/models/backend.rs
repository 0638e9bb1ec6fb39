//! 规划后端抽象
//!
//! 后端只见结构化的 PlanContext，不接收任何身份或人格文本；
//! 产出 PlanProposal，由控制面校验、门控、执行。

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::error::ControlError;
use crate::core::types::{ObservationEvent, PlanProposal, RunId, TickId};

/// 传给后端的结构化上下文
#[derive(Clone, Debug, Serialize)]
pub struct PlanContext {
    pub run_id: RunId,
    pub tick: TickId,
    pub intent: String,
    pub observations: Vec<ObservationEvent>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// 可用工具的 schema 表
    pub tool_schemas: serde_json::Value,
    /// 工作记忆摘录（已脱敏的结构化片段）
    pub memory_hints: Vec<String>,
}

/// 规划后端：一次 propose 对应一次模型调用
#[async_trait]
pub trait PlanBackend: Send + Sync {
    /// 后端种类名（null / openai_compat）
    fn kind(&self) -> &str;

    async fn propose(&self, ctx: &PlanContext) -> Result<PlanProposal, ControlError>;
}
