//! 控制面核心数据类型
//!
//! 约定：模型产出（PlanProposal / ToolCall）只是「提议」，在通过策略与审批前不具备任何效力；
//! 所有 ID 采用 newtype + `#[serde(transparent)]`，避免 run_id / call_id 混用。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run 唯一 ID（uuid v4 simple 格式）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run 内的 tick 序号，从 1 开始
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickId(pub u64);

/// 单次工具调用 ID
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent 角色：路由表按此映射到具体模型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Planner,
    Executor,
    Critic,
    Summarizer,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Planner => "planner",
            AgentType::Executor => "executor",
            AgentType::Critic => "critic",
            AgentType::Summarizer => "summarizer",
        }
    }
}

/// 观察事件来源（闭集；feed 采集器在控制面之外）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Git,
    Fs,
    User,
    Workflow,
    Timer,
}

/// 观察事件：feed 产出，每个 Run tick 消费一次，不可变
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub source: ObservationSource,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// 可选的来源签名（由 feed 负责生成与校验）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ObservationEvent {
    pub fn now(source: ObservationSource, payload: serde_json::Value) -> Self {
        Self {
            source,
            timestamp: Utc::now(),
            payload,
            signature: None,
        }
    }
}

/// 外部任务请求：打开一个新 Run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub run_id: RunId,
    pub task_id: String,
    pub intent: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskRequest {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            intent: intent.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// 计划中的单次工具调用（提议态，未经校验）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: serde_json::Value,
    pub call_id: CallId,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            call_id: CallId::new(),
        }
    }
}

/// 模型产出的计划提议；在策略评估通过前不具备效力
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanProposal {
    pub agent_type: AgentType,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// 代码变更必须以 unified diff 形式提出（diff-first）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// 计划声明的阶段标签，最终落入 StateDelta.phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// 完成后派生的后续任务意图
    #[serde(default)]
    pub follow_ups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PlanProposal {
    /// 是否包含任何状态变更意图（diff 或非只读工具由策略层判定）
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.diff.is_none()
    }
}

/// 经过编排器绑定 run/tick 后的待执行调用；choke point 只接受这个类型
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub run_id: RunId,
    pub tick: TickId,
    pub call_id: CallId,
    pub tool: String,
    pub args: serde_json::Value,
}

impl ToolInvocation {
    pub fn from_call(run_id: &RunId, tick: TickId, call: &ToolCall) -> Self {
        Self {
            run_id: run_id.clone(),
            tick,
            call_id: call.call_id.clone(),
            tool: call.tool.clone(),
            args: call.args.clone(),
        }
    }

    /// 调用签名：对 (run_id, tool, args, call_id) 的规范化哈希。
    /// 策略决策与审批授权都绑定到这个签名，防止「先批 A 后执行 B」。
    pub fn signature(&self) -> String {
        crate::audit::codec::sha256_canonical_json(&serde_json::json!({
            "run_id": self.run_id,
            "tool": self.tool,
            "args": self.args,
            "call_id": self.call_id,
        }))
    }
}

/// 工具执行结果：结构化输出（工件引用），绝不承载自由对话文本
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub run_id: RunId,
    pub call_id: CallId,
    pub tool: String,
    pub ok: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// 一次 Run 的最终结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub ok: bool,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_signature_binds_args() {
        let run_id = RunId::new();
        let call = ToolCall::new("fs.read_file", serde_json::json!({"path": "a.txt"}));
        let inv = ToolInvocation::from_call(&run_id, TickId(1), &call);
        let sig1 = inv.signature();

        let mut other = inv.clone();
        other.args = serde_json::json!({"path": "b.txt"});
        assert_ne!(sig1, other.signature());

        // 同一调用重复计算签名必须稳定
        assert_eq!(sig1, inv.signature());
    }

    #[test]
    fn test_run_id_display_is_plain() {
        let id = RunId::new();
        assert_eq!(format!("{}", id), id.0);
    }
}
