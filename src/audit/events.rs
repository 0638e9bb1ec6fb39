//! 审计事件类型
//!
//! kind 是闭集枚举；payload 为已脱敏的结构化 JSON。序列化后的 kind 字符串
//! （"RunStarted" 等）是日志文件与回放工具共同依赖的稳定契约。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{RunId, TickId};

pub const AUDIT_SCHEMA_VERSION: u8 = 1;

/// 审计事件种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    RunStarted,
    PlanProposed,
    PolicyEvaluated,
    ApprovalGranted,
    ApprovalDenied,
    ApprovalTimeout,
    ToolExecuted,
    StateDeltaRejected,
    RunCompleted,
    RunFailed,
    RunCancelled,
    RunRolledBack,
}

impl AuditKind {
    /// 是否为 Run 的终止事件（其后仅允许 RunRolledBack）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuditKind::RunCompleted | AuditKind::RunFailed | AuditKind::RunCancelled
        )
    }

    /// 是否为一次变更尝试的记录（choke point 对每次受审批调用恰好追加一条）
    pub fn is_mutation_attempt(&self) -> bool {
        matches!(
            self,
            AuditKind::ApprovalGranted | AuditKind::ApprovalDenied | AuditKind::ApprovalTimeout
        )
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 单条审计事件；seq 与链哈希由日志层包裹（见 log.rs 的 AuditRecord）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub schema_version: u8,
    pub run_id: RunId,
    pub tick: TickId,
    pub ts: DateTime<Utc>,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(run_id: RunId, tick: TickId, kind: AuditKind, payload: serde_json::Value) -> Self {
        Self {
            schema_version: AUDIT_SCHEMA_VERSION,
            run_id,
            tick,
            ts: Utc::now(),
            kind,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_is_stable() {
        let s = serde_json::to_string(&AuditKind::RunStarted).unwrap();
        assert_eq!(s, "\"RunStarted\"");
        let k: AuditKind = serde_json::from_str("\"ApprovalTimeout\"").unwrap();
        assert_eq!(k, AuditKind::ApprovalTimeout);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(AuditKind::RunCompleted.is_terminal());
        assert!(AuditKind::RunFailed.is_terminal());
        assert!(AuditKind::RunCancelled.is_terminal());
        assert!(!AuditKind::RunRolledBack.is_terminal());
        assert!(!AuditKind::PolicyEvaluated.is_terminal());
    }
}
