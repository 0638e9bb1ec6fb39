//! 控制面错误类型与重试分类
//!
//! SchemaInvalid / PolicyDenied 永不重试，直接带原因上抛；
//! ToolExecutionFailed 按 transient / permanent 分类，仅 transient 在有限次数内指数退避重试。

use thiserror::Error;

use crate::audit::log::AuditLogError;

/// 工具失败分类：决定是否进入退避重试
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// 控制面错误全集
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("policy denied: {}", reasons.join("; "))]
    PolicyDenied { reasons: Vec<String> },

    #[error("approval timed out after {window_secs}s")]
    ApprovalTimeout { window_secs: u64 },

    #[error("approval denied: {0}")]
    ApprovalDenied(String),

    #[error("tool execution failed: {message}")]
    ToolExecutionFailed {
        class: FailureClass,
        message: String,
    },

    #[error("state delta rejected: {0}")]
    StateDeltaRejected(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("audit replay mismatch: {0}")]
    AuditReplayMismatch(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("audit log error: {0}")]
    Audit(#[from] AuditLogError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// 仅 transient 工具失败可重试；策略与 schema 类错误一律不重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::ToolExecutionFailed {
                class: FailureClass::Transient,
                ..
            }
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ControlError::ToolExecutionFailed {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ControlError::ToolExecutionFailed {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// 面向调用方的原因文本：来自策略规则名或错误摘要，绝不携带原始堆栈
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// 第 attempt 次重试前的退避时长（attempt 从 1 计，指数增长，封顶 30s）
pub fn backoff_delay(attempt: u32, base_ms: u64) -> std::time::Duration {
    let factor = 1u64 << attempt.min(10);
    std::time::Duration::from_millis((base_ms.saturating_mul(factor)).min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ControlError::transient("connection reset").is_transient());
        assert!(!ControlError::permanent("file missing").is_transient());
        assert!(!ControlError::PolicyDenied {
            reasons: vec!["exec_denied_by_default".into()]
        }
        .is_transient());
        assert!(!ControlError::SchemaInvalid("missing path".into()).is_transient());
    }

    #[test]
    fn test_policy_denied_reason_is_readable() {
        let e = ControlError::PolicyDenied {
            reasons: vec!["network_denied_by_default".into(), "unknown_tool".into()],
        };
        let msg = e.reason();
        assert!(msg.contains("network_denied_by_default"));
        assert!(msg.contains("unknown_tool"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = 100;
        assert!(backoff_delay(1, base) < backoff_delay(2, base));
        assert!(backoff_delay(2, base) < backoff_delay(3, base));
        assert_eq!(backoff_delay(30, base).as_millis(), 30_000);
    }
}
