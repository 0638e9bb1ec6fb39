//! 策略层：纯函数决策引擎与脱敏规则

pub mod engine;
pub mod redaction;

pub use engine::{PlanDecision, PolicyConfig, PolicyDecision, PolicyEngine, PolicySnapshot, RiskClass};
pub use redaction::{redact_text, redact_value};
