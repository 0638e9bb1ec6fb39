//! 审计层：规范化编码、事件类型、追加式日志与回放恢复

pub mod codec;
pub mod events;
pub mod log;
pub mod replay;

pub use events::{AuditEvent, AuditKind, AUDIT_SCHEMA_VERSION};
pub use log::{verify_file, AuditLog, AuditLogError, AuditRecord};
pub use replay::{cross_check, recover, replay_all, replay_run, RecoveredRun, ReplaySummary};
