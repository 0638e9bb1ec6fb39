//! 状态层：StateDelta 与仓库适配器

pub mod delta;
pub mod repo;

pub use delta::{encode_payload, payload_preview, StateDelta, DELTA_SCHEMA_VERSION};
pub use repo::{StateAck, StateRepository};
