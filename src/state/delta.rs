//! StateDelta：状态仓库唯一接受的变更单元
//!
//! 类型即边界：字段全私有，构造函数是 pub(crate) 的 `seal`，
//! 只有本 crate 内走完策略与审批流程的编排路径能铸出实例；
//! 模型与工具层拿到的始终是提议类型，不存在把提议直接塞进仓库的写法。

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{RunId, TickId};

/// 当前 delta 持久化格式版本；未知版本一律拒绝
pub const DELTA_SCHEMA_VERSION: u16 = 1;

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// 落盘与传输共用的结构；vector_payload 以 base64 编码
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateDelta {
    schema_version: u16,
    timestamp: DateTime<Utc>,
    tick_index: u64,
    run_id: RunId,
    subsystem: String,
    phase: String,
    entropy: f64,
    tags: BTreeMap<String, String>,
    #[serde(with = "b64")]
    vector_payload: Vec<u8>,
    entry_id: String,
}

impl StateDelta {
    /// 铸造一个已授权的 delta；仅供编排器在审批完成后调用
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn seal(
        run_id: RunId,
        tick: TickId,
        subsystem: impl Into<String>,
        phase: impl Into<String>,
        entropy: f64,
        tags: BTreeMap<String, String>,
        vector_payload: Vec<u8>,
    ) -> Self {
        Self {
            schema_version: DELTA_SCHEMA_VERSION,
            timestamp: Utc::now(),
            tick_index: tick.0,
            run_id,
            subsystem: subsystem.into(),
            phase: phase.into(),
            entropy,
            tags,
            vector_payload,
            entry_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn schema_version(&self) -> u16 {
        self.schema_version
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn tick_index(&self) -> u64 {
        self.tick_index
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn entropy(&self) -> f64 {
        self.entropy
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn payload_len(&self) -> usize {
        self.vector_payload.len()
    }

    /// 测试与回放校验专用：绕过铸造流程直接反序列化出的实例仍会被 apply 的校验拦住
    #[cfg(test)]
    pub(crate) fn set_schema_version(&mut self, v: u16) {
        self.schema_version = v;
    }
}

/// 把任意 JSON 摘要编码为 payload 字节（规范化后 UTF-8）
pub fn encode_payload(summary: &serde_json::Value) -> Vec<u8> {
    crate::audit::codec::canonical_json_bytes(summary).unwrap_or_default()
}

/// 便于人读的 payload base64 预览（审计与调试用）
pub fn payload_preview(bytes: &[u8], max: usize) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    if encoded.len() > max {
        format!("{}...", &encoded[..max])
    } else {
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_fills_version_and_entry_id() {
        let d = StateDelta::seal(
            RunId::new(),
            TickId(1),
            "identity",
            "lint_fix",
            0.0,
            BTreeMap::new(),
            b"payload".to_vec(),
        );
        assert_eq!(d.schema_version(), DELTA_SCHEMA_VERSION);
        assert!(!d.entry_id().is_empty());
        assert_eq!(d.payload_len(), 7);
    }

    #[test]
    fn test_serde_roundtrip_keeps_payload() {
        let d = StateDelta::seal(
            RunId::new(),
            TickId(2),
            "trajectory",
            "task",
            0.5,
            BTreeMap::from([("k".to_string(), "v".to_string())]),
            vec![1, 2, 3, 255],
        );
        let json = serde_json::to_string(&d).unwrap();
        // vector_payload 字段必须是 base64 字符串
        let raw: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(raw["vector_payload"].is_string());

        let back: StateDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload_len(), 4);
        assert_eq!(back.tags()["k"], "v");
    }
}
