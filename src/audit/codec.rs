//! 规范化 JSON 序列化与 SHA-256 哈希
//!
//! 审计链、工件引用与回放状态哈希都建立在「相同输入得到相同字节」之上：
//! 键按字典序排序、无空白、UTF-8。禁止 pretty print 后再哈希。

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// 序列化为规范 JSON 字节（通过 Value 往返强制键排序）
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// 返回规范 JSON 的 "sha256:<hex>"；序列化失败时退化为对错误信息哈希。
/// serde_json::Value 自身序列化不会失败，正常路径不会走到退化分支。
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> String {
    match canonical_json_bytes(value) {
        Ok(bytes) => sha256_bytes(&bytes),
        Err(e) => sha256_bytes(e.to_string().as_bytes()),
    }
}

/// 返回原始字节的 "sha256:<hex>"
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// 链式哈希的创世值
pub fn genesis_hash() -> String {
    format!("sha256:{}", "0".repeat(64))
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn test_canonical_hash_ignores_key_order() {
        let x = serde_json::json!({"b": 2, "a": 1});
        let y = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(sha256_canonical_json(&x), sha256_canonical_json(&y));
    }

    #[test]
    fn test_struct_and_value_agree() {
        let s = Obj { b: 2, a: 1 };
        let v = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(sha256_canonical_json(&s), sha256_canonical_json(&v));
    }

    #[test]
    fn test_genesis_hash_shape() {
        let g = genesis_hash();
        assert!(g.starts_with("sha256:"));
        assert_eq!(g.len(), "sha256:".len() + 64);
    }
}
