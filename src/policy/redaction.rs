//! 脱敏规则
//!
//! 任何进入审计日志或持久层的 payload 先经过这里；规则是确定性的字符串替换，
//! 同样的输入永远得到同样的输出（回放校验依赖这一点）。

use std::sync::OnceLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

fn patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // api_key = "..." / api-key: '...'
            r#"(?i)api[_-]?key\s*[:=]\s*['"][^'"]+['"]"#,
            r#"(?i)authorization\s*[:=]\s*['"][^'"]+['"]"#,
            // Bearer 头
            r#"(?i)bearer\s+[A-Za-z0-9._\-]{16,}"#,
            // OpenAI 风格密钥
            r#"(?i)sk-[A-Za-z0-9]{20,}"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 对单个字符串应用全部脱敏规则
pub fn redact_text(s: &str) -> String {
    let mut out = s.to_string();
    for pat in patterns() {
        out = pat.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// 递归脱敏 JSON：字符串走 redact_text，容器递归，其余原样保留
pub fn redact_value(v: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::String(s) => Value::String(redact_text(s)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_api_key_assignment() {
        let s = r#"api_key = "super-secret-value""#;
        assert_eq!(redact_text(s), REDACTED);
    }

    #[test]
    fn test_redact_sk_token() {
        let s = "using sk-abcdefghijklmnopqrstuvwx for auth";
        let out = redact_text(s);
        assert!(!out.contains("sk-abcdefghijklmnopqrstuvwx"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_redact_value_walks_nested() {
        let v = serde_json::json!({
            "outer": {
                "secret": "authorization: 'abc123'",
                "n": 42
            },
            "list": ["plain", "sk-abcdefghijklmnopqrstuvwxyz12"]
        });
        let out = redact_value(&v);
        assert_eq!(out["outer"]["n"], 42);
        assert!(out["outer"]["secret"].as_str().unwrap().contains(REDACTED));
        assert_eq!(out["list"][0], "plain");
        assert!(out["list"][1].as_str().unwrap().contains(REDACTED));
    }

    #[test]
    fn test_redaction_is_deterministic() {
        let s = "Authorization: 'tok_123456789' and sk-aaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(redact_text(s), redact_text(s));
    }
}
