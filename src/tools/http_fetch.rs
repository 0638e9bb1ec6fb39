//! 网络工具：http.fetch
//!
//! NETWORK 风险类，默认被策略关死。放行后也只允许域名白名单内的 https GET，
//! 结果截断到 max_result_chars。网络错误按 transient 上报，走退避重试。

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::policy::RiskClass;
use crate::tools::registry::Tool;
use crate::tools::sandbox::Capabilities;

pub struct HttpFetchTool {
    allowed_domains: Vec<String>,
    timeout_secs: u64,
    max_result_chars: usize,
}

impl HttpFetchTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        Self {
            allowed_domains,
            timeout_secs,
            max_result_chars,
        }
    }

    fn check_url(&self, url: &str) -> Result<(), String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("bad url: {e}"))?;
        if parsed.scheme() != "https" {
            return Err("only https urls are allowed".to_string());
        }
        let host = parsed.host_str().unwrap_or("");
        if !self.allowed_domains.iter().any(|d| d == host) {
            return Err(format!("domain '{host}' not in allowlist"));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http.fetch"
    }

    fn description(&self) -> &str {
        "Fetch an https URL from the domain allowlist. Args: url."
    }

    fn risk(&self) -> RiskClass {
        RiskClass::Network
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::network()
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing url".to_string())?;
        self.check_url(url)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| format!("client build: {e}"))?;

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("transient: fetch failed: {e}"))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("transient: read body: {e}"))?;

        let truncated = body.len() > self.max_result_chars;
        let text: String = body.chars().take(self.max_result_chars).collect();
        Ok(serde_json::json!({
            "url": url,
            "status": status,
            "truncated": truncated,
            "text": text,
        }))
    }
}
