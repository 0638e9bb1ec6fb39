//! 只读文件工具：fs.read_file

use async_trait::async_trait;
use serde_json::Value;

use crate::policy::RiskClass;
use crate::tools::registry::Tool;
use crate::tools::sandbox::{Capabilities, Sandbox};

const DEFAULT_MAX_BYTES: u64 = 1_000_000;

/// 读取 workspace 内的文本文件，超过 max_bytes 拒绝
pub struct FsReadTool {
    sandbox: Sandbox,
}

impl FsReadTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs.read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file inside the workspace. Args: path, optional max_bytes."
    }

    fn risk(&self) -> RiskClass {
        RiskClass::Read
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only_fs()
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "workspace-relative path"},
                "max_bytes": {"type": "integer"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let rel = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing path".to_string())?;
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_BYTES);

        let path = self.sandbox.resolve(rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| format!("stat {rel}: {e}"))?;
        if !meta.is_file() {
            return Err(format!("not a file: {rel}"));
        }
        if meta.len() > max_bytes {
            return Err(format!("file too large: {} > {max_bytes}", meta.len()));
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("read {rel}: {e}"))?;
        Ok(serde_json::json!({
            "path": rel,
            "size": meta.len(),
            "text": text,
        }))
    }
}
