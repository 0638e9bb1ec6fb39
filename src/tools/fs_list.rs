//! 只读目录工具：fs.list_dir

use async_trait::async_trait;
use serde_json::Value;

use crate::policy::RiskClass;
use crate::tools::registry::Tool;
use crate::tools::sandbox::{Capabilities, Sandbox};

/// 列出 workspace 内目录，按名称排序保证输出确定
pub struct FsListTool {
    sandbox: Sandbox,
}

impl FsListTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for FsListTool {
    fn name(&self) -> &str {
        "fs.list_dir"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory. Args: optional path (default '.')."
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
                "path": {"type": "string"}
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let rel = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let path = self.sandbox.resolve(rel)?;

        let mut read_dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("list {rel}: {e}"))?;
        let mut items = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| format!("list {rel}: {e}"))?
        {
            let file_type = entry.file_type().await.map_err(|e| e.to_string())?;
            items.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": file_type.is_dir(),
                "is_file": file_type.is_file(),
            }));
        }
        items.sort_by_key(|v| v["name"].as_str().unwrap_or("").to_string());
        Ok(serde_json::json!({"path": rel, "items": items}))
    }
}
