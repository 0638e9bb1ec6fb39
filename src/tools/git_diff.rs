//! 只读 git 工具：git.diff

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::policy::RiskClass;
use crate::tools::registry::Tool;
use crate::tools::sandbox::{Capabilities, Sandbox};

/// 在 workspace 内执行 git diff --no-color，可选 pathspec 限定
pub struct GitDiffTool {
    sandbox: Sandbox,
}

impl GitDiffTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git.diff"
    }

    fn description(&self) -> &str {
        "Show the uncommitted unified diff of the workspace. Args: optional paths array."
    }

    fn risk(&self) -> RiskClass {
        RiskClass::Read
    }

    fn capabilities(&self) -> Capabilities {
        // 需要起 git 子进程，但语义只读
        Capabilities {
            fs_read: true,
            subprocess: true,
            ..Capabilities::default()
        }
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "paths": {"type": "array", "items": {"type": "string"}}
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let paths: Vec<String> = args
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut cmd = Command::new("git");
        cmd.current_dir(self.sandbox.root())
            .args(["diff", "--no-color"]);
        if !paths.is_empty() {
            cmd.arg("--");
            cmd.args(&paths);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("git diff failed to start: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("git diff failed: {}", stderr.trim()));
        }
        Ok(serde_json::json!({
            "diff": String::from_utf8_lossy(&output.stdout),
        }))
    }
}
