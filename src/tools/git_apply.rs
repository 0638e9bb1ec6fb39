//! 变更工具：git.apply_patch
//!
//! 代码变更的唯一入口。只接受 unified diff 文本（diff-first），
//! 经 git apply --check 预检后才真正落盘；任何越出 workspace 的路径由 git 与沙箱双重拒绝。

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::policy::RiskClass;
use crate::tools::registry::Tool;
use crate::tools::sandbox::{Capabilities, Sandbox};

pub struct GitApplyTool {
    sandbox: Sandbox,
}

impl GitApplyTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    async fn run_apply(&self, diff: &str, check_only: bool) -> Result<(), String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(self.sandbox.root())
            .args(["apply", "--whitespace=nowarn"]);
        if check_only {
            cmd.arg("--check");
        }
        cmd.arg("-");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("git apply failed to start: {e}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(diff.as_bytes())
                .await
                .map_err(|e| format!("write diff: {e}"))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("git apply: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("git apply rejected diff: {}", stderr.trim()));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for GitApplyTool {
    fn name(&self) -> &str {
        "git.apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to the workspace. Args: diff (unified diff text)."
    }

    fn risk(&self) -> RiskClass {
        RiskClass::Write
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fs_read: true,
            fs_write: true,
            subprocess: true,
            ..Capabilities::default()
        }
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "diff": {"type": "string", "description": "unified diff text"}
            },
            "required": ["diff"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let diff = args
            .get("diff")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing diff".to_string())?;
        if diff.trim().is_empty() {
            return Err("empty diff".to_string());
        }

        self.run_apply(diff, true).await?;
        self.run_apply(diff, false).await?;

        let files_touched = diff
            .lines()
            .filter(|l| l.starts_with("+++ "))
            .count();
        Ok(serde_json::json!({
            "applied": true,
            "files_touched": files_touched,
            "diff_bytes": diff.len(),
        }))
    }
}
