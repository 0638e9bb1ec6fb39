//! 工件仓库
//!
//! 工具结果与 diff 以规范化字节落盘，按 "sha256:<hex>" 寻址。
//! 审计事件与情景记忆只携带工件引用，不内联大块内容。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::codec::{canonical_json_bytes, sha256_bytes};

/// 工件引用：哈希为主键，kind 为提示性标签
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub bytes: u64,
}

/// runtime/artifacts 下的内容寻址存储
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            root: runtime_root.into().join("artifacts"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, category: &str, kind: &str, data: &[u8]) -> std::io::Result<ArtifactRef> {
        let hash = sha256_bytes(data);
        let dir = self.root.join(category);
        std::fs::create_dir_all(&dir)?;
        // 文件名取哈希 hex 部分，内容寻址天然幂等
        let name = hash.trim_start_matches("sha256:");
        std::fs::write(dir.join(name), data)?;
        Ok(ArtifactRef {
            hash,
            kind: Some(kind.to_string()),
            bytes: data.len() as u64,
        })
    }

    /// 存一份规范化 JSON 工件
    pub fn put_json(
        &self,
        category: &str,
        kind: &str,
        value: &impl Serialize,
    ) -> std::io::Result<ArtifactRef> {
        let bytes = canonical_json_bytes(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.write(category, kind, &bytes)
    }

    /// 存一份文本工件（diff 等）
    pub fn put_text(&self, category: &str, kind: &str, text: &str) -> std::io::Result<ArtifactRef> {
        self.write(category, kind, text.as_bytes())
    }

    /// 按引用读回原始字节
    pub fn get(&self, category: &str, artifact: &ArtifactRef) -> std::io::Result<Vec<u8>> {
        let name = artifact.hash.trim_start_matches("sha256:");
        std::fs::read(self.root.join(category).join(name))
    }
}
