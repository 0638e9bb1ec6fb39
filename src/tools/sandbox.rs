//! 沙箱：路径圈禁与能力清单
//!
//! 所有文件系统访问先经 `Sandbox::resolve` 归一化并确认仍在 workspace 根之下；
//! 网络与子进程属于能力清单项，工具声明了才有，声明了还要过策略。

use std::path::{Path, PathBuf};

/// 工具声明的能力清单；默认全关，choke point 按清单核对实际风险类别
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Capabilities {
    pub fs_read: bool,
    pub fs_write: bool,
    pub subprocess: bool,
    pub network: bool,
}

impl Capabilities {
    pub fn read_only_fs() -> Self {
        Self {
            fs_read: true,
            ..Self::default()
        }
    }

    pub fn fs_write() -> Self {
        Self {
            fs_read: true,
            fs_write: true,
            ..Self::default()
        }
    }

    pub fn subprocess() -> Self {
        Self {
            fs_read: true,
            subprocess: true,
            ..Self::default()
        }
    }

    pub fn network() -> Self {
        Self {
            network: true,
            ..Self::default()
        }
    }
}

/// workspace 根下的受限文件系统视图
#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 将相对路径解析到沙箱根之下；任何逃逸（.. 或符号链接指向外部）都拒绝
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, String> {
        if rel.is_empty() {
            return Err("empty path".to_string());
        }
        let candidate = self.root.join(rel);

        // 先对已存在的最深祖先做 canonicalize，避免目标不存在时无法归一化
        let mut existing = candidate.clone();
        while !existing.exists() {
            match existing.parent() {
                Some(p) => existing = p.to_path_buf(),
                None => return Err(format!("path escapes workspace: {rel}")),
            }
        }
        let canon = existing
            .canonicalize()
            .map_err(|e| format!("cannot resolve {rel}: {e}"))?;
        if !canon.starts_with(&self.root) {
            return Err(format!("path escapes workspace: {rel}"));
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inside_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let sb = Sandbox::new(dir.path());
        let p = sb.resolve("a.txt").unwrap();
        assert!(p.ends_with("a.txt"));
    }

    #[test]
    fn test_resolve_rejects_parent_escape() {
        let dir = tempfile::TempDir::new().unwrap();
        let sb = Sandbox::new(dir.path());
        assert!(sb.resolve("../outside.txt").is_err());
        assert!(sb.resolve("a/../../outside.txt").is_err());
    }

    #[test]
    fn test_resolve_allows_missing_leaf() {
        let dir = tempfile::TempDir::new().unwrap();
        let sb = Sandbox::new(dir.path());
        // 目标不存在但仍在根下，应允许（写入类工具需要）
        assert!(sb.resolve("new_dir/new_file.txt").is_ok());
    }

    #[test]
    fn test_capabilities_defaults_closed() {
        let caps = Capabilities::default();
        assert!(!caps.fs_read && !caps.fs_write && !caps.subprocess && !caps.network);
    }
}
