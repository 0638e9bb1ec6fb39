//! 状态仓库适配器
//!
//! 长期身份/目标存储的唯一入口。`apply` 先验 schema_version 与必填字段，
//! 再与审计日志交叉核对（delta 必须对应一次已审计的授权变更），最后按子系统
//! 串行落盘。绕过适配器没有第二条写入路径。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::audit::codec::canonical_json_bytes;
use crate::audit::{AuditKind, AuditLog};
use crate::core::error::ControlError;
use crate::core::types::RunId;
use crate::state::delta::{StateDelta, DELTA_SCHEMA_VERSION};

/// apply 成功的回执
#[derive(Clone, Debug, Serialize)]
pub struct StateAck {
    pub entry_id: String,
    pub subsystem: String,
    pub entries_in_subsystem: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepoFile {
    version: u16,
    #[serde(default)]
    subsystems: BTreeMap<String, Vec<StateDelta>>,
}

pub struct StateRepository {
    path: PathBuf,
    audit: Arc<AuditLog>,
    state: Mutex<RepoFile>,
    /// 子系统级写锁：不同子系统可并行，同一子系统严格按申请顺序
    subsystem_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateRepository {
    /// 打开（或初始化）状态文件
    pub fn open(runtime_root: impl AsRef<Path>, audit: Arc<AuditLog>) -> Result<Self, ControlError> {
        let path = runtime_root.as_ref().join("state").join("state.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                RepoFile {
                    version: DELTA_SCHEMA_VERSION,
                    subsystems: BTreeMap::new(),
                }
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| ControlError::StateDeltaRejected(format!("corrupt state file: {e}")))?
            }
        } else {
            RepoFile {
                version: DELTA_SCHEMA_VERSION,
                subsystems: BTreeMap::new(),
            }
        };
        Ok(Self {
            path,
            audit,
            state: Mutex::new(state),
            subsystem_locks: Mutex::new(HashMap::new()),
        })
    }

    fn subsystem_lock(&self, subsystem: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .subsystem_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(subsystem.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 应用一个 delta。拒绝即错误返回，绝不部分写入。
    pub fn apply(&self, delta: StateDelta) -> Result<StateAck, ControlError> {
        if delta.schema_version() != DELTA_SCHEMA_VERSION {
            return Err(ControlError::StateDeltaRejected(format!(
                "unknown schema_version {}",
                delta.schema_version()
            )));
        }
        if delta.subsystem().trim().is_empty() {
            return Err(ControlError::StateDeltaRejected("empty subsystem".into()));
        }
        if delta.phase().trim().is_empty() {
            return Err(ControlError::StateDeltaRejected("empty phase".into()));
        }

        // 交叉核对：日志里必须存在该 Run，且出现过放行的策略评估。
        // 仓库可能滞后于日志，反过来绝不允许。
        let events = self.audit.replay(delta.run_id())?;
        if events.is_empty() {
            return Err(ControlError::StateDeltaRejected(format!(
                "no audit trail for run {}",
                delta.run_id()
            )));
        }
        let authorized = events.iter().any(|e| {
            e.kind == AuditKind::PolicyEvaluated
                && e.payload.get("allow").and_then(|v| v.as_bool()) == Some(true)
        });
        if !authorized {
            return Err(ControlError::StateDeltaRejected(format!(
                "run {} has no allowed policy evaluation on record",
                delta.run_id()
            )));
        }

        let subsystem = delta.subsystem().to_string();
        let lock = self.subsystem_lock(&subsystem);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry_id = delta.entry_id().to_string();
        let entries = state.subsystems.entry(subsystem.clone()).or_default();
        entries.push(delta);
        let count = entries.len();

        let bytes = canonical_json_bytes(&*state)
            .map_err(|e| ControlError::StateDeltaRejected(format!("serialize state: {e}")))?;
        std::fs::write(&self.path, bytes)?;

        tracing::info!(subsystem = %subsystem, entry_id = %entry_id, "state delta applied");
        Ok(StateAck {
            entry_id,
            subsystem,
            entries_in_subsystem: count,
        })
    }

    /// 某子系统的已提交条目数
    pub fn entry_count(&self, subsystem: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subsystems
            .get(subsystem)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// 全仓库的已提交条目总数
    pub fn total_entries(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subsystems
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// 出现过条目的 run 列表（去重），供启动时与日志交叉核对
    pub fn committed_runs(&self) -> Vec<RunId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = BTreeMap::new();
        for entries in state.subsystems.values() {
            for d in entries {
                seen.entry(d.run_id().0.clone()).or_insert(());
            }
        }
        seen.into_keys().map(RunId).collect()
    }

    /// 指定 run 的条目（按提交顺序）
    pub fn entries_for_run(&self, run_id: &RunId) -> Vec<StateDelta> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .subsystems
            .values()
            .flat_map(|v| v.iter())
            .filter(|d| d.run_id() == run_id)
            .cloned()
            .collect()
    }
}
