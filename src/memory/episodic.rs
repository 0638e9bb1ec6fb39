//! 情景记忆：SQLite 持久化的任务史
//!
//! Run 进行中只追加（由持有该 Run 的编排器线程写入）；修改只有一条显式的
//! update_summary 路径，留给热路径之外的整理任务。记录的是结构化的
//! 工具/决策摘要与工件引用，原始对话文本不落库。

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::codec::sha256_canonical_json;
use crate::core::error::ControlError;
use crate::core::types::{RunId, TickId};
use crate::tools::store::ArtifactRef;

pub const EPISODE_SCHEMA_VERSION: u8 = 1;

/// 一条情景记录；hash 对除自身外的全部字段计算
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Episode {
    pub schema_version: u8,
    pub episode_id: Uuid,
    pub run_id: RunId,
    pub tick: TickId,
    pub tags: Vec<String>,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub hash: String,
}

#[derive(Serialize)]
struct EpisodeUnsigned<'a> {
    schema_version: u8,
    episode_id: &'a Uuid,
    run_id: &'a RunId,
    tick: TickId,
    tags: &'a [String],
    title: &'a str,
    summary: &'a str,
    artifacts: &'a [ArtifactRef],
    created_at: &'a DateTime<Utc>,
}

impl Episode {
    pub fn new(
        run_id: RunId,
        tick: TickId,
        tags: Vec<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
        artifacts: Vec<ArtifactRef>,
    ) -> Self {
        let episode_id = Uuid::new_v4();
        let title = title.into();
        let summary = summary.into();
        let created_at = Utc::now();
        let hash = sha256_canonical_json(&EpisodeUnsigned {
            schema_version: EPISODE_SCHEMA_VERSION,
            episode_id: &episode_id,
            run_id: &run_id,
            tick,
            tags: &tags,
            title: &title,
            summary: &summary,
            artifacts: &artifacts,
            created_at: &created_at,
        });
        Self {
            schema_version: EPISODE_SCHEMA_VERSION,
            episode_id,
            run_id,
            tick,
            tags,
            title,
            summary,
            artifacts,
            created_at,
            hash,
        }
    }

    /// 重算哈希并核对完整性
    pub fn verify_hash(&self) -> Result<(), ControlError> {
        let expected = sha256_canonical_json(&EpisodeUnsigned {
            schema_version: self.schema_version,
            episode_id: &self.episode_id,
            run_id: &self.run_id,
            tick: self.tick,
            tags: &self.tags,
            title: &self.title,
            summary: &self.summary,
            artifacts: &self.artifacts,
            created_at: &self.created_at,
        });
        if expected != self.hash {
            return Err(ControlError::AuditReplayMismatch(format!(
                "episode {} hash mismatch",
                self.episode_id
            )));
        }
        Ok(())
    }

    fn rehash(&mut self) {
        self.hash = sha256_canonical_json(&EpisodeUnsigned {
            schema_version: self.schema_version,
            episode_id: &self.episode_id,
            run_id: &self.run_id,
            tick: self.tick,
            tags: &self.tags,
            title: &self.title,
            summary: &self.summary,
            artifacts: &self.artifacts,
            created_at: &self.created_at,
        });
    }
}

/// 查询过滤条件
#[derive(Clone, Debug, Default)]
pub struct EpisodeQuery {
    pub run_id: Option<RunId>,
    pub tags_all: Vec<String>,
    pub since_tick: Option<TickId>,
    pub limit: usize,
}

pub struct EpisodeStore {
    conn: Mutex<Connection>,
}

impl EpisodeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| ControlError::permanent(format!("open episode store: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                 rowid_pk   INTEGER PRIMARY KEY AUTOINCREMENT,
                 episode_id TEXT NOT NULL UNIQUE,
                 run_id     TEXT NOT NULL,
                 tick       INTEGER NOT NULL,
                 body       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_episodes_run ON episodes(run_id);
             CREATE INDEX IF NOT EXISTS idx_episodes_tick ON episodes(tick);",
        )
        .map_err(|e| ControlError::permanent(format!("init episode store: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 追加一条情景；写入前校验哈希
    pub fn append(&self, episode: &Episode) -> Result<(), ControlError> {
        episode.verify_hash()?;
        let body = serde_json::to_string(episode)
            .map_err(|e| ControlError::permanent(format!("encode episode: {e}")))?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO episodes (episode_id, run_id, tick, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                episode.episode_id.to_string(),
                episode.run_id.0,
                episode.tick.0 as i64,
                body
            ],
        )
        .map_err(|e| ControlError::permanent(format!("insert episode: {e}")))?;
        Ok(())
    }

    /// 热路径之外的显式修改：替换摘要并重算哈希
    pub fn update_summary(
        &self,
        episode_id: &Uuid,
        new_summary: impl Into<String>,
    ) -> Result<(), ControlError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let body: String = conn
            .query_row(
                "SELECT body FROM episodes WHERE episode_id = ?1",
                params![episode_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| ControlError::permanent(format!("episode {episode_id} not found: {e}")))?;
        let mut episode: Episode = serde_json::from_str(&body)
            .map_err(|e| ControlError::permanent(format!("decode episode: {e}")))?;
        episode.summary = new_summary.into();
        episode.rehash();
        let body = serde_json::to_string(&episode)
            .map_err(|e| ControlError::permanent(format!("encode episode: {e}")))?;
        conn.execute(
            "UPDATE episodes SET body = ?1 WHERE episode_id = ?2",
            params![body, episode_id.to_string()],
        )
        .map_err(|e| ControlError::permanent(format!("update episode: {e}")))?;
        Ok(())
    }

    /// 确定性查询：tick 升序、同 tick 按插入顺序
    pub fn query(&self, q: &EpisodeQuery) -> Result<Vec<Episode>, ControlError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT body FROM episodes ORDER BY tick ASC, rowid_pk ASC")
            .map_err(|e| ControlError::permanent(format!("query episodes: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ControlError::permanent(format!("query episodes: {e}")))?;

        let mut out = Vec::new();
        for body in rows {
            let body = body.map_err(|e| ControlError::permanent(format!("row: {e}")))?;
            let ep: Episode = serde_json::from_str(&body)
                .map_err(|e| ControlError::permanent(format!("decode episode: {e}")))?;
            if let Some(run_id) = &q.run_id {
                if &ep.run_id != run_id {
                    continue;
                }
            }
            if let Some(since) = q.since_tick {
                if ep.tick < since {
                    continue;
                }
            }
            if !q.tags_all.iter().all(|t| ep.tags.contains(t)) {
                continue;
            }
            ep.verify_hash()?;
            out.push(ep);
            if q.limit > 0 && out.len() >= q.limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize, ControlError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))
            .map_err(|e| ControlError::permanent(format!("count episodes: {e}")))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, EpisodeStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EpisodeStore::open(dir.path().join("episodes.db")).unwrap();
        (dir, store)
    }

    fn episode(run: &RunId, tick: u64, tags: &[&str]) -> Episode {
        Episode::new(
            run.clone(),
            TickId(tick),
            tags.iter().map(|s| s.to_string()).collect(),
            format!("tick{tick}"),
            "summary",
            vec![],
        )
    }

    #[test]
    fn test_append_and_query_ordered() {
        let (_dir, store) = store();
        let run = RunId::new();
        store.append(&episode(&run, 2, &["role:planner"])).unwrap();
        store.append(&episode(&run, 1, &["role:planner"])).unwrap();

        let out = store
            .query(&EpisodeQuery {
                run_id: Some(run.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].tick <= out[1].tick);
    }

    #[test]
    fn test_tag_filter_requires_all() {
        let (_dir, store) = store();
        let run = RunId::new();
        store.append(&episode(&run, 1, &["a", "b"])).unwrap();
        store.append(&episode(&run, 2, &["a"])).unwrap();

        let out = store
            .query(&EpisodeQuery {
                tags_all: vec!["a".into(), "b".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tick, TickId(1));
    }

    #[test]
    fn test_update_summary_rehashes() {
        let (_dir, store) = store();
        let run = RunId::new();
        let ep = episode(&run, 1, &[]);
        let id = ep.episode_id;
        let old_hash = ep.hash.clone();
        store.append(&ep).unwrap();

        store.update_summary(&id, "refined summary").unwrap();
        let out = store
            .query(&EpisodeQuery {
                run_id: Some(run),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out[0].summary, "refined summary");
        assert_ne!(out[0].hash, old_hash);
        out[0].verify_hash().unwrap();
    }

    #[test]
    fn test_tampered_episode_fails_verification() {
        let run = RunId::new();
        let mut ep = episode(&run, 1, &[]);
        ep.summary = "tampered".to_string();
        assert!(ep.verify_hash().is_err());
    }
}
