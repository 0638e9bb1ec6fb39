//! 追加式审计日志
//!
//! JSONL 格式，每行一条 AuditRecord：{seq, prev_hash, hash, event}。
//! seq 严格递增且无空洞；hash 对 (seq, prev_hash, event) 的规范 JSON 计算，
//! prev_hash 链接前一条，创世为 sha256:00..00。追加持锁串行，读取不加锁。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::codec::{genesis_hash, sha256_canonical_json, CanonError};
use super::events::AuditEvent;
use crate::core::types::RunId;
use crate::policy::redaction::redact_value;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
    #[error("seq mismatch at line {line}: expected {expected}, got {got}")]
    SeqMismatch { line: usize, expected: u64, got: u64 },
    #[error("hash mismatch at line {line}: expected {expected}, got {got}")]
    HashMismatch {
        line: usize,
        expected: String,
        got: String,
    },
    #[error("audit log poisoned")]
    Poisoned,
}

/// 落盘的一条审计记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub event: AuditEvent,
}

#[derive(Serialize)]
struct HashPayload<'a> {
    seq: u64,
    prev_hash: &'a str,
    event: &'a AuditEvent,
}

fn record_hash(seq: u64, prev_hash: &str, event: &AuditEvent) -> String {
    sha256_canonical_json(&HashPayload {
        seq,
        prev_hash,
        event,
    })
}

struct Appender {
    file: File,
    last_seq: u64,
    last_hash: String,
}

/// 追加式审计日志；跨 Run 共享，append 持锁串行
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<Appender>,
}

impl AuditLog {
    /// 打开（或创建）日志文件；已有内容时从尾部恢复 seq 与链哈希
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (last_seq, last_hash) = read_tail_state(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Appender {
                file,
                last_seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条事件，返回分配的 seq。payload 在写入前脱敏。
    pub fn append(&self, mut event: AuditEvent) -> Result<u64, AuditLogError> {
        event.payload = redact_value(&event.payload);

        let mut inner = self.inner.lock().map_err(|_| AuditLogError::Poisoned)?;
        let seq = inner.last_seq + 1;
        let prev_hash = inner.last_hash.clone();
        let hash = record_hash(seq, &prev_hash, &event);
        let record = AuditRecord {
            seq,
            prev_hash,
            hash: hash.clone(),
            event,
        };

        let line = serde_json::to_string(&record)?;
        inner.file.write_all(line.as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.file.flush()?;
        inner.last_seq = seq;
        inner.last_hash = hash;

        tracing::debug!(seq, kind = %record.event.kind, run_id = %record.event.run_id, "audit append");
        Ok(seq)
    }

    /// 读取全部记录并校验链完整性（读路径不持 append 锁）
    pub fn records(&self) -> Result<Vec<AuditRecord>, AuditLogError> {
        read_and_verify(&self.path)
    }

    /// 按 run 过滤的有序事件序列；链校验失败即拒绝回放
    pub fn replay(&self, run_id: &RunId) -> Result<Vec<AuditEvent>, AuditLogError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| &r.event.run_id == run_id)
            .map(|r| r.event)
            .collect())
    }
}

/// 校验文件中的 seq 连续性与哈希链，返回 (最后 seq, 最后哈希)
pub fn verify_file(path: impl AsRef<Path>) -> Result<(u64, String), AuditLogError> {
    let records = read_and_verify(path.as_ref())?;
    match records.last() {
        Some(last) => Ok((last.seq, last.hash.clone())),
        None => Ok((0, genesis_hash())),
    }
}

fn read_and_verify(path: &Path) -> Result<Vec<AuditRecord>, AuditLogError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut expected_prev = genesis_hash();
    let mut expected_seq = 1u64;
    let mut out = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(&line)?;
        if rec.seq != expected_seq {
            return Err(AuditLogError::SeqMismatch {
                line: line_no,
                expected: expected_seq,
                got: rec.seq,
            });
        }
        if rec.prev_hash != expected_prev {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: expected_prev,
                got: rec.prev_hash,
            });
        }
        let computed = record_hash(rec.seq, &rec.prev_hash, &rec.event);
        if computed != rec.hash {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: computed,
                got: rec.hash,
            });
        }
        expected_prev = rec.hash.clone();
        expected_seq += 1;
        out.push(rec);
    }
    Ok(out)
}

fn read_tail_state(path: &Path) -> Result<(u64, String), AuditLogError> {
    if !path.exists() {
        return Ok((0, genesis_hash()));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut last: Option<AuditRecord> = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        last = Some(serde_json::from_str(&line)?);
    }
    Ok(match last {
        Some(rec) => (rec.seq, rec.hash),
        None => (0, genesis_hash()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::events::{AuditEvent, AuditKind};
    use crate::core::types::{RunId, TickId};

    fn event(run_id: &RunId, kind: AuditKind) -> AuditEvent {
        AuditEvent::new(run_id.clone(), TickId(1), kind, serde_json::json!({}))
    }

    #[test]
    fn test_seq_is_gapless_and_chain_verifies() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl")).unwrap();
        let run = RunId::new();

        assert_eq!(log.append(event(&run, AuditKind::RunStarted)).unwrap(), 1);
        assert_eq!(log.append(event(&run, AuditKind::PlanProposed)).unwrap(), 2);
        assert_eq!(log.append(event(&run, AuditKind::RunCompleted)).unwrap(), 3);

        let (last_seq, last_hash) = verify_file(log.path()).unwrap();
        assert_eq!(last_seq, 3);
        assert!(last_hash.starts_with("sha256:"));
    }

    #[test]
    fn test_reopen_continues_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let run = RunId::new();

        {
            let log = AuditLog::open(&path).unwrap();
            log.append(event(&run, AuditKind::RunStarted)).unwrap();
        }
        {
            let log = AuditLog::open(&path).unwrap();
            assert_eq!(log.append(event(&run, AuditKind::RunFailed)).unwrap(), 2);
        }
        verify_file(&path).unwrap();
    }

    #[test]
    fn test_tampered_line_fails_verification() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let run = RunId::new();
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(event(&run, AuditKind::RunStarted)).unwrap();
            log.append(event(&run, AuditKind::RunCompleted)).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("RunCompleted", "RunFailed");
        std::fs::write(&path, tampered).unwrap();

        assert!(verify_file(&path).is_err());
    }

    #[test]
    fn test_payload_is_redacted_on_append() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl")).unwrap();
        let run = RunId::new();
        let ev = AuditEvent::new(
            run.clone(),
            TickId(1),
            AuditKind::RunStarted,
            serde_json::json!({"note": "sk-abcdefghijklmnopqrstuvwx"}),
        );
        log.append(ev).unwrap();

        let records = log.records().unwrap();
        let note = records[0].event.payload["note"].as_str().unwrap();
        assert!(!note.contains("sk-abcdefghijklmnopqrstuvwx"));
    }

    #[test]
    fn test_replay_filters_by_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl")).unwrap();
        let a = RunId::new();
        let b = RunId::new();
        log.append(event(&a, AuditKind::RunStarted)).unwrap();
        log.append(event(&b, AuditKind::RunStarted)).unwrap();
        log.append(event(&a, AuditKind::RunCompleted)).unwrap();

        let events = log.replay(&a).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.run_id == a));
    }
}
