//! 审计回放与崩溃恢复
//!
//! 回放只信任日志：先校验哈希链，再按 Run 分组做顺序不变量检查，
//! 最后用 RunState 的纯 fold 重建终态。状态仓库只用于交叉核对，发现不一致即拒绝自动恢复。

use std::collections::BTreeMap;

use chrono::Utc;

use super::events::{AuditEvent, AuditKind};
use super::log::{AuditLog, AuditRecord};
use crate::audit::codec::sha256_canonical_json;
use crate::core::error::ControlError;
use crate::core::run::RunState;
use crate::core::types::{RunId, TickId};

/// 单个 Run 的回放结论
#[derive(Clone, Debug)]
pub struct ReplaySummary {
    pub run_id: RunId,
    pub final_state: RunState,
    pub events: usize,
    /// 对 (prev, event_hash, kind) 逐条链式哈希得到的回放状态指纹
    pub state_hash: String,
}

/// 对一个 Run 的有序记录做顺序检查并 fold 出终态
pub fn replay_run(records: &[AuditRecord], run_id: &RunId) -> Result<ReplaySummary, ControlError> {
    let run_records: Vec<&AuditRecord> = records
        .iter()
        .filter(|r| &r.event.run_id == run_id)
        .collect();
    if run_records.is_empty() {
        return Err(ControlError::AuditReplayMismatch(format!(
            "no audit events for run {run_id}"
        )));
    }

    if run_records[0].event.kind != AuditKind::RunStarted {
        return Err(ControlError::AuditReplayMismatch(
            "first event must be RunStarted".into(),
        ));
    }

    let mut state_hash = "GENESIS".to_string();
    let mut terminal_seen = false;
    let mut rolled_back_seen = false;

    for rec in &run_records {
        if rolled_back_seen {
            return Err(ControlError::AuditReplayMismatch(format!(
                "event {} after RunRolledBack (seq {})",
                rec.event.kind, rec.seq
            )));
        }
        if terminal_seen && rec.event.kind != AuditKind::RunRolledBack {
            return Err(ControlError::AuditReplayMismatch(format!(
                "event {} after terminal event (seq {})",
                rec.event.kind, rec.seq
            )));
        }
        if rec.event.kind.is_terminal() {
            terminal_seen = true;
        }
        if rec.event.kind == AuditKind::RunRolledBack {
            rolled_back_seen = true;
        }
        state_hash = sha256_canonical_json(&serde_json::json!({
            "prev": state_hash,
            "event_hash": rec.hash,
            "kind": rec.event.kind,
        }));
    }

    let final_state = RunState::fold(run_records.iter().map(|r| &r.event));
    Ok(ReplaySummary {
        run_id: run_id.clone(),
        final_state,
        events: run_records.len(),
        state_hash,
    })
}

/// 回放整个日志，按出现顺序返回每个 Run 的结论
pub fn replay_all(records: &[AuditRecord]) -> Result<Vec<ReplaySummary>, ControlError> {
    let mut order: Vec<RunId> = Vec::new();
    let mut seen: BTreeMap<String, ()> = BTreeMap::new();
    for rec in records {
        if seen.insert(rec.event.run_id.0.clone(), ()).is_none() {
            order.push(rec.event.run_id.clone());
        }
    }
    order.iter().map(|id| replay_run(records, id)).collect()
}

/// 崩溃恢复结论
#[derive(Clone, Debug)]
pub struct RecoveredRun {
    pub run_id: RunId,
    pub state_before: RunState,
    pub rolled_back: bool,
}

/// 启动时恢复：校验日志，对停在非终态的 Run 追加 RunRolledBack 并标记弃置。
/// 补偿不做猜测：StateDelta 在提交前已与日志核对过，缺少终止事件即说明没有 delta 落库。
pub fn recover(log: &AuditLog) -> Result<Vec<RecoveredRun>, ControlError> {
    let records = log.records()?;
    let summaries = replay_all(&records)?;

    let mut out = Vec::new();
    for summary in summaries {
        if summary.final_state.is_terminal() {
            continue;
        }
        let last_tick = records
            .iter()
            .filter(|r| r.event.run_id == summary.run_id)
            .map(|r| r.event.tick)
            .max()
            .unwrap_or(TickId(1));

        log.append(AuditEvent::new(
            summary.run_id.clone(),
            last_tick,
            AuditKind::RunRolledBack,
            serde_json::json!({
                "reason": "crash_recovery",
                "state_at_checkpoint": summary.final_state,
                "recovered_at": Utc::now().to_rfc3339(),
            }),
        ))?;
        tracing::warn!(run_id = %summary.run_id, state = %summary.final_state, "run rolled back by crash recovery");
        out.push(RecoveredRun {
            run_id: summary.run_id,
            state_before: summary.final_state,
            rolled_back: true,
        });
    }
    Ok(out)
}

/// 日志与状态仓库的交叉核对：仓库里出现过的 run 必须在日志中完成过。
/// 不一致属于 AuditReplayMismatch，自动恢复必须就地停下。
pub fn cross_check(
    log: &AuditLog,
    committed_runs: &[RunId],
) -> Result<(), ControlError> {
    let records = log.records()?;
    for run_id in committed_runs {
        let summary = replay_run(&records, run_id).map_err(|_| {
            ControlError::AuditReplayMismatch(format!(
                "state repository holds entries for run {run_id} absent from the audit log"
            ))
        })?;
        if !matches!(summary.final_state, RunState::Completed | RunState::RolledBack) {
            return Err(ControlError::AuditReplayMismatch(format!(
                "state repository holds entries for run {run_id} but log ends in {}",
                summary.final_state
            )));
        }
    }
    Ok(())
}
