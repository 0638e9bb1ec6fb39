//! Run 状态机
//!
//! 状态转移函数是对审计事件的纯 fold：给定同一事件序列必然得到同一终态，
//! 崩溃恢复只依赖这一点，任何带副作用的转移都必须先落一条事件。

use serde::{Deserialize, Serialize};

use crate::audit::events::{AuditEvent, AuditKind};
use crate::core::types::{RunId, TickId};

/// Run 生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Observing,
    Planning,
    AwaitingPolicy,
    AwaitingApproval,
    Executing,
    Recording,
    Completed,
    Failed,
    RolledBack,
}

impl RunState {
    /// 终态：Completed / Failed 仍可被恢复流程转入 RolledBack
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::RolledBack
        )
    }

    /// 单步转移。未知或乱序事件保持原状态，由回放校验器负责报告。
    pub fn apply(self, event: &AuditEvent) -> RunState {
        match event.kind {
            AuditKind::RunStarted => {
                // 有观察或显式空上下文决策才进入 Planning
                let has_context = event
                    .payload
                    .get("observations")
                    .and_then(|v| v.as_u64())
                    .map(|n| n > 0)
                    .unwrap_or(false)
                    || event
                        .payload
                        .get("empty_context")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                if has_context {
                    RunState::Planning
                } else {
                    RunState::Observing
                }
            }
            AuditKind::PlanProposed => RunState::AwaitingPolicy,
            AuditKind::PolicyEvaluated => {
                let allow = event
                    .payload
                    .get("allow")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let requires_approval = event
                    .payload
                    .get("requires_approval")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if !allow {
                    // 拒绝对该提议终结；编排器可在限额内重新规划，否则随后出现 RunFailed
                    RunState::Planning
                } else if requires_approval {
                    RunState::AwaitingApproval
                } else {
                    RunState::Executing
                }
            }
            AuditKind::ApprovalGranted | AuditKind::ToolExecuted => RunState::Executing,
            AuditKind::ApprovalDenied | AuditKind::ApprovalTimeout => self,
            AuditKind::StateDeltaRejected => RunState::Recording,
            AuditKind::RunCompleted => RunState::Completed,
            AuditKind::RunFailed | AuditKind::RunCancelled => RunState::Failed,
            AuditKind::RunRolledBack => RunState::RolledBack,
        }
    }

    /// 从空状态 fold 一个事件序列
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a AuditEvent>) -> RunState {
        events
            .into_iter()
            .fold(RunState::Idle, |state, ev| state.apply(ev))
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Observing => "observing",
            RunState::Planning => "planning",
            RunState::AwaitingPolicy => "awaiting_policy",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Executing => "executing",
            RunState::Recording => "recording",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Run 的内存侧描述；事件序列是事实源，这里只是便于调度的快照
#[derive(Clone, Debug)]
pub struct Run {
    pub run_id: RunId,
    pub state: RunState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub tick: TickId,
}

impl Run {
    pub fn open(run_id: RunId) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            created_at: chrono::Utc::now(),
            tick: TickId(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::events::AuditEvent;

    fn ev(run: &RunId, kind: AuditKind, payload: serde_json::Value) -> AuditEvent {
        AuditEvent::new(run.clone(), TickId(1), kind, payload)
    }

    #[test]
    fn test_happy_path_fold() {
        let run = RunId::new();
        let events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 1})),
            ev(&run, AuditKind::PlanProposed, serde_json::json!({})),
            ev(
                &run,
                AuditKind::PolicyEvaluated,
                serde_json::json!({"allow": true, "requires_approval": true}),
            ),
            ev(&run, AuditKind::ApprovalGranted, serde_json::json!({})),
            ev(&run, AuditKind::RunCompleted, serde_json::json!({})),
        ];
        assert_eq!(RunState::fold(&events), RunState::Completed);
    }

    #[test]
    fn test_no_approval_path_goes_straight_to_executing() {
        let run = RunId::new();
        let events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 1})),
            ev(&run, AuditKind::PlanProposed, serde_json::json!({})),
            ev(
                &run,
                AuditKind::PolicyEvaluated,
                serde_json::json!({"allow": true, "requires_approval": false}),
            ),
        ];
        assert_eq!(RunState::fold(&events), RunState::Executing);
    }

    #[test]
    fn test_denial_returns_to_planning_then_fails() {
        let run = RunId::new();
        let mut events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 1})),
            ev(&run, AuditKind::PlanProposed, serde_json::json!({})),
            ev(
                &run,
                AuditKind::PolicyEvaluated,
                serde_json::json!({"allow": false, "requires_approval": false}),
            ),
        ];
        assert_eq!(RunState::fold(&events), RunState::Planning);

        events.push(ev(&run, AuditKind::RunFailed, serde_json::json!({})));
        assert_eq!(RunState::fold(&events), RunState::Failed);
    }

    #[test]
    fn test_timeout_path_fails() {
        let run = RunId::new();
        let events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 1})),
            ev(&run, AuditKind::PlanProposed, serde_json::json!({})),
            ev(
                &run,
                AuditKind::PolicyEvaluated,
                serde_json::json!({"allow": true, "requires_approval": true}),
            ),
            ev(&run, AuditKind::ApprovalTimeout, serde_json::json!({})),
            ev(&run, AuditKind::RunFailed, serde_json::json!({})),
        ];
        assert_eq!(RunState::fold(&events), RunState::Failed);
    }

    #[test]
    fn test_rolled_back_is_reachable_from_terminal() {
        let run = RunId::new();
        let events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 1})),
            ev(&run, AuditKind::RunFailed, serde_json::json!({})),
            ev(&run, AuditKind::RunRolledBack, serde_json::json!({})),
        ];
        assert_eq!(RunState::fold(&events), RunState::RolledBack);
    }

    #[test]
    fn test_started_without_context_stays_observing() {
        let run = RunId::new();
        let events = vec![ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 0}))];
        assert_eq!(RunState::fold(&events), RunState::Observing);

        let events = vec![ev(
            &run,
            AuditKind::RunStarted,
            serde_json::json!({"observations": 0, "empty_context": true}),
        )];
        assert_eq!(RunState::fold(&events), RunState::Planning);
    }

    #[test]
    fn test_fold_is_deterministic() {
        let run = RunId::new();
        let events = vec![
            ev(&run, AuditKind::RunStarted, serde_json::json!({"observations": 2})),
            ev(&run, AuditKind::PlanProposed, serde_json::json!({})),
            ev(
                &run,
                AuditKind::PolicyEvaluated,
                serde_json::json!({"allow": true, "requires_approval": false}),
            ),
            ev(&run, AuditKind::ToolExecuted, serde_json::json!({})),
            ev(&run, AuditKind::RunCompleted, serde_json::json!({})),
        ];
        assert_eq!(RunState::fold(&events), RunState::fold(&events));
        assert_eq!(RunState::fold(&events), RunState::Completed);
    }
}
