//! 评审团：对计划提议的多评审打分（可选扩展点）
//!
//! 评审全体一致通过则不干预；出现分歧且分歧票数达到配置阈值时，
//! 结论升级为强制审批。规则评审是确定性的；模型评审可后续接入同一 trait。

use crate::config::CouncilSection;
use crate::core::types::PlanProposal;

/// 单个评审的裁定
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    /// 要求升级审批，附稳定的原因名
    Escalate(String),
}

/// 评审 trait：对提议给出裁定，不得有副作用
pub trait CouncilCritic: Send + Sync {
    fn name(&self) -> &str;
    fn review(&self, proposal: &PlanProposal) -> Verdict;
}

/// diff 规模评审：触碰文件数超限则升级
pub struct DiffScopeCritic {
    max_files: usize,
}

impl DiffScopeCritic {
    pub fn new(max_files: usize) -> Self {
        Self { max_files }
    }
}

impl CouncilCritic for DiffScopeCritic {
    fn name(&self) -> &str {
        "diff_scope"
    }

    fn review(&self, proposal: &PlanProposal) -> Verdict {
        let Some(diff) = &proposal.diff else {
            return Verdict::Approve;
        };
        let files = diff.lines().filter(|l| l.starts_with("+++ ")).count();
        if files > self.max_files {
            Verdict::Escalate(format!("diff_touches_{files}_files"))
        } else {
            Verdict::Approve
        }
    }
}

/// 计划规模评审：一次提议里工具调用过多视为可疑
pub struct CallBudgetCritic {
    max_calls: usize,
}

impl CallBudgetCritic {
    pub fn new(max_calls: usize) -> Self {
        Self { max_calls }
    }
}

impl CouncilCritic for CallBudgetCritic {
    fn name(&self) -> &str {
        "call_budget"
    }

    fn review(&self, proposal: &PlanProposal) -> Verdict {
        if proposal.tool_calls.len() > self.max_calls {
            Verdict::Escalate(format!("plan_has_{}_calls", proposal.tool_calls.len()))
        } else {
            Verdict::Approve
        }
    }
}

/// 空计划评审：带 diff 却没有任何执行调用的提议不自洽
pub struct CoherenceCritic;

impl CouncilCritic for CoherenceCritic {
    fn name(&self) -> &str {
        "coherence"
    }

    fn review(&self, proposal: &PlanProposal) -> Verdict {
        if proposal.diff.is_some() && proposal.tool_calls.is_empty() {
            Verdict::Escalate("diff_without_apply_call".to_string())
        } else {
            Verdict::Approve
        }
    }
}

/// 评审团结论
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CouncilOutcome {
    Pass,
    /// 升级为强制审批；携带各评审的原因
    Escalate(Vec<String>),
}

pub struct Council {
    critics: Vec<Box<dyn CouncilCritic>>,
    disagreement_threshold: usize,
}

impl Council {
    pub fn new(critics: Vec<Box<dyn CouncilCritic>>, disagreement_threshold: usize) -> Self {
        Self {
            critics,
            disagreement_threshold: disagreement_threshold.max(1),
        }
    }

    pub fn from_config(section: &CouncilSection) -> Option<Self> {
        if !section.enabled {
            return None;
        }
        Some(Self::new(
            vec![
                Box::new(DiffScopeCritic::new(section.max_diff_files)),
                Box::new(CallBudgetCritic::new(16)),
                Box::new(CoherenceCritic),
            ],
            section.disagreement_threshold,
        ))
    }

    /// 裁定规则：全员通过则 Pass；全员升级则 Escalate；
    /// 出现分歧时，升级票数达到阈值才升级，否则按多数放行。
    pub fn review(&self, proposal: &PlanProposal) -> CouncilOutcome {
        let mut reasons = Vec::new();
        let mut approvals = 0usize;
        for critic in &self.critics {
            match critic.review(proposal) {
                Verdict::Approve => approvals += 1,
                Verdict::Escalate(reason) => {
                    reasons.push(format!("{}:{}", critic.name(), reason));
                }
            }
        }
        let escalations = reasons.len();
        if escalations == 0 {
            return CouncilOutcome::Pass;
        }
        if approvals == 0 || escalations >= self.disagreement_threshold {
            return CouncilOutcome::Escalate(reasons);
        }
        CouncilOutcome::Pass
    }
}
