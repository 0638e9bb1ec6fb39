//! 策略引擎
//!
//! 纯函数：`evaluate(调用, 配置, 上下文快照) -> PolicyDecision`。无 I/O、无内部状态，
//! 相同输入必然得到相同决策（审计回放与测试都依赖这一点）。决策绑定调用签名，
//! 每次执行前重新计算，绝不缓存复用。风险不明时一律 requires_approval（fail-safe）。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::types::{PlanProposal, RunId, TickId, ToolInvocation};

/// 工具风险类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Read,
    Write,
    Exec,
    Network,
}

impl RiskClass {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, RiskClass::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::Read => "read",
            RiskClass::Write => "write",
            RiskClass::Exec => "exec",
            RiskClass::Network => "network",
        }
    }
}

/// 策略配置（来自 [policy] 配置段；引擎本身不读配置文件）
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// EXEC 类工具默认关闭
    pub allow_exec: bool,
    /// NETWORK 类工具默认关闭（loopback 之外一律显式放行）
    pub allow_network: bool,
    /// WRITE 类的总开关；关闭时所有写入直接拒绝
    pub allow_write: bool,
    /// 按工具名覆盖风险类别（如把某个只读工具升级为 write 对待）
    pub risk_overrides: BTreeMap<String, RiskClass>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_exec: false,
            allow_network: false,
            allow_write: true,
            risk_overrides: BTreeMap::new(),
        }
    }
}

/// 评估时的上下文快照；刻意只携带可复算的字段
#[derive(Clone, Debug)]
pub struct PolicySnapshot {
    pub run_id: RunId,
    pub tick: TickId,
    /// 提议是否携带 diff（diff 一律按 Write 对待）
    pub has_diff: bool,
}

/// 策略决策：allow 与 requires_approval 正交；reasons 为稳定的规则名
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reasons: Vec<String>,
    pub requires_approval: bool,
    pub risk: RiskClass,
    /// 被评估调用的签名；choke point 以此核对「批的就是执行的」
    pub signature: String,
}

impl PolicyDecision {
    fn deny(risk: RiskClass, signature: String, reason: &str) -> Self {
        Self {
            allow: false,
            reasons: vec![reason.to_string()],
            requires_approval: false,
            risk,
            signature,
        }
    }
}

/// 计划级汇总决策
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanDecision {
    pub allow: bool,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
    pub decisions: Vec<PolicyDecision>,
}

/// 纯策略引擎；持有配置副本，不做任何 I/O
#[derive(Clone, Debug, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// 解析某工具的有效风险类别：配置覆盖优先于工具自报
    pub fn effective_risk(&self, tool: &str, declared: Option<RiskClass>) -> Option<RiskClass> {
        self.config
            .risk_overrides
            .get(tool)
            .copied()
            .or(declared)
    }

    /// 评估单次调用。declared_risk 为 None 表示工具未注册，直接拒绝。
    pub fn evaluate(
        &self,
        invocation: &ToolInvocation,
        declared_risk: Option<RiskClass>,
        snapshot: &PolicySnapshot,
    ) -> PolicyDecision {
        let signature = invocation.signature();

        let Some(risk) = self.effective_risk(&invocation.tool, declared_risk) else {
            return PolicyDecision::deny(RiskClass::Exec, signature, "unknown_tool");
        };

        match risk {
            RiskClass::Read => PolicyDecision {
                allow: true,
                reasons: vec!["read_allowed_by_default".into()],
                requires_approval: false,
                risk,
                signature,
            },
            RiskClass::Exec if !self.config.allow_exec => {
                PolicyDecision::deny(risk, signature, "exec_denied_by_default")
            }
            RiskClass::Network if !self.config.allow_network => {
                PolicyDecision::deny(risk, signature, "network_denied_by_default")
            }
            RiskClass::Write if !self.config.allow_write => PolicyDecision {
                allow: false,
                reasons: vec!["write_disabled".into()],
                requires_approval: true,
                risk,
                signature,
            },
            // 放行的变更类调用一律要求审批
            RiskClass::Write | RiskClass::Exec | RiskClass::Network => {
                let mut reasons = vec![format!("{}_allowed_by_config", risk.as_str())];
                if snapshot.has_diff {
                    reasons.push("mutation_risk_diff_present".into());
                }
                PolicyDecision {
                    allow: true,
                    reasons,
                    requires_approval: true,
                    risk,
                    signature,
                }
            }
        }
    }

    /// 计划级评估：逐调用评估后汇总。任何一条拒绝则整个计划拒绝；
    /// 任何一条要求审批、或计划携带 diff，则整体要求审批。
    pub fn evaluate_plan(
        &self,
        proposal: &PlanProposal,
        invocations: &[(ToolInvocation, Option<RiskClass>)],
        snapshot: &PolicySnapshot,
    ) -> PlanDecision {
        let decisions: Vec<PolicyDecision> = invocations
            .iter()
            .map(|(inv, risk)| self.evaluate(inv, *risk, snapshot))
            .collect();

        let allow = decisions.iter().all(|d| d.allow);
        let mut requires_approval = decisions.iter().any(|d| d.requires_approval);
        if proposal.diff.is_some() {
            // diff-first：任何代码变更在没有更明确信号时按需要审批处理
            requires_approval = true;
        }
        let mut reasons: Vec<String> = decisions
            .iter()
            .filter(|d| !d.allow || d.requires_approval)
            .flat_map(|d| d.reasons.iter().cloned())
            .collect();
        if reasons.is_empty() {
            reasons.push("read_only_plan".into());
        }

        PlanDecision {
            allow,
            requires_approval,
            reasons,
            decisions,
        }
    }
}
