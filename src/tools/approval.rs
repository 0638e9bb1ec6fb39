//! 审批闸门
//!
//! 任何变更类调用在执行前必须拿到 ExecutionArm。arm 只能由审批事件产生，
//! 且按值移动消费，一次调用用掉一个，不存在「复用上次审批」的路径。
//! 支持两种授权来源：审窗内的显式 grant/deny（HTTP 面板等），以及
//! 请求随附的静态 token（无头运行与测试）。超窗一律超时失败，不默认放行。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::core::types::RunId;
use crate::tools::store::ArtifactRef;

/// 单次调用的执行授权。字段对 crate 外不可见，构造只发生在审批通过之后。
#[derive(Debug)]
pub struct ExecutionArm {
    run_id: RunId,
    signature: String,
}

impl ExecutionArm {
    pub(crate) fn mint(run_id: RunId, signature: String) -> Self {
        Self { run_id, signature }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// arm 是否授权给指定调用签名
    pub fn covers(&self, run_id: &RunId, signature: &str) -> bool {
        &self.run_id == run_id && self.signature == signature
    }
}

/// 一次审批通过后持有的授权集合；按签名取 arm，取走即消失
#[derive(Debug)]
pub struct ApprovalGrant {
    pub run_id: RunId,
    pub artifact: Option<ArtifactRef>,
    arms: Vec<ExecutionArm>,
}

impl ApprovalGrant {
    /// 取出覆盖该签名的 arm；single-use，取第二次返回 None
    pub fn take_arm(&mut self, signature: &str) -> Option<ExecutionArm> {
        let idx = self.arms.iter().position(|a| a.signature == signature)?;
        Some(self.arms.swap_remove(idx))
    }

    pub fn remaining(&self) -> usize {
        self.arms.len()
    }
}

/// 审批结论
#[derive(Debug)]
pub enum ApprovalOutcome {
    Granted(ApprovalGrant),
    Denied(String),
    TimedOut,
}

#[derive(Clone, Debug)]
enum Verdict {
    Grant,
    Deny(String),
}

/// 等待中的审批请求（供查询面板展示）
#[derive(Clone, Debug, serde::Serialize)]
pub struct PendingApproval {
    pub run_id: RunId,
    pub artifact_hash: Option<String>,
    pub calls: usize,
    pub requested_at: DateTime<Utc>,
}

/// 审批代理：pending 表 + 审窗超时
pub struct ApprovalBroker {
    window: Duration,
    static_token: Option<String>,
    pending: Mutex<HashMap<String, (PendingApproval, oneshot::Sender<Verdict>)>>,
}

impl ApprovalBroker {
    pub fn new(window: Duration, static_token: Option<String>) -> Self {
        Self {
            window,
            static_token,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 当前等待审批的请求列表
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.pending
            .lock()
            .map(|p| p.values().map(|(info, _)| info.clone()).collect())
            .unwrap_or_default()
    }

    /// 为一组调用签名请求审批。supplied_token 与配置的静态 token 匹配时立即放行，
    /// 否则挂起等待显式 grant/deny，超窗返回 TimedOut。
    pub async fn request(
        &self,
        run_id: &RunId,
        artifact: Option<ArtifactRef>,
        signatures: &[String],
        supplied_token: Option<&str>,
    ) -> ApprovalOutcome {
        let mint = |run_id: &RunId| ApprovalGrant {
            run_id: run_id.clone(),
            artifact: artifact.clone(),
            arms: signatures
                .iter()
                .map(|sig| ExecutionArm::mint(run_id.clone(), sig.clone()))
                .collect(),
        };

        if let (Some(expected), Some(got)) = (self.static_token.as_deref(), supplied_token) {
            if !expected.is_empty() && expected == got.trim() {
                tracing::info!(run_id = %run_id, "approval granted via static token");
                return ApprovalOutcome::Granted(mint(run_id));
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let Ok(mut pending) = self.pending.lock() else {
                return ApprovalOutcome::Denied("approval broker poisoned".into());
            };
            pending.insert(
                run_id.0.clone(),
                (
                    PendingApproval {
                        run_id: run_id.clone(),
                        artifact_hash: artifact.as_ref().map(|a| a.hash.clone()),
                        calls: signatures.len(),
                        requested_at: Utc::now(),
                    },
                    tx,
                ),
            );
        }

        let verdict = tokio::time::timeout(self.window, rx).await;
        // 无论结局如何都摘掉 pending 条目
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&run_id.0);
        }

        match verdict {
            Ok(Ok(Verdict::Grant)) => ApprovalOutcome::Granted(mint(run_id)),
            Ok(Ok(Verdict::Deny(reason))) => ApprovalOutcome::Denied(reason),
            // sender 被丢弃视为拒绝，不默认放行
            Ok(Err(_)) => ApprovalOutcome::Denied("approval channel closed".into()),
            Err(_) => ApprovalOutcome::TimedOut,
        }
    }

    /// 放行指定 Run 的待审请求；无此请求返回 false
    pub fn grant(&self, run_id: &RunId) -> bool {
        self.resolve(run_id, Verdict::Grant)
    }

    /// 拒绝指定 Run 的待审请求
    pub fn deny(&self, run_id: &RunId, reason: impl Into<String>) -> bool {
        self.resolve(run_id, Verdict::Deny(reason.into()))
    }

    fn resolve(&self, run_id: &RunId, verdict: Verdict) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.remove(&run_id.0) {
            Some((_, tx)) => tx.send(verdict).is_ok(),
            None => false,
        }
    }
}
