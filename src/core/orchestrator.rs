//! 编排器：Run 级状态机主控
//!
//! 一次 Run 的流水线：观察 -> 规划 -> 策略评估 -> （必要时）审批 -> choke point 执行
//! -> 记录（StateDelta + 情景记忆）-> 终止事件。每一步先落审计事件再继续；
//! 模型只提议，应用永远发生在控制面。多 Run 并发由上层循环配合 RunScheduler 管理，
//! 单个 Run 内部严格串行。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{recover, replay_run, AuditEvent, AuditKind, AuditLog, RecoveredRun};
use crate::config::AppConfig;
use crate::core::council::{Council, CouncilOutcome};
use crate::core::error::{backoff_delay, ControlError};
use crate::core::run::RunState;
use crate::core::scheduler::RunScheduler;
use crate::core::types::{
    AgentType, ObservationEvent, ObservationSource, PlanProposal, RunId, RunResult, TaskRequest,
    TickId, ToolInvocation, ToolResult,
};
use crate::memory::{Episode, EpisodeStore, WorkingMemory};
use crate::models::{ModelRouter, PlanContext, RouterTable};
use crate::policy::{redact_text, PolicyEngine, PolicySnapshot, RiskClass};
use crate::state::{encode_payload, StateDelta, StateRepository};
use crate::tools::{
    ApprovalBroker, ApprovalOutcome, ArtifactRef, ArtifactStore, FsListTool, FsReadTool,
    GitApplyTool, GitDiffTool, HttpFetchTool, Sandbox, ShellTool, ToolChokePoint, ToolRegistry,
};

pub struct Orchestrator {
    config: AppConfig,
    audit: Arc<AuditLog>,
    choke: ToolChokePoint,
    policy: PolicyEngine,
    router: Arc<ModelRouter>,
    state_repo: Arc<StateRepository>,
    episodes: Arc<EpisodeStore>,
    working: Arc<WorkingMemory>,
    approvals: Arc<ApprovalBroker>,
    council: Option<Council>,
    store: ArtifactStore,
    /// 进行中的 Run 及其取消令牌
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    /// 按配置装配全部协作者；目录缺失时创建
    pub fn build(config: AppConfig) -> Result<Self, ControlError> {
        std::fs::create_dir_all(&config.app.runtime_root)?;
        std::fs::create_dir_all(&config.app.workspace_root)?;

        let audit = Arc::new(AuditLog::open(config.app.audit_log_path())?);
        let store = ArtifactStore::new(&config.app.runtime_root);
        let sandbox = Sandbox::new(&config.app.workspace_root);

        let mut registry = ToolRegistry::new();
        registry.register(FsReadTool::new(sandbox.clone()));
        registry.register(FsListTool::new(sandbox.clone()));
        registry.register(GitDiffTool::new(sandbox.clone()));
        registry.register(GitApplyTool::new(sandbox.clone()));
        registry.register(ShellTool::new(
            sandbox.clone(),
            config.tools.shell.allowed_commands.clone(),
        ));
        registry.register(HttpFetchTool::new(
            config.tools.http.allowed_domains.clone(),
            config.tools.http.timeout_secs,
            config.tools.http.max_result_chars,
        ));

        let policy = PolicyEngine::new(config.policy.to_policy_config());
        let choke = ToolChokePoint::new(
            registry,
            policy.clone(),
            audit.clone(),
            store.clone(),
            Duration::from_secs(config.tools.tool_timeout_secs),
        );

        let table = RouterTable::load(&config.router.table_path).unwrap_or_else(|e| {
            tracing::warn!("router table load failed ({e}), using null routing");
            RouterTable::null_table()
        });
        let router = Arc::new(ModelRouter::new(
            table,
            Duration::from_millis(config.router.swap_slo_ms),
        ));

        let state_repo = Arc::new(StateRepository::open(&config.app.runtime_root, audit.clone())?);
        let episodes = Arc::new(EpisodeStore::open(config.app.episodes_path())?);
        let working = Arc::new(WorkingMemory::new(
            config.memory.working_max_entries,
            Duration::from_secs(config.memory.working_ttl_secs),
        ));
        let approvals = Arc::new(ApprovalBroker::new(
            Duration::from_secs(config.approval.window_secs),
            config.approval.token.clone(),
        ));
        let council = Council::from_config(&config.council);

        Ok(Self {
            config,
            audit,
            choke,
            policy,
            router,
            state_repo,
            episodes,
            working,
            approvals,
            council,
            store,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn state_repo(&self) -> &Arc<StateRepository> {
        &self.state_repo
    }

    pub fn episodes(&self) -> &Arc<EpisodeStore> {
        &self.episodes
    }

    pub fn working(&self) -> &Arc<WorkingMemory> {
        &self.working
    }

    /// 启动恢复：先与状态仓库交叉核对，再回放日志，把停在非终态的 Run 标记回滚
    pub fn recover_runs(&self) -> Result<Vec<RecoveredRun>, ControlError> {
        crate::audit::cross_check(&self.audit, &self.state_repo.committed_runs())?;
        recover(&self.audit)
    }

    /// 当前（按日志回放出的）Run 状态
    pub fn run_state(&self, run_id: &RunId) -> Result<RunState, ControlError> {
        let records = self.audit.records()?;
        Ok(replay_run(&records, run_id)?.final_state)
    }

    /// 请求取消一个进行中的 Run
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&run_id.0) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn register_active(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(run_id.0.clone(), token.clone());
        token
    }

    fn unregister_active(&self, run_id: &RunId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&run_id.0);
    }

    /// 执行一个任务请求直至终态。返回 Ok(RunResult) 表示 Run 得到了终止事件
    /// （成功或失败）；Err 只在基础设施（审计日志等）不可用时出现。
    pub async fn run_task(
        &self,
        request: TaskRequest,
        observations: Vec<ObservationEvent>,
    ) -> Result<RunResult, ControlError> {
        let run_id = request.run_id.clone();
        let tick = TickId(1);
        let cancel = self.register_active(&run_id);
        let result = self
            .run_task_inner(&request, observations, tick, &cancel)
            .await;
        self.unregister_active(&run_id);
        self.working.clear_run(&run_id);
        result
    }

    async fn run_task_inner(
        &self,
        request: &TaskRequest,
        observations: Vec<ObservationEvent>,
        tick: TickId,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ControlError> {
        let run_id = request.run_id.clone();

        self.audit.append(AuditEvent::new(
            run_id.clone(),
            tick,
            AuditKind::RunStarted,
            serde_json::json!({
                "task_id": &request.task_id,
                "intent": redact_text(&request.intent),
                "observations": observations.len(),
                "empty_context": observations.is_empty(),
                "sources": observations.iter().map(|o| o.source).collect::<Vec<_>>(),
            }),
        ))?;

        // 规划与策略门控；策略拒绝时按配置额度重新规划
        let mut replans = 0u32;
        let (proposal, plan_decision, invocations, diff_artifact) = loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&run_id, tick).await;
            }

            let proposal = match self.plan_once(&run_id, tick, request, &observations).await {
                Ok(p) => p,
                Err(e @ ControlError::SchemaInvalid(_))
                    if replans < self.config.tools.max_attempts =>
                {
                    replans += 1;
                    tracing::warn!(run_id = %run_id, "plan reply invalid ({e}), replanning");
                    continue;
                }
                Err(e) => return self.finish_failed(&run_id, tick, e, vec![]).await,
            };

            // diff-first：先把 diff 物化为可评审工件，再谈任何评估
            let diff_artifact = match &proposal.diff {
                Some(diff) => Some(self.store.put_text("diffs", "diff", diff)?),
                None => None,
            };

            self.audit.append(AuditEvent::new(
                run_id.clone(),
                tick,
                AuditKind::PlanProposed,
                serde_json::json!({
                    "agent_type": proposal.agent_type,
                    "tool_calls": proposal.tool_calls.iter().map(|c| {
                        serde_json::json!({"tool": &c.tool, "call_id": &c.call_id})
                    }).collect::<Vec<_>>(),
                    "diff_artifact": &diff_artifact,
                    "phase": &proposal.phase,
                    "follow_ups": &proposal.follow_ups,
                    "note": &proposal.note,
                }),
            ))?;

            let invocations: Vec<(ToolInvocation, Option<RiskClass>)> = proposal
                .tool_calls
                .iter()
                .map(|call| {
                    (
                        ToolInvocation::from_call(&run_id, tick, call),
                        self.choke.registry().risk_of(&call.tool),
                    )
                })
                .collect();
            let snapshot = PolicySnapshot {
                run_id: run_id.clone(),
                tick,
                has_diff: proposal.diff.is_some(),
            };
            let mut plan_decision = self.policy.evaluate_plan(&proposal, &invocations, &snapshot);

            if let Some(council) = &self.council {
                if let CouncilOutcome::Escalate(reasons) = council.review(&proposal) {
                    plan_decision.requires_approval = true;
                    plan_decision.reasons.extend(reasons);
                }
            }

            self.audit.append(AuditEvent::new(
                run_id.clone(),
                tick,
                AuditKind::PolicyEvaluated,
                serde_json::json!({
                    "allow": plan_decision.allow,
                    "requires_approval": plan_decision.requires_approval,
                    "reasons": &plan_decision.reasons,
                    "decisions": &plan_decision.decisions,
                }),
            ))?;

            if plan_decision.allow {
                break (proposal, plan_decision, invocations, diff_artifact);
            }
            if replans < self.config.tools.replan_on_denial {
                replans += 1;
                tracing::info!(run_id = %run_id, "plan denied, replanning ({replans})");
                continue;
            }
            return self
                .finish_failed(
                    &run_id,
                    tick,
                    ControlError::PolicyDenied {
                        reasons: plan_decision.reasons,
                    },
                    vec![],
                )
                .await;
        };

        // 审批：策略或评审团要求时挂起等待，超窗失败
        let mut grant = None;
        if plan_decision.requires_approval {
            let mut signatures: Vec<String> = plan_decision
                .decisions
                .iter()
                .filter(|d| d.requires_approval)
                .map(|d| d.signature.clone())
                .collect();
            if signatures.is_empty() {
                // 审批来自计划级信号（diff / 评审团）：为全部调用铸 arm
                signatures = invocations.iter().map(|(inv, _)| inv.signature()).collect();
            }
            let supplied = request
                .metadata
                .get("approval_token")
                .and_then(|v| v.as_str())
                .map(String::from);

            let outcome = tokio::select! {
                outcome = self.approvals.request(
                    &run_id,
                    diff_artifact.clone(),
                    &signatures,
                    supplied.as_deref(),
                ) => outcome,
                _ = cancel.cancelled() => {
                    return self.finish_cancelled(&run_id, tick).await;
                }
            };

            match outcome {
                ApprovalOutcome::Granted(g) => grant = Some(g),
                ApprovalOutcome::Denied(reason) => {
                    self.audit.append(AuditEvent::new(
                        run_id.clone(),
                        tick,
                        AuditKind::ApprovalDenied,
                        serde_json::json!({
                            "reason": &reason,
                            "diff_artifact": &diff_artifact,
                        }),
                    ))?;
                    return self
                        .finish_failed(&run_id, tick, ControlError::ApprovalDenied(reason), vec![])
                        .await;
                }
                ApprovalOutcome::TimedOut => {
                    let window_secs = self.approvals.window().as_secs();
                    self.audit.append(AuditEvent::new(
                        run_id.clone(),
                        tick,
                        AuditKind::ApprovalTimeout,
                        serde_json::json!({
                            "window_secs": window_secs,
                            "diff_artifact": &diff_artifact,
                        }),
                    ))?;
                    return self
                        .finish_failed(
                            &run_id,
                            tick,
                            ControlError::ApprovalTimeout { window_secs },
                            vec![],
                        )
                        .await;
                }
            }
        }

        // 执行：同一 Run 的调用严格串行；armed 调用不自动重试（arm 已消费）
        let mut results: Vec<ToolResult> = Vec::new();
        for (idx, (invocation, _)) in invocations.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&run_id, tick).await;
            }
            let decision = &plan_decision.decisions[idx];
            let signature = invocation.signature();

            let mut attempt = 1u32;
            let invoked = loop {
                let arm = if decision.requires_approval {
                    grant.as_mut().and_then(|g| g.take_arm(&signature))
                } else {
                    None
                };
                match self.choke.invoke(invocation, decision, arm).await {
                    Ok(result) => break Ok(result),
                    Err(e)
                        if e.is_transient()
                            && !decision.requires_approval
                            && attempt < self.config.tools.max_attempts =>
                    {
                        let delay = backoff_delay(attempt, self.config.tools.retry_base_ms);
                        tracing::warn!(
                            run_id = %run_id,
                            tool = %invocation.tool,
                            attempt,
                            "transient tool failure, retrying in {:?}",
                            delay
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            match invoked {
                Ok(result) => {
                    self.working.put(
                        format!("run:{}:call:{}", run_id, invocation.call_id.0),
                        serde_json::json!({
                            "tool": &invocation.tool,
                            "ok": true,
                            "output": &result.output,
                        }),
                        Some(&run_id),
                    );
                    results.push(result);
                }
                Err(e) => {
                    return self.finish_failed(&run_id, tick, e, results).await;
                }
            }
        }

        // 记录：先提交 StateDelta，被拒即失败；随后写情景记忆，最后落终止事件
        let phase = proposal.phase.clone().unwrap_or_else(|| "task".to_string());
        let delta_summary = serde_json::json!({
            "task_id": &request.task_id,
            "intent": redact_text(&request.intent),
            "phase": &phase,
            "tool_calls": results.len(),
            "diff_artifact": &diff_artifact,
        });
        let delta = StateDelta::seal(
            run_id.clone(),
            tick,
            "trajectory",
            phase.clone(),
            0.0,
            BTreeMap::from([
                ("task_id".to_string(), request.task_id.clone()),
                ("source".to_string(), "orchestrator".to_string()),
            ]),
            encode_payload(&delta_summary),
        );
        let delta_entry = delta.entry_id().to_string();
        if let Err(e) = self.state_repo.apply(delta) {
            self.audit.append(AuditEvent::new(
                run_id.clone(),
                tick,
                AuditKind::StateDeltaRejected,
                serde_json::json!({"reason": e.reason()}),
            ))?;
            return self.finish_failed(&run_id, tick, e, results).await;
        }

        let artifacts: Vec<ArtifactRef> = diff_artifact.iter().cloned().collect();
        let episode = Episode::new(
            run_id.clone(),
            tick,
            vec![
                format!("phase:{phase}"),
                format!("task:{}", request.task_id),
                "role:planner".to_string(),
            ],
            redact_text(&request.intent),
            serde_json::to_string(&serde_json::json!({
                "tool_calls": results.iter().map(|r| {
                    serde_json::json!({"tool": &r.tool, "call_id": &r.call_id, "ok": r.ok})
                }).collect::<Vec<_>>(),
                "phase": &phase,
            }))
            .unwrap_or_default(),
            artifacts,
        );
        if let Err(e) = self.episodes.append(&episode) {
            tracing::warn!(run_id = %run_id, "episode append failed: {e}");
        }

        self.audit.append(AuditEvent::new(
            run_id.clone(),
            tick,
            AuditKind::RunCompleted,
            serde_json::json!({
                "tool_calls": results.len(),
                "results": results.iter().map(|r| {
                    serde_json::json!({"call_id": &r.call_id, "tool": &r.tool, "ok": r.ok})
                }).collect::<Vec<_>>(),
                "delta_entry": delta_entry,
                "follow_ups": &proposal.follow_ups,
            }),
        ))?;

        Ok(RunResult {
            run_id,
            ok: true,
            tool_results: results,
            error: None,
            follow_ups: proposal.follow_ups.clone(),
        })
    }

    /// 一次规划：占路由槽位、组上下文、限时等待提议
    async fn plan_once(
        &self,
        run_id: &RunId,
        tick: TickId,
        request: &TaskRequest,
        observations: &[ObservationEvent],
    ) -> Result<PlanProposal, ControlError> {
        let lease = self.router.route(AgentType::Planner).await?;
        let ctx = PlanContext {
            run_id: run_id.clone(),
            tick,
            intent: request.intent.clone(),
            observations: observations.to_vec(),
            metadata: request.metadata.clone(),
            tool_schemas: self.choke.registry().to_schema_json(),
            memory_hints: self.working.keys_for_run(run_id),
        };
        let plan_timeout = Duration::from_secs(self.config.router.plan_timeout_secs);
        let proposal = tokio::time::timeout(plan_timeout, lease.backend().propose(&ctx))
            .await
            .map_err(|_| {
                ControlError::ModelUnavailable(format!(
                    "planner timed out after {}s",
                    plan_timeout.as_secs()
                ))
            })??;
        drop(lease);

        if proposal.is_empty() && proposal.note.is_none() {
            return Err(ControlError::SchemaInvalid("empty plan without note".into()));
        }
        Ok(proposal)
    }

    async fn finish_failed(
        &self,
        run_id: &RunId,
        tick: TickId,
        error: ControlError,
        results: Vec<ToolResult>,
    ) -> Result<RunResult, ControlError> {
        let reason = error.reason();
        self.audit.append(AuditEvent::new(
            run_id.clone(),
            tick,
            AuditKind::RunFailed,
            serde_json::json!({"error": &reason}),
        ))?;
        tracing::info!(run_id = %run_id, "run failed: {reason}");
        Ok(RunResult {
            run_id: run_id.clone(),
            ok: false,
            tool_results: results,
            error: Some(reason),
            follow_ups: vec![],
        })
    }

    async fn finish_cancelled(
        &self,
        run_id: &RunId,
        tick: TickId,
    ) -> Result<RunResult, ControlError> {
        self.audit.append(AuditEvent::new(
            run_id.clone(),
            tick,
            AuditKind::RunCancelled,
            serde_json::json!({"reason": "cancelled"}),
        ))?;
        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(RunResult {
            run_id: run_id.clone(),
            ok: false,
            tool_results: vec![],
            error: Some("run cancelled".to_string()),
            follow_ups: vec![],
        })
    }
}

/// 从任务请求派生观察事件：metadata.path 视为文件观察，意图本身作为 user 观察
pub fn observations_for(request: &TaskRequest) -> Vec<ObservationEvent> {
    let mut out = vec![ObservationEvent::now(
        ObservationSource::User,
        serde_json::json!({"intent": &request.intent}),
    )];
    if let Some(path) = request.metadata.get("path").and_then(|v| v.as_str()) {
        out.push(ObservationEvent::now(
            ObservationSource::Fs,
            serde_json::json!({"path": path}),
        ));
    }
    out
}

/// 控制面主循环：消费任务与 follow-up 队列，按并发上限跑 Run。
/// 返回任务发送端；循环在发送端关闭后退出。
pub fn spawn_control_plane(
    orchestrator: Arc<Orchestrator>,
    max_concurrent_runs: usize,
) -> mpsc::UnboundedSender<TaskRequest> {
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<TaskRequest>();
    let (scheduler, mut follow_up_rx) = RunScheduler::new(max_concurrent_runs);
    let scheduler = Arc::new(scheduler);

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                Some(req) = task_rx.recv() => req,
                Some(req) = follow_up_rx.recv() => req,
                else => break,
            };

            let permit = scheduler.acquire_run().await;
            let orchestrator = orchestrator.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let observations = observations_for(&request);
                let task_id = request.task_id.clone();
                match orchestrator.run_task(request, observations).await {
                    Ok(result) => {
                        if result.ok && !result.follow_ups.is_empty() {
                            scheduler.enqueue_follow_ups(&task_id, &result.follow_ups);
                        }
                    }
                    Err(e) => {
                        tracing::error!("run infrastructure failure: {e}");
                    }
                }
            });
        }
        tracing::info!("control plane loop stopped");
    });

    task_tx
}
