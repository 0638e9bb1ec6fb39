//! 控制面集成测试
//!
//! 覆盖端到端场景：带审批的 diff 修复、审批超时、并发 Run 抢模型槽位、
//! 审计回放的确定性，以及「未经策略放行绝无工具结果」的因果不变量。

use std::sync::Arc;
use std::time::Duration;

use hive::audit::{replay_run, AuditKind};
use hive::config::AppConfig;
use hive::core::{observations_for, Orchestrator, RunState, TaskRequest};
use hive::memory::EpisodeQuery;

const LINT_DIFF: &str = "--- a/foo.py\n+++ b/foo.py\n@@ -1 +1 @@\n-x=1\n+x = 1\n";

/// 每个测试独立的 runtime/workspace，审批 token 固定
fn test_config(dir: &std::path::Path, approval_window_secs: u64) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.runtime_root = dir.join("runtime");
    cfg.app.workspace_root = dir.join("workspace");
    cfg.approval.window_secs = approval_window_secs;
    cfg.approval.token = Some("approve-me".to_string());
    // 路由表不存在，build 时退回全 null 路由
    cfg.router.table_path = dir.join("missing-router.toml");
    cfg
}

async fn init_git_workspace(workspace: &std::path::Path) {
    std::fs::create_dir_all(workspace).unwrap();
    let out = tokio::process::Command::new("git")
        .current_dir(workspace)
        .args(["init", "-q"])
        .output()
        .await
        .unwrap();
    assert!(out.status.success());
    std::fs::write(workspace.join("foo.py"), "x=1\n").unwrap();
}

fn lint_fix_request() -> TaskRequest {
    TaskRequest::new("fix lint error in foo.py")
        .with_metadata("diff", serde_json::Value::String(LINT_DIFF.to_string()))
        .with_metadata(
            "approval_token",
            serde_json::Value::String("approve-me".to_string()),
        )
}

#[tokio::test]
async fn test_lint_fix_scenario_records_exactly_five_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = test_config(dir.path(), 60);
    init_git_workspace(&cfg.app.workspace_root).await;

    let orchestrator = Orchestrator::build(cfg).unwrap();
    let request = lint_fix_request();
    let run_id = request.run_id.clone();

    let observations = observations_for(&request);
    let result = orchestrator.run_task(request, observations).await.unwrap();
    assert!(result.ok, "run failed: {:?}", result.error);

    // diff 真的被应用
    assert_eq!(
        std::fs::read_to_string(dir.path().join("workspace/foo.py")).unwrap(),
        "x = 1\n"
    );

    // 恰好 5 条审计事件，顺序固定
    let events = orchestrator.audit().replay(&run_id).unwrap();
    let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AuditKind::RunStarted,
            AuditKind::PlanProposed,
            AuditKind::PolicyEvaluated,
            AuditKind::ApprovalGranted,
            AuditKind::RunCompleted,
        ]
    );

    // 恰好一条 StateDelta 落库，phase 为 lint_fix
    let deltas = orchestrator.state_repo().entries_for_run(&run_id);
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].phase(), "lint_fix");

    // 情景记忆收到结构化摘要
    let episodes = orchestrator
        .episodes()
        .query(&EpisodeQuery {
            run_id: Some(run_id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(episodes[0].tags.contains(&"phase:lint_fix".to_string()));
}

#[tokio::test]
async fn test_approval_timeout_fails_run_without_tool_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path(), 1);
    // 静态 token 不生效（请求不带），审窗 1s 超时
    cfg.approval.token = None;
    init_git_workspace(&cfg.app.workspace_root).await;

    let orchestrator = Orchestrator::build(cfg).unwrap();
    let request = TaskRequest::new("fix lint error in foo.py")
        .with_metadata("diff", serde_json::Value::String(LINT_DIFF.to_string()));
    let run_id = request.run_id.clone();

    let observations = observations_for(&request);
    let result = orchestrator.run_task(request, observations).await.unwrap();
    assert!(!result.ok);
    assert!(result.tool_results.is_empty());

    // 文件原样未动，零 StateDelta
    assert_eq!(
        std::fs::read_to_string(dir.path().join("workspace/foo.py")).unwrap(),
        "x=1\n"
    );
    assert!(orchestrator.state_repo().entries_for_run(&run_id).is_empty());

    let events = orchestrator.audit().replay(&run_id).unwrap();
    let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditKind::ApprovalTimeout));
    assert!(kinds.contains(&AuditKind::RunFailed));
    // 超时路径绝无工具执行记录
    assert!(!kinds.contains(&AuditKind::ToolExecuted));
    assert!(!kinds.contains(&AuditKind::ApprovalGranted));

    let records = orchestrator.audit().records().unwrap();
    assert_eq!(
        replay_run(&records, &run_id).unwrap().final_state,
        RunState::Failed
    );
}

#[tokio::test]
async fn test_no_tool_result_without_prior_allowed_policy_event() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = test_config(dir.path(), 60);
    std::fs::create_dir_all(&cfg.app.workspace_root).unwrap();
    std::fs::write(cfg.app.workspace_root.join("hello.txt"), "hi").unwrap();

    let orchestrator = Orchestrator::build(cfg).unwrap();
    let request = TaskRequest::new("inspect hello.txt")
        .with_metadata("path", serde_json::Value::String("hello.txt".to_string()));
    let run_id = request.run_id.clone();

    let observations = observations_for(&request);
    let result = orchestrator.run_task(request, observations).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.tool_results.len(), 1);

    // 因果不变量：每条执行记录之前必须有 allow=true 的策略评估
    let events = orchestrator.audit().replay(&run_id).unwrap();
    let mut allowed_seen = false;
    for event in &events {
        match event.kind {
            AuditKind::PolicyEvaluated => {
                allowed_seen = event.payload["allow"].as_bool().unwrap_or(false);
            }
            AuditKind::ToolExecuted | AuditKind::ApprovalGranted => {
                assert!(allowed_seen, "tool record before allowed policy evaluation");
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_exec_denied_by_default_fails_run_with_reason() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path(), 60);
    std::fs::create_dir_all(&cfg.app.workspace_root).unwrap();
    std::fs::write(cfg.app.workspace_root.join("a.txt"), "x").unwrap();
    // 把只读工具升级为 exec 对待，触发默认拒绝路径
    cfg.policy
        .risk_overrides
        .insert("fs.read_file".to_string(), "exec".to_string());
    let orchestrator = Orchestrator::build(cfg).unwrap();

    let request = TaskRequest::new("read a file")
        .with_metadata("path", serde_json::Value::String("a.txt".to_string()));
    let run_id = request.run_id.clone();
    let observations = observations_for(&request);
    let result = orchestrator.run_task(request, observations).await.unwrap();
    assert!(!result.ok);
    let err = result.error.unwrap();
    assert!(err.contains("exec_denied_by_default"), "reason: {err}");

    let events = orchestrator.audit().replay(&run_id).unwrap();
    let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AuditKind::RunStarted,
            AuditKind::PlanProposed,
            AuditKind::PolicyEvaluated,
            AuditKind::RunFailed,
        ]
    );
}

#[tokio::test]
async fn test_concurrent_runs_block_on_model_slot_in_request_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = test_config(dir.path(), 60);
    std::fs::create_dir_all(&cfg.app.workspace_root).unwrap();
    std::fs::write(cfg.app.workspace_root.join("a.txt"), "a").unwrap();
    std::fs::write(cfg.app.workspace_root.join("b.txt"), "b").unwrap();

    let orchestrator = Arc::new(Orchestrator::build(cfg).unwrap());

    // 先手工占住槽位，保证两个 Run 都得排队
    let lease = orchestrator
        .router()
        .route(hive::core::AgentType::Planner)
        .await
        .unwrap();

    let first = {
        let orchestrator = orchestrator.clone();
        let request = TaskRequest::new("inspect a")
            .with_metadata("path", serde_json::Value::String("a.txt".to_string()));
        tokio::spawn(async move {
            let obs = observations_for(&request);
            orchestrator.run_task(request, obs).await.unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = {
        let orchestrator = orchestrator.clone();
        let request = TaskRequest::new("inspect b")
            .with_metadata("path", serde_json::Value::String("b.txt".to_string()));
        tokio::spawn(async move {
            let obs = observations_for(&request);
            orchestrator.run_task(request, obs).await.unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;

    // 槽位被占期间两个 Run 都未完成
    assert!(!first.is_finished());
    assert!(!second.is_finished());
    drop(lease);

    let r1 = first.await.unwrap();
    let r2 = second.await.unwrap();
    assert!(r1.ok && r2.ok);

    // 槽位获取顺序与请求顺序一致（首条为手工占位）
    let acquisitions = orchestrator.router().acquisitions();
    assert_eq!(acquisitions.len(), 3);
    assert!(acquisitions[0].order < acquisitions[1].order);
    assert!(acquisitions[1].order < acquisitions[2].order);
}

#[tokio::test]
async fn test_replay_is_deterministic_across_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = test_config(dir.path(), 60);
    init_git_workspace(&cfg.app.workspace_root).await;

    let completed_run = {
        let orchestrator = Orchestrator::build(cfg.clone()).unwrap();
        let request = lint_fix_request();
        let run_id = request.run_id.clone();
        let obs = observations_for(&request);
        let result = orchestrator.run_task(request, obs).await.unwrap();
        assert!(result.ok);
        run_id
    };

    // 同一进程重开（崩溃后重启的形状）：回放必须重建出同一终态
    let orchestrator = Orchestrator::build(cfg).unwrap();
    let records = orchestrator.audit().records().unwrap();
    let s1 = replay_run(&records, &completed_run).unwrap();
    let s2 = replay_run(&records, &completed_run).unwrap();
    assert_eq!(s1.final_state, RunState::Completed);
    assert_eq!(s1.state_hash, s2.state_hash);

    // 交叉核对通过且无需回滚
    let recovered = orchestrator.recover_runs().unwrap();
    assert!(recovered.is_empty());
}

#[tokio::test]
async fn test_working_memory_dropped_at_run_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = test_config(dir.path(), 60);
    std::fs::create_dir_all(&cfg.app.workspace_root).unwrap();
    std::fs::write(cfg.app.workspace_root.join("a.txt"), "x").unwrap();

    let orchestrator = Orchestrator::build(cfg).unwrap();
    let request = TaskRequest::new("inspect")
        .with_metadata("path", serde_json::Value::String("a.txt".to_string()));
    let run_id = request.run_id.clone();
    let obs = observations_for(&request);
    let result = orchestrator.run_task(request, obs).await.unwrap();
    assert!(result.ok);

    // Run 完成后该 Run 的工作记忆必须已清空
    assert!(orchestrator.working().keys_for_run(&run_id).is_empty());
}
