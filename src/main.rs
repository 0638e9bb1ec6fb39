//! Hive - 智能体编排控制平面 CLI
//!
//! 子命令：run（单次任务编排）、replay（审计日志校验与回放）、doctor（环境体检）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use hive::audit;
use hive::config::load_config;
use hive::core::{Orchestrator, TaskRequest};
use hive::models::RouterTable;

#[derive(Parser)]
#[command(name = "hive", version, about = "deterministic agent-orchestration control plane")]
struct Cli {
    /// 额外配置文件（叠加在 config/default.toml 与 HIVE__* 之上）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// 提交一个任务并等待 Run 终态
    Run {
        /// 任务意图
        #[arg(long)]
        intent: String,
        /// 观察路径（workspace 相对），作为 fs 观察事件传入
        #[arg(long)]
        path: Option<String>,
        /// unified diff 文件；内容作为提议变更传入规划上下文
        #[arg(long)]
        diff: Option<PathBuf>,
        /// 审批 token（与 approval.token 匹配时免交互放行）
        #[arg(long)]
        approval_token: Option<String>,
    },
    /// 校验审计日志并回放每个 Run 的终态
    Replay {
        /// 日志路径；缺省用配置中的 runtime 日志
        log: Option<PathBuf>,
    },
    /// 环境体检：目录、配置、路由表、审计链
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        hive::config::AppConfig::default()
    });

    match cli.cmd {
        Cmd::Run {
            intent,
            path,
            diff,
            approval_token,
        } => {
            let orchestrator =
                Arc::new(Orchestrator::build(cfg).context("failed to build control plane")?);
            let recovered = orchestrator
                .recover_runs()
                .context("crash recovery failed")?;
            if !recovered.is_empty() {
                tracing::info!("rolled back {} stranded run(s)", recovered.len());
            }

            let mut request = TaskRequest::new(intent);
            if let Some(path) = path {
                request = request.with_metadata("path", serde_json::Value::String(path));
            }
            if let Some(diff_path) = diff {
                let text = std::fs::read_to_string(&diff_path)
                    .with_context(|| format!("read diff {}", diff_path.display()))?;
                request = request.with_metadata("diff", serde_json::Value::String(text));
            }
            if let Some(token) = approval_token {
                request = request.with_metadata("approval_token", serde_json::Value::String(token));
            }

            let observations = hive::core::observations_for(&request);
            let result = orchestrator.run_task(request, observations).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                std::process::exit(1);
            }
        }
        Cmd::Replay { log } => {
            let path = log.unwrap_or_else(|| cfg.app.audit_log_path());
            let (last_seq, last_hash) =
                audit::verify_file(&path).context("audit verification failed")?;
            println!("CHAIN OK: events={last_seq} last_hash={last_hash}");

            let audit_log = audit::AuditLog::open(&path)?;
            let records = audit_log.records()?;
            for summary in audit::replay_all(&records).context("replay failed")? {
                println!(
                    "REPLAY OK: run_id={} events={} state={} state_hash={}",
                    summary.run_id, summary.events, summary.final_state, summary.state_hash
                );
            }
        }
        Cmd::Doctor => {
            let mut failures = 0;
            let mut check = |name: &str, ok: bool, detail: String| {
                if ok {
                    println!("OK   {name}: {detail}");
                } else {
                    println!("FAIL {name}: {detail}");
                    failures += 1;
                }
            };

            check(
                "runtime_root",
                std::fs::create_dir_all(&cfg.app.runtime_root).is_ok(),
                cfg.app.runtime_root.display().to_string(),
            );
            check(
                "workspace_root",
                std::fs::create_dir_all(&cfg.app.workspace_root).is_ok(),
                cfg.app.workspace_root.display().to_string(),
            );

            let router = RouterTable::load(&cfg.router.table_path);
            match router {
                Ok(table) => {
                    let planner = table.resolve(hive::core::AgentType::Planner);
                    check(
                        "router_table",
                        planner.is_ok(),
                        match planner {
                            Ok((name, spec)) => format!("planner -> {name} ({})", spec.kind),
                            Err(e) => e.to_string(),
                        },
                    );
                }
                Err(e) => check("router_table", false, e.to_string()),
            }

            let log_path = cfg.app.audit_log_path();
            if log_path.exists() {
                match audit::verify_file(&log_path) {
                    Ok((seq, _)) => check("audit_chain", true, format!("{seq} events verified")),
                    Err(e) => check("audit_chain", false, e.to_string()),
                }
            } else {
                check("audit_chain", true, "no log yet".to_string());
            }

            // 姿态信息：放开 exec/network 是合法配置，这里只提示不判错
            check(
                "policy_posture",
                true,
                format!(
                    "allow_exec={} allow_network={} allow_write={}",
                    cfg.policy.allow_exec, cfg.policy.allow_network, cfg.policy.allow_write
                ),
            );

            if failures > 0 {
                anyhow::bail!("{failures} check(s) failed");
            }
        }
    }

    Ok(())
}
