//! 工具执行唯一通道（choke point）
//!
//! 任何副作用动作都从 `invoke` 走：入参 schema 校验、针对这一次调用重新计算策略、
//! 核对 ExecutionArm、限时执行、结果落工件仓库。无论成败，每次 invoke 恰好追加
//! 一条审计记录；内部失败以类型化错误返回，绝不绕过审计向上抛。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::core::error::ControlError;
use crate::core::types::{ToolInvocation, ToolResult};
use crate::policy::{PolicyDecision, PolicyEngine, PolicySnapshot, RiskClass};
use crate::tools::approval::ExecutionArm;
use crate::tools::registry::ToolRegistry;
use crate::tools::store::{ArtifactRef, ArtifactStore};

/// 约定：工具返回以 "transient:" 开头的错误视为暂时性失败，允许退避重试
const TRANSIENT_PREFIX: &str = "transient:";

pub struct ToolChokePoint {
    registry: ToolRegistry,
    policy: PolicyEngine,
    audit: Arc<AuditLog>,
    store: ArtifactStore,
    call_timeout: Duration,
}

impl ToolChokePoint {
    pub fn new(
        registry: ToolRegistry,
        policy: PolicyEngine,
        audit: Arc<AuditLog>,
        store: ArtifactStore,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            audit,
            store,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// 执行一次调用。decision 必须是针对同一签名计算出的；这里仍会重新评估一次，
    /// 两者不一致按拒绝处理。变更类调用必须带 arm，arm 按值消费。
    pub async fn invoke(
        &self,
        invocation: &ToolInvocation,
        decision: &PolicyDecision,
        arm: Option<ExecutionArm>,
    ) -> Result<ToolResult, ControlError> {
        let start = Instant::now();
        let signature = invocation.signature();
        let armed = arm.is_some();

        let (outcome, artifact) = self.guard_and_execute(invocation, decision, arm, &signature).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let (ok, error) = match &outcome {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.reason())),
        };

        // 审批通过后的执行以 ApprovalGranted 记录（授权与执行结局同条可查），
        // 其余调用记 ToolExecuted。每次 invoke 的追加恰好发生一次。
        let kind = if decision.requires_approval && armed {
            AuditKind::ApprovalGranted
        } else {
            AuditKind::ToolExecuted
        };
        let payload = serde_json::json!({
            "call_id": &invocation.call_id,
            "tool": &invocation.tool,
            "signature": &signature,
            "allow": decision.allow,
            "requires_approval": decision.requires_approval,
            "risk": decision.risk,
            "reasons": &decision.reasons,
            "armed": armed,
            "ok": ok,
            "error": error,
            "duration_ms": duration_ms,
            "artifact": artifact,
        });
        self.audit.append(AuditEvent::new(
            invocation.run_id.clone(),
            invocation.tick,
            kind,
            payload,
        ))?;

        tracing::info!(
            tool = %invocation.tool,
            run_id = %invocation.run_id,
            ok,
            duration_ms,
            "tool invocation"
        );

        match outcome {
            Ok(output) => Ok(ToolResult {
                run_id: invocation.run_id.clone(),
                call_id: invocation.call_id.clone(),
                tool: invocation.tool.clone(),
                ok: true,
                output,
                error: None,
                duration_ms,
            }),
            Err(e) => Err(e),
        }
    }

    /// 前置检查与执行；返回 (结果, 工件引用)。任何分支都不触碰审计日志，
    /// 追加由 invoke 统一完成。
    async fn guard_and_execute(
        &self,
        invocation: &ToolInvocation,
        decision: &PolicyDecision,
        arm: Option<ExecutionArm>,
        signature: &str,
    ) -> (Result<Value, ControlError>, Option<ArtifactRef>) {
        let Some(tool) = self.registry.get(&invocation.tool) else {
            return (
                Err(ControlError::PolicyDenied {
                    reasons: vec!["unknown_tool".into()],
                }),
                None,
            );
        };

        if let Err(msg) = validate_args(&tool.parameters_schema(), &invocation.args) {
            return (Err(ControlError::SchemaInvalid(msg)), None);
        }

        // 能力清单与风险类别必须自洽，声明之外的能力一概没有
        let caps = tool.capabilities();
        let caps_ok = match tool.risk() {
            RiskClass::Read => true,
            RiskClass::Write => caps.fs_write,
            RiskClass::Exec => caps.subprocess,
            RiskClass::Network => caps.network,
        };
        if !caps_ok {
            return (
                Err(ControlError::PolicyDenied {
                    reasons: vec!["capability_manifest_mismatch".into()],
                }),
                None,
            );
        }

        // 针对这一次调用重新计算策略；传入的决策只作核对，不作依据
        let snapshot = PolicySnapshot {
            run_id: invocation.run_id.clone(),
            tick: invocation.tick,
            has_diff: false,
        };
        let fresh = self
            .policy
            .evaluate(invocation, Some(tool.risk()), &snapshot);
        if !fresh.allow {
            return (
                Err(ControlError::PolicyDenied {
                    reasons: fresh.reasons,
                }),
                None,
            );
        }
        if decision.signature != *signature || !decision.allow {
            return (
                Err(ControlError::PolicyDenied {
                    reasons: vec!["decision_signature_mismatch".into()],
                }),
                None,
            );
        }

        if fresh.requires_approval {
            match arm {
                Some(arm) if arm.covers(&invocation.run_id, signature) => {}
                Some(_) => {
                    return (
                        Err(ControlError::PolicyDenied {
                            reasons: vec!["execution_arm_mismatch".into()],
                        }),
                        None,
                    );
                }
                None => {
                    return (
                        Err(ControlError::PolicyDenied {
                            reasons: vec!["approval_required".into()],
                        }),
                        None,
                    );
                }
            }
        }

        let executed = timeout(self.call_timeout, tool.execute(invocation.args.clone())).await;
        match executed {
            Ok(Ok(output)) => {
                let artifact = self
                    .store
                    .put_json("tool_results", "tool_result", &output)
                    .ok();
                (Ok(output), artifact)
            }
            Ok(Err(msg)) => {
                let err = if let Some(rest) = msg.strip_prefix(TRANSIENT_PREFIX) {
                    ControlError::transient(rest.trim())
                } else {
                    ControlError::permanent(msg)
                };
                (Err(err), None)
            }
            Err(_) => (
                Err(ControlError::transient(format!(
                    "tool timed out after {}s",
                    self.call_timeout.as_secs()
                ))),
                None,
            ),
        }
    }
}

/// 轻量 schema 校验：args 必须是对象，required 字段必须在场且类型匹配
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("args must be a JSON object".to_string());
    };
    let required = schema
        .get("required")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for key in required {
        let Some(key) = key.as_str() else { continue };
        let Some(value) = obj.get(key) else {
            return Err(format!("missing required field: {key}"));
        };
        if let Some(expected) = schema
            .get("properties")
            .and_then(|p| p.get(key))
            .and_then(|s| s.get("type"))
            .and_then(|t| t.as_str())
        {
            let matches = match expected {
                "string" => value.is_string(),
                "integer" | "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("field {key} must be {expected}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunId, TickId, ToolCall};
    use crate::policy::{PolicyConfig, PolicyEngine};
    use crate::tools::registry::Tool;
    use crate::tools::sandbox::Capabilities;
    use async_trait::async_trait;

    struct OkTool;

    #[async_trait]
    impl Tool for OkTool {
        fn name(&self) -> &str {
            "ok"
        }
        fn description(&self) -> &str {
            "Always succeeds."
        }
        fn risk(&self) -> RiskClass {
            RiskClass::Read
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })
        }
        async fn execute(&self, args: Value) -> Result<Value, String> {
            Ok(serde_json::json!({"echo": args}))
        }
    }

    struct FlakyTool;

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Always fails transiently."
        }
        fn risk(&self) -> RiskClass {
            RiskClass::Read
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn execute(&self, _args: Value) -> Result<Value, String> {
            Err("transient: connection reset".to_string())
        }
    }

    fn choke(dir: &std::path::Path) -> (ToolChokePoint, Arc<AuditLog>) {
        let mut registry = ToolRegistry::new();
        registry.register(OkTool);
        registry.register(FlakyTool);
        let audit = Arc::new(AuditLog::open(dir.join("audit.jsonl")).unwrap());
        let choke = ToolChokePoint::new(
            registry,
            PolicyEngine::new(PolicyConfig::default()),
            audit.clone(),
            ArtifactStore::new(dir),
            Duration::from_secs(5),
        );
        (choke, audit)
    }

    fn invocation(run: &RunId, tool: &str, args: Value) -> ToolInvocation {
        ToolInvocation::from_call(run, TickId(1), &ToolCall::new(tool, args))
    }

    fn decision_for(choke: &ToolChokePoint, inv: &ToolInvocation) -> PolicyDecision {
        let snapshot = PolicySnapshot {
            run_id: inv.run_id.clone(),
            tick: inv.tick,
            has_diff: false,
        };
        choke
            .policy()
            .evaluate(inv, choke.registry().risk_of(&inv.tool), &snapshot)
    }

    #[tokio::test]
    async fn test_invoke_success_appends_one_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let (choke, audit) = choke(dir.path());
        let run = RunId::new();
        let inv = invocation(&run, "ok", serde_json::json!({"path": "a"}));
        let decision = decision_for(&choke, &inv);

        let result = choke.invoke(&inv, &decision, None).await.unwrap();
        assert!(result.ok);

        let events = audit.replay(&run).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::ToolExecuted);
        assert_eq!(events[0].payload["ok"], true);
    }

    #[tokio::test]
    async fn test_schema_violation_is_audited_and_typed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (choke, audit) = choke(dir.path());
        let run = RunId::new();
        let inv = invocation(&run, "ok", serde_json::json!({}));
        let decision = decision_for(&choke, &inv);

        let err = choke.invoke(&inv, &decision, None).await.unwrap_err();
        assert!(matches!(err, ControlError::SchemaInvalid(_)));

        let events = audit.replay(&run).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["ok"], false);
    }

    #[tokio::test]
    async fn test_stale_decision_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (choke, _) = choke(dir.path());
        let run = RunId::new();
        let inv = invocation(&run, "ok", serde_json::json!({"path": "a"}));
        // 对另一个调用计算的决策不得套用到本调用
        let other = invocation(&run, "ok", serde_json::json!({"path": "b"}));
        let stale = decision_for(&choke, &other);

        let err = choke.invoke(&inv, &stale, None).await.unwrap_err();
        match err {
            ControlError::PolicyDenied { reasons } => {
                assert!(reasons.contains(&"decision_signature_mismatch".to_string()));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_transient_error_classified() {
        let dir = tempfile::TempDir::new().unwrap();
        let (choke, audit) = choke(dir.path());
        let run = RunId::new();
        let inv = invocation(&run, "flaky", serde_json::json!({}));
        let decision = decision_for(&choke, &inv);

        let err = choke.invoke(&inv, &decision, None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(audit.replay(&run).unwrap().len(), 1);
    }

    #[test]
    fn test_validate_args_type_check() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": ["n"]
        });
        assert!(validate_args(&schema, &serde_json::json!({"n": 3})).is_ok());
        assert!(validate_args(&schema, &serde_json::json!({"n": "three"})).is_err());
        assert!(validate_args(&schema, &serde_json::json!([1, 2])).is_err());
    }
}
