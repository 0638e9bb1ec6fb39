//! 模型路由器
//!
//! route(AgentType) -> ModelLease。全局只有一个「已加载模型」槽位，
//! 槽位是一把公平的 tokio Mutex：等待者按到达顺序获得租约（FCFS 交换队列），
//! 租约在手即独占，释放后下一位才可能触发换载。换载耗时对照软 SLO 打日志，不强制。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;

use crate::core::error::ControlError;
use crate::core::types::AgentType;
use crate::models::backend::PlanBackend;
use crate::models::null::NullBackend;
use crate::models::openai_compat::OpenAiCompatBackend;
use crate::models::profiles::{ModelSpec, RouterTable};

struct LoadedModel {
    name: String,
    backend: Arc<dyn PlanBackend>,
}

#[derive(Default)]
struct ActiveSlot {
    loaded: Option<LoadedModel>,
}

/// 槽位租约：持有期间路由器不会把模型让给任何其他 Run
pub struct ModelLease {
    guard: OwnedMutexGuard<ActiveSlot>,
    name: String,
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ModelLease {
    pub fn model_name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Arc<dyn PlanBackend> {
        // 租约存在即已加载；防御性兜底为 null 后端
        self.guard
            .loaded
            .as_ref()
            .map(|m| m.backend.clone())
            .unwrap_or_else(|| Arc::new(NullBackend))
    }
}

/// 一次槽位获取的记录（观测与排队顺序验证用）
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub order: u64,
    pub role: AgentType,
    pub model: String,
    pub swapped: bool,
}

pub struct ModelRouter {
    table: RouterTable,
    slot: Arc<tokio::sync::Mutex<ActiveSlot>>,
    swap_slo: Duration,
    counter: AtomicU64,
    acquisitions: Mutex<Vec<Acquisition>>,
}

impl ModelRouter {
    pub fn new(table: RouterTable, swap_slo: Duration) -> Self {
        Self {
            table,
            slot: Arc::new(tokio::sync::Mutex::new(ActiveSlot::default())),
            swap_slo,
            counter: AtomicU64::new(0),
            acquisitions: Mutex::new(Vec::new()),
        }
    }

    pub fn table(&self) -> &RouterTable {
        &self.table
    }

    /// 获取槽位顺序的历史记录
    pub fn acquisitions(&self) -> Vec<Acquisition> {
        self.acquisitions
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// 解析角色并占有模型槽位；需要时先换载。阻塞直到槽位可用。
    pub async fn route(&self, agent: AgentType) -> Result<ModelLease, ControlError> {
        let (name, spec) = self.table.resolve(agent)?;
        let name = name.to_string();
        let spec = spec.clone();

        let mut guard = self.slot.clone().lock_owned().await;

        let needs_swap = guard
            .loaded
            .as_ref()
            .map(|m| m.name != name)
            .unwrap_or(true);
        if needs_swap {
            let start = Instant::now();
            // 先逐出再加载；同一时刻最多一个模型在载
            guard.loaded = None;
            let backend = build_backend(&name, &spec)?;
            guard.loaded = Some(LoadedModel {
                name: name.clone(),
                backend,
            });
            let elapsed = start.elapsed();
            if elapsed > self.swap_slo {
                tracing::warn!(
                    model = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    slo_ms = self.swap_slo.as_millis() as u64,
                    "model swap latency above soft SLO"
                );
            } else {
                tracing::debug!(model = %name, elapsed_ms = elapsed.as_millis() as u64, "model swap");
            }
        }

        let order = self.counter.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.acquisitions.lock() {
            log.push(Acquisition {
                order,
                role: agent,
                model: name.clone(),
                swapped: needs_swap,
            });
        }

        Ok(ModelLease { guard, name })
    }
}

fn build_backend(name: &str, spec: &ModelSpec) -> Result<Arc<dyn PlanBackend>, ControlError> {
    match spec.kind.as_str() {
        "null" => Ok(Arc::new(NullBackend)),
        "openai_compat" => {
            let model = spec.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            if std::env::var("OPENAI_API_KEY").is_err() {
                tracing::warn!(model = %name, "no OPENAI_API_KEY set, falling back to null backend");
                return Ok(Arc::new(NullBackend));
            }
            Ok(Arc::new(OpenAiCompatBackend::new(
                spec.base_url.as_deref(),
                &model,
                None,
            )))
        }
        other => Err(ControlError::ModelUnavailable(format!(
            "model kind not implemented: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_loads_and_reuses_model() {
        let router = ModelRouter::new(RouterTable::null_table(), Duration::from_secs(2));
        {
            let lease = router.route(AgentType::Planner).await.unwrap();
            assert_eq!(lease.model_name(), "null");
        }
        {
            let lease = router.route(AgentType::Critic).await.unwrap();
            assert_eq!(lease.model_name(), "null");
        }
        let acq = router.acquisitions();
        assert_eq!(acq.len(), 2);
        assert!(acq[0].swapped);
        // 第二次同名路由不应触发换载
        assert!(!acq[1].swapped);
    }

    #[tokio::test]
    async fn test_slot_is_exclusive_and_fcfs() {
        let router = Arc::new(ModelRouter::new(
            RouterTable::null_table(),
            Duration::from_secs(2),
        ));

        let first = router.route(AgentType::Planner).await.unwrap();

        let second = {
            let router = router.clone();
            tokio::spawn(async move {
                let lease = router.route(AgentType::Planner).await.unwrap();
                drop(lease);
            })
        };

        // 第二个请求此刻应仍在排队
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(first);
        second.await.unwrap();

        let acq = router.acquisitions();
        assert_eq!(acq.len(), 2);
        assert!(acq[0].order < acq[1].order);
    }

    #[tokio::test]
    async fn test_unrouted_role_is_model_unavailable() {
        let mut table = RouterTable::null_table();
        table.routing.remove("critic");
        let router = ModelRouter::new(table, Duration::from_secs(2));
        let err = router.route(AgentType::Critic).await.unwrap_err();
        assert!(matches!(err, ControlError::ModelUnavailable(_)));
    }
}
