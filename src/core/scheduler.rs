//! Run 调度：并发上限与后续任务队列
//!
//! 多个 Run 并发执行，单个 Run 内部严格串行；并发度由 Semaphore 限制。
//! Completed 的 Run 声明的 follow_ups 在这里转成新的 TaskRequest 排队。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::core::types::TaskRequest;

/// Run 槽位 ID（诊断用）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotId(u64);

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(0);

impl SlotId {
    pub fn next() -> Self {
        Self(NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct RunScheduler {
    run_semaphore: Arc<Semaphore>,
    follow_up_tx: mpsc::UnboundedSender<TaskRequest>,
}

impl RunScheduler {
    /// 返回调度器与 follow-up 消费端；消费端由控制面主循环接走
    pub fn new(max_concurrent_runs: usize) -> (Self, mpsc::UnboundedReceiver<TaskRequest>) {
        let (follow_up_tx, follow_up_rx) = mpsc::unbounded_channel();
        (
            Self {
                run_semaphore: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
                follow_up_tx,
            },
            follow_up_rx,
        )
    }

    /// 占一个 Run 并发槽位；满了就排队
    pub async fn acquire_run(&self) -> tokio::sync::OwnedSemaphorePermit {
        // Semaphore 只在关闭时返回错误，此处不会关闭
        match self.run_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("run semaphore closed"),
        }
    }

    /// 把计划声明的 follow-ups 转成新任务排队
    pub fn enqueue_follow_ups(&self, parent_task_id: &str, follow_ups: &[String]) {
        for intent in follow_ups {
            let request = TaskRequest::new(intent.clone()).with_metadata(
                "parent_task",
                serde_json::Value::String(parent_task_id.to_string()),
            );
            if self.follow_up_tx.send(request).is_err() {
                tracing::warn!("follow-up queue closed, dropping task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (scheduler, _rx) = RunScheduler::new(2);
        let p1 = scheduler.acquire_run().await;
        let _p2 = scheduler.acquire_run().await;

        let scheduler = Arc::new(scheduler);
        let third = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p = scheduler.acquire_run().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!third.is_finished());

        drop(p1);
        third.await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_ups_become_tasks() {
        let (scheduler, mut rx) = RunScheduler::new(1);
        scheduler.enqueue_follow_ups("task-1", &["run the tests".into(), "update docs".into()]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.intent, "run the tests");
        assert_eq!(
            first.metadata["parent_task"],
            serde_json::Value::String("task-1".into())
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(second.intent, "update docs");
    }
}
