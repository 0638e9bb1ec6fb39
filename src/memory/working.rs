//! 工作记忆：TTL + 容量双重约束的运行期键值暂存
//!
//! 超容量按 LRU 逐出；过期条目在下次访问时不可见；Run 结束无条件清空该 Run 的全部条目。
//! 只存结构化 JSON，绝不存对话文本。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::types::RunId;

#[derive(Debug)]
struct Entry {
    value: serde_json::Value,
    run_id: Option<RunId>,
    expires_at: Instant,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, Entry>,
    access_counter: u64,
}

/// 统计快照
#[derive(Clone, Debug, serde::Serialize)]
pub struct WorkingMemoryStats {
    pub entries: usize,
    pub max_entries: usize,
}

pub struct WorkingMemory {
    inner: Mutex<Inner>,
    max_entries: usize,
    default_ttl: Duration,
}

impl WorkingMemory {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// 写入条目；容量满时逐出最久未使用的一条
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value, run_id: Option<&RunId>) {
        self.put_with_ttl(key, value, run_id, self.default_ttl)
    }

    pub fn put_with_ttl(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        run_id: Option<&RunId>,
        ttl: Duration,
    ) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut inner);

        // 覆盖写不占新名额
        if !inner.items.contains_key(&key) && inner.items.len() >= self.max_entries {
            if let Some(lru_key) = inner
                .items
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.items.remove(&lru_key);
                tracing::debug!(key = %lru_key, "working memory lru eviction");
            }
        }

        inner.access_counter += 1;
        let access = inner.access_counter;
        inner.items.insert(
            key,
            Entry {
                value,
                run_id: run_id.cloned(),
                expires_at: Instant::now() + ttl,
                last_access: access,
            },
        );
    }

    /// 读取；过期条目在这里被移除并返回 None
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut inner);
        inner.access_counter += 1;
        let access = inner.access_counter;
        let entry = inner.items.get_mut(key)?;
        entry.last_access = access;
        Some(entry.value.clone())
    }

    /// Run 完成时调用：该 Run 的条目无条件全部丢弃
    pub fn clear_run(&self, run_id: &RunId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .items
            .retain(|_, e| e.run_id.as_ref() != Some(run_id));
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.clear();
    }

    pub fn stats(&self) -> WorkingMemoryStats {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut inner);
        WorkingMemoryStats {
            entries: inner.items.len(),
            max_entries: self.max_entries,
        }
    }

    /// 某 Run 的键列表（规划上下文提示用）
    pub fn keys_for_run(&self, run_id: &RunId) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut inner);
        let mut keys: Vec<String> = inner
            .items
            .iter()
            .filter(|(_, e)| e.run_id.as_ref() == Some(run_id))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn evict_expired(inner: &mut Inner) {
        let now = Instant::now();
        inner.items.retain(|_, e| e.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_never_exceeded() {
        let wm = WorkingMemory::new(3, Duration::from_secs(60));
        for i in 0..10 {
            wm.put(format!("k{i}"), serde_json::json!(i), None);
            assert!(wm.stats().entries <= 3);
        }
        assert_eq!(wm.stats().entries, 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let wm = WorkingMemory::new(2, Duration::from_secs(60));
        wm.put("a", serde_json::json!(1), None);
        wm.put("b", serde_json::json!(2), None);
        // 访问 a 使 b 成为最久未使用
        wm.get("a");
        wm.put("c", serde_json::json!(3), None);

        assert!(wm.get("a").is_some());
        assert!(wm.get("b").is_none());
        assert!(wm.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry_unreachable_on_next_access() {
        let wm = WorkingMemory::new(8, Duration::from_secs(60));
        wm.put_with_ttl("gone", serde_json::json!(1), None, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(wm.get("gone").is_none());
        assert_eq!(wm.stats().entries, 0);
    }

    #[test]
    fn test_clear_run_drops_only_that_run() {
        let wm = WorkingMemory::new(8, Duration::from_secs(60));
        let a = RunId::new();
        let b = RunId::new();
        wm.put("a1", serde_json::json!(1), Some(&a));
        wm.put("b1", serde_json::json!(2), Some(&b));
        wm.clear_run(&a);
        assert!(wm.get("a1").is_none());
        assert!(wm.get("b1").is_some());
        assert_eq!(wm.keys_for_run(&b), vec!["b1".to_string()]);
    }

    #[test]
    fn test_overwrite_does_not_consume_capacity() {
        let wm = WorkingMemory::new(2, Duration::from_secs(60));
        wm.put("a", serde_json::json!(1), None);
        wm.put("b", serde_json::json!(2), None);
        wm.put("a", serde_json::json!(3), None);
        assert_eq!(wm.stats().entries, 2);
        assert_eq!(wm.get("a").unwrap(), serde_json::json!(3));
    }
}
