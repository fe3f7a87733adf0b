//! 两级翻译缓存
//!
//! 内存中的 LRU 缓存加上持久化存储，统一为 cache-aside 接口：
//! 读取先查内存，未命中再查持久层并回填；写入同时写两层。
//! 持久层的错误只记录日志并按未命中/空操作处理，缓存永远不会让翻译失败。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::error::Result;
use crate::store::DurableStore;
use crate::text::normalize_cache_key;
use crate::types::{HistoryPage, HistoryQuery, TranslationRecord};

/// 缓存统计信息
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    durable_errors: AtomicU64,
}

/// 统计信息快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub durable_errors: u64,
}

impl CacheStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            durable_errors: self.durable_errors.load(Ordering::Relaxed),
        }
    }
}

/// 两级缓存门面
pub struct CacheTier {
    memory: Mutex<LruCache<String, String>>,
    durable: Arc<dyn DurableStore>,
    stats: CacheStats,
}

impl CacheTier {
    pub fn new(durable: Arc<dyn DurableStore>, memory_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            durable,
            stats: CacheStats::default(),
        }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn memory(&self) -> MutexGuard<'_, LruCache<String, String>> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_durable_error(&self, operation: &str, error: &dyn std::fmt::Display) {
        CacheStats::add(&self.stats.durable_errors, 1);
        tracing::warn!("持久缓存{}失败，按未命中处理: {}", operation, error);
    }

    /// 查询单条翻译
    ///
    /// 规范化后为空的键（空行、只有换行的行）直接命中并原样返回。
    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_many(&[key.to_string()])
            .await
            .remove(key)
            .flatten()
    }

    /// 批量查询
    ///
    /// 返回的映射以调用方传入的原始文本为键，覆盖每一个输入；
    /// 只有内存未命中的部分才会访问持久层。
    pub async fn get_many(&self, keys: &[String]) -> HashMap<String, Option<String>> {
        let mut result: HashMap<String, Option<String>> = HashMap::with_capacity(keys.len());
        let mut missing: HashMap<String, Vec<String>> = HashMap::new();

        {
            let mut memory = self.memory();
            for key in keys {
                if result.contains_key(key) {
                    continue;
                }
                let normalized = normalize_cache_key(key);
                if normalized.is_empty() {
                    result.insert(key.clone(), Some(key.clone()));
                    continue;
                }
                match memory.get(&normalized) {
                    Some(value) => {
                        CacheStats::add(&self.stats.memory_hits, 1);
                        result.insert(key.clone(), Some(value.clone()));
                    }
                    None => {
                        missing.entry(normalized).or_default().push(key.clone());
                        result.insert(key.clone(), None);
                    }
                }
            }
        }

        if missing.is_empty() {
            return result;
        }

        let lookup: Vec<String> = missing.keys().cloned().collect();
        match self.durable.get_many(&lookup).await {
            Ok(found) => {
                let mut memory = self.memory();
                for (normalized, value) in found {
                    let Some(value) = value else { continue };
                    let Some(originals) = missing.remove(&normalized) else {
                        continue;
                    };
                    CacheStats::add(&self.stats.durable_hits, originals.len());
                    for original in originals {
                        result.insert(original, Some(value.clone()));
                    }
                    memory.put(normalized, value);
                }
            }
            Err(e) => self.record_durable_error("读取", &e),
        }

        let misses: usize = missing.values().map(Vec::len).sum();
        CacheStats::add(&self.stats.misses, misses);
        result
    }

    /// 写入单条翻译
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        success: bool,
        file_info: Option<&str>,
        model: Option<&str>,
    ) {
        self.set_many(&[(key.to_string(), value.to_string())], success, file_info, model)
            .await;
    }

    /// 批量写入翻译
    ///
    /// 失败记录（`success == false`）只用于审计：写入持久层，但从内存层移除，
    /// 之后的查询不会把它当作命中。
    pub async fn set_many(
        &self,
        entries: &[(String, String)],
        success: bool,
        file_info: Option<&str>,
        model: Option<&str>,
    ) {
        let normalized: Vec<(String, String)> = entries
            .iter()
            .filter_map(|(key, value)| {
                let key = normalize_cache_key(key);
                (!key.is_empty()).then(|| (key, value.clone()))
            })
            .collect();
        if normalized.is_empty() {
            return;
        }

        {
            let mut memory = self.memory();
            for (key, value) in &normalized {
                if success {
                    memory.put(key.clone(), value.clone());
                } else {
                    memory.pop(key);
                }
            }
        }

        if let Err(e) = self
            .durable
            .set_many(&normalized, success, file_info, model)
            .await
        {
            self.record_durable_error("写入", &e);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.invalidate_many(&[key.to_string()]).await;
    }

    pub async fn invalidate_many(&self, keys: &[String]) {
        let normalized: Vec<String> = keys
            .iter()
            .map(|k| normalize_cache_key(k))
            .filter(|k| !k.is_empty())
            .collect();
        {
            let mut memory = self.memory();
            for key in &normalized {
                memory.pop(key);
            }
        }
        if let Err(e) = self.durable.delete_by_keys(&normalized).await {
            self.record_durable_error("删除", &e);
        }
    }

    pub async fn clear(&self) {
        self.memory().clear();
        if let Err(e) = self.durable.clear().await {
            self.record_durable_error("清空", &e);
        }
    }

    /// 按记录 ID 删除
    ///
    /// 持久层以 ID 为键而内存层以内容为键，所以先取出记录的源文本键，再清理内存层。
    pub async fn delete_record(&self, id: i64) -> Result<Option<TranslationRecord>> {
        let deleted = self.durable.delete_record(id).await?;
        if let Some(record) = &deleted {
            self.memory().pop(&record.source_key);
        }
        Ok(deleted)
    }

    /// 按记录 ID 修改译文，并同步内存层
    pub async fn update_record(
        &self,
        id: i64,
        target_text: &str,
        success: bool,
    ) -> Result<Option<TranslationRecord>> {
        let updated = self.durable.update_record(id, target_text, success).await?;
        if let Some(record) = &updated {
            let mut memory = self.memory();
            if record.success {
                memory.put(record.source_key.clone(), record.target_text.clone());
            } else {
                memory.pop(&record.source_key);
            }
        }
        Ok(updated)
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<TranslationRecord>> {
        self.durable.get_record(id).await
    }

    pub async fn history(&self, query: HistoryQuery) -> Result<HistoryPage> {
        self.durable.history(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TranslationError;
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    fn tier() -> CacheTier {
        CacheTier::new(Arc::new(SqliteStore::open_in_memory().unwrap()), 16)
    }

    #[tokio::test]
    async fn test_set_many_then_get() {
        let cache = tier();
        cache
            .set_many(&[("A".into(), "B".into())], true, None, None)
            .await;
        assert_eq!(cache.get("A").await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_blank_keys_pass_through() {
        let cache = tier();
        let found = cache
            .get_many(&["".to_string(), "  ".to_string(), "\\n".to_string()])
            .await;
        assert_eq!(found[""].as_deref(), Some(""));
        assert_eq!(found["  "].as_deref(), Some("  "));
        assert_eq!(found["\\n"].as_deref(), Some("\\n"));

        cache.set("   ", "ignored", true, None, None).await;
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_keys_are_normalized() {
        let cache = tier();
        cache.set("Hello\\n", "안녕", true, None, None).await;
        assert_eq!(cache.get("  Hello ").await.as_deref(), Some("안녕"));
    }

    #[tokio::test]
    async fn test_durable_hit_backfills_memory() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .set_many(&[("Hi".into(), "안녕".into())], true, None, None)
            .await
            .unwrap();
        let cache = CacheTier::new(store, 16);

        let found = cache.get_many(&["Hi".to_string(), "Bye".to_string()]).await;
        assert_eq!(found["Hi"].as_deref(), Some("안녕"));
        assert_eq!(found["Bye"], None);

        assert_eq!(cache.get("Hi").await.as_deref(), Some("안녕"));
        let stats = cache.stats();
        assert_eq!(stats.durable_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_a_hit() {
        let cache = tier();
        cache.set("Hi", "안녕", true, None, None).await;
        cache.set("Hi", "", false, None, None).await;
        assert_eq!(cache.get("Hi").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = tier();
        cache
            .set_many(
                &[("a".into(), "1".into()), ("b".into(), "2".into()), ("c".into(), "3".into())],
                true,
                None,
                None,
            )
            .await;

        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await, None);
        cache.invalidate_many(&["b".to_string()]).await;
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("c").await.as_deref(), Some("3"));

        cache.clear().await;
        assert_eq!(cache.get("c").await, None);
    }

    #[tokio::test]
    async fn test_delete_record_invalidates_memory() {
        let cache = tier();
        cache.set("Hi", "안녕", true, None, None).await;
        let id = cache.durable().find_record("Hi").await.unwrap().unwrap().id;

        let deleted = cache.delete_record(id).await.unwrap();
        assert_eq!(deleted.map(|r| r.source_key).as_deref(), Some("Hi"));
        assert_eq!(cache.get("Hi").await, None);
    }

    #[tokio::test]
    async fn test_update_record_refreshes_memory() {
        let cache = tier();
        cache.set("Hi", "안녕", true, None, None).await;
        let id = cache.durable().find_record("Hi").await.unwrap().unwrap().id;

        cache.update_record(id, "안녕하세요", true).await.unwrap();
        assert_eq!(cache.get("Hi").await.as_deref(), Some("안녕하세요"));
    }

    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn get_many(&self, _: &[String]) -> Result<HashMap<String, Option<String>>> {
            Err(TranslationError::StorageError("disk gone".into()))
        }
        async fn set_many(
            &self,
            _: &[(String, String)],
            _: bool,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<()> {
            Err(TranslationError::StorageError("disk gone".into()))
        }
        async fn get_record(&self, _: i64) -> Result<Option<TranslationRecord>> {
            Ok(None)
        }
        async fn find_record(&self, _: &str) -> Result<Option<TranslationRecord>> {
            Ok(None)
        }
        async fn update_record(&self, _: i64, _: &str, _: bool) -> Result<Option<TranslationRecord>> {
            Ok(None)
        }
        async fn delete_record(&self, _: i64) -> Result<Option<TranslationRecord>> {
            Ok(None)
        }
        async fn delete_by_keys(&self, _: &[String]) -> Result<usize> {
            Err(TranslationError::StorageError("disk gone".into()))
        }
        async fn history(&self, _: HistoryQuery) -> Result<HistoryPage> {
            Err(TranslationError::StorageError("disk gone".into()))
        }
        async fn clear(&self) -> Result<()> {
            Err(TranslationError::StorageError("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn test_durable_errors_never_propagate() {
        let cache = CacheTier::new(Arc::new(BrokenStore), 16);

        assert_eq!(cache.get("Hi").await, None);
        cache.set("Hi", "안녕", true, None, None).await;
        // 内存层仍然可用
        assert_eq!(cache.get("Hi").await.as_deref(), Some("안녕"));
        cache.invalidate("Hi").await;
        cache.clear().await;

        assert!(cache.stats().durable_errors >= 4);
    }
}
