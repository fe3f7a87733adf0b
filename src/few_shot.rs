//! 少样本示例库
//!
//! 每种语言的示例由两部分组成：持久化的当前预设（人工整理的示例对）
//! 和仅存在于本次会话的滚动缓冲区（最近成功翻译的结果）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Result, TranslationError};
use crate::store::PresetStore;
use crate::tagging::tag_lines;
use crate::types::{ExamplePair, ExamplePreset};

/// 滚动缓冲区源文本总字符数的默认上限
pub const DEFAULT_ROLLING_BUDGET: usize = 300;

/// 单一语言的滚动示例缓冲区
///
/// 源文本总字符数超过预算时从最旧的条目开始丢弃。
#[derive(Debug, Clone)]
pub struct RollingExampleBuffer {
    entries: VecDeque<(String, String)>,
    source_chars: usize,
    budget: usize,
}

impl RollingExampleBuffer {
    pub fn new(budget: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            source_chars: 0,
            budget,
        }
    }

    pub fn push(&mut self, source: String, result: String) {
        self.source_chars += source.chars().count();
        self.entries.push_back((source, result));
        while self.source_chars > self.budget {
            match self.entries.pop_front() {
                Some((old, _)) => self.source_chars -= old.chars().count(),
                None => break,
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &(String, String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_chars(&self) -> usize {
        self.source_chars
    }
}

/// 示例库
pub struct ExampleStore {
    presets: Arc<dyn PresetStore>,
    current: RwLock<Option<ExamplePreset>>,
    rolling: Mutex<HashMap<String, RollingExampleBuffer>>,
    rolling_budget: usize,
}

impl ExampleStore {
    pub fn new(presets: Arc<dyn PresetStore>, rolling_budget: usize) -> Self {
        Self {
            presets,
            current: RwLock::new(None),
            rolling: Mutex::new(HashMap::new()),
            rolling_budget,
        }
    }

    /// 当前预设与滚动缓冲区合并后的示例，已按标记协议渲染
    pub fn get_example(&self, language: &str) -> ExamplePair {
        let mut sources: Vec<String> = Vec::new();
        let mut results: Vec<String> = Vec::new();

        if let Ok(current) = self.current.read() {
            if let Some(lines) = current.as_ref().and_then(|p| p.examples.get(language)) {
                for (source, result) in lines.source_lines.iter().zip(&lines.result_lines) {
                    if source.trim().is_empty() || result.trim().is_empty() {
                        continue;
                    }
                    sources.push(source.clone());
                    results.push(result.clone());
                }
            }
        }

        if let Ok(rolling) = self.rolling.lock() {
            if let Some(buffer) = rolling.get(language) {
                for (source, result) in buffer.entries() {
                    sources.push(source.clone());
                    results.push(result.clone());
                }
            }
        }

        ExamplePair {
            source: tag_lines(&sources),
            result: tag_lines(&results),
        }
    }

    /// 把一个成功批次的结果追加到该语言的滚动缓冲区
    pub fn append_current_example(
        &self,
        language: &str,
        source_lines: &[String],
        result_lines: &[String],
    ) {
        let Ok(mut rolling) = self.rolling.lock() else {
            tracing::warn!("示例缓冲区锁已中毒，跳过追加");
            return;
        };
        let buffer = rolling
            .entry(language.to_string())
            .or_insert_with(|| RollingExampleBuffer::new(self.rolling_budget));
        for (source, result) in source_lines.iter().zip(result_lines) {
            if source.trim().is_empty() || result.trim().is_empty() {
                continue;
            }
            buffer.push(source.trim().to_string(), result.trim().to_string());
        }
    }

    pub fn rolling_len(&self, language: &str) -> usize {
        self.rolling
            .lock()
            .ok()
            .and_then(|r| r.get(language).map(RollingExampleBuffer::len))
            .unwrap_or(0)
    }

    pub fn clear_rolling(&self) {
        if let Ok(mut rolling) = self.rolling.lock() {
            rolling.clear();
        }
    }

    /// 加载并切换当前预设
    pub async fn load_preset(&self, name: &str) -> Result<()> {
        let preset = self
            .presets
            .get_preset(name)
            .await?
            .ok_or_else(|| TranslationError::InvalidInput(format!("preset '{}' not found", name)))?;
        tracing::info!("切换示例预设: {}", preset.name);
        self.set_current(Some(preset));
        Ok(())
    }

    pub fn current_preset(&self) -> Option<ExamplePreset> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    fn set_current(&self, preset: Option<ExamplePreset>) {
        match self.current.write() {
            Ok(mut current) => *current = preset,
            Err(poisoned) => *poisoned.into_inner() = preset,
        }
    }

    fn is_current(&self, name: &str) -> bool {
        self.current_preset().is_some_and(|p| p.name == name)
    }

    pub async fn create_preset(&self, preset: &ExamplePreset) -> Result<()> {
        self.presets.create_preset(preset).await
    }

    pub async fn list_presets(&self) -> Result<Vec<ExamplePreset>> {
        self.presets.list_presets().await
    }

    pub async fn update_preset(&self, preset: &ExamplePreset) -> Result<bool> {
        let updated = self.presets.update_preset(preset).await?;
        if updated && self.is_current(&preset.name) {
            self.set_current(Some(preset.clone()));
        }
        Ok(updated)
    }

    pub async fn delete_preset(&self, name: &str) -> Result<bool> {
        let deleted = self.presets.delete_preset(name).await?;
        if deleted && self.is_current(name) {
            self.set_current(None);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::ExampleLines;

    fn store() -> ExampleStore {
        ExampleStore::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            DEFAULT_ROLLING_BUDGET,
        )
    }

    fn preset(name: &str) -> ExamplePreset {
        let mut examples = HashMap::new();
        examples.insert(
            "English".to_string(),
            ExampleLines {
                source_lines: vec!["Start game".into()],
                result_lines: vec!["게임 시작".into()],
            },
        );
        ExamplePreset {
            name: name.into(),
            description: String::new(),
            examples,
        }
    }

    #[test]
    fn test_rolling_buffer_trims_oldest() {
        let mut buffer = RollingExampleBuffer::new(10);
        buffer.push("aaaa".into(), "1".into());
        buffer.push("bbbb".into(), "2".into());
        assert_eq!(buffer.len(), 2);

        buffer.push("cccc".into(), "3".into());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.source_chars(), 8);
        let first = buffer.entries().next().unwrap();
        assert_eq!(first.0, "bbbb");
    }

    #[test]
    fn test_empty_store_renders_empty_example() {
        let store = store();
        assert_eq!(store.get_example("English"), ExamplePair::default());
    }

    #[tokio::test]
    async fn test_preset_and_rolling_are_combined() {
        let store = store();
        store.create_preset(&preset("ui")).await.unwrap();
        store.load_preset("ui").await.unwrap();
        store.append_current_example("English", &["Quit".to_string()], &["종료".to_string()]);

        let example = store.get_example("English");
        assert_eq!(example.source, "<|1|>Start game\n<|2|>Quit");
        assert_eq!(example.result, "<|1|>게임 시작\n<|2|>종료");
        assert_eq!(store.get_example("Japanese"), ExamplePair::default());
    }

    #[tokio::test]
    async fn test_load_unknown_preset_fails() {
        let store = store();
        assert!(store.load_preset("missing").await.is_err());
        assert!(store.current_preset().is_none());
    }

    #[tokio::test]
    async fn test_deleting_current_preset_unloads_it() {
        let store = store();
        store.create_preset(&preset("ui")).await.unwrap();
        store.load_preset("ui").await.unwrap();

        let mut changed = preset("ui");
        changed.description = "menus".into();
        assert!(store.update_preset(&changed).await.unwrap());
        assert_eq!(store.current_preset().unwrap().description, "menus");

        assert!(store.delete_preset("ui").await.unwrap());
        assert!(store.current_preset().is_none());
        assert!(store.list_presets().await.unwrap().is_empty());
    }

    #[test]
    fn test_rolling_skips_blank_pairs() {
        let store = store();
        store.append_current_example(
            "English",
            &["Hello".to_string(), "Bye".to_string()],
            &["안녕".to_string(), "  ".to_string()],
        );
        assert_eq!(store.rolling_len("English"), 1);
        store.clear_rolling();
        assert_eq!(store.rolling_len("English"), 0);
    }
}
