//! 翻译服务核心模块
//!
//! 编排一次批量翻译：缓存查询 → 按令牌预算分批 → 限流 → 渲染提示词 →
//! 调用模型 → 解析 → 回写缓存与示例 → 未完成的条目重新分批重试。
//!
//! 同一次调用内批次严格顺序处理，连续失败计数和增量回写都是调用内的顺序状态；
//! 多个调用可以并发，它们共享按模型聚合的限流器和示例库。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::batcher::{max_input_tokens, Batcher, TokenEstimator};
use crate::cache::CacheTier;
use crate::config::EngineConfig;
use crate::error::{FailureClass, Result, TranslationError};
use crate::few_shot::ExampleStore;
use crate::prompt::{parse_conversation, render_prompt, PromptContext, DEFAULT_TEMPLATE};
use crate::provider::{ApiKeyRing, GenerateRequest, ModelProvider, ProviderTable};
use crate::rate_limiter::{RateLimiter, RateLimiterRegistry};
use crate::response::{extract_text, parse_translations, ParsedTranslation};
use crate::store::SqliteStore;
use crate::tagging::tag_lines;
use crate::text::{canonicalize_input, normalize_cache_key, unescape_line_breaks};
use crate::types::TranslateRequest;

/// 单个批次的结果
///
/// 区分整批失败和个别条目遗漏：前者计入连续失败，后者只是回到剩余工作集。
#[derive(Debug)]
pub enum BatchOutcome {
    Translated {
        parsed: HashMap<String, ParsedTranslation>,
        /// 本批次中模型没有给出译文的文本
        omitted: Vec<String>,
    },
    Failed(TranslationError),
}

/// 一次调用内不变的上下文
struct CallContext<'a> {
    model_id: &'a str,
    source_language: &'a str,
    target_language: &'a str,
    template: &'a str,
    use_thinking: bool,
    max_output_tokens: usize,
    file_info: Option<&'a str>,
    provider: Arc<dyn ModelProvider>,
    keys: ApiKeyRing,
    limiter: Arc<RateLimiter>,
}

/// 去重后的翻译任务：每个不同的源文本及其在输入中的所有位置
struct TranslationJob {
    order: Vec<String>,
    positions: HashMap<String, Vec<usize>>,
}

impl TranslationJob {
    fn new(texts: &[String]) -> Self {
        let mut order = Vec::new();
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, text) in texts.iter().enumerate() {
            positions
                .entry(text.clone())
                .or_insert_with(|| {
                    order.push(text.clone());
                    Vec::new()
                })
                .push(i);
        }
        Self { order, positions }
    }
}

/// 翻译服务主类
///
/// 持有两级缓存、示例库、限流器注册表和服务商策略表；
/// `Clone` 得到的实例共享这些进程级状态。
///
/// # 示例
///
/// ```rust,no_run
/// use llm_bulk_translator::{EngineConfig, TranslateRequest, TranslationService};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = TranslationService::new(EngineConfig::default())?;
///
///     let request = TranslateRequest::new(
///         vec!["Hello".to_string(), "".to_string(), "Hello".to_string()],
///         "English",
///         "key-one key-two",
///     );
///     let output = service.translate("gemini-2.0-flash", request).await?;
///     assert_eq!(output.len(), 3);
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct TranslationService {
    cache: Arc<CacheTier>,
    examples: Arc<ExampleStore>,
    limiters: Arc<RateLimiterRegistry>,
    providers: ProviderTable,
    batcher: Batcher,
    config: EngineConfig,
}

impl TranslationService {
    /// 按配置创建翻译服务
    ///
    /// 配置了 `database_path` 时使用磁盘上的 SQLite，否则使用内存数据库；
    /// 服务商表默认只注册 Gemini。
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = match &config.database_path {
            Some(path) => Self::open_store(path)?,
            None => SqliteStore::open_in_memory()?,
        };
        let store = Arc::new(store);

        let cache = Arc::new(CacheTier::new(store.clone(), config.memory_cache_capacity));
        let examples = Arc::new(ExampleStore::new(store, config.rolling_example_budget));
        let providers = ProviderTable::with_gemini(&config.gemini_api_base);

        Ok(Self::from_parts(config, cache, examples, providers))
    }

    fn open_store(path: &Path) -> Result<SqliteStore> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        SqliteStore::open(path)
    }

    /// 用现成的组件组装服务
    pub fn from_parts(
        config: EngineConfig,
        cache: Arc<CacheTier>,
        examples: Arc<ExampleStore>,
        providers: ProviderTable,
    ) -> Self {
        Self {
            cache,
            examples,
            limiters: Arc::new(RateLimiterRegistry::new()),
            providers,
            batcher: Batcher::default(),
            config,
        }
    }

    pub fn with_providers(mut self, providers: ProviderTable) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.batcher = Batcher::new(estimator);
        self
    }

    /// 与其他服务实例共享限流器注册表
    pub fn with_rate_limiters(mut self, limiters: Arc<RateLimiterRegistry>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn cache(&self) -> &Arc<CacheTier> {
        &self.cache
    }

    pub fn examples(&self) -> &Arc<ExampleStore> {
        &self.examples
    }

    pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 翻译文本列表
    ///
    /// 输出与输入等长同序；相同的输入得到相同的输出。
    /// 请求参数无效或连续失败达到上限时返回错误。
    pub async fn translate(&self, model_id: &str, request: TranslateRequest) -> Result<Vec<String>> {
        self.run(model_id, request, None).await
    }

    /// 翻译文本列表，并在每个批次回写后通过 `progress` 发布中间结果
    ///
    /// 中间结果里尚未翻译的位置是原文。
    pub async fn translate_with_progress(
        &self,
        model_id: &str,
        request: TranslateRequest,
        progress: watch::Sender<Vec<String>>,
    ) -> Result<Vec<String>> {
        self.run(model_id, request, Some(&progress)).await
    }

    async fn run(
        &self,
        model_id: &str,
        request: TranslateRequest,
        progress: Option<&watch::Sender<Vec<String>>>,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        if request.source_texts.is_empty() {
            return Ok(Vec::new());
        }

        let target_language = request
            .target_language
            .clone()
            .unwrap_or_else(|| self.config.target_language.clone());
        if request.source_language.trim().is_empty() || target_language.trim().is_empty() {
            return Err(TranslationError::InvalidInput(
                "source and target language are required".to_string(),
            ));
        }

        let ctx = CallContext {
            model_id,
            source_language: &request.source_language,
            target_language: &target_language,
            template: request
                .prompt_preset_content
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(DEFAULT_TEMPLATE),
            use_thinking: request.use_thinking,
            max_output_tokens: request.max_output_token_count,
            file_info: request.file_info.as_deref(),
            provider: self.providers.resolve(model_id)?,
            keys: ApiKeyRing::parse(&request.api_key)?,
            limiter: self
                .limiters
                .limiter_for(model_id, request.requests_per_minute)?,
        };

        // 规范化：换行转义、全角转半角
        let canonical: Vec<String> = request
            .source_texts
            .iter()
            .map(|t| canonicalize_input(t))
            .collect();
        let job = TranslationJob::new(&canonical);
        let mut output: Vec<Option<String>> = vec![None; canonical.len()];

        // 空白文本原样返回，不查缓存也不发给模型
        let lookup: Vec<String> = job
            .order
            .iter()
            .filter(|text| {
                let first = job.positions[text.as_str()][0];
                !normalize_cache_key(&request.source_texts[first]).is_empty()
            })
            .cloned()
            .collect();

        // 缓存查询
        let cached = self.cache.get_many(&lookup).await;
        let mut remaining: Vec<String> = Vec::new();
        let mut cache_hits = job.order.len() - lookup.len();
        for text in &lookup {
            match cached.get(text).cloned().flatten() {
                Some(value) => {
                    cache_hits += 1;
                    for &i in &job.positions[text] {
                        output[i] = Some(value.clone());
                    }
                }
                None => remaining.push(text.clone()),
            }
        }

        tracing::info!(
            "开始翻译：{} 条输入，{} 条不同文本，缓存命中 {}，待翻译 {}",
            canonical.len(),
            job.order.len(),
            cache_hits,
            remaining.len()
        );

        let budget = self.batch_budget(request.max_output_token_count, request.use_thinking);
        let mut consecutive_failures = 0usize;
        let mut requests = 0usize;

        while !remaining.is_empty() {
            let batches = self.batcher.batch(&remaining, budget);
            let mut next_remaining = Vec::new();

            for (batch_no, group) in batches.into_iter().enumerate() {
                ctx.limiter.acquire().await;
                requests += 1;
                tracing::debug!(
                    "发送第 {} 个批次：{} 条文本，估算 {} 令牌",
                    batch_no + 1,
                    group.len(),
                    group.estimated_tokens
                );

                match self.request_batch(&ctx, &group.texts, &job.positions).await {
                    BatchOutcome::Translated { parsed, omitted } => {
                        consecutive_failures = 0;
                        if !omitted.is_empty() {
                            tracing::debug!("{} 条文本未返回译文，留待下一轮", omitted.len());
                        }
                        self.reconcile(&ctx, &group.texts, &parsed, &mut output).await;
                        if let Some(progress) = progress {
                            progress.send_replace(Self::intermediate(
                                &output,
                                &request.source_texts,
                            ));
                        }
                        next_remaining.extend(omitted);
                    }
                    BatchOutcome::Failed(err) => {
                        consecutive_failures += 1;
                        let class = err.class();

                        if class == FailureClass::Fatal
                            || consecutive_failures >= self.config.max_consecutive_failures
                        {
                            tracing::error!(
                                "连续失败 {} 次，中止翻译：{}",
                                consecutive_failures,
                                err
                            );
                            let failed: Vec<(String, String)> = group
                                .texts
                                .iter()
                                .map(|t| (t.clone(), String::new()))
                                .collect();
                            self.cache
                                .set_many(&failed, false, ctx.file_info, Some(ctx.model_id))
                                .await;
                            return Err(TranslationError::Aborted {
                                failures: consecutive_failures,
                                source: Box::new(err),
                            });
                        }

                        tracing::warn!(
                            "批次请求失败（连续第 {} 次）: {}",
                            consecutive_failures,
                            err
                        );
                        if class == FailureClass::Throttled {
                            let backoff = self.config.throttle_backoff();
                            tracing::warn!("触发限流，等待 {:?} 后重试", backoff);
                            sleep(backoff).await;
                        }
                        next_remaining.extend(group.texts);
                    }
                }
            }

            remaining = next_remaining;
        }

        let result = Self::intermediate(&output, &request.source_texts);

        tracing::info!(
            "翻译完成：{} 条输入，{} 次模型请求，耗时 {:?}",
            result.len(),
            requests,
            started.elapsed()
        );
        Ok(result)
    }

    /// 实际用于分批的令牌预算
    fn batch_budget(&self, max_output_tokens: usize, use_thinking: bool) -> usize {
        let max_input = max_input_tokens(max_output_tokens, use_thinking);
        ((max_input as f64 * self.config.batch_fill_ratio).floor() as usize).max(1)
    }

    /// 渲染、请求并解析一个批次
    async fn request_batch(
        &self,
        ctx: &CallContext<'_>,
        texts: &[String],
        positions: &HashMap<String, Vec<usize>>,
    ) -> BatchOutcome {
        let content = tag_lines(texts);
        let example = self.examples.get_example(ctx.source_language);
        let prompt_ctx = PromptContext {
            source_language: ctx.source_language,
            target_language: ctx.target_language,
            example: &example,
            content: &content,
        };
        let rendered = match render_prompt(ctx.template, &prompt_ctx, ctx.use_thinking) {
            Ok(rendered) => rendered,
            Err(e) => return BatchOutcome::Failed(e),
        };
        let conversation = parse_conversation(&rendered);

        let client = match ctx.provider.connect(ctx.model_id, ctx.keys.next_key()) {
            Ok(client) => client,
            Err(e) => return BatchOutcome::Failed(e),
        };
        let response = match client
            .generate_content(GenerateRequest {
                contents: conversation.turns,
                system_instruction: conversation.system_instruction,
                max_output_tokens: Some(ctx.max_output_tokens),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => return BatchOutcome::Failed(e),
        };

        let text = extract_text(&response);
        let parsed = parse_translations(&text, texts, positions);
        if parsed.is_empty() {
            return BatchOutcome::Failed(TranslationError::EmptyResponse(format!(
                "finish reason {:?}",
                response.finish_reason()
            )));
        }

        let omitted = texts
            .iter()
            .filter(|t| !parsed.contains_key(t.as_str()))
            .cloned()
            .collect();
        BatchOutcome::Translated { parsed, omitted }
    }

    /// 回写成功的译文：缓存、滚动示例、输出数组
    async fn reconcile(
        &self,
        ctx: &CallContext<'_>,
        batch_texts: &[String],
        parsed: &HashMap<String, ParsedTranslation>,
        output: &mut [Option<String>],
    ) {
        let entries: Vec<(String, String)> = batch_texts
            .iter()
            .filter_map(|t| parsed.get(t).map(|p| (t.clone(), p.translated_text.clone())))
            .collect();

        self.cache
            .set_many(&entries, true, ctx.file_info, Some(ctx.model_id))
            .await;

        let (sources, results): (Vec<String>, Vec<String>) = entries.into_iter().unzip();
        self.examples
            .append_current_example(ctx.source_language, &sources, &results);

        for translation in parsed.values() {
            for &i in &translation.indices {
                output[i] = Some(translation.translated_text.clone());
            }
        }
    }

    /// 已翻译的位置还原换行转义，其余位置是未经改动的原文
    fn intermediate(output: &[Option<String>], source_texts: &[String]) -> Vec<String> {
        output
            .iter()
            .zip(source_texts)
            .map(|(translated, original)| match translated {
                Some(translated) => unescape_line_breaks(translated),
                None => original.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deduplicates_in_first_seen_order() {
        let texts: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        let job = TranslationJob::new(&texts);
        assert_eq!(job.order, vec!["b", "a", "c"]);
        assert_eq!(job.positions["b"], vec![0, 2]);
        assert_eq!(job.positions["a"], vec![1, 4]);
        assert_eq!(job.positions["c"], vec![3]);
    }

    #[test]
    fn test_batch_budget_applies_fill_ratio() {
        let service = TranslationService::new(EngineConfig::default()).unwrap();
        assert_eq!(service.batch_budget(100, false), 80);
        assert_eq!(service.batch_budget(8000, true), 1600);
        assert_eq!(service.batch_budget(0, false), 1);
    }

    #[test]
    fn test_intermediate_falls_back_to_source() {
        let output = vec![Some("하나\\n둘".to_string()), None];
        let sources = vec!["one\ntwo".to_string(), "C:\\new\u{3000}".to_string()];
        assert_eq!(
            TranslationService::intermediate(&output, &sources),
            vec!["하나\n둘".to_string(), "C:\\new\u{3000}".to_string()]
        );
    }
}
