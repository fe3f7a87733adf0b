//! # LLM Bulk Translator
//!
//! 面向大语言模型的批量翻译编排库：接收一组文本片段，返回等长同序的译文。
//!
//! ## 主要特性
//!
//! - **两级缓存**: 内存 LRU + SQLite 持久层，旁路读取并回填，缓存故障只记录日志
//! - **令牌预算分批**: 按估算令牌数贪心打包，一次请求翻译多条文本
//! - **按模型限流**: 每个模型一个令牌桶，跨调用共享，先到先得
//! - **少样本示例**: 预设示例加上按语言滚动累积的近期译文
//! - **标记协议**: 以 `<|N|>` 编号对齐请求与译文，容忍遗漏和截断
//! - **失败恢复**: 遗漏条目自动重试，连续失败达到上限后中止并留下审计记录
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use llm_bulk_translator::{EngineConfig, TranslateRequest, TranslationService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     llm_bulk_translator::logging::init_logging("info");
//!
//!     let service = TranslationService::new(EngineConfig::default())?;
//!     let mut request = TranslateRequest::new(
//!         vec!["Hello".to_string(), "Bye".to_string()],
//!         "English",
//!         "your-api-key",
//!     );
//!     request.target_language = Some("Korean".to_string());
//!
//!     let translated = service.translate("gemini-2.0-flash", request).await?;
//!     println!("{:?}", translated);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## 配置文件支持
//!
//! ```toml
//! [engine]
//! memory_cache_capacity = 10000
//! database_path = "translation-cache.db"
//! rolling_example_budget = 300
//! max_consecutive_failures = 3
//! throttle_backoff_secs = 10
//! batch_fill_ratio = 0.8
//! target_language = "Korean"
//! gemini_api_base = "https://generativelanguage.googleapis.com/v1beta"
//! ```

pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod few_shot;
pub mod logging;
pub mod prompt;
pub mod provider;
pub mod rate_limiter;
pub mod response;
pub mod store;
pub mod tagging;
pub mod text;
pub mod translator;
pub mod types;

pub use batcher::{BatchGroup, Batcher, HalfLengthEstimator, TokenEstimator};
pub use cache::{CacheStatsSnapshot, CacheTier};
pub use config::{EngineConfig, TranslationLibConfig};
pub use error::{FailureClass, Result, TranslationError};
pub use few_shot::ExampleStore;
pub use provider::{
    ApiKeyRing, FinishReason, GenerateRequest, GeminiProvider, ModelClient, ModelFamily,
    ModelProvider, ModelResponse, ProviderTable,
};
pub use rate_limiter::{RateLimiter, RateLimiterRegistry};
pub use store::{DurableStore, PresetStore, SqliteStore};
pub use translator::{BatchOutcome, TranslationService};
pub use types::{
    ExampleLines, ExamplePair, ExamplePreset, HistoryPage, HistoryQuery, TranslateRequest,
    TranslationHistoryEntry, TranslationRecord,
};
