//! 错误处理模块
//!
//! 定义翻译引擎使用的错误类型，以及用于重试决策的失败分类。

use thiserror::Error;

/// 翻译错误类型
///
/// 包含翻译过程中可能出现的各种错误情况。
///
/// # 变体说明
///
/// * `Http` - HTTP请求错误
/// * `RateLimited` - 配额/速率限制类错误，触发固定退避
/// * `ApiError` - 模型服务返回的错误，包含状态码和消息
/// * `EmptyResponse` - 模型响应中没有任何可用的翻译
/// * `Aborted` - 连续失败次数达到上限，整个调用中止
#[derive(Error, Debug)]
pub enum TranslationError {
    /// HTTP请求错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 配额或速率限制错误
    #[error("Rate limit error: {0}")]
    RateLimited(String),

    /// API响应错误
    #[error("API error {code}: {message}")]
    ApiError {
        /// 错误代码
        code: i32,
        /// 错误消息
        message: String,
    },

    /// 响应中没有可解析的翻译
    #[error("Model returned no usable translation ({0})")]
    EmptyResponse(String),

    /// 解析错误
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 输入无效
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 持久化存储错误
    #[error("Storage error: {0}")]
    StorageError(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 连续失败过多，调用中止
    #[error("Translation aborted after {failures} consecutive failures: {source}")]
    Aborted {
        /// 连续失败次数
        failures: usize,
        /// 最后一次失败的原因
        #[source]
        source: Box<TranslationError>,
    },
}

/// 失败分类
///
/// 决定一次批次失败之后编排器如何继续：
/// 限流类先固定等待再重试，其他瞬时错误立即重试，致命错误直接上抛。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 配额/限流
    Throttled,
    /// 网络或服务端的其他错误
    Transient,
    /// 不可重试
    Fatal,
}

impl TranslationError {
    /// 获取错误的失败分类
    pub fn class(&self) -> FailureClass {
        match self {
            TranslationError::RateLimited(_) => FailureClass::Throttled,
            TranslationError::ApiError { code: 429, .. } => FailureClass::Throttled,
            TranslationError::Http(e) if e.status().map(|s| s.as_u16()) == Some(429) => {
                FailureClass::Throttled
            }
            TranslationError::Http(_)
            | TranslationError::ApiError { .. }
            | TranslationError::EmptyResponse(_)
            | TranslationError::ParseError(_)
            | TranslationError::Serialization(_) => FailureClass::Transient,
            TranslationError::InvalidInput(_)
            | TranslationError::ConfigError(_)
            | TranslationError::StorageError(_)
            | TranslationError::Io(_)
            | TranslationError::Aborted { .. } => FailureClass::Fatal,
        }
    }

    /// 是否属于配额/限流类错误
    pub fn is_throttled(&self) -> bool {
        self.class() == FailureClass::Throttled
    }
}

impl From<rusqlite::Error> for TranslationError {
    fn from(error: rusqlite::Error) -> Self {
        TranslationError::StorageError(error.to_string())
    }
}

impl From<toml::de::Error> for TranslationError {
    fn from(error: toml::de::Error) -> Self {
        TranslationError::ConfigError(format!("TOML parse failed: {}", error))
    }
}

impl From<toml::ser::Error> for TranslationError {
    fn from(error: toml::ser::Error) -> Self {
        TranslationError::ConfigError(format!("TOML serialize failed: {}", error))
    }
}

impl From<tokio::task::JoinError> for TranslationError {
    fn from(error: tokio::task::JoinError) -> Self {
        TranslationError::StorageError(format!("blocking task failed: {}", error))
    }
}

/// 翻译结果类型别名
///
/// 简化返回类型，使用 `TranslationError` 作为错误类型。
///
/// # 示例
///
/// ```rust
/// use llm_bulk_translator::{Result, TranslationError};
///
/// fn example_function() -> Result<String> {
///     Ok("Success".to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, TranslationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_errors_are_throttled() {
        assert!(TranslationError::RateLimited("quota".into()).is_throttled());
        let err = TranslationError::ApiError {
            code: 429,
            message: "RESOURCE_EXHAUSTED".into(),
        };
        assert_eq!(err.class(), FailureClass::Throttled);
    }

    #[test]
    fn test_provider_errors_are_transient() {
        let err = TranslationError::ApiError {
            code: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(
            TranslationError::EmptyResponse("no tags".into()).class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_aborted_wraps_last_failure() {
        let err = TranslationError::Aborted {
            failures: 3,
            source: Box::new(TranslationError::RateLimited("quota".into())),
        };
        assert_eq!(err.class(), FailureClass::Fatal);
        assert!(err.to_string().contains("3 consecutive failures"));
        assert!(err.to_string().contains("quota"));
    }
}
