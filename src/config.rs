//! 配置管理模块
//!
//! 提供TOML配置文件的读取、写入和自动发现功能。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TranslationError};
use crate::few_shot::DEFAULT_ROLLING_BUDGET;
use crate::provider::DEFAULT_GEMINI_API_BASE;

/// 翻译引擎配置
///
/// # 字段说明
///
/// * `memory_cache_capacity` - 内存缓存最多保留的条目数
/// * `database_path` - SQLite 数据库路径，缺省时只使用内存数据库
/// * `rolling_example_budget` - 滚动示例缓冲区源文本的字符上限
/// * `max_consecutive_failures` - 连续失败多少次后中止整个调用
/// * `throttle_backoff_secs` - 限流类失败后的固定等待秒数
/// * `batch_fill_ratio` - 批次实际使用的输入预算比例，给标记和模板留出余量
/// * `target_language` - 请求未指定目标语言时使用的语言
/// * `gemini_api_base` - Gemini REST 接口地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory_cache_capacity: usize,
    pub database_path: Option<PathBuf>,
    pub rolling_example_budget: usize,
    pub max_consecutive_failures: usize,
    pub throttle_backoff_secs: u64,
    pub batch_fill_ratio: f64,
    pub target_language: String,
    pub gemini_api_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_cache_capacity: 10_000,
            database_path: None,
            rolling_example_budget: DEFAULT_ROLLING_BUDGET,
            max_consecutive_failures: 3,
            throttle_backoff_secs: 10,
            batch_fill_ratio: 0.8,
            target_language: "Korean".to_string(),
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_secs(self.throttle_backoff_secs)
    }

    /// 检查配置取值是否合理
    pub fn validate(&self) -> Result<()> {
        if self.memory_cache_capacity == 0 {
            return Err(TranslationError::ConfigError(
                "memory_cache_capacity must be greater than zero".to_string(),
            ));
        }
        if !(self.batch_fill_ratio > 0.0 && self.batch_fill_ratio <= 1.0) {
            return Err(TranslationError::ConfigError(format!(
                "batch_fill_ratio must be in (0, 1], got {}",
                self.batch_fill_ratio
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(TranslationError::ConfigError(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.target_language.trim().is_empty() {
            return Err(TranslationError::ConfigError(
                "target_language must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 翻译库配置结构
///
/// 包含所有翻译相关的配置选项，支持从TOML文件加载和保存。
///
/// # 示例
///
/// ```rust,no_run
/// use llm_bulk_translator::TranslationLibConfig;
///
/// // 从默认位置加载配置
/// let config = TranslationLibConfig::load_from_default_locations();
///
/// // 从指定文件加载配置
/// let config = TranslationLibConfig::from_file("config.toml").unwrap();
///
/// // 保存配置到文件
/// config.save_to_file("output.toml").unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationLibConfig {
    /// 引擎配置
    #[serde(default)]
    pub engine: EngineConfig,
}

impl TranslationLibConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TranslationLibConfig = toml::from_str(&content)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from multiple possible locations
    pub fn load_from_default_locations() -> Self {
        let possible_paths = [
            "translation-config.toml",
            "config.toml",
            ".translation-config.toml",
        ];

        for path in &possible_paths {
            if Path::new(path).exists() {
                match Self::from_file(path) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from: {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Self::default()
    }

    /// Generate example configuration file
    pub fn generate_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let example_config = Self::default();
        example_config.save_to_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.throttle_backoff(), Duration::from_secs(10));
        assert_eq!(config.rolling_example_budget, 300);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TranslationLibConfig = toml::from_str(
            r#"
            [engine]
            target_language = "Japanese"
            batch_fill_ratio = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.target_language, "Japanese");
        assert_eq!(config.engine.batch_fill_ratio, 0.5);
        assert_eq!(config.engine.max_consecutive_failures, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            batch_fill_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            max_consecutive_failures: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translation-config.toml");

        let mut config = TranslationLibConfig::default();
        config.engine.database_path = Some(dir.path().join("cache.db"));
        config.save_to_file(&path).unwrap();

        let reloaded = TranslationLibConfig::from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
