//! 类型定义模块
//!
//! 定义翻译引擎中使用的数据结构：翻译请求、缓存记录、历史记录和示例预设。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 翻译请求
///
/// 一次 `translate` 调用的全部参数。
///
/// # 字段说明
///
/// * `source_texts` - 待翻译的文本列表，输出与之等长且同序
/// * `source_language` - 源语言名称，同时用作示例库的语言键
/// * `target_language` - 目标语言名称，缺省时使用引擎配置
/// * `max_output_token_count` - 模型单次输出的令牌上限
/// * `requests_per_minute` - 该模型每分钟允许的请求数
/// * `api_key` - 一个或多个以空格分隔的 API 密钥，按轮询方式使用
/// * `prompt_preset_content` - 自定义提示词模板，缺省时使用内置模板
/// * `use_thinking` - 是否启用扩展推理
/// * `file_info` - 来源文件信息，写入缓存记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub source_texts: Vec<String>,
    pub source_language: String,
    #[serde(default)]
    pub target_language: Option<String>,
    pub max_output_token_count: usize,
    pub requests_per_minute: u32,
    pub api_key: String,
    #[serde(default)]
    pub prompt_preset_content: Option<String>,
    #[serde(default)]
    pub use_thinking: bool,
    #[serde(default)]
    pub file_info: Option<String>,
}

impl TranslateRequest {
    pub fn new(
        source_texts: Vec<String>,
        source_language: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            source_texts,
            source_language: source_language.into(),
            target_language: None,
            max_output_token_count: 8192,
            requests_per_minute: 15,
            api_key: api_key.into(),
            prompt_preset_content: None,
            use_thinking: false,
            file_info: None,
        }
    }
}

/// 缓存中的翻译记录，以规范化后的源文本为唯一键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub id: i64,
    pub source_key: String,
    pub target_text: String,
    pub success: bool,
    pub model_name: Option<String>,
    pub file_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// 只追加的翻译历史，每次写入翻译记录时生成一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationHistoryEntry {
    pub id: i64,
    pub record_id: i64,
    pub source: String,
    pub target: String,
    pub success: bool,
    pub model: Option<String>,
    pub file_info: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 历史查询条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub source_contains: Option<String>,
    pub target_contains: Option<String>,
    pub file_info: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// 从 1 开始的页码
    pub page: usize,
    pub page_size: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            source_contains: None,
            target_contains: None,
            file_info: None,
            from: None,
            to: None,
            page: 1,
            page_size: 50,
        }
    }
}

/// 一页历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<TranslationHistoryEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// 一组示例：源文本行与对应的译文行
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleLines {
    pub source_lines: Vec<String>,
    pub result_lines: Vec<String>,
}

/// 命名的示例预设，按语言保存示例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamplePreset {
    pub name: String,
    pub description: String,
    pub examples: HashMap<String, ExampleLines>,
}

/// 已按标记协议渲染好的示例
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamplePair {
    pub source: String,
    pub result: String,
}
