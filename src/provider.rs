//! 模型服务抽象
//!
//! 编排器只依赖 `ModelClient` 接口；具体服务商通过 `ModelProvider`
//! 按模型家族注册到 `ProviderTable`，调用入口处解析一次。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TranslationError};
use crate::prompt::{Role, Turn};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// 一次生成请求
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub contents: Vec<Turn>,
    pub system_instruction: Option<String>,
    pub max_output_tokens: Option<usize>,
}

/// 生成结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// 达到输出令牌上限，末尾可能被截断
    MaxTokens,
    Safety,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" => FinishReason::Safety,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

/// 服务商无关的模型响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

impl ModelResponse {
    /// 单候选的便捷构造
    pub fn from_text(text: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            candidates: vec![Candidate {
                text: text.into(),
                finish_reason,
            }],
            usage_metadata: None,
        }
    }

    /// 第一个候选的原始文本
    pub fn text(&self) -> &str {
        self.candidates.first().map(|c| c.text.as_str()).unwrap_or("")
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.candidates
            .first()
            .map(|c| c.finish_reason.clone())
            .unwrap_or_else(|| FinishReason::Other("NO_CANDIDATES".to_string()))
    }
}

/// 模型客户端
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_content(&self, request: GenerateRequest) -> Result<ModelResponse>;
}

/// 模型家族，决定由哪个服务商处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Gemini,
    OpenAi,
    Other,
}

impl ModelFamily {
    pub fn from_model_id(model_id: &str) -> Self {
        let id = model_id.trim_start_matches("models/").to_ascii_lowercase();
        if id.starts_with("gemini") || id.starts_with("gemma") {
            ModelFamily::Gemini
        } else if id.starts_with("gpt-") || id.starts_with("o1") || id.starts_with("o3") || id.starts_with("o4") {
            ModelFamily::OpenAi
        } else {
            ModelFamily::Other
        }
    }
}

/// 服务商：用模型标识和一个密钥创建客户端
pub trait ModelProvider: Send + Sync {
    fn connect(&self, model_id: &str, api_key: &str) -> Result<Arc<dyn ModelClient>>;

    fn provider_name(&self) -> &str;
}

/// 模型家族到服务商的策略表
#[derive(Clone, Default)]
pub struct ProviderTable {
    providers: HashMap<ModelFamily, Arc<dyn ModelProvider>>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只注册 Gemini 的默认表
    pub fn with_gemini(api_base: &str) -> Self {
        let mut table = Self::new();
        table.register(ModelFamily::Gemini, Arc::new(GeminiProvider::new(api_base)));
        table
    }

    pub fn register(&mut self, family: ModelFamily, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(family, provider);
    }

    /// 解析模型标识对应的服务商；未注册的家族回落到 `Other`
    pub fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelProvider>> {
        let family = ModelFamily::from_model_id(model_id);
        self.providers
            .get(&family)
            .or_else(|| self.providers.get(&ModelFamily::Other))
            .cloned()
            .ok_or_else(|| {
                TranslationError::ConfigError(format!(
                    "no provider registered for model '{}' ({:?})",
                    model_id, family
                ))
            })
    }
}

/// 以空格分隔的多个密钥，按轮询方式逐次取用
#[derive(Debug)]
pub struct ApiKeyRing {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl ApiKeyRing {
    pub fn parse(api_key: &str) -> Result<Self> {
        let keys: Vec<String> = api_key.split_whitespace().map(str::to_string).collect();
        if keys.is_empty() {
            return Err(TranslationError::InvalidInput("API key is empty".to_string()));
        }
        Ok(Self {
            keys,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn next_key(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[index]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================================================
// Gemini REST 适配
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing)]
    thought: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetail,
}

#[derive(Deserialize)]
struct GeminiErrorDetail {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl From<&Turn> for GeminiContent {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        Self {
            role: Some(role.to_string()),
            parts: vec![GeminiPart {
                text: turn.text.clone(),
                thought: false,
            }],
        }
    }
}

impl GeminiResponse {
    fn into_model_response(self) -> ModelResponse {
        let mut candidates: Vec<Candidate> = self
            .candidates
            .into_iter()
            .map(|c| Candidate {
                text: c
                    .content
                    .parts
                    .iter()
                    .filter(|p| !p.thought)
                    .map(|p| p.text.as_str())
                    .collect(),
                finish_reason: c
                    .finish_reason
                    .as_deref()
                    .map(FinishReason::from_wire)
                    .unwrap_or(FinishReason::Stop),
            })
            .collect();

        if candidates.is_empty() {
            if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
                tracing::warn!("请求被模型拦截: {}", reason);
                candidates.push(Candidate {
                    text: String::new(),
                    finish_reason: FinishReason::Safety,
                });
            }
        }

        ModelResponse {
            candidates,
            usage_metadata: self.usage_metadata,
        }
    }
}

/// 把错误响应映射为错误类型；配额类错误单独归类
fn gemini_error(status: reqwest::StatusCode, body: &str) -> TranslationError {
    let detail = serde_json::from_str::<GeminiErrorBody>(body).ok().map(|b| b.error);
    let code = detail
        .as_ref()
        .map(|d| d.code)
        .filter(|&c| c != 0)
        .unwrap_or(status.as_u16() as i32);
    let message = detail
        .as_ref()
        .map(|d| format!("{} {}", d.status, d.message).trim().to_string())
        .unwrap_or_else(|| body.to_string());

    let exhausted = detail.as_ref().is_some_and(|d| d.status == "RESOURCE_EXHAUSTED");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || exhausted {
        TranslationError::RateLimited(message)
    } else {
        TranslationError::ApiError { code, message }
    }
}

/// Gemini 服务商
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    api_base: String,
}

impl GeminiProvider {
    pub fn new(api_base: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("创建HTTP客户端失败: {}，使用默认配置", e);
                Client::new()
            });

        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

impl ModelProvider for GeminiProvider {
    fn connect(&self, model_id: &str, api_key: &str) -> Result<Arc<dyn ModelClient>> {
        Ok(Arc::new(GeminiClient {
            client: self.client.clone(),
            endpoint: format!(
                "{}/models/{}:generateContent",
                self.api_base,
                model_id.trim_start_matches("models/")
            ),
            api_key: api_key.to_string(),
        }))
    }

    fn provider_name(&self) -> &str {
        "Gemini"
    }
}

struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate_content(&self, request: GenerateRequest) -> Result<ModelResponse> {
        let body = GeminiRequest {
            contents: request.contents.iter().map(GeminiContent::from).collect(),
            system_instruction: request.system_instruction.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text, thought: false }],
            }),
            generation_config: request
                .max_output_tokens
                .map(|max_output_tokens| GeminiGenerationConfig { max_output_tokens }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(gemini_error(status, &text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)
            .map_err(|e| TranslationError::ParseError(format!("invalid Gemini response: {}", e)))?;
        Ok(parsed.into_model_response())
    }
}
