use reqwest::{header::CONTENT_TYPE, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{ChatMessage, ModelDescriptor, ProviderConfig};
use crate::settings::{Resolution, ResolvedSettings};
use crate::telemetry;

/** \brief 列表接口不返回上下文长度，统一使用占位值。 */
pub const MODEL_TOKEN_PLACEHOLDER: u32 = 8000;

pub const DEFAULT_MAX_TOKENS: u32 = 200;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const FALLBACK_MODEL_IDS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4", "gpt-35-turbo"];

/**
 * \brief 生成调用的错误分类，调用方可据此区分配置问题与厂商故障。
 */
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{provider} is not configured, missing: {}", .missing.join(", "))]
    Unconfigured {
        provider: &'static str,
        missing: Vec<&'static str>,
    },
    #[error("request to vendor failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vendor returned {status}: {body}")]
    Vendor { status: u16, body: String },
    #[error("unexpected vendor response: {0}")]
    Malformed(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /** \brief 部署名无法作为单个 URL 路径段使用 */
    #[error("invalid deployment name: {0:?}")]
    InvalidDeployment(String),
}

/**
 * \brief 生成请求：统一使用消息列表，单条 prompt 视为一条 user 消息。
 */
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    /** \brief 指定时替代已解析的部署名 */
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::from_messages(vec![ChatMessage::user(prompt)])
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

/**
 * \brief 非流式调用，返回完整回复文本。
 */
pub async fn chat_once(
    client: &reqwest::Client,
    config: &ProviderConfig,
    resolution: &Resolution,
    request: &GenerationRequest,
) -> Result<String, GenerationError> {
    let settings = match resolution {
        Resolution::Configured(settings) => settings,
        Resolution::Unconfigured { missing } => {
            return Err(GenerationError::Unconfigured {
                provider: config.name,
                missing: missing.clone(),
            })
        }
    };
    let deployment = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(settings.deployment.as_str());
    let deployment = checked_deployment(deployment)?;

    let url = vendor_url(
        &settings.endpoint,
        &["openai", "deployments", deployment, "chat", "completions"],
    )?;
    let body = ChatCompletionBody {
        messages: &request.messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    };

    telemetry::log_event(
        "llm.chat",
        &format!(
            "provider={} deployment={} msgs={}",
            config.name,
            deployment,
            request.messages.len()
        ),
    );

    let resp = client
        .post(url)
        .query(&[("api-version", settings.api_version.as_str())])
        .header(CONTENT_TYPE, "application/json")
        .header("api-key", &settings.api_key)
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(GenerationError::Vendor { status, body });
    }
    let v: Value = resp
        .json()
        .await
        .map_err(|e| GenerationError::Malformed(e.to_string()))?;
    extract_chat_content(&v)
}

/**
 * \brief 部署名必须是单个路径段，不允许携带路径、查询或片段分隔符。
 */
fn checked_deployment(name: &str) -> Result<&str, GenerationError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '?', '#']) {
        return Err(GenerationError::InvalidDeployment(name.to_string()));
    }
    Ok(name)
}

/**
 * \brief 在端点之后逐段追加路径，每段单独做百分号编码。
 */
fn vendor_url(endpoint: &str, segments: &[&str]) -> Result<Url, GenerationError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| GenerationError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| GenerationError::InvalidEndpoint(endpoint.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn extract_chat_content(v: &Value) -> Result<String, GenerationError> {
    let first = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| GenerationError::Malformed(format!("no choices in {}", v)))?;
    Ok(first
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string())
}

/**
 * \brief 厂商模型列表的解析结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelListing {
    Models(Vec<String>),
    Unrecognized,
}

/**
 * \brief 解析 `{data: [{id}]}` 形状；其它形状一律视为无法识别。
 */
pub fn parse_model_listing(v: &Value) -> ModelListing {
    match v.get("data").and_then(|d| d.as_array()) {
        Some(arr) => ModelListing::Models(
            arr.iter()
                .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
                .map(|s| s.to_string())
                .collect(),
        ),
        None => ModelListing::Unrecognized,
    }
}

/**
 * \brief 厂商调用失败或返回无法识别时使用的固定模型列表。
 */
pub fn fallback_models(config: &ProviderConfig) -> Vec<ModelDescriptor> {
    FALLBACK_MODEL_IDS
        .iter()
        .map(|id| ModelDescriptor {
            name: id.to_string(),
            label: format!("{} (Azure)", id),
            provider: config.name.to_string(),
            max_token_allowed: MODEL_TOKEN_PLACEHOLDER,
        })
        .collect()
}

/** \brief 模型列表的来源。 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Unconfigured,
    Vendor,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDiscovery {
    pub models: Vec<ModelDescriptor>,
    pub source: ModelSource,
}

/**
 * \brief 列出当前 Provider 可用模型。
 * \details 未配置时直接返回空列表且不发请求；厂商失败时退化为固定列表，从不返回错误。
 */
pub async fn list_models(
    client: &reqwest::Client,
    config: &ProviderConfig,
    resolution: &Resolution,
) -> Vec<ModelDescriptor> {
    discover_models(client, config, resolution).await.models
}

/**
 * \brief 与 list_models 相同，同时给出列表来自厂商、固定列表还是未配置。
 */
pub async fn discover_models(
    client: &reqwest::Client,
    config: &ProviderConfig,
    resolution: &Resolution,
) -> ModelDiscovery {
    let settings = match resolution {
        Resolution::Configured(settings) => settings,
        Resolution::Unconfigured { missing } => {
            telemetry::log_event(
                "llm.models",
                &format!("{} unconfigured, missing={}", config.name, missing.join(",")),
            );
            return ModelDiscovery {
                models: Vec::new(),
                source: ModelSource::Unconfigured,
            };
        }
    };

    let fallback = ModelDiscovery {
        models: fallback_models(config),
        source: ModelSource::Fallback,
    };
    match fetch_model_listing(client, settings).await {
        Ok(ModelListing::Models(ids)) => ModelDiscovery {
            models: ids
                .into_iter()
                .map(|id| ModelDescriptor {
                    label: id.clone(),
                    name: id,
                    provider: config.name.to_string(),
                    max_token_allowed: MODEL_TOKEN_PLACEHOLDER,
                })
                .collect(),
            source: ModelSource::Vendor,
        },
        Ok(ModelListing::Unrecognized) => {
            telemetry::log_error(
                "llm.models",
                &format!("{} returned an unrecognized model list, using fallback", config.name),
            );
            fallback
        }
        Err(err) => {
            telemetry::log_error(
                "llm.models",
                &format!("{} list models failed: {}, using fallback", config.name, err),
            );
            fallback
        }
    }
}

async fn fetch_model_listing(
    client: &reqwest::Client,
    settings: &ResolvedSettings,
) -> Result<ModelListing, GenerationError> {
    let url = vendor_url(&settings.endpoint, &["openai", "models"])?;
    let resp = client
        .get(url)
        .query(&[("api-version", settings.api_version.as_str())])
        .header("api-key", &settings.api_key)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(GenerationError::Vendor { status, body });
    }
    match resp.json::<Value>().await {
        Ok(v) => Ok(parse_model_listing(&v)),
        Err(_) => Ok(ModelListing::Unrecognized),
    }
}
