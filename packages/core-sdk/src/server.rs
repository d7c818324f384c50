use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    db, llm,
    llm::{GenerationError, GenerationRequest, ModelSource},
    models::{
        find_provider, ChatMessage, ModelDescriptor, ProviderConfig, ProviderSetting, AZURE_OPENAI,
        PROVIDERS,
    },
    settings::{self, Resolution, ServerEnv, SettingsSources},
    telemetry,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

/**
 * \brief 各请求共享的只读状态。
 */
#[derive(Clone)]
pub struct AppState {
    db_path: Arc<PathBuf>,
    env: Arc<ServerEnv>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(db_path: impl Into<PathBuf>, env: ServerEnv) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
            env: Arc::new(env),
            http: reqwest::Client::new(),
        }
    }

    /**
     * \brief 读取持久化设置并解析出当前配置；数据库连接不跨越 await。
     */
    fn resolve(
        &self,
        config: &ProviderConfig,
        overrides: &HashMap<String, String>,
    ) -> Result<Resolution, ApiError> {
        let conn = db::open_db(self.db_path.as_path()).map_err(internal_err)?;
        let persisted = db::get_provider_settings(&conn, config.id).map_err(internal_err)?;
        Ok(self.resolve_with(config, overrides, persisted.as_ref()))
    }

    fn resolve_with(
        &self,
        config: &ProviderConfig,
        overrides: &HashMap<String, String>,
        persisted: Option<&ProviderSetting>,
    ) -> Resolution {
        settings::resolve(
            config,
            SettingsSources {
                overrides,
                persisted,
                env: &self.env,
            },
        )
    }
}

/**
 * \brief 构建 API 路由。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/azure-openai", post(generate))
        .route("/api/models", get(list_models))
        .route("/api/providers", get(list_providers))
        .route(
            "/api/providers/{id}/settings",
            get(get_settings).put(update_settings).delete(clear_settings),
        )
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening addr={}", addr));
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    /** \brief 调用方提供的 API Key，按 Provider 名称、标识或 Key 键名索引 */
    #[serde(default)]
    api_keys: HashMap<String, String>,
}

impl GenerateBody {
    /**
     * \brief 转为生成请求；messages 优先，同时提供 prompt 时追加为最后一条 user 消息。
     */
    fn into_request(self) -> Result<GenerationRequest, &'static str> {
        let mut messages = self.messages.unwrap_or_default();
        if messages.iter().any(|m| m.content.is_blank()) {
            return Err("message content must not be empty");
        }
        if let Some(prompt) = self.prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(ChatMessage::user(prompt));
        }
        if messages.is_empty() {
            return Err("prompt or messages is required");
        }
        Ok(GenerationRequest {
            messages,
            model: self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }
}

/**
 * \brief 从请求体中只取 API Key 作为覆盖项；端点、部署名等始终来自服务端配置。
 */
fn caller_overrides(
    config: &ProviderConfig,
    api_keys: &HashMap<String, String>,
) -> HashMap<String, String> {
    [config.name, config.id, config.api_key_key]
        .into_iter()
        .filter_map(|key| api_keys.get(key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

#[derive(Serialize, Debug)]
struct GenerateResponse {
    response: String,
}

/**
 * \brief 文本生成：POST /api/azure-openai
 */
async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| bad_request(e.body_text()))?;
    let config = &AZURE_OPENAI;
    let overrides = caller_overrides(config, &body.api_keys);
    let request = body.into_request().map_err(bad_request)?;

    let resolution = state.resolve(config, &overrides)?;
    match llm::chat_once(&state.http, config, &resolution, &request).await {
        Ok(response) => Ok(Json(GenerateResponse { response })),
        Err(e @ GenerationError::InvalidDeployment(_)) => Err(bad_request(e.to_string())),
        Err(e) => {
            telemetry::log_error("server.generate", &format!("generate failed: {}", e));
            Err(internal_err(e))
        }
    }
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    provider: Option<String>,
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    provider: &'static str,
    models: Vec<ModelDescriptor>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let config = lookup_provider(q.provider.as_deref().unwrap_or(AZURE_OPENAI.id))?;
    let resolution = state.resolve(config, &HashMap::new())?;
    let models = llm::list_models(&state.http, config, &resolution).await;
    Ok(Json(ModelsResponse {
        provider: config.id,
        models,
    }))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ProviderItem {
    id: &'static str,
    name: &'static str,
    api_key_link: &'static str,
    /** \brief 数据库中是否存在该 Provider 的设置 */
    stored: bool,
    configured: bool,
    missing: Vec<&'static str>,
}

/**
 * \brief 列出已注册 Provider 及其配置状态；一次读出全部已保存设置。
 */
async fn list_providers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db::open_db(state.db_path.as_path()).map_err(internal_err)?;
    let saved: HashMap<String, ProviderSetting> = db::list_provider_settings(&conn)
        .map_err(internal_err)?
        .into_iter()
        .collect();
    drop(conn);

    let items: Vec<ProviderItem> = PROVIDERS
        .iter()
        .map(|config| {
            let persisted = saved.get(config.id);
            let resolution = state.resolve_with(config, &HashMap::new(), persisted);
            ProviderItem {
                id: config.id,
                name: config.name,
                api_key_link: config.api_key_link,
                stored: persisted.is_some(),
                configured: resolution.is_configured(),
                missing: resolution.missing().to_vec(),
            }
        })
        .collect();
    Ok(Json(json!({ "providers": items })))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SettingsResponse {
    provider: &'static str,
    settings: ProviderSetting,
    /** \brief settings 中不含 Key，以此告知是否已保存 */
    api_key_set: bool,
}

impl SettingsResponse {
    fn new(config: &ProviderConfig, settings: &ProviderSetting) -> Self {
        Self {
            provider: config.id,
            settings: settings.redacted(config),
            api_key_set: settings.has_api_key(config),
        }
    }
}

/**
 * \brief 读取 Provider 设置（API Key 不回显）。
 */
async fn get_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let config = lookup_provider(&id)?;
    let conn = db::open_db(state.db_path.as_path()).map_err(internal_err)?;
    let settings = db::get_provider_settings(&conn, config.id)
        .map_err(internal_err)?
        .unwrap_or_default();
    Ok(Json(SettingsResponse::new(config, &settings)))
}

/**
 * \brief 以补丁方式更新 Provider 设置。
 */
async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ProviderSetting>, JsonRejection>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let config = lookup_provider(&id)?;
    let Json(patch) = payload.map_err(|e| bad_request(e.body_text()))?;
    let conn = db::open_db(state.db_path.as_path()).map_err(internal_err)?;
    let merged = db::merge_provider_settings(&conn, config.id, &patch).map_err(internal_err)?;
    telemetry::log_event("server.settings", &format!("update provider={}", config.id));
    Ok(Json(SettingsResponse::new(config, &merged)))
}

async fn clear_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = lookup_provider(&id)?;
    let conn = db::open_db(state.db_path.as_path()).map_err(internal_err)?;
    let removed = db::delete_provider_settings(&conn, config.id).map_err(internal_err)?;
    telemetry::log_event("server.settings", &format!("clear provider={}", config.id));
    Ok(Json(json!({ "provider": config.id, "removed": removed })))
}

/**
 * \brief 健康检查：解析配置并尝试列出模型。
 * \details ok 仅在厂商模型列表可用时为 true；已配置但退化为固定列表时 ok 为 false。
 */
async fn health_check(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = lookup_provider(q.provider.as_deref().unwrap_or(AZURE_OPENAI.id))?;
    let resolution = state.resolve(config, &HashMap::new())?;
    let found = llm::discover_models(&state.http, config, &resolution).await;
    Ok(Json(json!({
        "ok": found.source == ModelSource::Vendor,
        "provider": config.id,
        "configured": resolution.is_configured(),
        "source": found.source,
        "missing": resolution.missing(),
        "models": found.models.len()
    })))
}

fn lookup_provider(id: &str) -> Result<&'static ProviderConfig, ApiError> {
    find_provider(id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown provider: {}", id) })),
        )
    })
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}
