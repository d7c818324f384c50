use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/**
 * \brief Provider 静态配置：标识信息与四个配置键名。
 * \details 键名同时用于环境变量、调用方覆盖项以及持久化设置中的 customConfiguration。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderConfig {
    /** \brief 路由与存储使用的 Provider 标识 */
    pub id: &'static str,
    /** \brief 显示名称，也是 ModelDescriptor.provider 的取值 */
    pub name: &'static str,
    /** \brief 获取 API Key 的入口链接 */
    pub api_key_link: &'static str,
    pub endpoint_key: &'static str,
    pub api_key_key: &'static str,
    pub deployment_key: &'static str,
    pub api_version_key: &'static str,
}

pub const AZURE_OPENAI_PROVIDER_ID: &str = "azure-openai";

pub const AZURE_OPENAI: ProviderConfig = ProviderConfig {
    id: AZURE_OPENAI_PROVIDER_ID,
    name: "Azure OpenAI",
    api_key_link: "https://portal.azure.com/",
    endpoint_key: "AZURE_OPENAI_ENDPOINT",
    api_key_key: "AZURE_OPENAI_API_KEY",
    deployment_key: "AZURE_OPENAI_DEPLOYMENT_NAME",
    api_version_key: "AZURE_OPENAI_API_VERSION",
};

/** \brief 已注册的 Provider 列表。 */
pub const PROVIDERS: &[ProviderConfig] = &[AZURE_OPENAI];

/**
 * \brief 按标识查找已注册的 Provider。
 */
pub fn find_provider(id: &str) -> Option<&'static ProviderConfig> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/**
 * \brief 持久化的 Provider 设置，JSON 字段与前端设置面板保持一致。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSetting {
    /** \brief 为 false 时该设置整体不参与解析 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(
        default,
        rename = "azureOpenAIEndpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub azure_openai_endpoint: Option<String>,
    #[serde(
        default,
        rename = "azureOpenAIApiKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub azure_openai_api_key: Option<String>,
    /** \brief 以配置键名索引的附加项（部署名、API 版本等） */
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_configuration: BTreeMap<String, String>,
}

impl ProviderSetting {
    /**
     * \brief 以补丁方式合并：仅覆盖补丁中出现的字段，空字符串表示清除。
     */
    pub fn merge(&mut self, patch: &ProviderSetting) {
        if patch.enabled.is_some() {
            self.enabled = patch.enabled;
        }
        merge_field(&mut self.base_url, &patch.base_url);
        merge_field(&mut self.azure_openai_endpoint, &patch.azure_openai_endpoint);
        merge_field(&mut self.azure_openai_api_key, &patch.azure_openai_api_key);
        for (key, value) in &patch.custom_configuration {
            if value.trim().is_empty() {
                self.custom_configuration.remove(key);
            } else {
                self.custom_configuration.insert(key.clone(), value.clone());
            }
        }
    }

    /**
     * \brief 返回去掉 API Key 的副本，用于对外展示。
     * \details Key 字段直接省略，客户端原样回写时 merge 不会清除已保存的 Key。
     */
    pub fn redacted(&self, config: &ProviderConfig) -> ProviderSetting {
        let mut out = self.clone();
        out.azure_openai_api_key = None;
        out.custom_configuration.remove(config.api_key_key);
        out
    }

    /** \brief 是否保存了非空 API Key。 */
    pub fn has_api_key(&self, config: &ProviderConfig) -> bool {
        [
            self.azure_openai_api_key.as_deref(),
            self.custom_configuration.get(config.api_key_key).map(String::as_str),
        ]
        .into_iter()
        .flatten()
        .any(|v| !v.trim().is_empty())
    }
}

fn merge_field(target: &mut Option<String>, patch: &Option<String>) {
    if let Some(value) = patch {
        *target = if value.trim().is_empty() {
            None
        } else {
            Some(value.clone())
        };
    }
}

/**
 * \brief 归一化后的模型描述。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /** \brief 模型或部署标识 */
    pub name: String,
    pub label: String,
    /** \brief 所属 Provider 的显示名称 */
    pub provider: String,
    pub max_token_allowed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐；content 原样透传给厂商。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
}

/** \brief 纯文本，或由文本/图片片段组成的有序列表。 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn is_blank(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}
