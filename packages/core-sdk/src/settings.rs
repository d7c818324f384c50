use std::collections::HashMap;

use crate::models::{ProviderConfig, ProviderSetting};

/**
 * \brief 服务端环境变量快照。
 * \details 启动时读取一次并显式传递，解析逻辑本身不访问进程环境。
 */
#[derive(Debug, Clone, Default)]
pub struct ServerEnv {
    vars: HashMap<String, String>,
}

impl ServerEnv {
    /** \brief 读取当前进程的全部环境变量。 */
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ServerEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/**
 * \brief 单次调用时解析出的完整配置，四个字段均非空。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    Endpoint,
    ApiKey,
    Deployment,
    ApiVersion,
}

impl SettingField {
    pub const ALL: [SettingField; 4] = [
        SettingField::Endpoint,
        SettingField::ApiKey,
        SettingField::Deployment,
        SettingField::ApiVersion,
    ];

    /** \brief 该字段在指定 Provider 下的配置键名。 */
    pub fn key(self, config: &ProviderConfig) -> &'static str {
        match self {
            SettingField::Endpoint => config.endpoint_key,
            SettingField::ApiKey => config.api_key_key,
            SettingField::Deployment => config.deployment_key,
            SettingField::ApiVersion => config.api_version_key,
        }
    }
}

/**
 * \brief 解析结果：完整配置，或列出缺失键名的“未配置”状态。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Configured(ResolvedSettings),
    Unconfigured { missing: Vec<&'static str> },
}

impl Resolution {
    pub fn is_configured(&self) -> bool {
        matches!(self, Resolution::Configured(_))
    }

    pub fn settings(&self) -> Option<&ResolvedSettings> {
        match self {
            Resolution::Configured(settings) => Some(settings),
            Resolution::Unconfigured { .. } => None,
        }
    }

    pub fn missing(&self) -> &[&'static str] {
        match self {
            Resolution::Configured(_) => &[],
            Resolution::Unconfigured { missing } => missing,
        }
    }
}

/**
 * \brief 三层配置来源，优先级：调用方覆盖 > 持久化设置 > 环境变量。
 */
#[derive(Debug, Clone, Copy)]
pub struct SettingsSources<'a> {
    pub overrides: &'a HashMap<String, String>,
    pub persisted: Option<&'a ProviderSetting>,
    pub env: &'a ServerEnv,
}

/**
 * \brief 逐字段解析 Provider 配置，取第一个非空值。
 * \details 任一字段在三层来源中均为空时返回 Unconfigured；不修改任何来源。
 */
pub fn resolve(config: &ProviderConfig, sources: SettingsSources<'_>) -> Resolution {
    let persisted = sources.persisted.filter(|s| s.enabled != Some(false));

    let mut values: [Option<String>; 4] = Default::default();
    let mut missing = Vec::new();
    for (slot, field) in values.iter_mut().zip(SettingField::ALL) {
        let value = normalized(field, from_overrides(config, field, sources.overrides))
            .or_else(|| normalized(field, persisted.and_then(|s| from_persisted(config, field, s))))
            .or_else(|| normalized(field, sources.env.get(field.key(config))));
        match value {
            Some(v) => *slot = Some(v.to_string()),
            None => missing.push(field.key(config)),
        }
    }

    match values {
        [Some(endpoint), Some(api_key), Some(deployment), Some(api_version)] => {
            Resolution::Configured(ResolvedSettings {
                endpoint,
                api_key,
                deployment,
                api_version,
            })
        }
        _ => Resolution::Unconfigured { missing },
    }
}

fn from_overrides<'a>(
    config: &ProviderConfig,
    field: SettingField,
    overrides: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let by_key = overrides.get(field.key(config)).map(String::as_str);
    match field {
        // 前端按 Provider 显示名称传递 API Key
        SettingField::ApiKey => non_empty(by_key).or_else(|| {
            overrides
                .get(config.name)
                .or_else(|| overrides.get(config.id))
                .map(String::as_str)
        }),
        _ => by_key,
    }
}

fn from_persisted<'a>(
    config: &ProviderConfig,
    field: SettingField,
    setting: &'a ProviderSetting,
) -> Option<&'a str> {
    let custom = || {
        setting
            .custom_configuration
            .get(field.key(config))
            .map(String::as_str)
    };
    match field {
        SettingField::Endpoint => normalized(field, setting.base_url.as_deref())
            .or_else(|| normalized(field, setting.azure_openai_endpoint.as_deref()))
            .or_else(custom),
        SettingField::ApiKey => non_empty(setting.azure_openai_api_key.as_deref()).or_else(custom),
        SettingField::Deployment | SettingField::ApiVersion => custom(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/** \brief 在比较优先级之前归一化单个来源的值；端点去掉末尾的 '/'。 */
fn normalized(field: SettingField, value: Option<&str>) -> Option<&str> {
    let value = non_empty(value)?;
    let value = match field {
        SettingField::Endpoint => value.trim_end_matches('/'),
        _ => value,
    };
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AZURE_OPENAI;

    const PLAIN: ProviderConfig = ProviderConfig {
        id: "plain",
        name: "Plain",
        api_key_link: "",
        endpoint_key: "ENDPOINT",
        api_key_key: "API_KEY",
        deployment_key: "DEPLOYMENT",
        api_version_key: "API_VERSION",
    };

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn custom(pairs: &[(&str, &str)]) -> ProviderSetting {
        ProviderSetting {
            custom_configuration: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_mixed_sources_scenario() {
        let overrides = map(&[("ENDPOINT", "https://x")]);
        let persisted = custom(&[("API_KEY", "k")]);
        let env: ServerEnv = [("DEPLOYMENT", "d"), ("API_VERSION", "v")].into_iter().collect();

        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &overrides,
                persisted: Some(&persisted),
                env: &env,
            },
        );
        assert_eq!(
            res,
            Resolution::Configured(ResolvedSettings {
                endpoint: "https://x".into(),
                api_key: "k".into(),
                deployment: "d".into(),
                api_version: "v".into(),
            })
        );
    }

    #[test]
    fn test_each_field_from_any_single_source() {
        // 每个字段各自从三种来源之一取值，覆盖全部 81 种组合
        let values = ["https://e", "key", "dep", "2024-06-01"];
        for combo in 0..81u32 {
            let mut overrides = HashMap::new();
            let mut persisted = ProviderSetting::default();
            let mut env_pairs = Vec::new();
            let mut c = combo;
            for (i, field) in SettingField::ALL.iter().enumerate() {
                let key = field.key(&PLAIN).to_string();
                match c % 3 {
                    0 => {
                        overrides.insert(key, values[i].to_string());
                    }
                    1 => {
                        persisted.custom_configuration.insert(key, values[i].to_string());
                    }
                    _ => env_pairs.push((key, values[i].to_string())),
                }
                c /= 3;
            }
            let env: ServerEnv = env_pairs.into_iter().collect();
            let res = resolve(
                &PLAIN,
                SettingsSources {
                    overrides: &overrides,
                    persisted: Some(&persisted),
                    env: &env,
                },
            );
            let settings = res.settings().expect("configured");
            assert_eq!(settings.endpoint, "https://e");
            assert_eq!(settings.api_key, "key");
            assert_eq!(settings.deployment, "dep");
            assert_eq!(settings.api_version, "2024-06-01");
        }
    }

    #[test]
    fn test_precedence_override_then_persisted_then_env() {
        let overrides = map(&[("DEPLOYMENT", "from-override")]);
        let persisted = custom(&[("DEPLOYMENT", "from-store"), ("API_VERSION", "store-v")]);
        let env: ServerEnv = [
            ("ENDPOINT", "https://env"),
            ("API_KEY", "env-key"),
            ("DEPLOYMENT", "from-env"),
            ("API_VERSION", "env-v"),
        ]
        .into_iter()
        .collect();
        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &overrides,
                persisted: Some(&persisted),
                env: &env,
            },
        );
        let s = res.settings().expect("configured");
        assert_eq!(s.deployment, "from-override");
        assert_eq!(s.api_version, "store-v");
        assert_eq!(s.endpoint, "https://env");
    }

    #[test]
    fn test_empty_values_fall_through() {
        let overrides = map(&[("ENDPOINT", "  "), ("API_KEY", "")]);
        let env: ServerEnv = [
            ("ENDPOINT", "https://env/"),
            ("API_KEY", "env-key"),
            ("DEPLOYMENT", "d"),
            ("API_VERSION", "v"),
        ]
        .into_iter()
        .collect();
        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &overrides,
                persisted: None,
                env: &env,
            },
        );
        let s = res.settings().expect("configured");
        assert_eq!(s.endpoint, "https://env");
        assert_eq!(s.api_key, "env-key");
    }

    #[test]
    fn test_slash_only_endpoint_falls_through() {
        let overrides = map(&[("ENDPOINT", "/")]);
        let persisted = custom(&[("ENDPOINT", " // ")]);
        let env: ServerEnv = [
            ("ENDPOINT", "https://env//"),
            ("API_KEY", "env-key"),
            ("DEPLOYMENT", "d"),
            ("API_VERSION", "v"),
        ]
        .into_iter()
        .collect();
        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &overrides,
                persisted: Some(&persisted),
                env: &env,
            },
        );
        assert_eq!(res.settings().expect("configured").endpoint, "https://env");
    }

    #[test]
    fn test_missing_field_is_unconfigured() {
        let overrides = map(&[("ENDPOINT", "https://x"), ("API_KEY", "k")]);
        let env: ServerEnv = [("DEPLOYMENT", "d")].into_iter().collect();
        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &overrides,
                persisted: None,
                env: &env,
            },
        );
        assert!(!res.is_configured());
        assert_eq!(res.missing(), &["API_VERSION"]);
    }

    #[test]
    fn test_nothing_configured_lists_all_keys() {
        let res = resolve(
            &AZURE_OPENAI,
            SettingsSources {
                overrides: &HashMap::new(),
                persisted: None,
                env: &ServerEnv::default(),
            },
        );
        assert_eq!(
            res.missing(),
            &[
                "AZURE_OPENAI_ENDPOINT",
                "AZURE_OPENAI_API_KEY",
                "AZURE_OPENAI_DEPLOYMENT_NAME",
                "AZURE_OPENAI_API_VERSION",
            ]
        );
    }

    #[test]
    fn test_persisted_typed_fields_and_provider_name_key() {
        let overrides = map(&[("Azure OpenAI", "name-key")]);
        let persisted = ProviderSetting {
            azure_openai_endpoint: Some("https://res.openai.azure.com/".into()),
            azure_openai_api_key: Some("stored-key".into()),
            custom_configuration: [
                ("AZURE_OPENAI_DEPLOYMENT_NAME".to_string(), "gpt-4o".to_string()),
                ("AZURE_OPENAI_API_VERSION".to_string(), "2024-05-01-preview".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let res = resolve(
            &AZURE_OPENAI,
            SettingsSources {
                overrides: &overrides,
                persisted: Some(&persisted),
                env: &ServerEnv::default(),
            },
        );
        let s = res.settings().expect("configured");
        assert_eq!(s.endpoint, "https://res.openai.azure.com");
        assert_eq!(s.api_key, "name-key");
        assert_eq!(s.deployment, "gpt-4o");
    }

    #[test]
    fn test_disabled_setting_is_ignored() {
        let persisted = ProviderSetting {
            enabled: Some(false),
            ..custom(&[
                ("ENDPOINT", "https://x"),
                ("API_KEY", "k"),
                ("DEPLOYMENT", "d"),
                ("API_VERSION", "v"),
            ])
        };
        let res = resolve(
            &PLAIN,
            SettingsSources {
                overrides: &HashMap::new(),
                persisted: Some(&persisted),
                env: &ServerEnv::default(),
            },
        );
        assert_eq!(res.missing().len(), 4);
    }
}
