use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use azurequill_core_sdk::{
    db,
    llm::{self, GenerationRequest},
    models::{ProviderSetting, AZURE_OPENAI},
    server,
    settings::{self, Resolution, ServerEnv, SettingsSources},
    telemetry,
};

/**
 * \brief CLI 程序入口：配置 Azure OpenAI、查询模型、生成文本与启动服务。
 */
#[derive(Parser, Debug)]
#[command(name = "azurequill", version, about = "AzureQuill Azure OpenAI adapter")]
struct Cli {
    /// 设置数据库路径
    #[arg(long, global = true, default_value = db::DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief 列出当前配置下可用的模型。
     */
    Models,

    /**
     * \brief 发送一条 prompt 并打印模型回复。
     */
    Generate {
        #[arg(long)]
        prompt: String,
        /// 替代已配置的部署名
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },

    /**
     * \brief 管理持久化的 Provider 设置。
     */
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /**
     * \brief 开启或关闭本地日志文件。
     */
    Telemetry {
        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /** \brief 显示已保存的设置与解析状态。 */
    Show,
    /** \brief 更新设置，未提供的字段保持不变，传空字符串表示清除。 */
    Set {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        deployment: Option<String>,
        #[arg(long)]
        api_version: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /** \brief 删除已保存的设置。 */
    Clear,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,azurequill_core_sdk=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let conn = db::open_db(&cli.db).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    let env = ServerEnv::from_process();
    let config = &AZURE_OPENAI;

    match cli.command {
        Commands::Serve { addr } => {
            drop(conn);
            server::run(&addr, server::AppState::new(cli.db, env)).await?;
        }
        Commands::Models => {
            let persisted =
                db::get_provider_settings(&conn, config.id).context("load settings failed")?;
            let resolution = resolve(&env, persisted.as_ref());
            if let Resolution::Unconfigured { missing } = &resolution {
                println!("{} is not configured, missing: {}", config.name, missing.join(", "));
                return Ok(());
            }
            let models = llm::list_models(&reqwest::Client::new(), config, &resolution).await;
            for m in models {
                println!("{}\t{}\t{}", m.name, m.label, m.max_token_allowed);
            }
        }
        Commands::Generate {
            prompt,
            model,
            max_tokens,
            temperature,
        } => {
            let persisted =
                db::get_provider_settings(&conn, config.id).context("load settings failed")?;
            let resolution = resolve(&env, persisted.as_ref());
            let request = GenerationRequest {
                model,
                max_tokens,
                temperature,
                ..GenerationRequest::from_prompt(prompt)
            };
            let text = llm::chat_once(&reqwest::Client::new(), config, &resolution, &request)
                .await
                .context("generate failed")?;
            println!("{}", text);
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                let persisted =
                    db::get_provider_settings(&conn, config.id).context("load settings failed")?;
                let shown = persisted
                    .as_ref()
                    .map(|s| s.redacted(config))
                    .unwrap_or_default();
                println!("{}", serde_json::to_string_pretty(&shown)?);
                let resolution = resolve(&env, persisted.as_ref());
                match resolution {
                    Resolution::Configured(s) => println!(
                        "configured: endpoint={} deployment={} api-version={}",
                        s.endpoint, s.deployment, s.api_version
                    ),
                    Resolution::Unconfigured { missing } => {
                        println!("unconfigured, missing: {}", missing.join(", "))
                    }
                }
            }
            SettingsAction::Set {
                endpoint,
                api_key,
                deployment,
                api_version,
                enabled,
            } => {
                let mut patch = ProviderSetting {
                    enabled,
                    azure_openai_endpoint: endpoint,
                    azure_openai_api_key: api_key,
                    ..Default::default()
                };
                if let Some(v) = deployment {
                    patch
                        .custom_configuration
                        .insert(config.deployment_key.to_string(), v);
                }
                if let Some(v) = api_version {
                    patch
                        .custom_configuration
                        .insert(config.api_version_key.to_string(), v);
                }
                db::merge_provider_settings(&conn, config.id, &patch)
                    .context("save settings failed")?;
                telemetry::log_event("cli.settings", &format!("update provider={}", config.id));
                println!("Saved settings for {}", config.name);
            }
            SettingsAction::Clear => {
                let removed = db::delete_provider_settings(&conn, config.id)
                    .context("clear settings failed")?;
                println!(
                    "{}",
                    if removed {
                        "Settings cleared"
                    } else {
                        "No saved settings"
                    }
                );
            }
        },
        Commands::Telemetry { enable, disable } => {
            let enabled = enable && !disable;
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    Ok(())
}

fn resolve(env: &ServerEnv, persisted: Option<&ProviderSetting>) -> Resolution {
    settings::resolve(
        &AZURE_OPENAI,
        SettingsSources {
            overrides: &HashMap::new(),
            persisted,
            env,
        },
    )
}
