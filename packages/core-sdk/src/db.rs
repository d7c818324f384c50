use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

use crate::models::ProviderSetting;

pub const DEFAULT_DB_PATH: &str = "azurequill.db";

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let conn = Connection::open(path)
        .with_context(|| format!("open database {} failed", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS provider_settings (
            provider_id TEXT PRIMARY KEY,
            settings    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取指定 Provider 的持久化设置（未保存时返回 None）。
 */
pub fn get_provider_settings(conn: &Connection, provider_id: &str) -> Result<Option<ProviderSetting>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT settings FROM provider_settings WHERE provider_id=?1",
            params![provider_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .with_context(|| format!("invalid settings json for provider {}", provider_id))
    })
    .transpose()
}

/**
 * \brief 整体写入 Provider 设置。
 */
pub fn upsert_provider_settings(
    conn: &Connection,
    provider_id: &str,
    settings: &ProviderSetting,
) -> Result<()> {
    let text = serde_json::to_string(settings)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO provider_settings (provider_id, settings) VALUES (?1, ?2)
         ON CONFLICT(provider_id) DO UPDATE SET settings=excluded.settings",
            params![provider_id, text],
        )
    })?;
    Ok(())
}

/**
 * \brief 以补丁方式更新 Provider 设置，返回合并后的结果。
 */
pub fn merge_provider_settings(
    conn: &Connection,
    provider_id: &str,
    patch: &ProviderSetting,
) -> Result<ProviderSetting> {
    let mut current = get_provider_settings(conn, provider_id)?.unwrap_or_default();
    current.merge(patch);
    upsert_provider_settings(conn, provider_id, &current)?;
    Ok(current)
}

/**
 * \brief 删除 Provider 设置，返回是否存在记录。
 */
pub fn delete_provider_settings(conn: &Connection, provider_id: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM provider_settings WHERE provider_id=?1",
            params![provider_id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief 列出全部已保存的 Provider 设置。
 */
pub fn list_provider_settings(conn: &Connection) -> Result<Vec<(String, ProviderSetting)>> {
    let mut stmt =
        conn.prepare("SELECT provider_id, settings FROM provider_settings ORDER BY provider_id ASC")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(id, text)| {
            let settings = serde_json::from_str(&text)
                .with_context(|| format!("invalid settings json for provider {}", id))?;
            Ok((id, settings))
        })
        .collect()
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn sample() -> ProviderSetting {
        let mut s = ProviderSetting {
            base_url: Some("https://res.openai.azure.com".into()),
            azure_openai_api_key: Some("sk-1".into()),
            ..Default::default()
        };
        s.custom_configuration
            .insert("AZURE_OPENAI_DEPLOYMENT_NAME".into(), "gpt-4o".into());
        s
    }

    #[test]
    fn test_settings_roundtrip_and_missing() {
        let conn = mem_conn();
        assert!(get_provider_settings(&conn, "azure-openai")
            .expect("get missing")
            .is_none());

        upsert_provider_settings(&conn, "azure-openai", &sample()).expect("upsert");
        let loaded = get_provider_settings(&conn, "azure-openai")
            .expect("get")
            .expect("exists");
        assert_eq!(loaded, sample());

        let replaced = ProviderSetting {
            enabled: Some(false),
            ..Default::default()
        };
        upsert_provider_settings(&conn, "azure-openai", &replaced).expect("replace");
        let loaded = get_provider_settings(&conn, "azure-openai")
            .expect("get")
            .expect("exists");
        assert_eq!(loaded, replaced);
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let conn = mem_conn();
        upsert_provider_settings(&conn, "azure-openai", &sample()).expect("upsert");

        let mut patch = ProviderSetting::default();
        patch
            .custom_configuration
            .insert("AZURE_OPENAI_API_VERSION".into(), "2024-06-01".into());
        let merged = merge_provider_settings(&conn, "azure-openai", &patch).expect("merge");

        assert_eq!(merged.azure_openai_api_key.as_deref(), Some("sk-1"));
        assert_eq!(merged.custom_configuration.len(), 2);
        let stored = get_provider_settings(&conn, "azure-openai")
            .expect("get")
            .expect("exists");
        assert_eq!(stored, merged);
    }

    #[test]
    fn test_merge_creates_when_absent() {
        let conn = mem_conn();
        let merged = merge_provider_settings(&conn, "azure-openai", &sample()).expect("merge");
        assert_eq!(merged, sample());
    }

    #[test]
    fn test_delete_and_list() {
        let conn = mem_conn();
        upsert_provider_settings(&conn, "b", &sample()).expect("upsert b");
        upsert_provider_settings(&conn, "a", &ProviderSetting::default()).expect("upsert a");
        let all = list_provider_settings(&conn).expect("list");
        let ids: Vec<&str> = all.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(delete_provider_settings(&conn, "b").expect("delete b"));
        assert!(!delete_provider_settings(&conn, "b").expect("delete again"));
        assert_eq!(list_provider_settings(&conn).expect("list").len(), 1);
    }

    #[test]
    fn test_corrupt_settings_json_is_error() {
        let conn = mem_conn();
        conn.execute(
            "INSERT INTO provider_settings (provider_id, settings) VALUES ('x', 'not json')",
            [],
        )
        .expect("raw insert");
        assert!(get_provider_settings(&conn, "x").is_err());
    }

    #[test]
    fn test_telemetry_flag() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).expect("default"));
        set_telemetry_enabled(&conn, true).expect("enable");
        assert!(get_telemetry_enabled(&conn).expect("read"));
        set_telemetry_enabled(&conn, false).expect("disable");
        assert!(!get_telemetry_enabled(&conn).expect("read"));
    }
}
