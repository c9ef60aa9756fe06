//! Single-row JSON settings documents. The typed views live in
//! `kernel::settings`; the store only round-trips opaque JSON.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::Store;

async fn load_document(
    store: &Store,
    table: &str,
) -> Result<Option<(serde_json::Value, DateTime<Utc>)>> {
    let sql = format!("SELECT data_json, updated_at FROM {} WHERE id = 1", table);
    let row: Option<(String, DateTime<Utc>)> =
        sqlx::query_as(&sql).fetch_optional(store.pool()).await?;
    match row {
        Some((text, updated_at)) => {
            let value = serde_json::from_str(&text)?;
            Ok(Some((value, updated_at)))
        }
        None => Ok(None),
    }
}

async fn save_document(store: &Store, table: &str, data: &serde_json::Value) -> Result<()> {
    let sql = format!(
        r#"
        INSERT INTO {} (id, data_json, updated_at)
        VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json, updated_at = excluded.updated_at
        "#,
        table
    );
    sqlx::query(&sql)
        .bind(data.to_string())
        .bind(Utc::now())
        .execute(store.pool())
        .await?;
    Ok(())
}

impl Store {
    pub async fn load_system_settings_doc(
        &self,
    ) -> Result<Option<(serde_json::Value, DateTime<Utc>)>> {
        load_document(self, "system_settings").await
    }

    pub async fn save_system_settings_doc(&self, data: &serde_json::Value) -> Result<()> {
        save_document(self, "system_settings", data).await
    }

    pub async fn load_scan_scheduler_doc(
        &self,
    ) -> Result<Option<(serde_json::Value, DateTime<Utc>)>> {
        load_document(self, "scan_scheduler_settings").await
    }

    pub async fn save_scan_scheduler_doc(&self, data: &serde_json::Value) -> Result<()> {
        save_document(self, "scan_scheduler_settings", data).await
    }

    pub async fn load_watermark_doc(&self) -> Result<Option<(serde_json::Value, DateTime<Utc>)>> {
        load_document(self, "watermark_free_config").await
    }

    pub async fn save_watermark_doc(&self, data: &serde_json::Value) -> Result<()> {
        save_document(self, "watermark_free_config", data).await
    }
}
