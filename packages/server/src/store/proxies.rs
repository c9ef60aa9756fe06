//! Per-profile proxies and Cloudflare-challenge observations.
//!
//! Challenge events feed `cf_recent_ratio`, which pre-arms the in-browser
//! transport for proxies that have been tripping anti-bot checks.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::Store;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Proxy {
    pub id: i64,
    pub profile_id: i64,
    pub proxy_type: String,
    pub proxy_ip: String,
    pub proxy_port: i64,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// Proxy URL in the scheme reqwest understands.
    pub fn url(&self) -> String {
        let scheme = match self.proxy_type.as_str() {
            "socks5" => "socks5",
            _ => "http",
        };
        match (&self.proxy_user, &self.proxy_password) {
            (Some(user), Some(password)) => format!(
                "{}://{}:{}@{}:{}",
                scheme, user, password, self.proxy_ip, self.proxy_port
            ),
            _ => format!("{}://{}:{}", scheme, self.proxy_ip, self.proxy_port),
        }
    }
}

impl Store {
    pub async fn upsert_proxy(
        &self,
        profile_id: i64,
        proxy_type: &str,
        proxy_ip: &str,
        proxy_port: i64,
        proxy_user: Option<&str>,
        proxy_password: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM proxies WHERE profile_id = ? LIMIT 1")
                .bind(profile_id)
                .fetch_optional(self.pool())
                .await?;
        match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE proxies
                    SET proxy_type = ?, proxy_ip = ?, proxy_port = ?, proxy_user = ?, proxy_password = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(proxy_type)
                .bind(proxy_ip)
                .bind(proxy_port)
                .bind(proxy_user)
                .bind(proxy_password)
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
                Ok(id)
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO proxies (profile_id, proxy_type, proxy_ip, proxy_port, proxy_user, proxy_password, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING id
                    "#,
                )
                .bind(profile_id)
                .bind(proxy_type)
                .bind(proxy_ip)
                .bind(proxy_port)
                .bind(proxy_user)
                .bind(proxy_password)
                .bind(now)
                .bind(now)
                .fetch_one(self.pool())
                .await?;
                Ok(id)
            }
        }
    }

    pub async fn get_proxy_for_profile(&self, profile_id: i64) -> Result<Option<Proxy>> {
        let proxy = sqlx::query_as::<_, Proxy>(
            "SELECT * FROM proxies WHERE profile_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(profile_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(proxy)
    }

    /// Record the outcome of one proxied poll: challenged or clean.
    pub async fn record_proxy_cf_event(
        &self,
        proxy_id: Option<i64>,
        profile_id: i64,
        job_id: i64,
        phase: &str,
        challenged: bool,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proxy_cf_events (proxy_id, profile_id, job_id, phase, challenged, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(proxy_id)
        .bind(profile_id)
        .bind(job_id)
        .bind(phase)
        .bind(challenged)
        .bind(detail)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fraction of recent polls through this proxy that hit a challenge.
    /// Returns 0.0 when nothing has been recorded in the window.
    pub async fn cf_recent_ratio(&self, proxy_id: i64, window_minutes: i64) -> Result<f64> {
        let since = Utc::now() - Duration::minutes(window_minutes.max(1));
        let row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(CASE WHEN challenged = 1 THEN 1 ELSE 0 END)
            FROM proxy_cf_events
            WHERE proxy_id = ? AND created_at >= ?
            "#,
        )
        .bind(proxy_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        let (total, challenged) = (row.0, row.1.unwrap_or(0));
        if total == 0 {
            return Ok(0.0);
        }
        Ok(challenged as f64 / total as f64)
    }
}
