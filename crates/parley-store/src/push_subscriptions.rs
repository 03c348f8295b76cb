//! Push subscription records, used by the notification fallback.

use std::net::IpAddr;

use chrono::Utc;
use rusqlite::{params, params_from_iter};
use url::{Host, Url};
use uuid::Uuid;

use parley_shared::UserId;

use crate::columns::{not_found, timestamp_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::PushSubscription;

impl Database {
    /// Register `endpoint` for `user`. Registering the same endpoint twice
    /// returns the existing record.
    pub fn add_push_subscription(&self, user: &UserId, endpoint: &str) -> Result<PushSubscription> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(StoreError::Validation("push endpoint must not be empty".into()));
        }
        validate_endpoint(endpoint)?;

        self.conn().execute(
            "INSERT OR IGNORE INTO push_subscriptions (id, user_id, endpoint, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                user.to_string(),
                endpoint,
                Utc::now().to_rfc3339(),
            ],
        )?;

        self.conn()
            .query_row(
                "SELECT id, user_id, endpoint, created_at FROM push_subscriptions
                 WHERE user_id = ?1 AND endpoint = ?2",
                params![user.to_string(), endpoint],
                row_to_subscription,
            )
            .map_err(not_found("push subscription"))
    }

    /// All subscriptions belonging to any of `users`.
    pub fn push_subscriptions_for(&self, users: &[UserId]) -> Result<Vec<PushSubscription>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; users.len()].join(", ");
        let sql = format!(
            "SELECT id, user_id, endpoint, created_at FROM push_subscriptions
             WHERE user_id IN ({placeholders})
             ORDER BY created_at ASC"
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(users.iter().map(|u| u.to_string())),
            row_to_subscription,
        )?;

        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row?);
        }
        Ok(subscriptions)
    }

    /// Delete a subscription by id.  Returns `true` if a row was deleted.
    pub fn remove_push_subscription(&self, id: &Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM push_subscriptions WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

/// Endpoints must be absolute `https` URLs on a public host.
fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint)
        .map_err(|e| StoreError::Validation(format!("push endpoint is not a valid URL: {e}")))?;

    if url.scheme() != "https" {
        return Err(StoreError::Validation("push endpoint must use https".into()));
    }

    let internal = match url.host() {
        None => true,
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_private_ip(&IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_private_ip(&IpAddr::V6(ip)),
    };
    if internal {
        return Err(StoreError::Validation(
            "push endpoint must point to a public host".into(),
        ));
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<PushSubscription> {
    Ok(PushSubscription {
        id: uuid_at(row, 0)?,
        user_id: UserId(uuid_at(row, 1)?),
        endpoint: row.get(2)?,
        created_at: timestamp_at(row, 3)?,
    })
}
