use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use gauge_types::{ApiKeyRecord, UserRecord, UserRole};

use crate::{
    json_to_sql, new_id, now_utc, sql_to_opt_ts, sql_to_ts, ts_to_sql, Store, StoreError,
    StoreResult,
};

const USER_COLUMNS: &str =
    "id, email, display_name, title, role, is_active, team_unit_id, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(UserRecord, String, String, String)> {
    let role_raw: String = row.get(4)?;
    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;
    let record = UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        title: row.get(3)?,
        role: UserRole::Employee, // fixed up by the caller from role_raw
        is_active: row.get::<_, i64>(5)? != 0,
        team_unit_id: row.get(6)?,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Ok((record, role_raw, created_raw, updated_raw))
}

fn finish_user(
    (mut record, role_raw, created_raw, updated_raw): (UserRecord, String, String, String),
) -> StoreResult<UserRecord> {
    record.role = UserRole::parse(&role_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown role {role_raw:?}")))?;
    record.created_at = sql_to_ts(&created_raw)?;
    record.updated_at = sql_to_ts(&updated_raw)?;
    Ok(record)
}

/// Partial user update; `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub title: Option<String>,
    pub role: Option<UserRole>,
    /// `Some(None)` clears the team assignment.
    pub team_unit_id: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Clone)]
pub struct UserFilter {
    pub email_contains: Option<String>,
    pub role: Option<UserRole>,
    pub team_unit_id: Option<String>,
}

impl Store {
    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        role: UserRole,
        team_unit_id: Option<&str>,
    ) -> StoreResult<UserRecord> {
        let conn = self.conn.lock().await;
        let id = new_id();
        let now = ts_to_sql(now_utc());
        conn.execute(
            "INSERT INTO users (id, email, display_name, title, role, is_active, team_unit_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, '', ?4, 1, ?5, ?6, ?6)",
            params![id, email, display_name, role.as_str(), team_unit_id, now],
        )?;
        drop(conn);
        self.get_user(&id).await?.ok_or(StoreError::NotFound("user"))
    }

    pub async fn get_user(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()?;
        raw.map(finish_user).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()?;
        raw.map(finish_user).transpose()
    }

    pub async fn count_users(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<UserRecord>> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {USER_COLUMNS} FROM users WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send + Sync>> = Vec::new();
        if let Some(fragment) = &filter.email_contains {
            sql.push_str(" AND email LIKE ?");
            args.push(Box::new(format!("%{fragment}%")));
        }
        if let Some(role) = filter.role {
            sql.push_str(" AND role = ?");
            args.push(Box::new(role.as_str().to_string()));
        }
        if let Some(team) = &filter.team_unit_id {
            sql.push_str(" AND team_unit_id = ?");
            args.push(Box::new(team.clone()));
        }
        sql.push_str(" ORDER BY email");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), user_from_row)?;
        let mut users = Vec::new();
        for raw in rows {
            users.push(finish_user(raw?)?);
        }
        Ok(users)
    }

    pub async fn update_user(&self, id: &str, update: &UserUpdate) -> StoreResult<UserRecord> {
        {
            let conn = self.conn.lock().await;
            let now = ts_to_sql(now_utc());
            if let Some(email) = &update.email {
                conn.execute(
                    "UPDATE users SET email = ?1, updated_at = ?2 WHERE id = ?3",
                    params![email, now, id],
                )?;
            }
            if let Some(display_name) = &update.display_name {
                conn.execute(
                    "UPDATE users SET display_name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![display_name, now, id],
                )?;
            }
            if let Some(title) = &update.title {
                conn.execute(
                    "UPDATE users SET title = ?1, updated_at = ?2 WHERE id = ?3",
                    params![title, now, id],
                )?;
            }
            if let Some(role) = update.role {
                conn.execute(
                    "UPDATE users SET role = ?1, updated_at = ?2 WHERE id = ?3",
                    params![role.as_str(), now, id],
                )?;
            }
            if let Some(team) = &update.team_unit_id {
                conn.execute(
                    "UPDATE users SET team_unit_id = ?1, updated_at = ?2 WHERE id = ?3",
                    params![team.as_deref(), now, id],
                )?;
            }
            if let Some(active) = update.is_active {
                conn.execute(
                    "UPDATE users SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                    params![active as i64, now, id],
                )?;
            }
        }
        self.get_user(id).await?.ok_or(StoreError::NotFound("user"))
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    pub async fn create_api_key(
        &self,
        user_id: &str,
        name: &str,
        prefix: &str,
        key_hash: &[u8],
    ) -> StoreResult<ApiKeyRecord> {
        let conn = self.conn.lock().await;
        let id = new_id();
        let now = now_utc();
        conn.execute(
            "INSERT INTO api_keys (id, user_id, name, prefix, key_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, user_id, name, prefix, key_hash, ts_to_sql(now)],
        )?;
        Ok(ApiKeyRecord {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            prefix: prefix.to_string(),
            created_at: now,
            revoked_at: None,
        })
    }

    /// Look up a non-revoked key by its 8-char public prefix; returns the
    /// record together with the stored hash for constant-time verification.
    pub async fn find_active_api_key(
        &self,
        prefix: &str,
    ) -> StoreResult<Option<(ApiKeyRecord, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT id, user_id, name, prefix, key_hash, created_at, revoked_at
                 FROM api_keys WHERE prefix = ?1 AND revoked_at IS NULL",
                params![prefix],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, user_id, name, prefix, hash, created_raw, revoked_raw)) = raw else {
            return Ok(None);
        };
        let record = ApiKeyRecord {
            id,
            user_id,
            name,
            prefix,
            created_at: sql_to_ts(&created_raw)?,
            revoked_at: sql_to_opt_ts(revoked_raw)?,
        };
        Ok(Some((record, hash)))
    }

    pub async fn revoke_api_key(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![ts_to_sql(now_utc()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("api key"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Platform settings
    // ------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM platform_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO platform_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts_to_sql(now_utc())],
        )?;
        Ok(())
    }

    pub async fn all_settings(&self) -> StoreResult<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT key, value FROM platform_settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub async fn append_audit(
        &self,
        actor_user_id: Option<&str>,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before: &Value,
        after: &Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (actor_user_id, action, entity_type, entity_id, before, after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                actor_user_id,
                action,
                entity_type,
                entity_id,
                json_to_sql(before),
                json_to_sql(after),
                ts_to_sql(now_utc())
            ],
        )?;
        Ok(())
    }

    pub async fn count_audit_rows(&self, action: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE action = ?1",
            params![action],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
