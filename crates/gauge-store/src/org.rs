use rusqlite::{params, Connection, OptionalExtension, Row};

use gauge_types::{OrgUnitRecord, OrgUnitType};

use crate::{new_id, now_utc, sql_to_ts, ts_to_sql, Store, StoreError, StoreResult};

const UNIT_COLUMNS: &str = "id, name, unit_type, parent_id, manager_user_id, created_at, updated_at";

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<(OrgUnitRecord, String, String, String)> {
    let type_raw: String = row.get(2)?;
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;
    let record = OrgUnitRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        unit_type: OrgUnitType::Team, // fixed up by the caller
        parent_id: row.get(3)?,
        manager_user_id: row.get(4)?,
        created_at: now_utc(),
        updated_at: now_utc(),
    };
    Ok((record, type_raw, created_raw, updated_raw))
}

fn finish_unit(
    (mut record, type_raw, created_raw, updated_raw): (OrgUnitRecord, String, String, String),
) -> StoreResult<OrgUnitRecord> {
    record.unit_type = OrgUnitType::parse(&type_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown org unit type {type_raw:?}")))?;
    record.created_at = sql_to_ts(&created_raw)?;
    record.updated_at = sql_to_ts(&updated_raw)?;
    Ok(record)
}

impl Store {
    pub async fn create_org_unit(
        &self,
        name: &str,
        unit_type: OrgUnitType,
        parent_id: Option<&str>,
    ) -> StoreResult<OrgUnitRecord> {
        let conn = self.conn.lock().await;
        let id = new_id();
        let now = ts_to_sql(now_utc());
        conn.execute(
            "INSERT INTO org_units (id, name, unit_type, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, unit_type.as_str(), parent_id, now],
        )?;
        insert_closure_for_unit(&conn, &id, parent_id)?;
        drop(conn);
        self.get_org_unit(&id)
            .await?
            .ok_or(StoreError::NotFound("org unit"))
    }

    pub async fn get_org_unit(&self, id: &str) -> StoreResult<Option<OrgUnitRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM org_units WHERE id = ?1"),
                params![id],
                unit_from_row,
            )
            .optional()?;
        raw.map(finish_unit).transpose()
    }

    pub async fn list_org_units_by_type(
        &self,
        unit_type: OrgUnitType,
    ) -> StoreResult<Vec<OrgUnitRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM org_units WHERE unit_type = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![unit_type.as_str()], unit_from_row)?;
        let mut units = Vec::new();
        for raw in rows {
            units.push(finish_unit(raw?)?);
        }
        Ok(units)
    }

    pub async fn list_children(&self, parent_id: &str) -> StoreResult<Vec<OrgUnitRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM org_units WHERE parent_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![parent_id], unit_from_row)?;
        let mut units = Vec::new();
        for raw in rows {
            units.push(finish_unit(raw?)?);
        }
        Ok(units)
    }

    pub async fn rename_org_unit(&self, id: &str, name: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE org_units SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, ts_to_sql(now_utc()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("org unit"));
        }
        Ok(())
    }

    /// Reparent a unit. The closure table is rebuilt wholesale; moves happen
    /// at admin frequency so linear cost is fine.
    pub async fn move_org_unit(&self, id: &str, new_parent_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE org_units SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_parent_id, ts_to_sql(now_utc()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("org unit"));
        }
        rebuild_closure(&conn)
    }

    pub async fn count_children(&self, unit_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM org_units WHERE parent_id = ?1",
            params![unit_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn count_team_members(&self, unit_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE team_unit_id = ?1",
            params![unit_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn clear_team_members(&self, unit_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET team_unit_id = NULL, updated_at = ?1 WHERE team_unit_id = ?2",
            params![ts_to_sql(now_utc()), unit_id],
        )?;
        Ok(())
    }

    pub async fn orphan_children(&self, unit_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE org_units SET parent_id = NULL, updated_at = ?1 WHERE parent_id = ?2",
            params![ts_to_sql(now_utc()), unit_id],
        )?;
        Ok(())
    }

    pub async fn delete_org_unit(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM org_unit_closure WHERE ancestor_id = ?1 OR descendant_id = ?1",
            params![id],
        )?;
        let changed = tx.execute("DELETE FROM org_units WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::NotFound("org unit"));
        }
        Ok(())
    }

    pub async fn set_team_manager(
        &self,
        team_id: &str,
        manager_user_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE org_units SET manager_user_id = ?1, updated_at = ?2
             WHERE id = ?3 AND unit_type = 'TEAM'",
            params![manager_user_id, ts_to_sql(now_utc()), team_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("team"));
        }
        Ok(())
    }

    /// Team ids where the given user is assigned as manager.
    pub async fn teams_managed_by(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM org_units WHERE unit_type = 'TEAM' AND manager_user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// A manager of another team than `except_team` (used to reject
    /// double-manager assignments).
    pub async fn other_team_managed_by(
        &self,
        user_id: &str,
        except_team: &str,
    ) -> StoreResult<Option<OrgUnitRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM org_units
                     WHERE manager_user_id = ?1 AND id != ?2"
                ),
                params![user_id, except_team],
                unit_from_row,
            )
            .optional()?;
        raw.map(finish_unit).transpose()
    }

    pub async fn user_ids_in_teams(&self, team_ids: &[String]) -> StoreResult<Vec<String>> {
        if team_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; team_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM users WHERE team_unit_id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(team_ids.iter()), |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Ancestor unit ids for a descendant, self included (depth 0).
    pub async fn closure_ancestors(&self, descendant_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ancestor_id FROM org_unit_closure WHERE descendant_id = ?1 ORDER BY depth",
        )?;
        let rows = stmt.query_map(params![descendant_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub async fn closure_size(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM org_unit_closure", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Rebuild the whole closure table; returns the number of rows written.
    pub async fn rebuild_closure(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let count = rebuild_closure(&conn)?;
        tracing::debug!(rows = count, "org unit closure rebuilt");
        Ok(count)
    }
}

/// Self link plus one link per ancestor, walking up the parent chain.
fn insert_closure_for_unit(
    conn: &Connection,
    unit_id: &str,
    parent_id: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO org_unit_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?1, 0)",
        params![unit_id],
    )?;
    let mut depth = 1i64;
    let mut current = parent_id.map(str::to_string);
    while let Some(ancestor) = current {
        conn.execute(
            "INSERT OR IGNORE INTO org_unit_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?2, ?3)",
            params![ancestor, unit_id, depth],
        )?;
        current = conn
            .query_row(
                "SELECT parent_id FROM org_units WHERE id = ?1",
                params![ancestor],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        depth += 1;
    }
    Ok(())
}

fn rebuild_closure(conn: &Connection) -> StoreResult<usize> {
    conn.execute("DELETE FROM org_unit_closure", [])?;
    let units: Vec<(String, Option<String>)> = {
        let mut stmt = conn.prepare("SELECT id, parent_id FROM org_units")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for (id, parent) in &units {
        insert_closure_for_unit(conn, id, parent.as_deref())?;
    }
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM org_unit_closure", [], |row| row.get(0))?;
    Ok(count as usize)
}
