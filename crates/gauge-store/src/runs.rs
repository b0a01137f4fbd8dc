use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::Value;

use gauge_types::{
    ApprovalDecision, ApprovalRecord, RunItemRecord, RunItemScoreRecord, RunRecord,
    RunWorkflowStatus,
};
use gauge_wire::{EventBody, RunEventV1};

use crate::{
    json_to_sql, now_utc, sql_to_json, sql_to_opt_ts, sql_to_ts, ts_to_sql, Store, StoreError,
    StoreResult,
};

const RUN_COLUMNS: &str = "id, external_run_id, created_by_user_id, owner_user_id, task, dataset, \
     model, metrics, run_metadata, run_config, status, started_at, ended_at, created_at, updated_at";

const ITEM_COLUMNS: &str = "run_id, item_id, item_index, input, expected, output, error, \
     item_metadata, latency_ms, trace_id, trace_url";

type RawRun = (
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn finish_run(raw: RawRun) -> StoreResult<RunRecord> {
    let (
        id,
        external_run_id,
        created_by_user_id,
        owner_user_id,
        task,
        dataset,
        model,
        metrics_raw,
        run_metadata_raw,
        run_config_raw,
        status_raw,
        started_raw,
        ended_raw,
        created_raw,
        updated_raw,
    ) = raw;
    let status = RunWorkflowStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status {status_raw:?}")))?;
    let metrics: Vec<String> = metrics_raw
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(RunRecord {
        id,
        external_run_id,
        created_by_user_id,
        owner_user_id,
        task,
        dataset,
        model,
        metrics,
        run_metadata: sql_to_json(run_metadata_raw),
        run_config: sql_to_json(run_config_raw),
        status,
        started_at: sql_to_opt_ts(started_raw)?,
        ended_at: sql_to_opt_ts(ended_raw)?,
        created_at: sql_to_ts(&created_raw)?,
        updated_at: sql_to_ts(&updated_raw)?,
    })
}

type RawItem = (
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
);

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_item(raw: RawItem) -> RunItemRecord {
    let (
        run_id,
        item_id,
        index,
        input_raw,
        expected_raw,
        output_raw,
        error,
        item_metadata_raw,
        latency_ms,
        trace_id,
        trace_url,
    ) = raw;
    RunItemRecord {
        run_id,
        item_id,
        index,
        input: sql_to_json(input_raw),
        expected: expected_raw.map(|s| sql_to_json(Some(s))),
        output: output_raw.map(|s| sql_to_json(Some(s))),
        error,
        item_metadata: sql_to_json(item_metadata_raw),
        latency_ms,
        trace_id,
        trace_url,
    }
}

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<RunItemScoreRecord> {
    let raw: Option<String> = row.get(4)?;
    let meta_raw: Option<String> = row.get(5)?;
    Ok(RunItemScoreRecord {
        run_id: row.get(0)?,
        item_id: row.get(1)?,
        metric_name: row.get(2)?,
        score_numeric: row.get(3)?,
        score_raw: raw.map(|s| sql_to_json(Some(s))),
        meta: sql_to_json(meta_raw),
    })
}

impl Store {
    pub async fn insert_run(&self, run: &RunRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (id, external_run_id, created_by_user_id, owner_user_id, task, dataset,
                 model, metrics, run_metadata, run_config, status, started_at, ended_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.id,
                run.external_run_id,
                run.created_by_user_id,
                run.owner_user_id,
                run.task,
                run.dataset,
                run.model,
                serde_json::to_string(&run.metrics)?,
                json_to_sql(&run.run_metadata),
                json_to_sql(&run.run_config),
                run.status.as_str(),
                run.started_at.map(ts_to_sql),
                run.ended_at.map(ts_to_sql),
                ts_to_sql(run.created_at),
                ts_to_sql(run.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> StoreResult<Option<RunRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                run_from_row,
            )
            .optional()?;
        raw.map(finish_run).transpose()
    }

    pub async fn list_runs(&self) -> StoreResult<Vec<RunRecord>> {
        self.query_runs("", &[]).await
    }

    pub async fn list_runs_by_owner(&self, owner_user_id: &str) -> StoreResult<Vec<RunRecord>> {
        self.query_runs(
            " WHERE owner_user_id = ?",
            &[Box::new(owner_user_id.to_string())],
        )
        .await
    }

    pub async fn list_runs_by_owners(&self, owner_ids: &[String]) -> StoreResult<Vec<RunRecord>> {
        if owner_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; owner_ids.len()].join(", ");
        let args: Vec<Box<dyn rusqlite::ToSql + Send + Sync>> = owner_ids
            .iter()
            .map(|id| Box::new(id.clone()) as Box<dyn rusqlite::ToSql + Send + Sync>)
            .collect();
        self.query_runs(&format!(" WHERE owner_user_id IN ({placeholders})"), &args)
            .await
    }

    pub async fn list_runs_by_statuses(
        &self,
        statuses: &[RunWorkflowStatus],
    ) -> StoreResult<Vec<RunRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let args: Vec<Box<dyn rusqlite::ToSql + Send + Sync>> = statuses
            .iter()
            .map(|s| Box::new(s.as_str().to_string()) as Box<dyn rusqlite::ToSql + Send + Sync>)
            .collect();
        self.query_runs(&format!(" WHERE status IN ({placeholders})"), &args)
            .await
    }

    async fn query_runs(
        &self,
        where_clause: &str,
        args: &[Box<dyn rusqlite::ToSql + Send + Sync>],
    ) -> StoreResult<Vec<RunRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs{where_clause} ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), run_from_row)?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(finish_run(raw?)?);
        }
        Ok(runs)
    }

    pub async fn set_run_status(&self, id: &str, status: RunWorkflowStatus) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts_to_sql(now_utc()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("run"));
        }
        Ok(())
    }

    pub async fn set_run_metrics(&self, id: &str, metrics: &[String]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE runs SET metrics = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(metrics)?, ts_to_sql(now_utc()), id],
        )?;
        Ok(())
    }

    pub async fn set_run_dataset(&self, id: &str, dataset: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE runs SET dataset = ?1, updated_at = ?2 WHERE id = ?3",
            params![dataset, ts_to_sql(now_utc()), id],
        )?;
        Ok(())
    }

    /// Cascade: scores, items, events, approval, then the run itself.
    pub async fn delete_run_cascade(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM run_item_scores WHERE run_id = ?1", params![id])?;
        tx.execute("DELETE FROM run_items WHERE run_id = ?1", params![id])?;
        tx.execute("DELETE FROM run_events WHERE run_id = ?1", params![id])?;
        tx.execute("DELETE FROM approvals WHERE run_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::NotFound("run"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Items and scores
    // ------------------------------------------------------------------

    pub async fn list_items(&self, run_id: &str) -> StoreResult<Vec<RunItemRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM run_items WHERE run_id = ?1 ORDER BY item_index ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], item_from_row)?;
        let mut items = Vec::new();
        for raw in rows {
            items.push(finish_item(raw?));
        }
        Ok(items)
    }

    pub async fn get_item(&self, run_id: &str, item_id: &str) -> StoreResult<Option<RunItemRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM run_items WHERE run_id = ?1 AND item_id = ?2"),
                params![run_id, item_id],
                item_from_row,
            )
            .optional()?;
        Ok(raw.map(finish_item))
    }

    pub async fn get_item_by_index(
        &self,
        run_id: &str,
        index: i64,
    ) -> StoreResult<Option<RunItemRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM run_items WHERE run_id = ?1 AND item_index = ?2"
                ),
                params![run_id, index],
                item_from_row,
            )
            .optional()?;
        Ok(raw.map(finish_item))
    }

    pub async fn insert_item(&self, item: &RunItemRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_items (run_id, item_id, item_index, input, expected, output, error,
                 item_metadata, latency_ms, trace_id, trace_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                item.run_id,
                item.item_id,
                item.index,
                json_to_sql(&item.input),
                item.expected.as_ref().map(json_to_sql),
                item.output.as_ref().map(json_to_sql),
                item.error,
                json_to_sql(&item.item_metadata),
                item.latency_ms,
                item.trace_id,
                item.trace_url,
            ],
        )?;
        Ok(())
    }

    pub async fn set_item_metadata(
        &self,
        run_id: &str,
        item_id: &str,
        metadata: &Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE run_items SET item_metadata = ?1 WHERE run_id = ?2 AND item_id = ?3",
            params![json_to_sql(metadata), run_id, item_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("run item"));
        }
        Ok(())
    }

    pub async fn list_scores(&self, run_id: &str) -> StoreResult<Vec<RunItemScoreRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, item_id, metric_name, score_numeric, score_raw, meta
             FROM run_item_scores WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id], score_from_row)?;
        let mut scores = Vec::new();
        for row in rows {
            scores.push(row?);
        }
        Ok(scores)
    }

    pub async fn list_scores_for_item(
        &self,
        run_id: &str,
        item_id: &str,
    ) -> StoreResult<Vec<RunItemScoreRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, item_id, metric_name, score_numeric, score_raw, meta
             FROM run_item_scores WHERE run_id = ?1 AND item_id = ?2",
        )?;
        let rows = stmt.query_map(params![run_id, item_id], score_from_row)?;
        let mut scores = Vec::new();
        for row in rows {
            scores.push(row?);
        }
        Ok(scores)
    }

    pub async fn get_score(
        &self,
        run_id: &str,
        item_id: &str,
        metric_name: &str,
    ) -> StoreResult<Option<RunItemScoreRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT run_id, item_id, metric_name, score_numeric, score_raw, meta
                 FROM run_item_scores WHERE run_id = ?1 AND item_id = ?2 AND metric_name = ?3",
                params![run_id, item_id, metric_name],
                score_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn upsert_score(&self, score: &RunItemScoreRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        upsert_score_tx(&conn, score)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub async fn get_approval(&self, run_id: &str) -> StoreResult<Option<ApprovalRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT run_id, submitted_by_user_id, submitted_at, decision, decision_by_user_id,
                        decision_at, comment
                 FROM approvals WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((run_id, submitted_by, submitted_raw, decision_raw, decision_by, decision_at_raw, comment)) =
            raw
        else {
            return Ok(None);
        };
        let decision = decision_raw
            .map(|d| {
                ApprovalDecision::parse(&d)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown decision {d:?}")))
            })
            .transpose()?;
        Ok(Some(ApprovalRecord {
            run_id,
            submitted_by_user_id: submitted_by,
            submitted_at: sql_to_ts(&submitted_raw)?,
            decision,
            decision_by_user_id: decision_by,
            decision_at: sql_to_opt_ts(decision_at_raw)?,
            comment,
        }))
    }

    /// Idempotent: re-submitting keeps the original approval row.
    pub async fn ensure_approval(&self, run_id: &str, submitted_by: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (run_id, submitted_by_user_id, submitted_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO NOTHING",
            params![run_id, submitted_by, ts_to_sql(now_utc())],
        )?;
        Ok(())
    }

    pub async fn decide_approval(
        &self,
        run_id: &str,
        decision: ApprovalDecision,
        decided_by: &str,
        comment: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE approvals SET decision = ?1, decision_by_user_id = ?2, decision_at = ?3, comment = ?4
             WHERE run_id = ?5",
            params![
                decision.as_str(),
                decided_by,
                ts_to_sql(now_utc()),
                comment,
                run_id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("approval"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event ingestion
    // ------------------------------------------------------------------

    pub async fn count_events(&self, run_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Apply one event transactionally. Returns `false` when the event id was
    /// already applied for this run (idempotent skip).
    pub async fn apply_event(&self, event: &RunEventV1) -> StoreResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM run_events WHERE run_id = ?1 AND event_id = ?2",
                params![event.run_id, event.event_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }

        let payload = serde_json::to_value(&event.body)?
            .get("payload")
            .cloned()
            .unwrap_or(Value::Null);
        tx.execute(
            "INSERT INTO run_events (run_id, event_id, sequence, event_type, sent_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id,
                event.event_id.to_string(),
                event.sequence as i64,
                event.body.type_name(),
                ts_to_sql(event.sent_at),
                json_to_sql(&payload),
            ],
        )?;

        apply_projection(&tx, event)?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn item_started_sent_at(
        &self,
        run_id: &str,
        item_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT sent_at FROM run_events
                 WHERE run_id = ?1 AND event_type = 'item_started'
                   AND json_extract(payload, '$.item_id') = ?2
                 ORDER BY sequence ASC LIMIT 1",
                params![run_id, item_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(sql_to_ts).transpose()
    }
}

fn apply_projection(tx: &Transaction<'_>, event: &RunEventV1) -> StoreResult<()> {
    let run_id = &event.run_id;
    let now = ts_to_sql(now_utc());
    match &event.body {
        EventBody::RunStarted(p) => {
            tx.execute(
                "UPDATE runs SET external_run_id = ?1, task = ?2, dataset = ?3, model = ?4,
                     metrics = ?5, run_metadata = ?6, run_config = ?7, started_at = ?8,
                     status = 'RUNNING', updated_at = ?9
                 WHERE id = ?10",
                params![
                    p.external_run_id,
                    p.task,
                    p.dataset,
                    p.model,
                    serde_json::to_string(&p.metrics)?,
                    json_to_sql(&p.run_metadata),
                    json_to_sql(&p.run_config),
                    ts_to_sql(p.started_at),
                    now,
                    run_id,
                ],
            )?;
        }
        EventBody::ItemStarted(p) => {
            tx.execute(
                "INSERT INTO run_items (run_id, item_id, item_index, input, expected, item_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id, item_id) DO UPDATE SET
                     item_index = excluded.item_index,
                     input = excluded.input,
                     expected = excluded.expected,
                     item_metadata = excluded.item_metadata",
                params![
                    run_id,
                    p.item_id,
                    p.index as i64,
                    json_to_sql(&p.input),
                    p.expected.as_ref().map(json_to_sql),
                    json_to_sql(&p.item_metadata),
                ],
            )?;
        }
        EventBody::MetricScored(p) => {
            upsert_score_tx(
                tx,
                &RunItemScoreRecord {
                    run_id: run_id.clone(),
                    item_id: p.item_id.clone(),
                    metric_name: p.metric_name.clone(),
                    score_numeric: p.score_numeric,
                    score_raw: p.score_raw.clone(),
                    meta: p.meta.clone(),
                },
            )?;
        }
        EventBody::ItemCompleted(p) => {
            tx.execute(
                "INSERT INTO run_items (run_id, item_id, item_index, input, output, error,
                     latency_ms, trace_id, trace_url)
                 VALUES (?1, ?2, 0, '{}', ?3, NULL, ?4, ?5, ?6)
                 ON CONFLICT(run_id, item_id) DO UPDATE SET
                     output = excluded.output,
                     error = NULL,
                     latency_ms = excluded.latency_ms,
                     trace_id = excluded.trace_id,
                     trace_url = excluded.trace_url",
                params![
                    run_id,
                    p.item_id,
                    json_to_sql(&p.output),
                    p.latency_ms,
                    p.trace_id,
                    p.trace_url,
                ],
            )?;
        }
        EventBody::ItemFailed(p) => {
            tx.execute(
                "INSERT INTO run_items (run_id, item_id, item_index, input, output, error,
                     trace_id, trace_url)
                 VALUES (?1, ?2, 0, '{}', NULL, ?3, ?4, ?5)
                 ON CONFLICT(run_id, item_id) DO UPDATE SET
                     error = excluded.error,
                     output = NULL,
                     trace_id = excluded.trace_id,
                     trace_url = excluded.trace_url",
                params![run_id, p.item_id, p.error, p.trace_id, p.trace_url],
            )?;
        }
        EventBody::RunCompleted(p) => {
            let status = match p.final_status {
                gauge_wire::FinalStatus::Completed => RunWorkflowStatus::Completed,
                gauge_wire::FinalStatus::Failed => RunWorkflowStatus::Failed,
            };
            tx.execute(
                "UPDATE runs SET ended_at = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![ts_to_sql(p.ended_at), status.as_str(), now, run_id],
            )?;
        }
    }
    Ok(())
}

fn upsert_score_tx(conn: &rusqlite::Connection, score: &RunItemScoreRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO run_item_scores (run_id, item_id, metric_name, score_numeric, score_raw, meta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(run_id, item_id, metric_name) DO UPDATE SET
             score_numeric = excluded.score_numeric,
             score_raw = excluded.score_raw,
             meta = excluded.meta",
        params![
            score.run_id,
            score.item_id,
            score.metric_name,
            score.score_numeric,
            score.score_raw.as_ref().map(json_to_sql),
            json_to_sql(&score.meta),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauge_wire::{
        ItemCompletedPayload, ItemFailedPayload, ItemStartedPayload, MetricScoredPayload,
        RunCompletedPayload, RunStartedPayload, SCHEMA_VERSION,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn sample_run(id: &str, owner: &str) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            id: id.to_string(),
            external_run_id: None,
            created_by_user_id: owner.to_string(),
            owner_user_id: owner.to_string(),
            task: "qa".to_string(),
            dataset: "ds".to_string(),
            model: None,
            metrics: vec!["m1".to_string()],
            run_metadata: json!({}),
            run_config: json!({}),
            status: RunWorkflowStatus::Running,
            started_at: Some(now),
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn event(run_id: &str, seq: u64, body: EventBody) -> RunEventV1 {
        RunEventV1 {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            sequence: seq,
            sent_at: Utc::now(),
            run_id: run_id.to_string(),
            body,
        }
    }

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_run(&sample_run("run-1", "user-1")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn run_round_trip() {
        let store = seeded_store().await;
        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.task, "qa");
        assert_eq!(run.metrics, vec!["m1".to_string()]);
        assert_eq!(run.status, RunWorkflowStatus::Running);
    }

    #[tokio::test]
    async fn event_application_is_idempotent() {
        let store = seeded_store().await;
        let evt = event(
            "run-1",
            1,
            EventBody::ItemStarted(ItemStartedPayload {
                item_id: "item_0".to_string(),
                index: 0,
                input: json!("hi"),
                expected: Some(json!("there")),
                item_metadata: json!({}),
            }),
        );
        assert!(store.apply_event(&evt).await.unwrap());
        assert!(!store.apply_event(&evt).await.unwrap());
        assert_eq!(store.count_events("run-1").await.unwrap(), 1);
        assert_eq!(store.list_items("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn projection_covers_item_lifecycle() {
        let store = seeded_store().await;
        let started = event(
            "run-1",
            1,
            EventBody::ItemStarted(ItemStartedPayload {
                item_id: "item_0".to_string(),
                index: 0,
                input: json!("hi"),
                expected: None,
                item_metadata: json!({"k": "v"}),
            }),
        );
        let scored = event(
            "run-1",
            2,
            EventBody::MetricScored(MetricScoredPayload {
                item_id: "item_0".to_string(),
                metric_name: "m1".to_string(),
                score_numeric: Some(1.0),
                score_raw: Some(json!(1.0)),
                meta: json!({}),
            }),
        );
        let completed = event(
            "run-1",
            3,
            EventBody::ItemCompleted(ItemCompletedPayload {
                item_id: "item_0".to_string(),
                output: json!("out"),
                latency_ms: 42.0,
                trace_id: Some("t".to_string()),
                trace_url: None,
            }),
        );
        for evt in [&started, &scored, &completed] {
            store.apply_event(evt).await.unwrap();
        }

        let item = store.get_item("run-1", "item_0").await.unwrap().unwrap();
        assert_eq!(item.output, Some(json!("out")));
        assert_eq!(item.error, None);
        assert_eq!(item.latency_ms, Some(42.0));
        assert_eq!(item.item_metadata, json!({"k": "v"}));

        let scores = store.list_scores("run-1").await.unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].score_numeric, Some(1.0));
    }

    #[tokio::test]
    async fn item_failed_clears_output() {
        let store = seeded_store().await;
        store
            .apply_event(&event(
                "run-1",
                1,
                EventBody::ItemCompleted(ItemCompletedPayload {
                    item_id: "item_0".to_string(),
                    output: json!("out"),
                    latency_ms: 1.0,
                    trace_id: None,
                    trace_url: None,
                }),
            ))
            .await
            .unwrap();
        store
            .apply_event(&event(
                "run-1",
                2,
                EventBody::ItemFailed(ItemFailedPayload {
                    item_id: "item_0".to_string(),
                    error: "boom".to_string(),
                    trace_id: None,
                    trace_url: None,
                }),
            ))
            .await
            .unwrap();
        let item = store.get_item("run-1", "item_0").await.unwrap().unwrap();
        assert_eq!(item.output, None);
        assert_eq!(item.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn run_started_and_completed_update_run() {
        let store = seeded_store().await;
        store
            .apply_event(&event(
                "run-1",
                1,
                EventBody::RunStarted(RunStartedPayload {
                    external_run_id: Some("ext-1".to_string()),
                    task: "qa2".to_string(),
                    dataset: "ds2".to_string(),
                    model: Some("m".to_string()),
                    metrics: vec!["m1".to_string(), "m2".to_string()],
                    run_metadata: json!({"total_items": 5}),
                    run_config: json!({"run_name": "r"}),
                    started_at: Utc::now(),
                }),
            ))
            .await
            .unwrap();
        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.task, "qa2");
        assert_eq!(run.metrics.len(), 2);
        assert_eq!(run.status, RunWorkflowStatus::Running);
        assert_eq!(run.run_metadata["total_items"], json!(5));

        store
            .apply_event(&event(
                "run-1",
                2,
                EventBody::RunCompleted(RunCompletedPayload {
                    ended_at: Utc::now(),
                    summary: json!({}),
                    final_status: gauge_wire::FinalStatus::Completed,
                }),
            ))
            .await
            .unwrap();
        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunWorkflowStatus::Completed);
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn cascade_delete_removes_everything() {
        let store = seeded_store().await;
        for (seq, body) in [
            EventBody::ItemStarted(ItemStartedPayload {
                item_id: "item_0".to_string(),
                index: 0,
                input: json!("x"),
                expected: None,
                item_metadata: json!({}),
            }),
            EventBody::MetricScored(MetricScoredPayload {
                item_id: "item_0".to_string(),
                metric_name: "m1".to_string(),
                score_numeric: Some(0.0),
                score_raw: None,
                meta: json!({}),
            }),
        ]
        .into_iter()
        .enumerate()
        {
            store
                .apply_event(&event("run-1", seq as u64 + 1, body))
                .await
                .unwrap();
        }
        store.ensure_approval("run-1", "user-1").await.unwrap();

        store.delete_run_cascade("run-1").await.unwrap();
        assert!(store.get_run("run-1").await.unwrap().is_none());
        assert_eq!(store.count_events("run-1").await.unwrap(), 0);
        assert!(store.list_items("run-1").await.unwrap().is_empty());
        assert!(store.list_scores("run-1").await.unwrap().is_empty());
        assert!(store.get_approval("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approvals_record_decisions() {
        let store = seeded_store().await;
        store.ensure_approval("run-1", "user-1").await.unwrap();
        store.ensure_approval("run-1", "user-2").await.unwrap();
        let approval = store.get_approval("run-1").await.unwrap().unwrap();
        assert_eq!(approval.submitted_by_user_id, "user-1");
        assert!(approval.decision.is_none());

        store
            .decide_approval("run-1", ApprovalDecision::Approved, "mgr-1", "lgtm")
            .await
            .unwrap();
        let approval = store.get_approval("run-1").await.unwrap().unwrap();
        assert_eq!(approval.decision, Some(ApprovalDecision::Approved));
        assert_eq!(approval.decision_by_user_id.as_deref(), Some("mgr-1"));
        assert_eq!(approval.comment, "lgtm");
    }
}
