//! Synchronous SQLite layer
//!
//! All SQL lives here. The [`Db`] is owned by the store actor; callers never
//! touch it directly. Writes are serialized by actor ownership, reads run on
//! the same connection (WAL keeps concurrent external readers happy).

use std::path::Path;

use rusqlite::{Connection, OpenFlags, params};
use serde_json::Value;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::places::{DomainSignals, PlaceHubRecord, PlaceRecord};
use crate::task::{ProgressUpdate, StatusChange, TaskFilter, TaskRow, TaskStatus, now_ms};
use crate::telemetry::{Observation, PlannerStageEvent, QueueAction, QueueEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                 TEXT PRIMARY KEY,
    type               TEXT NOT NULL,
    status             TEXT NOT NULL,
    progress_current   INTEGER NOT NULL DEFAULT 0,
    progress_total     INTEGER NOT NULL DEFAULT 0,
    progress_message   TEXT,
    config             TEXT NOT NULL DEFAULT 'null',
    metadata           TEXT NOT NULL DEFAULT 'null',
    error_message      TEXT,
    created_at         INTEGER NOT NULL,
    started_at         INTEGER,
    updated_at         INTEGER NOT NULL,
    completed_at       INTEGER,
    resume_started_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_type    ON tasks(type);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC);

CREATE TABLE IF NOT EXISTS queue_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ts           INTEGER NOT NULL,
    action       TEXT NOT NULL,
    url          TEXT NOT NULL,
    depth        INTEGER,
    host         TEXT,
    reason       TEXT,
    queue_size   INTEGER,
    role         TEXT,
    depth_bucket TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_events_task ON queue_events(task_id);

CREATE TABLE IF NOT EXISTS task_problems (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ts      INTEGER NOT NULL,
    kind    TEXT NOT NULL,
    scope   TEXT,
    target  TEXT,
    message TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_problems_task ON task_problems(task_id);

CREATE TABLE IF NOT EXISTS task_milestones (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ts      INTEGER NOT NULL,
    kind    TEXT NOT NULL,
    scope   TEXT,
    target  TEXT,
    message TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_milestones_task ON task_milestones(task_id);

CREATE TABLE IF NOT EXISTS planner_stage_events (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id           TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ts                INTEGER NOT NULL,
    stage             TEXT NOT NULL,
    rationale         TEXT,
    estimated_cost_ms INTEGER,
    decision          TEXT
);
CREATE INDEX IF NOT EXISTS idx_planner_stage_events_task ON planner_stage_events(task_id);

CREATE TABLE IF NOT EXISTS places (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    kind       TEXT NOT NULL,
    -- Empty string for places without a parent country; NULL would defeat
    -- the uniqueness constraint
    country    TEXT NOT NULL DEFAULT '',
    population INTEGER,
    source     TEXT,
    UNIQUE(name, kind, country)
);
CREATE INDEX IF NOT EXISTS idx_places_kind ON places(kind);

CREATE TABLE IF NOT EXISTS place_hubs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    domain     TEXT NOT NULL,
    url        TEXT NOT NULL,
    place_name TEXT,
    kind       TEXT NOT NULL,
    verified   INTEGER NOT NULL DEFAULT 0,
    source     TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(domain, url)
);
CREATE INDEX IF NOT EXISTS idx_place_hubs_domain ON place_hubs(domain);
"#;

/// Map a rusqlite error, flagging lock contention as transient
fn db_err(e: rusqlite::Error) -> StoreError {
    use rusqlite::ErrorCode;
    match &e {
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(ffi.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Serde(e.to_string()),
    }
}

fn json_to_sql(value: &Value) -> String {
    value.to_string()
}

fn json_from_sql(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

/// Owns the SQLite connection and the schema
pub(crate) struct Db {
    conn: Connection,
}

impl Db {
    /// Open (creating if absent) a database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        debug!(path = %path.display(), "Db::open");
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_millis(50)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn })
    }

    // === tasks ===

    pub fn create_task(&mut self, row: &TaskRow) -> StoreResult<()> {
        debug!(task_id = %row.id, task_type = %row.task_type, "Db::create_task");
        let result = self.conn.execute(
            "INSERT INTO tasks (id, type, status, progress_current, progress_total, progress_message,
                                config, metadata, error_message, created_at, started_at, updated_at,
                                completed_at, resume_started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.id,
                row.task_type,
                row.status.to_string(),
                row.progress_current as i64,
                row.progress_total as i64,
                row.progress_message,
                json_to_sql(&row.config),
                json_to_sql(&row.metadata),
                row.error_message,
                row.created_at,
                row.started_at,
                row.updated_at,
                row.completed_at,
                row.resume_started_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(ffi, _))
                if ffi.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(row.id.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_task(&self, id: &str) -> StoreResult<Option<TaskRow>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT * FROM tasks WHERE id = ?1")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![id]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(Self::task_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_task_required(&self, id: &str) -> StoreResult<TaskRow> {
        self.get_task(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Atomic status transition; see the state machine in [`TaskStatus`]
    pub fn update_status(&mut self, id: &str, next: TaskStatus, change: &StatusChange) -> StoreResult<TaskRow> {
        let row = self.get_task_required(id)?;

        if !row.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: row.status,
                to: next,
            });
        }

        let now = now_ms().max(row.updated_at + 1);
        let started_at = match (row.started_at, next) {
            (None, TaskStatus::Running) => Some(now),
            (existing, _) => existing,
        };
        let resume_started_at = if next == TaskStatus::Resuming { Some(now) } else { None };
        let completed_at = if next.is_terminal() { Some(now) } else { None };
        let error_message = change.error_message.clone().or(row.error_message);

        debug!(task_id = %id, from = %row.status, to = %next, "Db::update_status");
        self.conn
            .execute(
                "UPDATE tasks SET status = ?2, started_at = ?3, resume_started_at = ?4,
                                  completed_at = ?5, error_message = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![id, next.to_string(), started_at, resume_started_at, completed_at, error_message, now],
            )
            .map_err(db_err)?;

        self.get_task_required(id)
    }

    /// Partial progress update; terminal rows reject per the no-mutation rule
    pub fn update_progress(&mut self, id: &str, update: &ProgressUpdate) -> StoreResult<TaskRow> {
        let row = self.get_task_required(id)?;

        if row.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: row.status,
                to: row.status,
            });
        }

        let total = update.total.unwrap_or(row.progress_total);
        let mut current = update.current.unwrap_or(row.progress_current);
        if total > 0 {
            current = current.min(total);
        }
        let message = update.message.clone().or(row.progress_message);
        let metadata = update.metadata.clone().unwrap_or(row.metadata);
        let now = now_ms().max(row.updated_at + 1);

        self.conn
            .execute(
                "UPDATE tasks SET progress_current = ?2, progress_total = ?3, progress_message = ?4,
                                  metadata = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![id, current as i64, total as i64, message, json_to_sql(&metadata), now],
            )
            .map_err(db_err)?;

        self.get_task_required(id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskRow>> {
        let mut sql = String::from("SELECT * FROM tasks");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            args.push(Box::new(status.to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(ref task_type) = filter.task_type {
            args.push(Box::new(task_type.clone()));
            clauses.push(format!("type = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(if filter.newest_first {
            " ORDER BY created_at DESC, id DESC"
        } else {
            " ORDER BY created_at ASC, id ASC"
        });
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
        let mut rows = stmt.query(params).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(Self::task_from_row(row)?);
        }
        Ok(out)
    }

    /// The recovery set: every task that was active when the process died
    pub fn find_interrupted(&self) -> StoreResult<Vec<TaskRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT * FROM tasks WHERE status IN ('running', 'resuming') ORDER BY created_at ASC",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(Self::task_from_row(row)?);
        }
        Ok(out)
    }

    pub fn delete_task(&mut self, id: &str) -> StoreResult<()> {
        let affected = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn count_by_status(&self) -> StoreResult<Vec<(TaskStatus, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let status: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            out.push((status.parse()?, count as u64));
        }
        Ok(out)
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> StoreResult<TaskRow> {
        let status: String = row.get("status").map_err(db_err)?;
        let config: String = row.get("config").map_err(db_err)?;
        let metadata: String = row.get("metadata").map_err(db_err)?;
        Ok(TaskRow {
            id: row.get("id").map_err(db_err)?,
            task_type: row.get("type").map_err(db_err)?,
            status: status.parse()?,
            progress_current: row.get::<_, i64>("progress_current").map_err(db_err)? as u64,
            progress_total: row.get::<_, i64>("progress_total").map_err(db_err)? as u64,
            progress_message: row.get("progress_message").map_err(db_err)?,
            config: json_from_sql(&config),
            metadata: json_from_sql(&metadata),
            error_message: row.get("error_message").map_err(db_err)?,
            created_at: row.get("created_at").map_err(db_err)?,
            started_at: row.get("started_at").map_err(db_err)?,
            updated_at: row.get("updated_at").map_err(db_err)?,
            completed_at: row.get("completed_at").map_err(db_err)?,
            resume_started_at: row.get("resume_started_at").map_err(db_err)?,
        })
    }

    // === telemetry ===

    pub fn append_queue_event(&mut self, ev: &QueueEvent) -> StoreResult<i64> {
        self.conn
            .execute(
                "INSERT INTO queue_events (task_id, ts, action, url, depth, host, reason, queue_size, role, depth_bucket)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    ev.task_id,
                    ev.ts,
                    ev.action.to_string(),
                    ev.url,
                    ev.depth,
                    ev.host,
                    ev.reason,
                    ev.queue_size.map(|v| v as i64),
                    ev.role,
                    ev.depth_bucket,
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn append_observation(&mut self, table: &str, obs: &Observation) -> StoreResult<i64> {
        let sql = format!(
            "INSERT INTO {table} (task_id, ts, kind, scope, target, message, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        );
        self.conn
            .execute(
                &sql,
                params![
                    obs.task_id,
                    obs.ts,
                    obs.kind,
                    obs.scope,
                    obs.target,
                    obs.message,
                    obs.details.as_ref().map(json_to_sql),
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn append_problem(&mut self, obs: &Observation) -> StoreResult<i64> {
        self.append_observation("task_problems", obs)
    }

    pub fn append_milestone(&mut self, obs: &Observation) -> StoreResult<i64> {
        self.append_observation("task_milestones", obs)
    }

    pub fn append_planner_stage(&mut self, ev: &PlannerStageEvent) -> StoreResult<i64> {
        self.conn
            .execute(
                "INSERT INTO planner_stage_events (task_id, ts, stage, rationale, estimated_cost_ms, decision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ev.task_id, ev.ts, ev.stage, ev.rationale, ev.estimated_cost_ms.map(|v| v as i64), ev.decision],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_queue_events(&self, task_id: &str, limit: usize) -> StoreResult<Vec<QueueEvent>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT * FROM queue_events WHERE task_id = ?1 ORDER BY id ASC LIMIT ?2")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![task_id, limit as i64]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let action: String = row.get("action").map_err(db_err)?;
            out.push(QueueEvent {
                id: row.get("id").map_err(db_err)?,
                task_id: row.get("task_id").map_err(db_err)?,
                ts: row.get("ts").map_err(db_err)?,
                action: action.parse::<QueueAction>()?,
                url: row.get("url").map_err(db_err)?,
                depth: row.get("depth").map_err(db_err)?,
                host: row.get("host").map_err(db_err)?,
                reason: row.get("reason").map_err(db_err)?,
                queue_size: row
                    .get::<_, Option<i64>>("queue_size")
                    .map_err(db_err)?
                    .map(|v| v as u64),
                role: row.get("role").map_err(db_err)?,
                depth_bucket: row.get("depth_bucket").map_err(db_err)?,
            });
        }
        Ok(out)
    }

    fn list_observations(&self, table: &str, task_id: &str, limit: usize) -> StoreResult<Vec<Observation>> {
        let sql = format!("SELECT * FROM {table} WHERE task_id = ?1 ORDER BY id ASC LIMIT ?2");
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![task_id, limit as i64]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let details: Option<String> = row.get("details").map_err(db_err)?;
            out.push(Observation {
                id: row.get("id").map_err(db_err)?,
                task_id: row.get("task_id").map_err(db_err)?,
                ts: row.get("ts").map_err(db_err)?,
                kind: row.get("kind").map_err(db_err)?,
                scope: row.get("scope").map_err(db_err)?,
                target: row.get("target").map_err(db_err)?,
                message: row.get("message").map_err(db_err)?,
                details: details.map(|d| json_from_sql(&d)),
            });
        }
        Ok(out)
    }

    pub fn list_problems(&self, task_id: &str, limit: usize) -> StoreResult<Vec<Observation>> {
        self.list_observations("task_problems", task_id, limit)
    }

    pub fn list_milestones(&self, task_id: &str, limit: usize) -> StoreResult<Vec<Observation>> {
        self.list_observations("task_milestones", task_id, limit)
    }

    // === places and place hubs ===

    /// Insert places, ignoring ones already present; returns how many landed
    pub fn upsert_places(&mut self, places: &[PlaceRecord]) -> StoreResult<usize> {
        let mut inserted = 0;
        for place in places {
            let country = place.country.clone().unwrap_or_default();
            let n = self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO places (name, kind, country, population, source)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![place.name, place.kind, country, place.population, place.source],
                )
                .map_err(db_err)?;
            inserted += n;
        }
        Ok(inserted)
    }

    pub fn list_places(&self, kind: Option<&str>, limit: usize) -> StoreResult<Vec<PlaceRecord>> {
        let (sql, args): (&str, Vec<Box<dyn rusqlite::ToSql>>) = match kind {
            Some(kind) => (
                "SELECT * FROM places WHERE kind = ?1 ORDER BY population DESC NULLS LAST, name ASC LIMIT ?2",
                vec![Box::new(kind.to_string()), Box::new(limit as i64)],
            ),
            None => (
                "SELECT * FROM places ORDER BY population DESC NULLS LAST, name ASC LIMIT ?1",
                vec![Box::new(limit as i64)],
            ),
        };
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
        let mut rows = stmt.query(params).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let country: String = row.get("country").map_err(db_err)?;
            out.push(PlaceRecord {
                id: row.get("id").map_err(db_err)?,
                name: row.get("name").map_err(db_err)?,
                kind: row.get("kind").map_err(db_err)?,
                country: if country.is_empty() { None } else { Some(country) },
                population: row.get("population").map_err(db_err)?,
                source: row.get("source").map_err(db_err)?,
            });
        }
        Ok(out)
    }

    pub fn count_places(&self) -> StoreResult<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM places", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }

    /// Insert a hub guess; false when the (domain, url) pair already exists
    pub fn insert_place_hub(&mut self, hub: &PlaceHubRecord) -> StoreResult<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO place_hubs (domain, url, place_name, kind, verified, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    hub.domain,
                    hub.url,
                    hub.place_name,
                    hub.kind,
                    hub.verified,
                    hub.source,
                    hub.created_at,
                ],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn list_place_hubs(&self, domain: &str, limit: usize) -> StoreResult<Vec<PlaceHubRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT * FROM place_hubs WHERE domain = ?1 ORDER BY id ASC LIMIT ?2")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![domain, limit as i64]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(PlaceHubRecord {
                id: row.get("id").map_err(db_err)?,
                domain: row.get("domain").map_err(db_err)?,
                url: row.get("url").map_err(db_err)?,
                place_name: row.get("place_name").map_err(db_err)?,
                kind: row.get("kind").map_err(db_err)?,
                verified: row.get("verified").map_err(db_err)?,
                source: row.get("source").map_err(db_err)?,
                created_at: row.get("created_at").map_err(db_err)?,
            });
        }
        Ok(out)
    }

    /// Prior-signal summary for one domain
    pub fn domain_signals(&self, domain: &str) -> StoreResult<DomainSignals> {
        let fetch_count: u64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM queue_events WHERE host = ?1 AND action = 'dequeue'",
                params![domain],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)? as u64;
        let (known_hubs, verified_hubs): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(verified), 0) FROM place_hubs WHERE domain = ?1",
                params![domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        let (known_hubs, verified_hubs) = (known_hubs as u64, verified_hubs as u64);
        Ok(DomainSignals {
            domain: domain.to_string(),
            fetch_count,
            verified_hubs,
            known_hubs,
        })
    }

    pub fn list_planner_stages(&self, task_id: &str, limit: usize) -> StoreResult<Vec<PlannerStageEvent>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT * FROM planner_stage_events WHERE task_id = ?1 ORDER BY id ASC LIMIT ?2")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![task_id, limit as i64]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(PlannerStageEvent {
                id: row.get("id").map_err(db_err)?,
                task_id: row.get("task_id").map_err(db_err)?,
                ts: row.get("ts").map_err(db_err)?,
                stage: row.get("stage").map_err(db_err)?,
                rationale: row.get("rationale").map_err(db_err)?,
                estimated_cost_ms: row
                    .get::<_, Option<i64>>("estimated_cost_ms")
                    .map_err(db_err)?
                    .map(|v| v as u64),
                decision: row.get("decision").map_err(db_err)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh() -> Db {
        Db::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let mut db = fresh();
        let row = TaskRow::with_id("task-1", "compress", json!({"level": 3}));
        db.create_task(&row).unwrap();

        let got = db.get_task("task-1").unwrap().unwrap();
        assert_eq!(got.task_type, "compress");
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.config["level"], 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut db = fresh();
        let row = TaskRow::with_id("task-1", "compress", Value::Null);
        db.create_task(&row).unwrap();
        let err = db.create_task(&row).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[test]
    fn test_started_at_set_once() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "analyze", Value::Null)).unwrap();

        let running = db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();
        let started = running.started_at.unwrap();

        let paused = db.update_status("t", TaskStatus::Paused, &StatusChange::default()).unwrap();
        assert_eq!(paused.started_at, Some(started));

        let running_again = db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();
        assert_eq!(running_again.started_at, Some(started));
    }

    #[test]
    fn test_resume_started_at_tracks_resuming() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();

        let resuming = db.update_status("t", TaskStatus::Resuming, &StatusChange::default()).unwrap();
        assert!(resuming.resume_started_at.is_some());

        let running = db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();
        assert!(running.resume_started_at.is_none());
    }

    #[test]
    fn test_terminal_rows_frozen() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();
        let done = db.update_status("t", TaskStatus::Completed, &StatusChange::default()).unwrap();
        assert!(done.completed_at.is_some());

        let err = db
            .update_status("t", TaskStatus::Running, &StatusChange::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = db.update_progress("t", &ProgressUpdate::counters(1, 2)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_records_error_message() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        db.update_status("t", TaskStatus::Running, &StatusChange::default()).unwrap();
        let failed = db
            .update_status(
                "t",
                TaskStatus::Failed,
                &StatusChange {
                    error_message: Some("worker exited with code 3".into()),
                },
            )
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("worker exited with code 3"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn test_progress_clamped_to_total() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "compress", Value::Null)).unwrap();
        let row = db.update_progress("t", &ProgressUpdate::counters(150, 100)).unwrap();
        assert_eq!(row.progress_current, 100);
        assert_eq!(row.progress_total, 100);
    }

    #[test]
    fn test_indeterminate_total_accepted() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "compress", Value::Null)).unwrap();
        let row = db.update_progress("t", &ProgressUpdate::counters(7, 0)).unwrap();
        assert_eq!(row.progress_current, 7);
        assert_eq!(row.progress_total, 0);
        assert!(row.progress_fraction().is_none());
    }

    #[test]
    fn test_progress_partial_update_keeps_fields() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "compress", Value::Null)).unwrap();
        db.update_progress(
            "t",
            &ProgressUpdate {
                current: Some(1),
                total: Some(10),
                message: Some("scanning".into()),
                metadata: Some(json!({"stage": "scan"})),
            },
        )
        .unwrap();

        let row = db.update_progress("t", &ProgressUpdate { current: Some(2), ..Default::default() }).unwrap();
        assert_eq!(row.progress_total, 10);
        assert_eq!(row.progress_message.as_deref(), Some("scanning"));
        assert_eq!(row.metadata["stage"], "scan");
    }

    #[test]
    fn test_updated_at_strictly_monotonic() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "compress", Value::Null)).unwrap();
        let mut prev = db.get_task("t").unwrap().unwrap().updated_at;
        for i in 0..5 {
            let row = db.update_progress("t", &ProgressUpdate::counters(i, 10)).unwrap();
            assert!(row.updated_at > prev);
            prev = row.updated_at;
        }
    }

    #[test]
    fn test_find_interrupted() {
        let mut db = fresh();
        for (id, status) in [
            ("a", TaskStatus::Running),
            ("b", TaskStatus::Resuming),
            ("c", TaskStatus::Paused),
            ("d", TaskStatus::Completed),
        ] {
            db.create_task(&TaskRow::with_id(id, "crawl", Value::Null)).unwrap();
            if status != TaskStatus::Pending {
                if status == TaskStatus::Completed {
                    db.update_status(id, TaskStatus::Running, &StatusChange::default()).unwrap();
                }
                db.update_status(id, status, &StatusChange::default()).unwrap();
            }
        }

        let interrupted = db.find_interrupted().unwrap();
        let ids: Vec<_> = interrupted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_list_with_filters() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("a", "crawl", Value::Null)).unwrap();
        db.create_task(&TaskRow::with_id("b", "compress", Value::Null)).unwrap();
        db.update_status("b", TaskStatus::Running, &StatusChange::default()).unwrap();

        let crawls = db
            .list_tasks(&TaskFilter {
                task_type: Some("crawl".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(crawls.len(), 1);
        assert_eq!(crawls[0].id, "a");

        let running = db.list_tasks(&TaskFilter::by_status(TaskStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "b");
    }

    #[test]
    fn test_delete_cascades_telemetry() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        db.append_problem(&Observation::new("t", "silence", "no output")).unwrap();
        db.append_milestone(&Observation::new("t", "hub-verified", "found hub")).unwrap();

        db.delete_task("t").unwrap();
        assert!(db.get_task("t").unwrap().is_none());
        assert!(db.list_problems("t", 10).unwrap().is_empty());
        assert!(db.list_milestones("t", 10).unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let mut db = fresh();
        assert!(matches!(db.delete_task("nope").unwrap_err(), StoreError::NotFound(_)));
    }

    #[test]
    fn test_queue_event_round_trip() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        db.append_queue_event(&QueueEvent {
            id: 0,
            task_id: "t".into(),
            ts: now_ms(),
            action: QueueAction::Enqueue,
            url: "https://example.com/world/fr".into(),
            depth: Some(2),
            host: Some("example.com".into()),
            reason: Some("pattern".into()),
            queue_size: Some(5),
            role: Some("place-hub".into()),
            depth_bucket: Some("mid".into()),
        })
        .unwrap();

        let events = db.list_queue_events("t", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, QueueAction::Enqueue);
        assert_eq!(events[0].depth, Some(2));
        assert_eq!(events[0].role.as_deref(), Some("place-hub"));
    }

    #[test]
    fn test_planner_stage_round_trip() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        let mut ev = PlannerStageEvent::new("t", "seed");
        ev.rationale = Some("3 start urls, 2 hub candidates".into());
        ev.estimated_cost_ms = Some(450);
        ev.decision = Some("emitted 5 candidates".into());
        db.append_planner_stage(&ev).unwrap();

        let stages = db.list_planner_stages("t", 10).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, "seed");
        assert_eq!(stages[0].estimated_cost_ms, Some(450));
    }

    #[test]
    fn test_places_upsert_and_list() {
        let mut db = fresh();
        let places = vec![
            PlaceRecord::new("France", "country").with_source("seed"),
            PlaceRecord::new("Germany", "country"),
            PlaceRecord::new("Bavaria", "region").with_country("Germany"),
        ];
        assert_eq!(db.upsert_places(&places).unwrap(), 3);
        // Re-import is idempotent
        assert_eq!(db.upsert_places(&places).unwrap(), 0);
        assert_eq!(db.count_places().unwrap(), 3);

        let countries = db.list_places(Some("country"), 10).unwrap();
        assert_eq!(countries.len(), 2);
        assert!(countries.iter().all(|p| p.kind == "country"));
    }

    #[test]
    fn test_place_hub_insert_unique() {
        let mut db = fresh();
        let hub = PlaceHubRecord::guess("a.example", "https://a.example/world/france", "country");
        assert!(db.insert_place_hub(&hub).unwrap());
        assert!(!db.insert_place_hub(&hub).unwrap());

        let hubs = db.list_place_hubs("a.example", 10).unwrap();
        assert_eq!(hubs.len(), 1);
        assert!(!hubs[0].verified);
    }

    #[test]
    fn test_domain_signals_from_queue_events() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("t", "crawl", Value::Null)).unwrap();
        for action in [QueueAction::Enqueue, QueueAction::Dequeue, QueueAction::Dequeue] {
            db.append_queue_event(&QueueEvent {
                id: 0,
                task_id: "t".into(),
                ts: now_ms(),
                action,
                url: "https://a.example/x".into(),
                depth: None,
                host: Some("a.example".into()),
                reason: None,
                queue_size: None,
                role: None,
                depth_bucket: None,
            })
            .unwrap();
        }
        let mut verified = PlaceHubRecord::guess("a.example", "https://a.example/world/fr", "country");
        verified.verified = true;
        db.insert_place_hub(&verified).unwrap();

        let signals = db.domain_signals("a.example").unwrap();
        assert_eq!(signals.fetch_count, 2);
        assert_eq!(signals.known_hubs, 1);
        assert_eq!(signals.verified_hubs, 1);

        let empty = db.domain_signals("cold.example").unwrap();
        assert_eq!(empty.fetch_count, 0);
        assert!(!empty.is_ready(1));
    }

    #[test]
    fn test_count_by_status() {
        let mut db = fresh();
        db.create_task(&TaskRow::with_id("a", "crawl", Value::Null)).unwrap();
        db.create_task(&TaskRow::with_id("b", "crawl", Value::Null)).unwrap();
        db.update_status("b", TaskStatus::Running, &StatusChange::default()).unwrap();

        let counts = db.count_by_status().unwrap();
        let pending = counts.iter().find(|(s, _)| *s == TaskStatus::Pending).unwrap().1;
        let running = counts.iter().find(|(s, _)| *s == TaskStatus::Running).unwrap().1;
        assert_eq!(pending, 1);
        assert_eq!(running, 1);
    }
}
