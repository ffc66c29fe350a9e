//! SQLite implementation of [`Store`].
//!
//! Uses `tokio::task::spawn_blocking` to run synchronous rusqlite calls off the
//! async runtime. Uniqueness of rollout identities and of open incidents per
//! dedup key is enforced by indexes. Operations that decide and then write
//! (throttling, failing a rollout, claiming a batch) run inside an
//! `IMMEDIATE` transaction so replicas sharing the file serialize on them.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{failed_via_update, Store};
use crate::alerts::should_investigate;
use crate::error::{Error, Result};
use crate::model::{
    AlertBatchRecord, AlertRecord, AlertStateRecord, AnalysisRecord, AnalysisStatus,
    IncidentStatus, IncidentType, InvestigationJob, JobKind, JobScope, JobStatus, JobTarget,
    NamespaceIncident, NewAlert, NewAlertBatch, NewAnalysis, NewIncident, NewRollout,
    NotifyStatus, Rollout, RolloutKey, RolloutMetadata, RolloutStatus,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS rollouts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster TEXT NOT NULL,
    namespace TEXT NOT NULL,
    deployment TEXT NOT NULL,
    generation INTEGER NOT NULL,
    status TEXT NOT NULL,
    analysis_status TEXT NOT NULL DEFAULT 'PENDING',
    notify_status TEXT NOT NULL DEFAULT 'PENDING',
    origin TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    failed_at TEXT,
    analysis_id INTEGER,
    UNIQUE (cluster, namespace, deployment, generation)
);
CREATE INDEX IF NOT EXISTS rollouts_status ON rollouts (cluster, status);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    status TEXT NOT NULL,
    starts_at TEXT,
    ends_at TEXT,
    labels TEXT NOT NULL,
    annotations TEXT NOT NULL,
    raw TEXT NOT NULL,
    received_at TEXT NOT NULL,
    batched INTEGER NOT NULL DEFAULT 0,
    batch_id INTEGER
);
CREATE INDEX IF NOT EXISTS alerts_unbatched ON alerts (batched, received_at);
CREATE INDEX IF NOT EXISTS alerts_batch ON alerts (batch_id);

CREATE TABLE IF NOT EXISTS alert_states (
    fingerprint TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_received_at TEXT NOT NULL,
    last_investigated_at TEXT
);

CREATE TABLE IF NOT EXISTS alert_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    primary_fingerprint TEXT NOT NULL,
    namespace TEXT NOT NULL,
    service TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    summary TEXT NOT NULL,
    analysis_status TEXT NOT NULL DEFAULT 'PENDING',
    notify_status TEXT NOT NULL DEFAULT 'PENDING',
    analysis_id INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS namespace_incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster TEXT NOT NULL,
    namespace TEXT NOT NULL,
    incident_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    resolved_at TEXT,
    analysis_status TEXT NOT NULL DEFAULT 'PENDING',
    notify_status TEXT NOT NULL DEFAULT 'PENDING',
    analysis_id INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE UNIQUE INDEX IF NOT EXISTS namespace_incidents_open
    ON namespace_incidents (cluster, namespace, incident_type)
    WHERE status != 'RESOLVED';

CREATE TABLE IF NOT EXISTS investigation_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    cluster TEXT NOT NULL,
    namespace TEXT NOT NULL,
    status TEXT NOT NULL,
    analysis_id INTEGER,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS investigation_jobs_status ON investigation_jobs (status);
CREATE INDEX IF NOT EXISTS investigation_jobs_started ON investigation_jobs (cluster, started_at);

CREATE TABLE IF NOT EXISTS analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    analysis TEXT NOT NULL,
    triage_team TEXT NOT NULL,
    triage_reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const ROLLOUT_COLUMNS: &str = "id, cluster, namespace, deployment, generation, status, \
    analysis_status, notify_status, origin, metadata, started_at, completed_at, failed_at, \
    analysis_id";

const ALERT_COLUMNS: &str = "id, fingerprint, status, starts_at, ends_at, labels, annotations, \
    raw, received_at, batched, batch_id";

const BATCH_COLUMNS: &str = "id, primary_fingerprint, namespace, service, window_start, \
    window_end, summary, analysis_status, notify_status, analysis_id, created_at";

const INCIDENT_COLUMNS: &str = "id, cluster, namespace, incident_type, status, started_at, \
    resolved_at, analysis_status, notify_status, analysis_id, metadata";

const JOB_COLUMNS: &str = "id, kind, target_id, cluster, namespace, status, analysis_id, error, \
    created_at, started_at, finished_at";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::StorageError(format!("create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal_mode, "SQLite did not switch to WAL journal mode");
        }
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "SQLite schema ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::StorageError("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn rollout_from_row(row: &Row<'_>) -> rusqlite::Result<Rollout> {
    Ok(Rollout {
        id: row.get(0)?,
        key: RolloutKey {
            cluster: row.get(1)?,
            namespace: row.get(2)?,
            deployment: row.get(3)?,
            generation: row.get(4)?,
        },
        status: parsed(row, 5)?,
        analysis_status: parsed(row, 6)?,
        notify_status: parsed(row, 7)?,
        origin: row.get(8)?,
        metadata: json(row, 9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        failed_at: row.get(12)?,
        analysis_id: row.get(13)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        status: parsed(row, 2)?,
        starts_at: row.get(3)?,
        ends_at: row.get(4)?,
        labels: json(row, 5)?,
        annotations: json(row, 6)?,
        raw: json(row, 7)?,
        received_at: row.get(8)?,
        batched: row.get(9)?,
        batch_id: row.get(10)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<AlertBatchRecord> {
    Ok(AlertBatchRecord {
        id: row.get(0)?,
        primary_fingerprint: row.get(1)?,
        namespace: row.get(2)?,
        service: row.get(3)?,
        window_start: row.get(4)?,
        window_end: row.get(5)?,
        summary: row.get(6)?,
        analysis_status: parsed(row, 7)?,
        notify_status: parsed(row, 8)?,
        analysis_id: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<NamespaceIncident> {
    Ok(NamespaceIncident {
        id: row.get(0)?,
        cluster: row.get(1)?,
        namespace: row.get(2)?,
        incident_type: parsed(row, 3)?,
        status: parsed(row, 4)?,
        started_at: row.get(5)?,
        resolved_at: row.get(6)?,
        analysis_status: parsed(row, 7)?,
        notify_status: parsed(row, 8)?,
        analysis_id: row.get(9)?,
        metadata: json(row, 10)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<InvestigationJob> {
    let kind: JobKind = parsed(row, 1)?;
    Ok(InvestigationJob {
        id: row.get(0)?,
        target: JobTarget::from_parts(kind, row.get(2)?),
        scope: JobScope {
            cluster: row.get(3)?,
            namespace: row.get(4)?,
        },
        status: parsed(row, 5)?,
        analysis_id: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let kind: JobKind = parsed(row, 2)?;
    Ok(AnalysisRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        target: JobTarget::from_parts(kind, row.get(3)?),
        analysis: json(row, 4)?,
        triage_team: row.get(5)?,
        triage_reason: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn select_rollout(conn: &Connection, id: i64) -> Result<Option<Rollout>> {
    let sql = format!("SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], rollout_from_row).optional()?)
}

fn select_rollout_by_key(conn: &Connection, key: &RolloutKey) -> Result<Option<Rollout>> {
    let sql = format!(
        "SELECT {ROLLOUT_COLUMNS} FROM rollouts \
         WHERE cluster = ?1 AND namespace = ?2 AND deployment = ?3 AND generation = ?4"
    );
    Ok(conn
        .query_row(
            &sql,
            params![key.cluster, key.namespace, key.deployment, key.generation],
            rollout_from_row,
        )
        .optional()?)
}

fn select_incident(conn: &Connection, id: i64) -> Result<Option<NamespaceIncident>> {
    let sql = format!("SELECT {INCIDENT_COLUMNS} FROM namespace_incidents WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], incident_from_row).optional()?)
}

fn select_open_incident(
    conn: &Connection,
    cluster: &str,
    namespace: &str,
    incident_type: IncidentType,
) -> Result<Option<NamespaceIncident>> {
    let sql = format!(
        "SELECT {INCIDENT_COLUMNS} FROM namespace_incidents \
         WHERE cluster = ?1 AND namespace = ?2 AND incident_type = ?3 AND status != 'RESOLVED'"
    );
    Ok(conn
        .query_row(
            &sql,
            params![cluster, namespace, incident_type.as_str()],
            incident_from_row,
        )
        .optional()?)
}

fn select_alert_state(conn: &Connection, fingerprint: &str) -> Result<Option<AlertStateRecord>> {
    Ok(conn
        .query_row(
            "SELECT fingerprint, status, last_received_at, last_investigated_at \
             FROM alert_states WHERE fingerprint = ?1",
            [fingerprint],
            |row| {
                Ok(AlertStateRecord {
                    fingerprint: row.get(0)?,
                    status: parsed(row, 1)?,
                    last_received_at: row.get(2)?,
                    last_investigated_at: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn insert_job(conn: &Connection, target: JobTarget, scope: JobScope) -> Result<InvestigationJob> {
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO investigation_jobs \
         (kind, target_id, cluster, namespace, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            target.kind().as_str(),
            target.id(),
            scope.cluster,
            scope.namespace,
            JobStatus::Pending.as_str(),
            created_at,
        ],
    )?;
    Ok(InvestigationJob {
        id: conn.last_insert_rowid(),
        target,
        scope,
        status: JobStatus::Pending,
        analysis_id: None,
        error: None,
        created_at,
        started_at: None,
        finished_at: None,
    })
}

fn ensure_updated(changed: usize, what: &str, id: i64) -> Result<()> {
    if changed == 0 {
        Err(Error::NotFound(format!("{what} {id}")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_rollout_if_absent(&self, new: NewRollout) -> Result<(Rollout, bool)> {
        let metadata = to_json(&new.metadata)?;
        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO rollouts \
                 (cluster, namespace, deployment, generation, status, origin, metadata, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.key.cluster,
                    new.key.namespace,
                    new.key.deployment,
                    new.key.generation,
                    new.status.as_str(),
                    new.origin,
                    metadata,
                    new.started_at,
                ],
            )?;
            let rollout = select_rollout_by_key(conn, &new.key)?
                .ok_or_else(|| Error::StorageError("rollout vanished after insert".to_string()))?;
            Ok((rollout, inserted == 1))
        })
        .await
    }

    async fn get_rollout(&self, id: i64) -> Result<Option<Rollout>> {
        self.call(move |conn| select_rollout(conn, id)).await
    }

    async fn find_rollout(&self, key: &RolloutKey) -> Result<Option<Rollout>> {
        let key = key.clone();
        self.call(move |conn| select_rollout_by_key(conn, &key)).await
    }

    async fn update_rollout_metadata(&self, id: i64, metadata: &RolloutMetadata) -> Result<()> {
        let update = metadata.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut rollout = select_rollout(&tx, id)?.ok_or_else(|| {
                Error::NotFound(format!("rollout {id}"))
            })?;
            rollout.metadata.merge(&update);
            tx.execute(
                "UPDATE rollouts SET metadata = ?1 WHERE id = ?2",
                params![to_json(&rollout.metadata)?, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_rollout_status(
        &self,
        id: i64,
        status: RolloutStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if status == RolloutStatus::Failed {
            return Err(failed_via_update(id));
        }
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE rollouts SET status = ?1, \
                    completed_at = CASE WHEN ?1 = 'SUCCESS' THEN ?2 ELSE completed_at END \
                 WHERE id = ?3",
                params![status.as_str(), at, id],
            )?;
            ensure_updated(changed, "rollout", id)
        })
        .await
    }

    async fn fail_rollout(
        &self,
        id: i64,
        failure: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<InvestigationJob>> {
        let failure = failure.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut rollout =
                select_rollout(&tx, id)?.ok_or_else(|| Error::NotFound(format!("rollout {id}")))?;
            if rollout.status.is_terminal() {
                return Ok(None);
            }
            rollout.metadata.failure = Some(failure);
            tx.execute(
                "UPDATE rollouts SET status = ?1, failed_at = ?2, metadata = ?3 WHERE id = ?4",
                params![
                    RolloutStatus::Failed.as_str(),
                    at,
                    to_json(&rollout.metadata)?,
                    id
                ],
            )?;
            let job = insert_job(
                &tx,
                JobTarget::Rollout(id),
                JobScope {
                    cluster: rollout.key.cluster,
                    namespace: rollout.key.namespace,
                },
            )?;
            tx.commit()?;
            Ok(Some(job))
        })
        .await
    }

    async fn list_active_rollouts(&self, cluster: &str) -> Result<Vec<Rollout>> {
        let cluster = cluster.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {ROLLOUT_COLUMNS} FROM rollouts \
                 WHERE cluster = ?1 AND status IN ('PENDING', 'ROLLING_OUT') ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([cluster], rollout_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn record_alert(
        &self,
        new: NewAlert,
        throttle_window: chrono::Duration,
    ) -> Result<(AlertRecord, bool)> {
        let labels = to_json(&new.labels)?;
        let annotations = to_json(&new.annotations)?;
        let raw = to_json(&new.raw)?;
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let prior = select_alert_state(&tx, &new.fingerprint)?;
            let investigate =
                should_investigate(new.status, prior.as_ref(), new.received_at, throttle_window);
            let last_investigated_at = if investigate {
                Some(new.received_at)
            } else {
                prior.and_then(|state| state.last_investigated_at)
            };

            tx.execute(
                "INSERT INTO alert_states (fingerprint, status, last_received_at, last_investigated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(fingerprint) DO UPDATE SET \
                    status = excluded.status, \
                    last_received_at = excluded.last_received_at, \
                    last_investigated_at = excluded.last_investigated_at",
                params![
                    new.fingerprint,
                    new.status.as_str(),
                    new.received_at,
                    last_investigated_at,
                ],
            )?;
            tx.execute(
                "INSERT INTO alerts \
                 (fingerprint, status, starts_at, ends_at, labels, annotations, raw, received_at, batched) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.fingerprint,
                    new.status.as_str(),
                    new.starts_at,
                    new.ends_at,
                    labels,
                    annotations,
                    raw,
                    new.received_at,
                    !investigate,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok((
                AlertRecord {
                    id,
                    fingerprint: new.fingerprint,
                    status: new.status,
                    starts_at: new.starts_at,
                    ends_at: new.ends_at,
                    labels: new.labels,
                    annotations: new.annotations,
                    raw: new.raw,
                    received_at: new.received_at,
                    batched: !investigate,
                    batch_id: None,
                },
                investigate,
            ))
        })
        .await
    }

    async fn get_alert_state(&self, fingerprint: &str) -> Result<Option<AlertStateRecord>> {
        let fingerprint = fingerprint.to_string();
        self.call(move |conn| select_alert_state(conn, &fingerprint))
            .await
    }

    async fn list_unbatched_alerts(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts \
                 WHERE batched = 0 AND received_at >= ?1 ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([since], alert_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn create_batch(
        &self,
        new: NewAlertBatch,
        alert_ids: &[i64],
        scope: JobScope,
    ) -> Result<Option<(AlertBatchRecord, InvestigationJob)>> {
        let alert_ids = alert_ids.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO alert_batches \
                 (primary_fingerprint, namespace, service, window_start, window_end, summary, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.primary_fingerprint,
                    new.namespace,
                    new.service,
                    new.window_start,
                    new.window_end,
                    new.summary,
                    new.created_at,
                ],
            )?;
            let batch_id = tx.last_insert_rowid();

            let mut claimed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE alerts SET batched = 1, batch_id = ?1 WHERE id = ?2 AND batched = 0",
                )?;
                for alert_id in &alert_ids {
                    claimed += stmt.execute(params![batch_id, alert_id])?;
                }
            }
            if claimed == 0 {
                // Dropping the transaction rolls the batch row back
                return Ok(None);
            }

            let sql = format!("SELECT {BATCH_COLUMNS} FROM alert_batches WHERE id = ?1");
            let batch = tx.query_row(&sql, [batch_id], batch_from_row)?;
            let job = insert_job(&tx, JobTarget::AlertBatch(batch_id), scope)?;
            tx.commit()?;
            Ok(Some((batch, job)))
        })
        .await
    }

    async fn get_batch(&self, id: i64) -> Result<Option<AlertBatchRecord>> {
        self.call(move |conn| {
            let sql = format!("SELECT {BATCH_COLUMNS} FROM alert_batches WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], batch_from_row).optional()?)
        })
        .await
    }

    async fn list_batch_alerts(&self, batch_id: i64) -> Result<Vec<AlertRecord>> {
        self.call(move |conn| {
            let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE batch_id = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([batch_id], alert_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn create_incident_if_absent(
        &self,
        new: NewIncident,
    ) -> Result<(NamespaceIncident, Option<InvestigationJob>)> {
        let metadata = to_json(&new.metadata)?;
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO namespace_incidents \
                 (cluster, namespace, incident_type, status, started_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.cluster,
                    new.namespace,
                    new.incident_type.as_str(),
                    IncidentStatus::Active.as_str(),
                    new.started_at,
                    metadata,
                ],
            )?;
            let incident =
                select_open_incident(&tx, &new.cluster, &new.namespace, new.incident_type)?
                    .ok_or_else(|| {
                        Error::StorageError("incident vanished after insert".to_string())
                    })?;
            let job = if inserted == 1 {
                Some(insert_job(
                    &tx,
                    JobTarget::NamespaceIncident(incident.id),
                    JobScope {
                        cluster: incident.cluster.clone(),
                        namespace: incident.namespace.clone(),
                    },
                )?)
            } else {
                None
            };
            tx.commit()?;
            Ok((incident, job))
        })
        .await
    }

    async fn get_incident(&self, id: i64) -> Result<Option<NamespaceIncident>> {
        self.call(move |conn| select_incident(conn, id)).await
    }

    async fn list_open_incidents(&self, cluster: &str) -> Result<Vec<NamespaceIncident>> {
        let cluster = cluster.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {INCIDENT_COLUMNS} FROM namespace_incidents \
                 WHERE cluster = ?1 AND status != 'RESOLVED' ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([cluster], incident_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_incident_status(
        &self,
        id: i64,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE namespace_incidents SET status = ?1, \
                    resolved_at = CASE WHEN ?1 = 'RESOLVED' THEN ?2 ELSE resolved_at END \
                 WHERE id = ?3",
                params![status.as_str(), at, id],
            )?;
            ensure_updated(changed, "incident", id)
        })
        .await
    }

    async fn begin_incident_investigation(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE namespace_incidents SET status = 'INVESTIGATING' \
                 WHERE id = ?1 AND status = 'ACTIVE'",
                [id],
            )?;
            if changed == 0 && select_incident(conn, id)?.is_none() {
                return Err(Error::NotFound(format!("incident {id}")));
            }
            Ok(changed == 1)
        })
        .await
    }

    async fn get_job(&self, id: i64) -> Result<Option<InvestigationJob>> {
        self.call(move |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM investigation_jobs WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], job_from_row).optional()?)
        })
        .await
    }

    async fn list_pending_jobs(&self, kinds: &[JobKind]) -> Result<Vec<InvestigationJob>> {
        let kinds = kinds.to_vec();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM investigation_jobs WHERE status = 'pending' ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], job_from_row)?;
            let jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs
                .into_iter()
                .filter(|job| kinds.contains(&job.target.kind()))
                .collect())
        })
        .await
    }

    async fn mark_job_running(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE investigation_jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![at, id],
            )?;
            ensure_updated(changed, "job", id)
        })
        .await
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        analysis_id: Option<i64>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE investigation_jobs \
                 SET status = ?1, analysis_id = ?2, error = ?3, finished_at = ?4 WHERE id = ?5",
                params![status.as_str(), analysis_id, error, at, id],
            )?;
            ensure_updated(changed, "job", id)
        })
        .await
    }

    async fn count_started_jobs(
        &self,
        since: DateTime<Utc>,
        cluster: &str,
        namespace: Option<&str>,
    ) -> Result<usize> {
        let cluster = cluster.to_string();
        let namespace = namespace.map(str::to_string);
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM investigation_jobs \
                 WHERE started_at IS NOT NULL AND started_at >= ?1 AND cluster = ?2 \
                   AND (?3 IS NULL OR namespace = ?3)",
                params![since, cluster, namespace],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn insert_analysis(&self, new: NewAnalysis) -> Result<AnalysisRecord> {
        let analysis = to_json(&new.analysis)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO analyses \
                 (job_id, kind, target_id, analysis, triage_team, triage_reason, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.job_id,
                    new.target.kind().as_str(),
                    new.target.id(),
                    analysis,
                    new.triage_team,
                    new.triage_reason,
                    new.created_at,
                ],
            )?;
            Ok(AnalysisRecord {
                id: conn.last_insert_rowid(),
                job_id: new.job_id,
                target: new.target,
                analysis: new.analysis,
                triage_team: new.triage_team,
                triage_reason: new.triage_reason,
                created_at: new.created_at,
            })
        })
        .await
    }

    async fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, job_id, kind, target_id, analysis, triage_team, triage_reason, created_at \
                     FROM analyses WHERE id = ?1",
                    [id],
                    analysis_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn set_target_outcome(
        &self,
        target: JobTarget,
        analysis_status: AnalysisStatus,
        notify_status: Option<NotifyStatus>,
        analysis_id: Option<i64>,
    ) -> Result<()> {
        let table = match target {
            JobTarget::Rollout(_) => "rollouts",
            JobTarget::AlertBatch(_) => "alert_batches",
            JobTarget::NamespaceIncident(_) => "namespace_incidents",
        };
        self.call(move |conn| {
            let sql = format!(
                "UPDATE {table} SET analysis_status = ?1, \
                    notify_status = COALESCE(?2, notify_status), \
                    analysis_id = COALESCE(?3, analysis_id) \
                 WHERE id = ?4"
            );
            let changed = conn.execute(
                &sql,
                params![
                    analysis_status.as_str(),
                    notify_status.map(NotifyStatus::as_str),
                    analysis_id,
                    target.id(),
                ],
            )?;
            ensure_updated(changed, table, target.id())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertStatus;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("fyr.db")).unwrap();
        (dir, store)
    }

    fn new_rollout(deployment: &str) -> NewRollout {
        NewRollout {
            key: RolloutKey {
                cluster: "ci-cluster".to_string(),
                namespace: "shop".to_string(),
                deployment: deployment.to_string(),
                generation: 2,
            },
            status: RolloutStatus::RollingOut,
            origin: "k8s".to_string(),
            metadata: RolloutMetadata {
                team: Some("storefront".to_string()),
                ..RolloutMetadata::default()
            },
            started_at: Utc::now(),
        }
    }

    fn firing(fingerprint: &str) -> NewAlert {
        NewAlert {
            fingerprint: fingerprint.to_string(),
            status: AlertStatus::Firing,
            starts_at: None,
            ends_at: None,
            labels: BTreeMap::from([("alertname".to_string(), "HighLatency".to_string())]),
            annotations: BTreeMap::new(),
            raw: json!({"fingerprint": fingerprint}),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rollout_insert_is_idempotent() {
        let (_dir, store) = store();
        let new = new_rollout("web");

        let (first, created) = store.create_rollout_if_absent(new.clone()).await.unwrap();
        assert!(created);
        let (second, created) = store.create_rollout_if_absent(new).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, RolloutStatus::RollingOut);
        assert_eq!(second.metadata.team.as_deref(), Some("storefront"));
    }

    #[tokio::test]
    async fn test_fail_rollout_records_reason_and_job_together() {
        let (_dir, store) = store();
        let (rollout, _) = store.create_rollout_if_absent(new_rollout("web")).await.unwrap();
        let now = Utc::now();

        let job = store
            .fail_rollout(rollout.id, "progress_deadline: Progressing=False", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.target, JobTarget::Rollout(rollout.id));
        assert!(store
            .fail_rollout(rollout.id, "timeout", now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .update_rollout_status(rollout.id, RolloutStatus::Failed, now)
            .await
            .is_err());

        let stored = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::Failed);
        assert!(stored.failed_at.is_some());
        assert_eq!(
            stored.metadata.failure.as_deref(),
            Some("progress_deadline: Progressing=False")
        );
        assert_eq!(stored.metadata.team.as_deref(), Some("storefront"));
        assert_eq!(store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_index_allows_new_incident_after_resolve() {
        let (_dir, store) = store();
        let new = NewIncident {
            cluster: "ci-cluster".to_string(),
            namespace: "batch".to_string(),
            incident_type: IncidentType::HighEvictionRate,
            started_at: Utc::now(),
            metadata: json!({"evictions": 8}),
        };

        let (first, job) = store.create_incident_if_absent(new.clone()).await.unwrap();
        assert_eq!(job.unwrap().target, JobTarget::NamespaceIncident(first.id));
        let (again, job) = store.create_incident_if_absent(new.clone()).await.unwrap();
        assert!(job.is_none());
        assert_eq!(first.id, again.id);

        assert!(store.begin_incident_investigation(first.id).await.unwrap());
        store
            .update_incident_status(first.id, IncidentStatus::Resolved, Utc::now())
            .await
            .unwrap();
        assert!(!store.begin_incident_investigation(first.id).await.unwrap());
        assert_eq!(
            store.get_incident(first.id).await.unwrap().unwrap().status,
            IncidentStatus::Resolved
        );

        let (second, job) = store.create_incident_if_absent(new).await.unwrap();
        assert!(job.is_some());
        assert_ne!(first.id, second.id);
        assert_eq!(store.list_open_incidents("ci-cluster").await.unwrap().len(), 1);
        assert_eq!(store.list_pending_jobs(&[JobKind::Namespace]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_when_nothing_claimed() {
        let (_dir, store) = store();
        let window = ChronoDuration::hours(24);
        store.record_alert(firing("fp"), window).await.unwrap();
        let (suppressed, admitted) = store.record_alert(firing("fp"), window).await.unwrap();
        assert!(!admitted);
        assert!(suppressed.batched);

        let batch = NewAlertBatch {
            primary_fingerprint: "fp".to_string(),
            namespace: "default".to_string(),
            service: "unknown".to_string(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            summary: "x".to_string(),
            created_at: Utc::now(),
        };
        let scope = JobScope {
            cluster: "ci-cluster".to_string(),
            namespace: "default".to_string(),
        };
        assert!(store
            .create_batch(batch, &[suppressed.id], scope)
            .await
            .unwrap()
            .is_none());
        assert!(store.get_batch(1).await.unwrap().is_none());
        assert!(store.list_pending_jobs(&[JobKind::Alert]).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_connections_admit_one_investigation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fyr.db");
        let replicas = [
            Arc::new(SqliteStore::open(&path).unwrap()),
            Arc::new(SqliteStore::open(&path).unwrap()),
        ];

        let mut deliveries = Vec::new();
        for i in 0..6 {
            let store = replicas[i % 2].clone();
            deliveries.push(tokio::spawn(async move {
                store
                    .record_alert(firing("fp-ha"), ChronoDuration::hours(24))
                    .await
                    .unwrap()
                    .1
            }));
        }
        let mut admitted = 0;
        for delivery in deliveries {
            if delivery.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);

        let since = Utc::now() - ChronoDuration::minutes(5);
        assert_eq!(replicas[0].list_unbatched_alerts(since).await.unwrap().len(), 1);
        let state = replicas[1].get_alert_state("fp-ha").await.unwrap().unwrap();
        assert!(state.last_investigated_at.is_some());
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_started_count() {
        let (_dir, store) = store();
        let (web, _) = store.create_rollout_if_absent(new_rollout("web")).await.unwrap();
        let (api, _) = store.create_rollout_if_absent(new_rollout("api")).await.unwrap();
        let now = Utc::now();
        let job = store.fail_rollout(web.id, "timeout", now).await.unwrap().unwrap();
        let other = store.fail_rollout(api.id, "timeout", now).await.unwrap().unwrap();

        let pending = store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(store.list_pending_jobs(&[JobKind::Alert]).await.unwrap().is_empty());

        store.mark_job_running(job.id, now).await.unwrap();
        store
            .finish_job(job.id, JobStatus::Done, Some(3), None, now)
            .await
            .unwrap();

        let since = now - ChronoDuration::hours(1);
        assert_eq!(store.count_started_jobs(since, "ci-cluster", Some("shop")).await.unwrap(), 1);
        assert_eq!(store.count_started_jobs(since, "ci-cluster", Some("other")).await.unwrap(), 0);
        assert_eq!(store.count_started_jobs(since, "ci-cluster", None).await.unwrap(), 1);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.analysis_id, Some(3));
        let still_pending = store.get_job(other.id).await.unwrap().unwrap();
        assert_eq!(still_pending.status, JobStatus::Pending);
        assert_eq!(still_pending.target, JobTarget::Rollout(api.id));
    }
}
