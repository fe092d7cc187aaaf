// ABOUTME: SQLite implementation of the dispatch repository (technicians, jobs, outbox).
// ABOUTME: Claim races are settled by conditional UPDATEs that check the current status.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::repository::{
    DispatchRepository, Job, JobChange, JobStats, JobStatus, JobTransition, NewJob,
    NotificationStatus, PendingNotification, Registration, RegistrationStatus, Technician,
};

const JOB_COLUMNS: &str = "id, job_number, title, customer_name, address, status, technician_id,
     created_at, assigned_at, started_at, completed_at, completion_notes";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS technicians (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        phone TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS registrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        phone TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_registrations_one_pending
        ON registrations(phone) WHERE status = 'PENDING';
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_number TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        customer_name TEXT,
        address TEXT,
        status TEXT NOT NULL,
        technician_id INTEGER REFERENCES technicians(id),
        created_at TEXT NOT NULL,
        assigned_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        completion_notes TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient TEXT NOT NULL,
        message TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        sent_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(status, created_at);
";

/// Fixed-width timestamps so text ordering matches time ordering
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_timestamp(idx, r)).transpose()
}

fn parse_enum<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        job_number: row.get(1)?,
        title: row.get(2)?,
        customer_name: row.get(3)?,
        address: row.get(4)?,
        status: parse_enum(5, row.get(5)?)?,
        technician_id: row.get(6)?,
        created_at: parse_timestamp(7, row.get(7)?)?,
        assigned_at: parse_optional_timestamp(8, row.get(8)?)?,
        started_at: parse_optional_timestamp(9, row.get(9)?)?,
        completed_at: parse_optional_timestamp(10, row.get(10)?)?,
        completion_notes: row.get(11)?,
    })
}

fn technician_from_row(row: &Row) -> rusqlite::Result<Technician> {
    Ok(Technician {
        id: row.get(0)?,
        phone: row.get(1)?,
        name: row.get(2)?,
        active: row.get::<_, i32>(3)? != 0,
        created_at: parse_timestamp(4, row.get(4)?)?,
    })
}

fn registration_from_row(row: &Row) -> rusqlite::Result<Registration> {
    Ok(Registration {
        id: row.get(0)?,
        phone: row.get(1)?,
        name: row.get(2)?,
        status: parse_enum(3, row.get(3)?)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
    })
}

fn notification_from_row(row: &Row) -> rusqlite::Result<PendingNotification> {
    Ok(PendingNotification {
        id: row.get(0)?,
        recipient: row.get(1)?,
        message: row.get(2)?,
        status: parse_enum(3, row.get(3)?)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        created_at: parse_timestamp(6, row.get(6)?)?,
        sent_at: parse_optional_timestamp(7, row.get(7)?)?,
    })
}

#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // Other processes (the back office) write to the same file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        let repo = Self::from_connection(conn)?;
        tracing::info!(db = %path.display(), "Dispatch repository initialized");
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create dispatch schema")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Insert a job in OPEN state
    pub fn insert_job(&self, job: &NewJob) -> Result<Job> {
        self.insert_job_at(job, Utc::now())
    }

    pub fn insert_job_at(&self, job: &NewJob, created_at: DateTime<Utc>) -> Result<Job> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO jobs (job_number, title, customer_name, address, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.job_number,
                job.title,
                job.customer_name,
                job.address,
                JobStatus::Open.as_str(),
                timestamp(created_at),
            ],
        )
        .with_context(|| format!("Failed to insert job {}", job.job_number))?;
        let id = db.last_insert_rowid();
        let mut stmt = db.prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))?;
        Ok(stmt.query_row(params![id], job_from_row)?)
    }

    /// Insert an active technician
    pub fn insert_technician(&self, phone: &str, name: &str) -> Result<Technician> {
        let db = self.conn()?;
        let now = Utc::now();
        db.execute(
            "INSERT INTO technicians (phone, name, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![phone, name, timestamp(now)],
        )
        .with_context(|| format!("Failed to insert technician {}", phone))?;
        Ok(Technician {
            id: db.last_insert_rowid(),
            phone: phone.to_string(),
            name: name.to_string(),
            active: true,
            created_at: now,
        })
    }

    /// Approve the pending registration for a phone, activating the technician
    pub fn approve_registration(&self, phone: &str) -> Result<Technician> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let name: String = tx
            .query_row(
                "SELECT name FROM registrations WHERE phone = ?1 AND status = 'PENDING'",
                params![phone],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    anyhow::anyhow!("No pending registration for {}", phone)
                }
                e => e.into(),
            })?;
        let now = Utc::now();
        tx.execute(
            "UPDATE registrations SET status = 'APPROVED' WHERE phone = ?1 AND status = 'PENDING'",
            params![phone],
        )?;
        tx.execute(
            "INSERT INTO technicians (phone, name, active, created_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(phone) DO UPDATE SET name = excluded.name, active = 1",
            params![phone, name, timestamp(now)],
        )?;
        let technician = tx.query_row(
            "SELECT id, phone, name, active, created_at FROM technicians WHERE phone = ?1",
            params![phone],
            technician_from_row,
        )?;
        tx.commit()?;
        tracing::info!(phone = %phone, technician_id = technician.id, "Registration approved");
        Ok(technician)
    }

    pub fn get_notification(&self, id: i64) -> Result<Option<PendingNotification>> {
        let db = self.conn()?;
        let result = db.query_row(
            "SELECT id, recipient, message, status, attempts, last_error, created_at, sent_at
             FROM notifications WHERE id = ?1",
            params![id],
            notification_from_row,
        );
        match result {
            Ok(n) => Ok(Some(n)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DispatchRepository for SqliteRepository {
    async fn find_technician_by_phone(&self, phone: &str) -> Result<Option<Technician>> {
        let db = self.conn()?;
        let result = db.query_row(
            "SELECT id, phone, name, active, created_at FROM technicians WHERE phone = ?1",
            params![phone],
            technician_from_row,
        );
        match result {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_pending_registration(&self, phone: &str) -> Result<Option<Registration>> {
        let db = self.conn()?;
        let result = db.query_row(
            "SELECT id, phone, name, status, created_at FROM registrations
             WHERE phone = ?1 AND status = 'PENDING'",
            params![phone],
            registration_from_row,
        );
        match result {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_registration(&self, phone: &str, name: &str) -> Result<Registration> {
        let db = self.conn()?;
        let now = Utc::now();
        db.execute(
            "INSERT INTO registrations (phone, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![phone, name, RegistrationStatus::Pending.as_str(), timestamp(now)],
        )
        .with_context(|| format!("Failed to create registration for {}", phone))?;
        Ok(Registration {
            id: db.last_insert_rowid(),
            phone: phone.to_string(),
            name: name.to_string(),
            status: RegistrationStatus::Pending,
            created_at: now,
        })
    }

    async fn find_job_by_number(&self, job_number: &str) -> Result<Option<Job>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE job_number = ?1 COLLATE NOCASE",
            JOB_COLUMNS
        ))?;
        match stmt.query_row(params![job_number], job_from_row) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![status.as_str(), limit as i64], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn list_jobs_for_technician(
        &self,
        technician_id: i64,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM jobs WHERE technician_id = ? AND status IN ({})
             ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS, placeholders
        );
        let mut values = vec![Value::Integer(technician_id)];
        values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));

        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let jobs = stmt
            .query_map(params_from_iter(values.iter()), job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn transition_job(&self, transition: &JobTransition) -> Result<bool> {
        let at = Value::Text(timestamp(transition.at));
        let (assignments, mut values) = match &transition.change {
            JobChange::Assign { technician_id } => (
                "status = ?, technician_id = ?, assigned_at = ?",
                vec![
                    Value::Text(JobStatus::Assigned.as_str().to_string()),
                    Value::Integer(*technician_id),
                    at,
                ],
            ),
            JobChange::Start => (
                "status = ?, started_at = ?",
                vec![Value::Text(JobStatus::InProgress.as_str().to_string()), at],
            ),
            JobChange::Complete { notes } => (
                "status = ?, completed_at = ?, completion_notes = ?",
                vec![
                    Value::Text(JobStatus::Completed.as_str().to_string()),
                    at,
                    notes.clone().map(Value::Text).unwrap_or(Value::Null),
                ],
            ),
        };

        let mut sql = format!("UPDATE jobs SET {} WHERE id = ?", assignments);
        values.push(Value::Integer(transition.job_id));
        if !transition.expected.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                vec!["?"; transition.expected.len()].join(", ")
            ));
            values.extend(
                transition
                    .expected
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if let Some(owner) = transition.owner {
            sql.push_str(" AND technician_id = ?");
            values.push(Value::Integer(owner));
        }

        let db = self.conn()?;
        let changed = db.execute(&sql, params_from_iter(values.iter()))?;
        Ok(changed == 1)
    }

    async fn job_stats(&self, technician_id: i64) -> Result<JobStats> {
        let db = self.conn()?;
        let (total, completed, active) = db.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status IN ('ASSIGNED', 'IN_PROGRESS') THEN 1 ELSE 0 END)
             FROM jobs WHERE technician_id = ?1",
            params![technician_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )?;
        Ok(JobStats {
            total: total as u64,
            completed: completed.unwrap_or(0) as u64,
            active: active.unwrap_or(0) as u64,
        })
    }

    async fn list_pending_notifications(&self, limit: usize) -> Result<Vec<PendingNotification>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, recipient, message, status, attempts, last_error, created_at, sent_at
             FROM notifications WHERE status = 'PENDING'
             ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let notifications = stmt
            .query_map(params![limit as i64], notification_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notifications)
    }

    async fn mark_notification_sent(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE notifications SET status = ?1, sent_at = ?2 WHERE id = ?3",
            params![NotificationStatus::Sent.as_str(), timestamp(at), id],
        )?;
        Ok(())
    }

    async fn record_notification_failure(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<NotificationStatus> {
        let db = self.conn()?;
        db.execute(
            "UPDATE notifications SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        let attempts: u32 = db.query_row(
            "SELECT attempts FROM notifications WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if max_attempts > 0 && attempts >= max_attempts {
            db.execute(
                "UPDATE notifications SET status = ?1 WHERE id = ?2",
                params![NotificationStatus::Failed.as_str(), id],
            )?;
            return Ok(NotificationStatus::Failed);
        }
        Ok(NotificationStatus::Pending)
    }

    async fn enqueue_notification(&self, recipient: &str, message: &str) -> Result<i64> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO notifications (recipient, message, status, attempts, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                recipient,
                message,
                NotificationStatus::Pending.as_str(),
                timestamp(Utc::now())
            ],
        )?;
        Ok(db.last_insert_rowid())
    }
}
