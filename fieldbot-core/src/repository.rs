// ABOUTME: Repository contract for technicians, jobs and pending notifications.
// ABOUTME: Domain records plus the async trait the workflow and outbox depend on.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle. Stored upper-case in the database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Open,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Assigned => "ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "ASSIGNED" => Ok(Self::Assigned),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => anyhow::bail!("Unknown job status: {}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Technician {
    pub id: i64,
    /// Normalized phone number (digits only, with country code)
    pub phone: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Approved,
    Rejected,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            _ => anyhow::bail!("Unknown registration status: {}", s),
        }
    }
}

/// A technician sign-up awaiting admin approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: i64,
    pub phone: String,
    pub name: String,
    pub status: RegistrationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_number: String,
    pub title: String,
    pub customer_name: Option<String>,
    pub address: Option<String>,
    pub status: JobStatus,
    pub technician_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_notes: Option<String>,
}

/// Fields for seeding a job
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_number: String,
    pub title: String,
    pub customer_name: Option<String>,
    pub address: Option<String>,
}

/// Target state of a conditional job update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobChange {
    Assign { technician_id: i64 },
    Start,
    Complete { notes: Option<String> },
}

/// A write applied only if the job is still in `expected` state
/// (and, when set, still owned by `owner`)
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub job_id: i64,
    pub expected: Vec<JobStatus>,
    pub owner: Option<i64>,
    pub change: JobChange,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub completed: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            _ => anyhow::bail!("Unknown notification status: {}", s),
        }
    }
}

/// Durable outbox record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingNotification {
    pub id: i64,
    pub recipient: String,
    pub message: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Persistence consumed by the gateway core. Only `transition_job` is conditional;
/// every other write is last-writer-wins.
#[async_trait]
pub trait DispatchRepository: Send + Sync {
    async fn find_technician_by_phone(&self, phone: &str) -> Result<Option<Technician>>;
    async fn find_pending_registration(&self, phone: &str) -> Result<Option<Registration>>;
    async fn create_registration(&self, phone: &str, name: &str) -> Result<Registration>;

    async fn find_job_by_number(&self, job_number: &str) -> Result<Option<Job>>;
    /// Newest first
    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>>;
    async fn list_jobs_for_technician(
        &self,
        technician_id: i64,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>>;
    /// Returns false when the precondition no longer holds (zero rows changed)
    async fn transition_job(&self, transition: &JobTransition) -> Result<bool>;
    async fn job_stats(&self, technician_id: i64) -> Result<JobStats>;

    /// Oldest first
    async fn list_pending_notifications(&self, limit: usize) -> Result<Vec<PendingNotification>>;
    async fn mark_notification_sent(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    /// Count a failed attempt; dead-letters the row once `max_attempts` is reached (0 = never).
    /// Returns the new status.
    async fn record_notification_failure(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<NotificationStatus>;
    async fn enqueue_notification(&self, recipient: &str, message: &str) -> Result<i64>;
}
