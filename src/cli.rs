// ABOUTME: Command-line surface: subcommands plus output formatting for the offline tools
// ABOUTME: `status` reads the snapshot file; `enqueue`, `add-job` and `approve` write to the database

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use fieldbot_core::config::Config;
use fieldbot_core::paths;
use fieldbot_core::repository::{DispatchRepository, NewJob};
use fieldbot_core::status::{format_uptime, read_snapshot, StatusSnapshot};
use fieldbot_core::store::SqliteRepository;
use fieldbot_core::workflow::normalize_phone;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fieldbot")]
#[command(about = "Field-service job dispatch over a consumer chat network")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the gateway (default)
    Run,
    /// Show the status snapshot written by a running gateway
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Queue a notification for the outbox to deliver
    Enqueue {
        /// Phone number, Matrix user ID or room ID
        recipient: String,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Add an open job
    AddJob {
        job_number: String,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,
    },
    /// Approve a pending technician registration
    Approve { phone: String },
}

/// Config for the offline tools; absent config falls back to default paths
fn tool_config() -> Option<Config> {
    match Config::load_unvalidated() {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::debug!(error = %e, "No usable config; using default paths");
            None
        }
    }
}

fn open_repository(config: Option<&Config>) -> Result<SqliteRepository> {
    let path = config
        .map(|c| PathBuf::from(&c.database.path))
        .unwrap_or_else(paths::database_file);
    SqliteRepository::open(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

pub fn print_status(json: bool) -> Result<()> {
    let config = tool_config();
    let path = config
        .as_ref()
        .map(|c| PathBuf::from(&c.status.snapshot_path))
        .unwrap_or_else(paths::status_file);
    let interval_secs = config.as_ref().map(|c| c.status.interval_secs).unwrap_or(5);

    let snapshot = read_snapshot(&path)?.with_context(|| {
        format!(
            "No status snapshot at {}; is the gateway running?",
            path.display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let stale_after = ChronoDuration::seconds((interval_secs.max(1) * 3) as i64);
        println!("{}", format_status(&snapshot, Utc::now(), stale_after));
    }
    Ok(())
}

/// Human-readable status; flags snapshots older than `stale_after`
pub fn format_status(
    snapshot: &StatusSnapshot,
    now: DateTime<Utc>,
    stale_after: ChronoDuration,
) -> String {
    let account = match &snapshot.user {
        Some(user) => match &user.name {
            Some(name) => format!("{} ({})", user.id, name),
            None => user.id.clone(),
        },
        None => "(not signed in)".to_string(),
    };
    let stale = if now - snapshot.last_update > stale_after {
        " (stale; the gateway may not be running)"
    } else {
        ""
    };
    let m = &snapshot.messages;

    format!(
        "Connection: {}\nAccount: {}\nUptime: {}\nCommands handled: {}\n\
         Messages: {} received, {} sent, {} send failures\n\
         Notifications: {} sent, {} failed\nLast update: {}{}",
        snapshot.status,
        account,
        format_uptime(snapshot.uptime_seconds),
        snapshot.command_count,
        m.received,
        m.sent,
        m.send_failures,
        m.notifications_sent,
        m.notifications_failed,
        snapshot.last_update.to_rfc3339(),
        stale,
    )
}

pub async fn enqueue(recipient: &str, message: &[String]) -> Result<()> {
    let repo = open_repository(tool_config().as_ref())?;
    let id = repo
        .enqueue_notification(recipient.trim(), &message.join(" "))
        .await?;
    println!("Queued notification {} for {}", id, recipient.trim());
    Ok(())
}

pub fn add_job(
    job_number: &str,
    title: &[String],
    customer: Option<String>,
    address: Option<String>,
) -> Result<()> {
    let repo = open_repository(tool_config().as_ref())?;
    let job = repo.insert_job(&NewJob {
        job_number: job_number.to_string(),
        title: title.join(" "),
        customer_name: customer,
        address,
    })?;
    println!("Added job {} ({}) as {}", job.job_number, job.title, job.status);
    Ok(())
}

pub fn approve(phone: &str) -> Result<()> {
    let config = tool_config();
    let country_code = config
        .as_ref()
        .map(|c| c.commands.default_country_code.clone())
        .unwrap_or_else(|| "62".to_string());
    let phone = normalize_phone(phone, &country_code)
        .with_context(|| format!("Not a valid phone number: {}", phone))?;

    let repo = open_repository(config.as_ref())?;
    let technician = repo.approve_registration(&phone)?;
    println!(
        "Approved {} ({}) as technician #{}",
        technician.name, technician.phone, technician.id
    );
    Ok(())
}
