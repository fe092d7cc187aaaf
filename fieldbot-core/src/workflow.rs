// ABOUTME: Job workflow command handlers: registration, job listing, claim/start/complete, stats.
// ABOUTME: Handlers only touch the repository and return reply text; the router does the sending.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::commands::{route, Command, CommandRegistry};
use crate::config::CommandsConfig;
use crate::events::{EventHub, JobEventData, LiveEvent};
use crate::repository::{
    DispatchRepository, Job, JobChange, JobStatus, JobTransition, Technician,
};

/// Shortest digit string accepted as a phone number
const MIN_PHONE_DIGITS: usize = 6;

/// Normalize a phone number to digits with country code.
///
/// Non-digits are dropped and a leading `0` (local format) is replaced by
/// `country_code`. Returns None when fewer than six digits remain.
pub fn normalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let normalized = match digits.strip_prefix('0') {
        Some(local) => format!("{}{}", country_code, local),
        None => digits,
    };
    (normalized.len() >= MIN_PHONE_DIGITS).then_some(normalized)
}

pub struct JobWorkflowService {
    repo: Arc<dyn DispatchRepository>,
    events: EventHub,
    marker: String,
    list_limit: usize,
    country_code: String,
}

impl JobWorkflowService {
    pub fn new(repo: Arc<dyn DispatchRepository>, events: EventHub, config: &CommandsConfig) -> Self {
        Self {
            repo,
            events,
            marker: config.marker.clone(),
            list_limit: config.list_limit.max(1),
            country_code: config.default_country_code.clone(),
        }
    }

    fn sender_phone(&self, command: &Command) -> Option<String> {
        command
            .sender_phone
            .as_deref()
            .and_then(|p| normalize_phone(p, &self.country_code))
    }

    fn not_linked(&self) -> String {
        "Your chat account is not linked to a phone number, so job commands are unavailable."
            .to_string()
    }

    fn please_register(&self) -> String {
        format!(
            "You are not registered as a technician. Send {}register <your name> to sign up.",
            self.marker
        )
    }

    /// Resolve the sender to a technician. The inner `Err` is the refusal reply.
    async fn technician(&self, command: &Command, require_active: bool) -> Result<Result<Technician, String>> {
        let Some(phone) = self.sender_phone(command) else {
            return Ok(Err(self.not_linked()));
        };
        match self.repo.find_technician_by_phone(&phone).await? {
            Some(t) if t.active || !require_active => Ok(Ok(t)),
            Some(t) => {
                tracing::info!(technician_id = t.id, "Inactive technician attempted a job command");
                Ok(Err("Your technician account is inactive. Please contact the office.".to_string()))
            }
            None => Ok(Err(self.please_register())),
        }
    }

    /// Job number argument plus the job, or the refusal reply
    async fn job_arg(&self, command: &Command, usage: &str) -> Result<Result<Job, String>> {
        let Some(number) = command.first_arg() else {
            return Ok(Err(format!("Usage: {}{}", self.marker, usage)));
        };
        match self.repo.find_job_by_number(number).await? {
            Some(job) => Ok(Ok(job)),
            None => Ok(Err(format!("Job {} not found.", number))),
        }
    }

    fn publish(&self, job: &Job, technician: &Technician, notes: Option<String>, make: fn(JobEventData) -> LiveEvent) {
        self.events.publish(make(JobEventData {
            job_number: job.job_number.clone(),
            title: job.title.clone(),
            technician_id: technician.id,
            technician_name: technician.name.clone(),
            notes,
            at: Utc::now(),
        }));
    }

    pub async fn register(&self, command: Command) -> Result<String> {
        let Some(phone) = self.sender_phone(&command) else {
            return Ok(self.not_linked());
        };
        let name = command
            .rest_after(0)
            .map(str::to_string)
            .or_else(|| command.sender_name.clone())
            .filter(|n| !n.trim().is_empty());
        let Some(name) = name else {
            return Ok(format!("Usage: {}register <your name>", self.marker));
        };

        if let Some(existing) = self.repo.find_technician_by_phone(&phone).await? {
            if existing.active {
                return Ok(format!("You are already registered as {}.", existing.name));
            }
        }
        if self.repo.find_pending_registration(&phone).await?.is_some() {
            return Ok("A registration for this number is already pending approval.".to_string());
        }

        let registration = self.repo.create_registration(&phone, &name).await?;
        tracing::info!(
            registration_id = registration.id,
            phone = %phone,
            "Technician registration created"
        );
        Ok(format!(
            "Thanks {}, your registration was received and is waiting for admin approval.",
            name
        ))
    }

    pub async fn list_open_jobs(&self, _command: Command) -> Result<String> {
        let jobs = self
            .repo
            .list_jobs_by_status(JobStatus::Open, self.list_limit)
            .await?;
        if jobs.is_empty() {
            return Ok("No open jobs right now.".to_string());
        }

        let mut reply = format!("Open jobs ({}):\n", jobs.len());
        for job in &jobs {
            reply.push_str(&format_job_line(job));
            reply.push('\n');
        }
        reply.push_str(&format!("Claim one with {}claim <job number>", self.marker));
        Ok(reply)
    }

    pub async fn list_my_jobs(&self, command: Command) -> Result<String> {
        let technician = match self.technician(&command, false).await? {
            Ok(t) => t,
            Err(reply) => return Ok(reply),
        };
        let jobs = self
            .repo
            .list_jobs_for_technician(technician.id, &[JobStatus::Assigned, JobStatus::InProgress])
            .await?;
        if jobs.is_empty() {
            return Ok("You have no active jobs.".to_string());
        }

        let mut reply = format!("Your jobs ({}):\n", jobs.len());
        for job in &jobs {
            reply.push_str(&format!("{} [{}]\n", format_job_line(job), job.status));
        }
        Ok(reply.trim_end().to_string())
    }

    pub async fn claim(&self, command: Command) -> Result<String> {
        let technician = match self.technician(&command, true).await? {
            Ok(t) => t,
            Err(reply) => return Ok(reply),
        };
        let job = match self.job_arg(&command, "claim <job number>").await? {
            Ok(job) => job,
            Err(reply) => return Ok(reply),
        };
        if job.status != JobStatus::Open {
            return Ok(format!("Job {} is already taken.", job.job_number));
        }

        let claimed = self
            .repo
            .transition_job(&JobTransition {
                job_id: job.id,
                expected: vec![JobStatus::Open],
                owner: None,
                change: JobChange::Assign {
                    technician_id: technician.id,
                },
                at: Utc::now(),
            })
            .await?;
        if !claimed {
            tracing::info!(job = %job.job_number, technician_id = technician.id, "Lost claim race");
            return Ok(format!("Job {} is no longer available.", job.job_number));
        }

        tracing::info!(job = %job.job_number, technician_id = technician.id, "Job claimed");
        self.publish(&job, &technician, None, |data| LiveEvent::JobClaimed { data });
        Ok(format!(
            "Job {} ({}) is now assigned to you. Send {}start {} when you begin.",
            job.job_number, job.title, self.marker, job.job_number
        ))
    }

    pub async fn start(&self, command: Command) -> Result<String> {
        let technician = match self.technician(&command, true).await? {
            Ok(t) => t,
            Err(reply) => return Ok(reply),
        };
        let job = match self.job_arg(&command, "start <job number>").await? {
            Ok(job) => job,
            Err(reply) => return Ok(reply),
        };
        if job.technician_id != Some(technician.id) {
            return Ok(format!("Job {} is not yours.", job.job_number));
        }
        match job.status {
            JobStatus::Assigned => {}
            JobStatus::InProgress => {
                return Ok(format!("Job {} is already started.", job.job_number))
            }
            other => {
                return Ok(format!(
                    "Job {} cannot be started (status {}).",
                    job.job_number, other
                ))
            }
        }

        let started = self
            .repo
            .transition_job(&JobTransition {
                job_id: job.id,
                expected: vec![JobStatus::Assigned],
                owner: Some(technician.id),
                change: JobChange::Start,
                at: Utc::now(),
            })
            .await?;
        if !started {
            return Ok(format!("Job {} is already started.", job.job_number));
        }

        tracing::info!(job = %job.job_number, technician_id = technician.id, "Job started");
        self.publish(&job, &technician, None, |data| LiveEvent::JobStarted { data });
        Ok(format!(
            "Job {} started. Send {}complete {} <notes> when finished.",
            job.job_number, self.marker, job.job_number
        ))
    }

    pub async fn complete(&self, command: Command) -> Result<String> {
        let technician = match self.technician(&command, true).await? {
            Ok(t) => t,
            Err(reply) => return Ok(reply),
        };
        let job = match self.job_arg(&command, "complete <job number> [notes]").await? {
            Ok(job) => job,
            Err(reply) => return Ok(reply),
        };
        if job.technician_id != Some(technician.id) {
            return Ok(format!("Job {} is not yours.", job.job_number));
        }
        match job.status {
            JobStatus::Assigned | JobStatus::InProgress => {}
            JobStatus::Completed => {
                return Ok(format!("Job {} is already completed.", job.job_number))
            }
            other => {
                return Ok(format!(
                    "Job {} cannot be completed (status {}).",
                    job.job_number, other
                ))
            }
        }

        let notes = command.rest_after(1).map(str::to_string);
        let completed = self
            .repo
            .transition_job(&JobTransition {
                job_id: job.id,
                expected: vec![JobStatus::Assigned, JobStatus::InProgress],
                owner: Some(technician.id),
                change: JobChange::Complete {
                    notes: notes.clone(),
                },
                at: Utc::now(),
            })
            .await?;
        if !completed {
            return Ok(format!("Job {} is already completed.", job.job_number));
        }

        tracing::info!(job = %job.job_number, technician_id = technician.id, "Job completed");
        self.publish(&job, &technician, notes, |data| LiveEvent::JobCompleted { data });
        Ok(format!("Job {} completed. Thank you!", job.job_number))
    }

    pub async fn stats(&self, command: Command) -> Result<String> {
        let technician = match self.technician(&command, true).await? {
            Ok(t) => t,
            Err(reply) => return Ok(reply),
        };
        let stats = self.repo.job_stats(technician.id).await?;
        Ok(format!(
            "Stats for {}: {} total, {} completed, {} active.",
            technician.name, stats.total, stats.completed, stats.active
        ))
    }
}

fn format_job_line(job: &Job) -> String {
    let mut line = format!("• {} - {}", job.job_number, job.title);
    let location: Vec<&str> = [job.customer_name.as_deref(), job.address.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    if !location.is_empty() {
        line.push_str(&format!(" ({})", location.join(", ")));
    }
    line
}

/// Bind the workflow verbs (and their aliases) into the registry
pub fn register_handlers(registry: &mut CommandRegistry, service: Arc<JobWorkflowService>) {
    let m = service.marker.clone();
    registry.register(
        "register",
        &format!("{}register <name> - sign up as a technician", m),
        route(&service, |svc, cmd| async move { svc.register(cmd).await }),
    );
    registry.register(
        "list-open-jobs",
        &format!("{}jobs - list open jobs", m),
        route(&service, |svc, cmd| async move { svc.list_open_jobs(cmd).await }),
    );
    registry.register(
        "list-my-jobs",
        &format!("{}myjobs - list your active jobs", m),
        route(&service, |svc, cmd| async move { svc.list_my_jobs(cmd).await }),
    );
    registry.register(
        "claim",
        &format!("{}claim <job number> - take an open job", m),
        route(&service, |svc, cmd| async move { svc.claim(cmd).await }),
    );
    registry.register(
        "start",
        &format!("{}start <job number> - start your assigned job", m),
        route(&service, |svc, cmd| async move { svc.start(cmd).await }),
    );
    registry.register(
        "complete",
        &format!("{}complete <job number> [notes] - finish your job", m),
        route(&service, |svc, cmd| async move { svc.complete(cmd).await }),
    );
    registry.register(
        "stats",
        &format!("{}stats - your job counts", m),
        route(&service, |svc, cmd| async move { svc.stats(cmd).await }),
    );
    registry.alias("jobs", "list-open-jobs");
    registry.alias("myjobs", "list-my-jobs");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{parse_message, ParseResult};
    use crate::repository::NewJob;
    use crate::store::SqliteRepository;
    use crate::traits::ChatUser;

    fn setup() -> (SqliteRepository, JobWorkflowService) {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let service = JobWorkflowService::new(
            Arc::new(repo.clone()),
            EventHub::new(),
            &CommandsConfig::default(),
        );
        (repo, service)
    }

    fn cmd(text: &str, phone: Option<&str>) -> Command {
        let ParseResult::Command(command) = parse_message(text, '!') else {
            panic!("not a command: {}", text);
        };
        let mut sender = ChatUser::new("@whatsapp_x:bridge").with_name("Budi");
        if let Some(phone) = phone {
            sender = sender.with_phone(phone);
        }
        command.from_sender(&sender, "!dm:example")
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+62 811-11", "62").as_deref(), Some("6281111"));
        assert_eq!(normalize_phone("081111", "62").as_deref(), Some("6281111"));
        assert_eq!(normalize_phone("6281111", "62").as_deref(), Some("6281111"));
        assert_eq!(normalize_phone("12345", "62"), None);
        assert_eq!(normalize_phone("abc", "62"), None);
    }

    #[tokio::test]
    async fn test_register_twice_reports_pending() {
        let (repo, service) = setup();
        let first = service.register(cmd("!register Budi Santoso", Some("081111"))).await.unwrap();
        assert!(first.contains("waiting for admin approval"));
        assert!(first.contains("Budi Santoso"));

        let second = service.register(cmd("!register Budi", Some("6281111"))).await.unwrap();
        assert!(second.contains("already pending"));
        assert!(repo.find_pending_registration("6281111").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_existing_technician() {
        let (repo, service) = setup();
        repo.insert_technician("6281111", "Budi").unwrap();
        let reply = service.register(cmd("!register", Some("6281111"))).await.unwrap();
        assert!(reply.contains("already registered"));
    }

    #[tokio::test]
    async fn test_register_falls_back_to_display_name() {
        let (repo, service) = setup();
        service.register(cmd("!register", Some("6281111"))).await.unwrap();
        let pending = repo.find_pending_registration("6281111").await.unwrap().unwrap();
        assert_eq!(pending.name, "Budi");
    }

    #[tokio::test]
    async fn test_commands_without_phone_link() {
        let (_repo, service) = setup();
        let reply = service.claim(cmd("!claim JOB1", None)).await.unwrap();
        assert!(reply.contains("not linked"));
    }

    #[tokio::test]
    async fn test_claim_requires_registration() {
        let (repo, service) = setup();
        repo.insert_job(&NewJob {
            job_number: "JOB1".into(),
            title: "Fix".into(),
            ..NewJob::default()
        })
        .unwrap();
        let reply = service.claim(cmd("!claim JOB1", Some("6289999"))).await.unwrap();
        assert!(reply.contains("not registered"));
    }

    #[tokio::test]
    async fn test_claim_usage_and_unknown_job() {
        let (repo, service) = setup();
        repo.insert_technician("6281111", "Budi").unwrap();
        let usage = service.claim(cmd("!claim", Some("6281111"))).await.unwrap();
        assert!(usage.starts_with("Usage: !claim"));
        let missing = service.claim(cmd("!claim NOPE", Some("6281111"))).await.unwrap();
        assert_eq!(missing, "Job NOPE not found.");
    }

    #[tokio::test]
    async fn test_start_someone_elses_job() {
        let (repo, service) = setup();
        repo.insert_technician("6281111", "Budi").unwrap();
        repo.insert_technician("6282222", "Sari").unwrap();
        repo.insert_job(&NewJob {
            job_number: "A".into(),
            title: "Fix".into(),
            ..NewJob::default()
        })
        .unwrap();
        service.claim(cmd("!claim A", Some("6281111"))).await.unwrap();

        let reply = service.start(cmd("!start A", Some("6282222"))).await.unwrap();
        assert_eq!(reply, "Job A is not yours.");
        service.start(cmd("!start A", Some("6281111"))).await.unwrap();
        let again = service.start(cmd("!start A", Some("6281111"))).await.unwrap();
        assert_eq!(again, "Job A is already started.");
    }

    #[tokio::test]
    async fn test_claim_publishes_event() {
        let (repo, service) = setup();
        let mut rx = service.events.subscribe();
        repo.insert_technician("6281111", "Budi").unwrap();
        repo.insert_job(&NewJob {
            job_number: "A".into(),
            title: "Fix".into(),
            ..NewJob::default()
        })
        .unwrap();
        service.claim(cmd("!claim A", Some("6281111"))).await.unwrap();

        match rx.recv().await.unwrap() {
            LiveEvent::JobClaimed { data } => {
                assert_eq!(data.job_number, "A");
                assert_eq!(data.technician_name, "Budi");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_open_jobs_empty_and_bounded() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let config = CommandsConfig {
            list_limit: 2,
            ..CommandsConfig::default()
        };
        let service = JobWorkflowService::new(Arc::new(repo.clone()), EventHub::new(), &config);
        assert_eq!(
            service.list_open_jobs(cmd("!jobs", None)).await.unwrap(),
            "No open jobs right now."
        );

        for n in ["J1", "J2", "J3"] {
            repo.insert_job(&NewJob {
                job_number: n.into(),
                title: "Survey".into(),
                customer_name: Some("PT Maju".into()),
                ..NewJob::default()
            })
            .unwrap();
        }
        let reply = service.list_open_jobs(cmd("!jobs", None)).await.unwrap();
        assert!(reply.starts_with("Open jobs (2):"));
        assert!(reply.contains("(PT Maju)"));
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (repo, service) = setup();
        repo.insert_technician("6281111", "Budi").unwrap();
        repo.insert_job(&NewJob {
            job_number: "A".into(),
            title: "Fix".into(),
            ..NewJob::default()
        })
        .unwrap();
        service.claim(cmd("!claim A", Some("6281111"))).await.unwrap();
        let reply = service.stats(cmd("!stats", Some("6281111"))).await.unwrap();
        assert_eq!(reply, "Stats for Budi: 1 total, 0 completed, 1 active.");
    }

    #[tokio::test]
    async fn test_register_handlers_binds_aliases() {
        let (_repo, service) = setup();
        let mut registry = CommandRegistry::new();
        register_handlers(&mut registry, Arc::new(service));
        for name in ["register", "jobs", "myjobs", "claim", "start", "complete", "stats"] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }
}
