use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use croner::Cron;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{InboundMessage, MessageBus};
use crate::cron::types::*;

/// Service that manages scheduled cron jobs.
///
/// Jobs persist in a single JSON store. A timer task sleeps until the
/// earliest due job, fires it by synthesizing an InboundMessage onto the bus
/// (so it re-enters the normal agent flow), and re-arms.
pub struct CronService {
    store_path: PathBuf,
    jobs: Vec<CronJob>,
    timer_handle: Option<JoinHandle<()>>,
    bus: Arc<MessageBus>,
}

impl CronService {
    pub fn new(store_path: PathBuf, bus: Arc<MessageBus>) -> Self {
        Self {
            store_path,
            jobs: Vec::new(),
            timer_handle: None,
            bus,
        }
    }

    /// Load jobs from disk and start the timer.
    pub async fn start(&mut self) -> Result<()> {
        self.load()?;
        self.arm_timer();
        info!("Cron service started with {} jobs", self.jobs.len());
        Ok(())
    }

    /// Stop the timer.
    pub fn stop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
            info!("Cron service stopped");
        }
    }

    /// List all jobs (optionally including disabled).
    pub fn list_jobs(&mut self, include_disabled: bool) -> Vec<&CronJob> {
        self.refresh_from_disk();
        self.jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .collect()
    }

    /// Add a new cron job.
    pub fn add_job(
        &mut self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        channel: Option<String>,
        to: Option<String>,
    ) -> Result<CronJob> {
        self.refresh_from_disk();
        let now_ms = Utc::now().timestamp_millis();
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let next_run = compute_next_run(&schedule, now_ms)?;

        let job = CronJob {
            id: id.clone(),
            name: name.chars().take(30).collect(),
            enabled: true,
            schedule,
            payload: CronPayload {
                message: message.to_string(),
                channel,
                to,
            },
            state: CronJobState {
                next_run_at_ms: next_run,
                last_run_at_ms: None,
                last_status: None,
            },
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        self.jobs.push(job.clone());
        self.save()?;
        self.arm_timer();

        info!("Added cron job '{}' (id: {})", name, id);
        Ok(job)
    }

    /// Remove a job by ID.
    pub fn remove_job(&mut self, job_id: &str) -> bool {
        self.refresh_from_disk();
        let len_before = self.jobs.len();
        self.jobs.retain(|j| j.id != job_id);
        let removed = self.jobs.len() < len_before;
        if removed {
            let _ = self.save();
            self.arm_timer();
            info!("Removed cron job {job_id}");
        }
        removed
    }

    /// Enable or disable a job.
    pub fn enable_job(&mut self, job_id: &str, enabled: bool) -> Option<&CronJob> {
        self.refresh_from_disk();
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) {
            let now_ms = Utc::now().timestamp_millis();
            job.enabled = enabled;
            job.updated_at_ms = now_ms;
            if enabled {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
            }
            let _ = self.save();
            self.arm_timer();
            self.jobs.iter().find(|j| j.id == job_id)
        } else {
            None
        }
    }

    /// Fire a job immediately, regardless of its schedule.
    pub async fn run_job_now(&mut self, job_id: &str) -> Result<()> {
        self.refresh_from_disk();
        let job = self
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| anyhow::anyhow!("no such cron job: {job_id}"))?
            .clone();
        fire_job(&job, &self.bus).await;
        Ok(())
    }

    /// Refresh in-memory jobs from disk.
    ///
    /// The timer loop updates persisted state independently, so API
    /// operations reload first to avoid acting on stale in-memory data.
    fn refresh_from_disk(&mut self) {
        if let Err(e) = self.load() {
            warn!("Failed to refresh cron store from disk: {e}");
        }
    }

    /// Arm the timer to wake at the next due job.
    ///
    /// Spawns a background loop that sleeps until the next job is due,
    /// executes it, and re-arms for the next one. The loop exits when no
    /// enabled job has a next run time.
    fn arm_timer(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }

        let mut jobs = self.jobs.clone();
        let store_path = self.store_path.clone();
        let bus = self.bus.clone();

        self.timer_handle = Some(tokio::spawn(async move {
            loop {
                let now_ms = Utc::now().timestamp_millis();
                let earliest = jobs
                    .iter()
                    .filter(|j| j.enabled)
                    .filter_map(|j| j.state.next_run_at_ms)
                    .min();

                let sleep_ms = match earliest {
                    Some(t) if t > now_ms => (t - now_ms) as u64,
                    Some(_) => 0,
                    None => break,
                };

                if sleep_ms > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
                }

                execute_due_jobs(&mut jobs, &store_path, &bus).await;

                let has_scheduled = jobs
                    .iter()
                    .any(|j| j.enabled && j.state.next_run_at_ms.is_some());
                if !has_scheduled {
                    break;
                }
            }
        }));
    }

    fn load(&mut self) -> Result<()> {
        if !self.store_path.exists() {
            self.jobs = Vec::new();
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.store_path)?;
        let store: CronStore = serde_json::from_str(&content)?;
        self.jobs = store.jobs;

        // Recompute next_run for enabled recurring jobs
        let now_ms = Utc::now().timestamp_millis();
        for job in &mut self.jobs {
            if job.enabled && job.schedule.kind != ScheduleKind::At {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
            }
        }

        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = CronStore {
            version: 1,
            jobs: self.jobs.clone(),
        };
        let json = serde_json::to_string_pretty(&store)?;
        std::fs::write(&self.store_path, json)?;
        Ok(())
    }
}

/// Synthesize the job's message onto the bus as an inbound message.
async fn fire_job(job: &CronJob, bus: &MessageBus) {
    let channel = job
        .payload
        .channel
        .clone()
        .unwrap_or_else(|| "system".to_string());
    let chat_id = job.payload.to.clone().unwrap_or_else(|| "cron".to_string());

    let mut msg = InboundMessage::new(&channel, "cron", &chat_id, &job.payload.message);
    msg.metadata.insert(
        "cron_job_id".to_string(),
        serde_json::Value::String(job.id.clone()),
    );
    msg.metadata.insert(
        "cron_job_name".to_string(),
        serde_json::Value::String(job.name.clone()),
    );

    if bus.publish_inbound(msg).await == 0 {
        warn!("Cron job '{}' fired with no inbound consumer", job.name);
    }
}

/// Execute due jobs (called by the timer).
async fn execute_due_jobs(jobs: &mut Vec<CronJob>, store_path: &Path, bus: &Arc<MessageBus>) {
    let now_ms = Utc::now().timestamp_millis();

    for job in jobs.iter_mut() {
        if !job.enabled {
            continue;
        }
        let next = match job.state.next_run_at_ms {
            Some(t) => t,
            None => continue,
        };
        if now_ms < next {
            continue;
        }

        info!("Executing cron job '{}' (id: {})", job.name, job.id);
        fire_job(job, bus).await;

        job.state.last_run_at_ms = Some(now_ms);
        job.state.last_status = Some("ok".to_string());
        job.updated_at_ms = now_ms;

        if job.schedule.kind == ScheduleKind::At {
            // One-time jobs disarm after firing
            job.enabled = false;
            job.state.next_run_at_ms = None;
        } else {
            job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
        }
    }

    let store = CronStore {
        version: 1,
        jobs: jobs.clone(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&store) {
        let _ = std::fs::write(store_path, json);
    }
}

/// Compute the next run time for a schedule.
pub(crate) fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Result<Option<i64>> {
    match schedule.kind {
        ScheduleKind::At => match schedule.at_ms {
            Some(t) if t > now_ms => Ok(Some(t)),
            _ => Ok(None),
        },
        ScheduleKind::Every => match schedule.every_ms {
            Some(interval) if interval > 0 => Ok(Some(now_ms + interval)),
            _ => Ok(None),
        },
        ScheduleKind::Cron => {
            let expr = schedule
                .expr
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cron schedule missing expr"))?;

            let cron = Cron::new(expr)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))?;

            let now = chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now);

            match cron.find_next_occurrence(&now, false) {
                Ok(next) => Ok(Some(next.timestamp_millis())),
                Err(_) => Ok(None),
            }
        }
    }
}
