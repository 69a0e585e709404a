// Pawnbutler Core — Cron task store & heartbeat
// Scheduled automations: each job carries a cron expression, a task
// description, and a target agent. The store is a single JSON array
// rewritten atomically on every mutation; a 60-second heartbeat posts a
// `task` message to the target agent whenever a job comes due. One-shot
// jobs are deleted after their terminal run.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::atoms::constants::HEARTBEAT_INTERVAL_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{AgentMessage, AgentMessageType};
use crate::engine::AgentEngine;
use crate::events::EngineEvent;

// ── CronJob ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// Standard cron expression, 5-field (min hr dom mon dow) or 6-field
    /// with leading seconds.
    pub schedule: String,
    pub task_description: String,
    pub target_agent: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_result: Option<String>,
    pub run_count: u64,
    pub one_shot: bool,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        task_description: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Self {
        CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            schedule: schedule.into(),
            task_description: task_description.into(),
            target_agent: target_agent.into(),
            enabled: true,
            last_run_at: None,
            last_run_result: None,
            run_count: 0,
            one_shot: false,
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// The next fire time strictly after `after`, or None for an invalid
    /// expression.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        parse_schedule(&self.schedule)?.after(&after).next()
    }

    /// Due = enabled, valid schedule, and a fire time between the last run
    /// (or creation) and now has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let anchor = match self.last_run_at {
            Some(last) => last,
            // Never ran: due as soon as any past fire time exists in the
            // last heartbeat window's worth of slack.
            None => now - chrono::Duration::seconds(HEARTBEAT_INTERVAL_SECS as i64 * 2),
        };
        match self.next_run_after(anchor) {
            Some(next) => next <= now,
            None => false,
        }
    }
}

/// The `cron` crate wants a 6-field expression (sec min hr dom mon dow);
/// accept the common 5-field form by prefixing seconds.
fn parse_schedule(expr: &str) -> Option<cron::Schedule> {
    let full = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&full).ok()
}

/// Validate a schedule string (used by config validation and job CRUD).
pub fn validate_schedule(expr: &str) -> Result<(), String> {
    match parse_schedule(expr) {
        Some(_) => Ok(()),
        None => Err(format!("invalid cron expression '{}'", expr)),
    }
}

// ── TaskStore ──────────────────────────────────────────────────────────

/// JSON-array-on-disk job store. Every mutation rewrites the whole file
/// atomically (temp file + rename), so a crash can never leave a torn
/// store behind.
pub struct TaskStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TaskStore {
            path: path.into(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> EngineResult<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let jobs: Vec<CronJob> = serde_json::from_str(&content)?;
        let count = jobs.len();
        *self.jobs.lock() = jobs;
        Ok(count)
    }

    fn persist(&self, jobs: &[CronJob]) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(jobs)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn create(&self, job: CronJob) -> EngineResult<String> {
        validate_schedule(&job.schedule)?;
        let mut jobs = self.jobs.lock();
        let id = job.id.clone();
        jobs.push(job);
        self.persist(&jobs)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.jobs.lock().clone()
    }

    pub fn delete(&self, id: &str) -> EngineResult<bool> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() < before;
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> EngineResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| format!("Task not found: {}", id))?;
        job.enabled = enabled;
        self.persist(&jobs)
    }

    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        self.jobs.lock().iter().filter(|j| j.is_due(now)).cloned().collect()
    }

    /// Record a completed run: bump the monotonic run counter, stamp the
    /// result, and delete the job if it was one-shot.
    pub fn record_run(&self, id: &str, result: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let mut jobs = self.jobs.lock();
        let Some(index) = jobs.iter().position(|j| j.id == id) else {
            return Err(format!("Task not found: {}", id).into());
        };
        {
            let job = &mut jobs[index];
            job.run_count += 1;
            job.last_run_at = Some(now);
            job.last_run_result = Some(result.to_string());
        }
        if jobs[index].one_shot {
            info!("[tasks] One-shot job '{}' completed, deleting", jobs[index].name);
            jobs.remove(index);
        }
        self.persist(&jobs)
    }
}

// ── Heartbeat ──────────────────────────────────────────────────────────

/// Run the scheduler loop: every 60 s, post a `task` message to each due
/// job's target agent. Runs until the engine stops.
pub async fn run_heartbeat(engine: Arc<AgentEngine>, store: Arc<TaskStore>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("[tasks] Heartbeat started ({}s interval)", HEARTBEAT_INTERVAL_SECS);

    loop {
        ticker.tick().await;
        if !engine.is_running() {
            info!("[tasks] Engine stopped; heartbeat exiting");
            break;
        }
        let now = Utc::now();
        for job in store.due_jobs(now) {
            info!("[tasks] Job '{}' due, dispatching to '{}'", job.name, job.target_agent);
            let send_result = engine.bus().send(AgentMessage::new(
                "scheduler",
                job.target_agent.as_str(),
                AgentMessageType::Task,
                json!({
                    "jobId": job.id,
                    "jobName": job.name,
                    "text": job.task_description,
                    "scheduledAt": now,
                }),
            ));
            let outcome = match send_result {
                Ok(()) => {
                    engine.events().publish(EngineEvent::TaskTriggered {
                        job_id: job.id.clone(),
                        job_name: job.name.clone(),
                        target_agent: job.target_agent.clone(),
                    });
                    "dispatched".to_string()
                }
                Err(e) => {
                    warn!("[tasks] Dispatch of '{}' failed: {}", job.name, e);
                    format!("dispatch failed: {}", e)
                }
            };
            if let Err(e) = store.record_run(&job.id, &outcome, now) {
                warn!("[tasks] Failed to record run for '{}': {}", job.name, e);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        (dir, store)
    }

    #[test]
    fn test_create_validates_schedule() {
        let (_dir, store) = store();
        let bad = CronJob::new("bad", "not a cron", "x", "butler");
        assert!(store.create(bad).is_err());

        let good = CronJob::new("good", "*/5 * * * *", "x", "butler");
        assert!(store.create(good).is_ok());
    }

    #[test]
    fn test_five_and_six_field_schedules() {
        assert!(validate_schedule("*/5 * * * *").is_ok());
        assert!(validate_schedule("0 0 9 * * Mon").is_ok());
        assert!(validate_schedule("every tuesday").is_err());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let store = TaskStore::new(&path);
        store.create(CronJob::new("tick", "* * * * *", "check mail", "butler")).unwrap();

        let restored = TaskStore::new(&path);
        assert_eq!(restored.load().unwrap(), 1);
        assert_eq!(restored.list()[0].name, "tick");
        // Store file is a single JSON array.
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_start().starts_with('['));
    }

    #[test]
    fn test_run_count_monotonic() {
        let (_dir, store) = store();
        let id = store.create(CronJob::new("tick", "* * * * *", "x", "butler")).unwrap();
        for i in 1..=3 {
            store.record_run(&id, "ok", Utc::now()).unwrap();
            assert_eq!(store.get(&id).unwrap().run_count, i);
        }
    }

    #[test]
    fn test_one_shot_deleted_after_run() {
        let (_dir, store) = store();
        let id = store
            .create(CronJob::new("once", "* * * * *", "x", "butler").one_shot())
            .unwrap();
        store.record_run(&id, "ok", Utc::now()).unwrap();
        assert!(store.get(&id).is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_due_every_minute_job() {
        let job = CronJob::new("tick", "* * * * *", "x", "butler");
        assert!(job.is_due(Utc::now()));

        let mut ran_just_now = job.clone();
        ran_just_now.last_run_at = Some(Utc::now());
        assert!(!ran_just_now.is_due(Utc::now()));

        let mut ran_long_ago = job;
        ran_long_ago.last_run_at = Some(Utc::now() - chrono::Duration::minutes(5));
        assert!(ran_long_ago.is_due(Utc::now()));
    }

    #[test]
    fn test_disabled_job_never_due() {
        let mut job = CronJob::new("tick", "* * * * *", "x", "butler");
        job.enabled = false;
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        let id = store.create(CronJob::new("tick", "* * * * *", "x", "butler")).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn test_wire_format() {
        let job = CronJob::new("tick", "* * * * *", "check", "butler");
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"taskDescription\""));
        assert!(json.contains("\"targetAgent\""));
        assert!(json.contains("\"oneShot\":false"));
        assert!(json.contains("\"runCount\":0"));
    }
}
