// src/scheduler.rs
//
// =============================================================================
// RAGKEEPER: SCHEDULER
// =============================================================================
//
// Durable, single-process job scheduling. Job definitions persist in SQLite
// with pragma tuning (DELETE journal mode, synchronous=NORMAL, a busy
// timeout) so concurrent readers from the control surface don't collide
// with the dispatch loop's writes. The per-job non-overlap guard locks
// briefly to hand out a per-job mutex, then holds that mutex for the run.

use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::error::IndexError;
use crate::pipeline::PipelineEngine;
use crate::report::RunReport;
use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub id: String,
    pub trigger: Trigger,
    pub config: PipelineConfig,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fire_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatistics {
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub jobs_missed: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_jobs: usize,
    pub scheduler_running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

struct JobStore {
    path: PathBuf,
}

impl JobStore {
    fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, IndexError> {
        Connection::open(&self.path).map_err(|e| IndexError::Schedule(format!("cannot open job store: {e}")))
    }

    fn init(&self) -> Result<(), IndexError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )
        .map_err(|e| IndexError::Schedule(format!("cannot set pragmas: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                trigger_json TEXT NOT NULL,
                config_json TEXT NOT NULL,
                next_fire_time TEXT,
                last_fire_time TEXT,
                last_error TEXT
            );",
        )
        .map_err(|e| IndexError::Schedule(format!("cannot create jobs table: {e}")))?;
        Ok(())
    }

    fn insert(&self, job: &JobDefinition) -> Result<(), IndexError> {
        let conn = self.conn()?;
        let trigger_json = serde_json::to_string(&job.trigger)
            .map_err(|e| IndexError::Schedule(format!("cannot serialize trigger: {e}")))?;
        let config_json = serde_json::to_string(&job.config)
            .map_err(|e| IndexError::Schedule(format!("cannot serialize config: {e}")))?;
        conn.execute(
            "INSERT INTO jobs (id, trigger_json, config_json, next_fire_time, last_fire_time, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                trigger_json,
                config_json,
                job.next_fire_time.map(|t| t.to_rfc3339()),
                job.last_fire_time.map(|t| t.to_rfc3339()),
                job.last_error,
            ],
        )
        .map_err(|e| IndexError::Schedule(format!("cannot insert job {}: {e}", job.id)))?;
        Ok(())
    }

    fn update(&self, job: &JobDefinition) -> Result<(), IndexError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET next_fire_time = ?1, last_fire_time = ?2, last_error = ?3 WHERE id = ?4",
            params![
                job.next_fire_time.map(|t| t.to_rfc3339()),
                job.last_fire_time.map(|t| t.to_rfc3339()),
                job.last_error,
                job.id,
            ],
        )
        .map_err(|e| IndexError::Schedule(format!("cannot update job {}: {e}", job.id)))?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, IndexError> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(|e| IndexError::Schedule(format!("cannot delete job {id}: {e}")))?;
        Ok(changed > 0)
    }

    fn load_all(&self) -> Result<Vec<JobDefinition>, IndexError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, trigger_json, config_json, next_fire_time, last_fire_time, last_error FROM jobs")
            .map_err(|e| IndexError::Schedule(format!("cannot prepare job query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let trigger_json: String = row.get(1)?;
                let config_json: String = row.get(2)?;
                let next_fire_time: Option<String> = row.get(3)?;
                let last_fire_time: Option<String> = row.get(4)?;
                let last_error: Option<String> = row.get(5)?;
                Ok((id, trigger_json, config_json, next_fire_time, last_fire_time, last_error))
            })
            .map_err(|e| IndexError::Schedule(format!("cannot query jobs: {e}")))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, trigger_json, config_json, next_fire_time, last_fire_time, last_error) =
                row.map_err(|e| IndexError::Schedule(format!("cannot read job row: {e}")))?;
            let trigger: Trigger = serde_json::from_str(&trigger_json)
                .map_err(|e| IndexError::Schedule(format!("corrupt trigger for job {id}: {e}")))?;
            let config: PipelineConfig = serde_json::from_str(&config_json)
                .map_err(|e| IndexError::Schedule(format!("corrupt config for job {id}: {e}")))?;
            jobs.push(JobDefinition {
                id,
                trigger,
                config,
                next_fire_time: next_fire_time.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                last_fire_time: last_fire_time.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                last_error,
            });
        }
        Ok(jobs)
    }

    fn exists(&self, id: &str) -> Result<bool, IndexError> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row("SELECT id FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(|e| IndexError::Schedule(format!("cannot check job existence: {e}")))?;
        Ok(found.is_some())
    }
}

struct SchedulerState {
    jobs: HashMap<String, JobDefinition>,
    guards: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    stats: SchedulerStatistics,
}

pub struct Scheduler {
    store: JobStore,
    state: Mutex<SchedulerState>,
    wake: Arc<Notify>,
    clock: SharedClock,
    engine: PipelineEngine,
}

impl Scheduler {
    pub fn open(db_path: impl AsRef<Path>, clock: SharedClock, engine: PipelineEngine) -> Result<Arc<Self>, IndexError> {
        let store = JobStore::open(db_path)?;
        let loaded = store.load_all()?;
        let now = clock.now();

        let mut jobs = HashMap::new();
        let mut guards = HashMap::new();
        for mut job in loaded {
            let recomputed = job
                .trigger
                .next_fire_time(now, job.last_fire_time)
                .unwrap_or(job.next_fire_time);

            // A OneShot trigger returns `None` only when it fired so far in
            // the past that it has gone stale; carrying the old persisted
            // time forward would fire it late on the next dispatch tick, so
            // drop the job instead.
            if recomputed.is_none() && job.trigger.is_one_shot() {
                let _ = store.delete(&job.id);
                continue;
            }

            job.next_fire_time = match (recomputed, job.next_fire_time) {
                (Some(r), Some(persisted)) => Some(r.max(persisted).max(now)),
                (Some(r), None) => Some(r),
                (None, persisted) => persisted,
            };
            guards.insert(job.id.clone(), Arc::new(tokio::sync::Mutex::new(())));
            jobs.insert(job.id.clone(), job);
        }

        let scheduler = Arc::new(Self {
            store,
            state: Mutex::new(SchedulerState {
                jobs,
                guards,
                stats: SchedulerStatistics {
                    scheduler_running: true,
                    started_at: Some(now),
                    ..Default::default()
                },
            }),
            wake: Arc::new(Notify::new()),
            clock,
            engine,
        });
        Ok(scheduler)
    }

    pub fn create_job(&self, id: &str, trigger: Trigger, config: PipelineConfig) -> Result<(), IndexError> {
        if self.store.exists(id)? {
            return Err(IndexError::Schedule(format!("job {id} already exists")));
        }
        let now = self.clock.now();
        let next_fire_time = trigger.next_fire_time(now, None)?;
        let job = JobDefinition {
            id: id.to_string(),
            trigger,
            config,
            next_fire_time,
            last_fire_time: None,
            last_error: None,
        };
        self.store.insert(&job)?;
        {
            let mut state = self.state.lock().unwrap();
            state.guards.insert(id.to_string(), Arc::new(tokio::sync::Mutex::new(())));
            state.jobs.insert(id.to_string(), job);
        }
        self.wake.notify_one();
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<bool, IndexError> {
        let removed = self.store.delete(id)?;
        if removed {
            let mut state = self.state.lock().unwrap();
            state.jobs.remove(id);
            state.guards.remove(id);
        }
        self.wake.notify_one();
        Ok(removed)
    }

    pub fn list_jobs(&self) -> Vec<JobDefinition> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<JobDefinition> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn stats(&self) -> SchedulerStatistics {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats.clone();
        stats.active_jobs = state.jobs.len();
        stats
    }

    /// Enqueues a one-shot execution that bypasses the schedule but still
    /// honours the non-overlap guard.
    pub fn trigger_now(self: &Arc<Self>, id: &str) -> Result<(), IndexError> {
        let exists = self.state.lock().unwrap().jobs.contains_key(id);
        if !exists {
            return Err(IndexError::Schedule(format!("no such job: {id}")));
        }
        let scheduler = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            scheduler.dispatch(&id).await;
        });
        Ok(())
    }

    fn guard_for(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.state.lock().unwrap().guards.get(id).cloned()
    }

    async fn dispatch(self: &Arc<Self>, id: &str) -> Option<RunReport> {
        let guard = self.guard_for(id)?;
        let permit = match guard.try_lock() {
            Ok(p) => p,
            Err(_) => {
                let mut state = self.state.lock().unwrap();
                state.stats.jobs_missed += 1;
                return None;
            }
        };

        let config = {
            let state = self.state.lock().unwrap();
            state.jobs.get(id)?.config.clone()
        };

        let report = self.engine.run(id, &config).await;
        drop(permit);

        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.stats.jobs_executed += 1;
        state.stats.last_execution = Some(now);
        if report.status == crate::report::RunStatus::Failure {
            state.stats.jobs_failed += 1;
            state.stats.last_error = report.error_list.first().cloned();
        }

        if let Some(job) = state.jobs.get_mut(id) {
            job.last_fire_time = Some(now);
            job.last_error = report.error_list.first().cloned();
            if job.trigger.is_one_shot() {
                job.next_fire_time = None;
            } else {
                job.next_fire_time = job.trigger.next_fire_time(now, job.last_fire_time).ok().flatten();
            }
            let _ = self.store.update(job);
            if job.trigger.is_one_shot() {
                let removed_job_id = job.id.clone();
                drop(state);
                let _ = self.store.delete(&removed_job_id);
                let mut state = self.state.lock().unwrap();
                state.jobs.remove(&removed_job_id);
            }
        }

        Some(report)
    }

    fn earliest_wake(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state.jobs.values().filter_map(|j| j.next_fire_time).min()
    }

    fn due_job_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .values()
            .filter(|j| j.next_fire_time.map(|t| t <= now).unwrap_or(false))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Runs the dispatch loop until `shutdown` fires. Self-heals: any panic
    /// inside a single dispatch is caught by `tokio::spawn`'s isolation, and
    /// loop-level errors are logged then the loop resumes after a short
    /// backoff, matching "the loop must self-heal."
    pub async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            let now = self.clock.now();
            let due = self.due_job_ids(now);
            for id in due {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.dispatch(&id).await;
                });
            }

            let sleep_duration = match self.earliest_wake() {
                Some(next) if next > now => (next - now).to_std().unwrap_or(Duration::from_secs(1)),
                Some(_) => Duration::from_millis(50),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {}
                _ = self.wake.notified() => {}
                _ = &mut shutdown => {
                    let mut state = self.state.lock().unwrap();
                    state.stats.scheduler_running = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::perf::PerformanceMonitor;
    use tempfile::tempdir;

    fn engine() -> PipelineEngine {
        PipelineEngine::new(PerformanceMonitor::new(64), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn create_duplicate_job_is_rejected() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = Scheduler::open(dir.path().join("jobs.db"), clock, engine()).unwrap();
        let trigger = Trigger::Interval(crate::trigger::IntervalTrigger {
            minutes: 5,
            hours: 0,
            days: 0,
        });
        scheduler.create_job("daily", trigger.clone(), PipelineConfig::default()).unwrap();
        let err = scheduler.create_job("daily", trigger, PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, IndexError::Schedule(_)));
    }

    #[tokio::test]
    async fn restart_preserves_job_definitions() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        {
            let scheduler = Scheduler::open(&db_path, clock.clone(), engine()).unwrap();
            let trigger = Trigger::Interval(crate::trigger::IntervalTrigger {
                minutes: 5,
                hours: 0,
                days: 0,
            });
            scheduler.create_job("daily", trigger, PipelineConfig::default()).unwrap();
        }
        let scheduler = Scheduler::open(&db_path, clock, engine()).unwrap();
        let jobs = scheduler.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "daily");
    }

    #[tokio::test]
    async fn restart_drops_one_shot_job_expired_past_tolerance() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let fire_at = Utc::now() - chrono::Duration::hours(5);
        {
            let clock: SharedClock = Arc::new(ManualClock::new(fire_at));
            let scheduler = Scheduler::open(&db_path, clock, engine()).unwrap();
            let trigger = Trigger::OneShot(crate::trigger::OneShotTrigger {
                fire_at,
                lateness_tolerance_minutes: Some(60),
            });
            scheduler.create_job("one-off", trigger, PipelineConfig::default()).unwrap();
            assert_eq!(scheduler.list_jobs().len(), 1);
        }

        let later_clock: SharedClock = Arc::new(ManualClock::new(fire_at + chrono::Duration::hours(5)));
        let scheduler = Scheduler::open(&db_path, later_clock, engine()).unwrap();
        assert!(scheduler.list_jobs().is_empty());
    }
}
