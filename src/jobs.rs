//! Background job registry.
//!
//! A background job is a detached execution on whichever session was
//! active when it started. Its output is buffered in the job record
//! until collected with `fg` or discarded with `kill`; status changes
//! flow through a per-job watch channel so waiters wake without polling.
//!
//! The registry is guarded by a single mutex. `kill` removes the record
//! immediately and fires the job's cancellation token; the underlying
//! execution aborts at its next await point, and whatever it returns
//! afterwards is dropped — best-effort cancellation by design.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;

/// Lifecycle of one job. Transitions `Running -> {Completed, Failed}`
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Snapshot of one background job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: u64,
    pub command: String,
    pub session: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl JobRecord {
    /// Wall-clock duration, up to now for still-running jobs.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

struct JobEntry {
    record: JobRecord,
    status_tx: watch::Sender<JobStatus>,
    status_rx: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    jobs: HashMap<u64, JobEntry>,
}

/// Registry of background jobs, shared with the tasks that run them.
pub struct JobRegistry {
    table: Arc<Mutex<JobTable>>,
    notify: StdMutex<Option<mpsc::UnboundedSender<String>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(JobTable::default())),
            notify: StdMutex::new(None),
        }
    }

    /// Install the sink that receives one line per finished job.
    pub fn set_notification_sink(&self, sink: mpsc::UnboundedSender<String>) {
        *self.notify.lock().expect("notify sink poisoned") = Some(sink);
    }

    fn notify_line(&self, line: String) {
        let sink = self.notify.lock().expect("notify sink poisoned");
        if let Some(sink) = sink.as_ref()
            && sink.send(line).is_err()
        {
            debug!("notification sink closed");
        }
    }

    /// Launch `cmd` on `session` as a detached task and return the job id.
    pub async fn start(
        self: &Arc<Self>,
        session: Arc<dyn Session>,
        session_name: &str,
        cmd: &str,
    ) -> u64 {
        let (status_tx, status_rx) = watch::channel(JobStatus::Running);
        let cancel = CancellationToken::new();

        let id = {
            let mut table = self.table.lock().await;
            table.next_id += 1;
            let id = table.next_id;
            table.jobs.insert(
                id,
                JobEntry {
                    record: JobRecord {
                        id,
                        command: cmd.to_string(),
                        session: session_name.to_string(),
                        started_at: Utc::now(),
                        finished_at: None,
                        status: JobStatus::Running,
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: None,
                    },
                    status_tx,
                    status_rx,
                    cancel: cancel.clone(),
                },
            );
            id
        };

        let registry = Arc::clone(self);
        let command = cmd.to_string();
        tokio::spawn(async move {
            let result = session.execute(&command, &cancel).await;

            let mut table = registry.table.lock().await;
            // A kill may have removed the record while we ran.
            let Some(entry) = table.jobs.get_mut(&id) else {
                return;
            };
            if entry.record.status != JobStatus::Running {
                return;
            }

            let line = match result {
                Ok(out) => {
                    entry.record.status = JobStatus::Completed;
                    entry.record.exit_code = Some(out.exit_code);
                    entry.record.stdout = out.stdout;
                    entry.record.stderr = out.stderr;
                    format!("[job {}] completed (exit {}): {}", id, out.exit_code, command)
                }
                Err(err) => {
                    entry.record.status = JobStatus::Failed;
                    entry.record.stderr = err.to_string();
                    format!("[job {}] failed: {}", id, err)
                }
            };
            entry.record.finished_at = Some(Utc::now());
            let _ = entry.status_tx.send(entry.record.status);
            drop(table);

            registry.notify_line(line);
        });

        id
    }

    /// Snapshot of every job, ordered by id.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        let table = self.table.lock().await;
        let mut records: Vec<JobRecord> =
            table.jobs.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Wait for a job to finish, then remove and return its record.
    ///
    /// Returns `None` for unknown ids and for jobs killed while waiting.
    pub async fn wait(&self, id: u64) -> Option<JobRecord> {
        let mut rx = {
            let table = self.table.lock().await;
            table.jobs.get(&id)?.status_rx.clone()
        };

        loop {
            if *rx.borrow() != JobStatus::Running {
                break;
            }
            if rx.changed().await.is_err() {
                // Sender gone: the record was removed by a kill.
                break;
            }
        }

        let mut table = self.table.lock().await;
        table.jobs.remove(&id).map(|e| e.record)
    }

    /// Kill a job: the record is removed immediately and reported with
    /// exit 137; the execution is cancelled best-effort.
    pub async fn kill(&self, id: u64) -> Option<JobRecord> {
        let mut entry = {
            let mut table = self.table.lock().await;
            table.jobs.remove(&id)?
        };
        entry.cancel.cancel();
        entry.record.status = JobStatus::Failed;
        entry.record.exit_code = Some(137);
        entry.record.stderr = "killed by user".to_string();
        entry.record.finished_at = Some(Utc::now());
        debug!(id, "job killed");
        Some(entry.record)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
