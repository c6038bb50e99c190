//! Status of the dispatched tasks, stored next to the job artifacts.
//!
//! Each state has its own directory: `lambda_tracker/Running/`,
//! `lambda_tracker/Completed/` and `lambda_tracker/Failed/`. A record is only
//! ever created, never rewritten, so a task goes from `Running` to one of the
//! terminal states once and a reader never sees a half-written status.
//!
//! Completion and failure race: the worker reports one, the dispatcher may
//! report the other on a timeout. Both first create the same marker in
//! `lambda_tracker/terminal/`, a create-only write, and only the writer that
//! created it records its status.

use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::store::Db;
use crate::audit::tasks::TaskArgs;
use crate::audit::*;

pub const TRACKER_DIR: &str = "lambda_tracker";
const TERMINAL_DIR: &str = "terminal";

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn dirname(&self) -> &'static str {
        match self {
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dirname())
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_type: String,
    pub error_message: String,
    pub error_stack: String,
}

impl ErrorInfo {
    pub fn from_error(e: &AuditError) -> ErrorInfo {
        ErrorInfo {
            error_type: e.kind().to_string(),
            error_message: e.to_string(),
            error_stack: e.stack(),
        }
    }

    pub fn timeout(waited_secs: u64) -> ErrorInfo {
        ErrorInfo {
            error_type: "Timeout".to_string(),
            error_message: format!("no terminal status after {} seconds without progress", waited_secs),
            error_stack: "".to_string(),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub request_id: String,
    pub status: TaskStatus,
    pub task_args: TaskArgs,
    pub error_info: Option<ErrorInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrackerCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

fn record_name(task_name: &str) -> String {
    format!("{}.json", task_name)
}

fn task_of_record(name: &str) -> Option<String> {
    name.strip_suffix(".json").map(|s| s.to_string())
}

/// Reads and writes the tracker records of a job.
#[derive(Debug, Clone)]
pub struct Tracker {
    db: Db,
}

impl Tracker {
    pub fn new(db: &Db) -> Tracker {
        Tracker { db: db.clone() }
    }

    /// Removes every record. Called when a chunked stage starts.
    pub fn reset(&self) -> AuditResult<usize> {
        let mut n = 0;
        for s in [TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
            n += self.db.delete(TRACKER_DIR, Some(s.dirname()), "*.json")?;
        }
        self.db.delete(TRACKER_DIR, Some(TERMINAL_DIR), "*.json")?;
        debug!("reset: {} tracker records removed", n);
        Ok(n)
    }

    fn create(
        &self,
        status: TaskStatus,
        request_id: &str,
        task_args: &TaskArgs,
        error_info: Option<ErrorInfo>,
    ) -> AuditResult<bool> {
        let record = TrackerRecord {
            request_id: request_id.to_string(),
            status,
            task_args: task_args.clone(),
            error_info,
            timestamp: Utc::now(),
        };
        let name = record_name(&task_args.task_name);
        let bytes = serde_json::to_vec_pretty(&record).context(JsonSnafu {
            location: name.clone(),
        })?;
        let created = self
            .db
            .save_bytes_new(bytes, TRACKER_DIR, Some(status.dirname()), &name)?;
        if !created {
            warn!(
                "tracker: {} already has a {} record",
                task_args.task_name, status
            );
        }
        Ok(created)
    }

    pub fn mark_running(&self, request_id: &str, task_args: &TaskArgs) -> AuditResult<bool> {
        self.create(TaskStatus::Running, request_id, task_args, None)
    }

    /// Records the success of a task, unless it already reached a terminal state
    /// (for instance when the dispatcher gave up on it).
    pub fn mark_completed(&self, request_id: &str, task_args: &TaskArgs) -> AuditResult<bool> {
        if !self.claim_terminal(TaskStatus::Completed, request_id, task_args)? {
            return Ok(false);
        }
        self.create(TaskStatus::Completed, request_id, task_args, None)
    }

    pub fn mark_failed(
        &self,
        request_id: &str,
        task_args: &TaskArgs,
        error_info: ErrorInfo,
    ) -> AuditResult<bool> {
        if !self.claim_terminal(TaskStatus::Failed, request_id, task_args)? {
            return Ok(false);
        }
        self.create(TaskStatus::Failed, request_id, task_args, Some(error_info))
    }

    /// Creates the terminal marker of a task. False when another writer owns it.
    fn claim_terminal(
        &self,
        status: TaskStatus,
        request_id: &str,
        task_args: &TaskArgs,
    ) -> AuditResult<bool> {
        let name = record_name(&task_args.task_name);
        let marker = serde_json::json!({"request_id": request_id, "status": status});
        let bytes = serde_json::to_vec(&marker).context(JsonSnafu {
            location: name.clone(),
        })?;
        let claimed = self
            .db
            .save_bytes_new(bytes, TRACKER_DIR, Some(TERMINAL_DIR), &name)?;
        if !claimed {
            info!(
                "tracker: {} already reached a terminal state, dropping {}",
                task_args.task_name, status
            );
        }
        Ok(claimed)
    }

    fn terminal_status(&self, task_name: &str) -> AuditResult<Option<TaskStatus>> {
        let name = record_name(task_name);
        for s in [TaskStatus::Failed, TaskStatus::Completed] {
            if self.db.exists(TRACKER_DIR, Some(s.dirname()), &name)? {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    /// The most advanced status of a task.
    pub fn status(&self, task_name: &str) -> AuditResult<Option<TaskStatus>> {
        if let Some(s) = self.terminal_status(task_name)? {
            return Ok(Some(s));
        }
        if self
            .db
            .exists(TRACKER_DIR, Some(TaskStatus::Running.dirname()), &record_name(task_name))?
        {
            return Ok(Some(TaskStatus::Running));
        }
        Ok(None)
    }

    /// The names of the tasks that have a record in the given state.
    pub fn tasks_in(&self, status: TaskStatus) -> AuditResult<BTreeSet<String>> {
        Ok(self
            .db
            .list(TRACKER_DIR, Some(status.dirname()), "*.json")?
            .iter()
            .filter_map(|n| task_of_record(n))
            .collect())
    }

    pub fn counts(&self) -> AuditResult<TrackerCounts> {
        Ok(TrackerCounts {
            running: self.tasks_in(TaskStatus::Running)?.len(),
            completed: self.tasks_in(TaskStatus::Completed)?.len(),
            failed: self.tasks_in(TaskStatus::Failed)?.len(),
        })
    }

    pub fn load(&self, status: TaskStatus, task_name: &str) -> AuditResult<TrackerRecord> {
        self.db
            .load_json(TRACKER_DIR, Some(status.dirname()), &record_name(task_name))
    }

    /// The failure records, in the order of the task names.
    pub fn failed_records(&self) -> AuditResult<Vec<TrackerRecord>> {
        self.tasks_in(TaskStatus::Failed)?
            .iter()
            .map(|t| self.load(TaskStatus::Failed, t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::settings::JobSettings;
    use crate::audit::tasks::Stage;

    fn args(idx: usize) -> TaskArgs {
        let s: JobSettings =
            serde_json::from_str(r#"{"job_name": "j", "job_root": "/tmp/j"}"#).unwrap();
        TaskArgs::new(&s, Stage::Marks, "a", idx)
    }

    #[test]
    fn a_task_reaches_one_terminal_state() {
        let db = Db::in_memory("t").unwrap();
        let t = Tracker::new(&db);
        let a = args(0);
        assert_eq!(t.status(&a.task_name).unwrap(), None);
        assert!(t.mark_running("r1", &a).unwrap());
        assert_eq!(t.status(&a.task_name).unwrap(), Some(TaskStatus::Running));
        assert!(t.mark_failed("r1", &a, ErrorInfo::timeout(5)).unwrap());
        // A late worker does not turn the failure into a success.
        assert!(!t.mark_completed("r1", &a).unwrap());
        assert_eq!(t.status(&a.task_name).unwrap(), Some(TaskStatus::Failed));
        let c = t.counts().unwrap();
        assert_eq!((c.running, c.completed, c.failed), (1, 0, 1));

        let failed = t.failed_records().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_info.as_ref().unwrap().error_type, "Timeout");
        assert_eq!(failed[0].task_args, a);
    }

    #[test]
    fn completion_and_failure_race_for_one_terminal_state() {
        for round in 0..20 {
            let db = Db::in_memory("t").unwrap();
            let t = Tracker::new(&db);
            let a = args(round);
            t.mark_running("r", &a).unwrap();
            let barrier = std::sync::Barrier::new(2);
            let (completed, failed) = std::thread::scope(|scope| {
                let c = scope.spawn(|| {
                    barrier.wait();
                    t.mark_completed("worker", &a).unwrap()
                });
                let f = scope.spawn(|| {
                    barrier.wait();
                    t.mark_failed("dispatcher", &a, ErrorInfo::timeout(1)).unwrap()
                });
                (c.join().unwrap(), f.join().unwrap())
            });
            assert!(completed ^ failed, "round {}", round);
            let counts = t.counts().unwrap();
            assert_eq!(counts.completed + counts.failed, 1);
            let expected = if completed {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            assert_eq!(t.status(&a.task_name).unwrap(), Some(expected));
        }
    }

    #[test]
    fn reset_removes_all_records() {
        let db = Db::in_memory("t").unwrap();
        let t = Tracker::new(&db);
        t.mark_running("r0", &args(0)).unwrap();
        t.mark_completed("r0", &args(0)).unwrap();
        t.mark_running("r1", &args(1)).unwrap();
        assert_eq!(t.reset().unwrap(), 3);
        assert_eq!(t.counts().unwrap(), TrackerCounts::default());
        // The records can be created again after a reset.
        assert!(t.mark_running("r2", &args(0)).unwrap());
        assert!(t.mark_completed("r2", &args(0)).unwrap());
    }

    #[test]
    fn records_travel_as_json() {
        let db = Db::in_memory("t").unwrap();
        let t = Tracker::new(&db);
        t.mark_running("req", &args(3)).unwrap();
        let text = db
            .load_text(TRACKER_DIR, Some("Running"), "a_chunk_0003.json")
            .unwrap();
        let js: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(js["request_id"], "req");
        assert_eq!(js["status"], "Running");
        assert!(js["error_info"].is_null());
        assert_eq!(js["task_args"]["task_name"], "a_chunk_0003");
    }
}
