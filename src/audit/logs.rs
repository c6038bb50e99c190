// Per-task scratch logs and their consolidation at the end of a stage.

use log::{info, warn};

use crate::audit::store::Db;
use crate::audit::tasks::{Stage, LOGS_DIR};
use crate::audit::tracker::TrackerRecord;
use crate::audit::*;

pub const LOG_NAME: &str = "log.txt";
pub const EXCEPTION_REPORT_NAME: &str = "exception_report.txt";

/// The log and the exception file of one task. Every line is also sent to the
/// process logger.
#[derive(Debug, Clone, Default)]
pub struct TaskLog {
    task_name: String,
    lines: Vec<String>,
    exceptions: Vec<String>,
}

impl TaskLog {
    pub fn new(task_name: &str) -> TaskLog {
        TaskLog {
            task_name: task_name.to_string(),
            ..TaskLog::default()
        }
    }

    pub fn info(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}: {}", self.task_name, line);
        self.lines.push(line);
    }

    /// A problem that does not stop the task, such as a ballot that cannot be
    /// read. It goes to both files.
    pub fn exception(&mut self, line: impl Into<String>) {
        let line = line.into();
        warn!("{}: {}", self.task_name, line);
        self.lines.push(format!("EXCEPTION {}", line));
        self.exceptions.push(line);
    }

    pub fn num_exceptions(&self) -> usize {
        self.exceptions.len()
    }

    pub fn log_name(&self) -> String {
        format!("{}_log.txt", self.task_name)
    }

    pub fn exc_name(&self) -> String {
        format!("{}_exc.txt", self.task_name)
    }

    /// Writes the files into `{stage}/logs/`. The exception file is only written
    /// when there is something in it.
    pub fn upload(&self, db: &Db, stage: Stage) -> AuditResult<()> {
        let mut text = self.lines.join("\n");
        text.push('\n');
        db.save_text(&text, stage.dirname(), Some(LOGS_DIR), &self.log_name())?;
        if !self.exceptions.is_empty() {
            let mut exc = self.exceptions.join("\n");
            exc.push('\n');
            db.save_text(&exc, stage.dirname(), Some(LOGS_DIR), &self.exc_name())?;
        }
        Ok(())
    }
}

fn concat_files(db: &Db, stage: Stage, names: &[String], suffix: &str) -> AuditResult<String> {
    let mut res = String::new();
    for name in names.iter() {
        let task = name.strip_suffix(suffix).unwrap_or(name);
        let text = db.load_text(stage.dirname(), Some(LOGS_DIR), name)?;
        res.push_str(&format!("===== {} =====\n", task));
        res.push_str(&text);
        if !text.ends_with('\n') {
            res.push('\n');
        }
    }
    Ok(res)
}

/// Merges the task logs of a stage into `{stage}/log.txt` and the exception files
/// into `{stage}/exception_report.txt`, followed by the failed tasks.
/// Returns the number of exception lines.
pub fn consolidate(db: &Db, stage: Stage, failed: &[TrackerRecord]) -> AuditResult<usize> {
    let log_names = db.list(stage.dirname(), Some(LOGS_DIR), "*_log.txt")?;
    let log = concat_files(db, stage, &log_names, "_log.txt")?;
    db.save_text(&log, stage.dirname(), None, LOG_NAME)?;

    let exc_names = db.list(stage.dirname(), Some(LOGS_DIR), "*_exc.txt")?;
    let mut report = concat_files(db, stage, &exc_names, "_exc.txt")?;
    let mut num_lines = report
        .lines()
        .filter(|l| !l.starts_with("====="))
        .count();
    let stage_failures: Vec<&TrackerRecord> = failed
        .iter()
        .filter(|r| r.task_args.stage == stage)
        .collect();
    if !stage_failures.is_empty() {
        report.push_str("===== failed tasks =====\n");
        for r in stage_failures {
            let (error_type, message, stack) = match &r.error_info {
                Some(e) => (e.error_type.as_str(), e.error_message.as_str(), e.error_stack.as_str()),
                None => ("Unknown", "", ""),
            };
            report.push_str(&format!(
                "{} [{}] {}: {}\n",
                r.task_args.task_name, r.request_id, error_type, message
            ));
            for l in stack.lines().skip(1) {
                report.push_str(&format!("    {}\n", l));
            }
            num_lines += 1;
        }
    }
    db.save_text(&report, stage.dirname(), None, EXCEPTION_REPORT_NAME)?;
    info!(
        "consolidate: {}: {} task logs, {} exception lines",
        stage,
        log_names.len(),
        num_lines
    );
    Ok(num_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::settings::JobSettings;
    use crate::audit::tasks::TaskArgs;
    use crate::audit::tracker::{ErrorInfo, TaskStatus};

    #[test]
    fn merges_logs_and_failures() {
        let db = Db::in_memory("t").unwrap();
        let mut a = TaskLog::new("a_chunk_0000");
        a.info("3 ballots");
        a.exception("ballot 0002: unreadable");
        a.upload(&db, Stage::Bif).unwrap();
        let mut b = TaskLog::new("a_chunk_0001");
        b.info("2 ballots");
        b.upload(&db, Stage::Bif).unwrap();
        assert!(!db.exists("bif", Some(LOGS_DIR), "a_chunk_0001_exc.txt").unwrap());

        let s: JobSettings =
            serde_json::from_str(r#"{"job_name": "j", "job_root": "/tmp/j"}"#).unwrap();
        let failed = TrackerRecord {
            request_id: "r2".to_string(),
            status: TaskStatus::Failed,
            task_args: TaskArgs::new(&s, Stage::Bif, "a", 2),
            error_info: Some(ErrorInfo {
                error_type: "WorkerFailure".to_string(),
                error_message: "boom".to_string(),
                error_stack: "boom\ncaused by: disk".to_string(),
            }),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(consolidate(&db, Stage::Bif, &[failed]).unwrap(), 2);

        let log = db.load_text("bif", None, LOG_NAME).unwrap();
        assert!(log.contains("===== a_chunk_0000 =====\n3 ballots\n"));
        assert!(log.contains("===== a_chunk_0001 =====\n2 ballots\n"));
        let exc = db.load_text("bif", None, EXCEPTION_REPORT_NAME).unwrap();
        assert!(exc.contains("ballot 0002: unreadable"));
        assert!(exc.contains("a_chunk_0002 [r2] WorkerFailure: boom"));
        assert!(exc.contains("    caused by: disk"));
    }
}
