// Runs one task where it is called, and records its outcome in the tracker.

use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::audit::bif::run_bif_task;
use crate::audit::compare::run_cmpcvr_task;
use crate::audit::context::JobContext;
use crate::audit::logs::TaskLog;
use crate::audit::marks::run_marks_task;
use crate::audit::styles::run_styles_task;
use crate::audit::tasks::{Stage, TaskArgs};
use crate::audit::tracker::{ErrorInfo, TaskStatus, Tracker};
use crate::audit::*;

/// What a delegate reads on its standard input.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: String,
    pub task_args: TaskArgs,
}

/// Routes a task to the code of its stage.
pub fn run_task(ctx: &JobContext, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<()> {
    debug!("run_task: {} ({})", args.task_name, args.stage);
    match args.stage {
        Stage::Bif => run_bif_task(ctx, args, log),
        Stage::Styles => run_styles_task(ctx, args, log),
        Stage::Marks => run_marks_task(ctx, args, log),
        Stage::Cmpcvr => run_cmpcvr_task(ctx, args, log),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Runs a task and records a `Completed` or `Failed` status. Errors and panics
/// of the task do not escape: only a failure to write the tracker is returned.
pub fn execute_task(ctx: &JobContext, request_id: &str, args: &TaskArgs) -> AuditResult<TaskStatus> {
    let mut log = TaskLog::new(&args.task_name);
    let outcome = catch_unwind(AssertUnwindSafe(|| run_task(ctx, args, &mut log)));
    let res: AuditResult<()> = match outcome {
        Ok(r) => r,
        Err(payload) => WorkerFailureSnafu {
            task_name: args.task_name.clone(),
            message: format!("panicked: {}", panic_message(payload)),
        }
        .fail(),
    };
    if let Err(e) = &res {
        log.exception(e.stack());
    }
    if let Err(e) = log.upload(&ctx.db, args.stage) {
        warn!("execute_task: {}: the logs could not be saved: {}", args.task_name, e);
    }

    let tracker = Tracker::new(&ctx.db);
    match res {
        Ok(()) => {
            tracker.mark_completed(request_id, args)?;
            info!("execute_task: {} completed", args.task_name);
            Ok(TaskStatus::Completed)
        }
        Err(e) => {
            tracker.mark_failed(request_id, args, ErrorInfo::from_error(&e))?;
            warn!("execute_task: {} failed: {}", args.task_name, e);
            Ok(TaskStatus::Failed)
        }
    }
}

/// The entry point of a delegate: rebuilds the context from the settings that
/// travel with the task, then runs it.
pub fn run_worker(request: &WorkerRequest) -> AuditResult<TaskStatus> {
    let ctx = JobContext::from_settings(request.task_args.argsdict.clone())?;
    execute_task(&ctx, &request.request_id, &request.task_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::analysis::SyntheticAnalyzer;
    use crate::audit::settings::JobSettings;
    use crate::audit::store::Db;
    use std::sync::Arc;

    fn ctx() -> JobContext {
        let s: JobSettings =
            serde_json::from_str(r#"{"job_name": "j", "job_root": "/tmp/j"}"#).unwrap();
        JobContext::new(s, Db::in_memory("t").unwrap(), Arc::new(SyntheticAnalyzer::default()))
    }

    #[test]
    fn a_missing_manifest_fails_the_task() {
        let ctx = ctx();
        let args = TaskArgs::new(&ctx.settings, Stage::Marks, "a", 0);
        let status = execute_task(&ctx, "r0", &args).unwrap();
        assert_eq!(status, TaskStatus::Failed);
        let tracker = Tracker::new(&ctx.db);
        let rec = tracker.load(TaskStatus::Failed, &args.task_name).unwrap();
        assert_eq!(rec.error_info.unwrap().error_type, "DataNotFound");
        assert!(ctx
            .db
            .exists("marks", Some("logs"), "a_chunk_0000_exc.txt")
            .unwrap());
    }

    #[test]
    fn worker_requests_travel_as_json() {
        let ctx = ctx();
        let req = WorkerRequest {
            request_id: "r1".to_string(),
            task_args: TaskArgs::new(&ctx.settings, Stage::Bif, "a", 1),
        };
        let js = serde_json::to_string(&req).unwrap();
        let back: WorkerRequest = serde_json::from_str(&js).unwrap();
        assert_eq!(back, req);
    }
}
