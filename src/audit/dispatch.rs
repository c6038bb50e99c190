//! Fan-out of the tasks of a stage and the wait for their outcome.
//!
//! The dispatcher only talks to the workers through the tracker: it writes the
//! `Running` record of a task, hands the task to an [`Invoker`] and polls the
//! `Completed` and `Failed` directories until every task has a terminal status
//! or nothing moved for `stage_timeout_secs`.

use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use uuid::Uuid;

use crate::audit::context::JobContext;
use crate::audit::runner::{execute_task, WorkerRequest};
use crate::audit::settings::Delegation;
use crate::audit::tasks::{Stage, TaskArgs};
use crate::audit::tracker::{ErrorInfo, TaskStatus, Tracker};
use crate::audit::*;

/// Starts the execution of a task. The task reports its own outcome in the
/// tracker, so an invoker may return before the task is done.
pub trait Invoker: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, request_id: &str, args: &TaskArgs) -> AuditResult<()>;
}

/// Runs the task before returning.
#[derive(Debug, Clone)]
pub struct InProcessInvoker {
    ctx: JobContext,
}

impl InProcessInvoker {
    pub fn new(ctx: &JobContext) -> InProcessInvoker {
        InProcessInvoker { ctx: ctx.clone() }
    }
}

impl Invoker for InProcessInvoker {
    fn name(&self) -> &str {
        "in_process"
    }

    fn invoke(&self, request_id: &str, args: &TaskArgs) -> AuditResult<()> {
        execute_task(&self.ctx, request_id, args).map(|_| ())
    }
}

/// Runs each task on its own thread, sharing the context of the job.
#[derive(Debug, Clone)]
pub struct ThreadInvoker {
    ctx: JobContext,
}

impl ThreadInvoker {
    pub fn new(ctx: &JobContext) -> ThreadInvoker {
        ThreadInvoker { ctx: ctx.clone() }
    }
}

impl Invoker for ThreadInvoker {
    fn name(&self) -> &str {
        "threads"
    }

    fn invoke(&self, request_id: &str, args: &TaskArgs) -> AuditResult<()> {
        let ctx = self.ctx.clone();
        let request_id = request_id.to_string();
        let args = args.clone();
        let thread_name = format!("task-{}", args.task_name);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Err(e) = execute_task(&ctx, &request_id, &args) {
                    error!("{}: the outcome could not be recorded: {}", args.task_name, e);
                }
            })
            .context(IoSnafu { path: thread_name })?;
        Ok(())
    }
}

/// Runs each task in a delegate process. The process receives a
/// [`WorkerRequest`] as JSON on its standard input.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    command: Vec<String>,
}

impl ProcessInvoker {
    /// `command` is the program and its first arguments. `worker` is appended.
    pub fn new(command: Vec<String>) -> ProcessInvoker {
        ProcessInvoker { command }
    }

    /// The delegate is the current executable, unless `delegate_command` is set.
    pub fn from_settings(ctx: &JobContext) -> AuditResult<ProcessInvoker> {
        if let Some(cmd) = ctx.settings.delegate_command.as_ref() {
            return Ok(ProcessInvoker::new(cmd.clone()));
        }
        let exe = std::env::current_exe().context(IoSnafu {
            path: "current executable",
        })?;
        Ok(ProcessInvoker::new(vec![exe.to_string_lossy().to_string()]))
    }
}

impl Invoker for ProcessInvoker {
    fn name(&self) -> &str {
        "process"
    }

    fn invoke(&self, request_id: &str, args: &TaskArgs) -> AuditResult<()> {
        let (program, rest) = self.command.split_first().context(ConfigurationSnafu {
            message: "delegate_command is empty",
        })?;
        let request = WorkerRequest {
            request_id: request_id.to_string(),
            task_args: args.clone(),
        };
        let payload = serde_json::to_vec(&request).context(JsonSnafu {
            location: args.task_name.clone(),
        })?;
        let mut child = Command::new(program)
            .args(rest)
            .arg("worker")
            .stdin(Stdio::piped())
            .spawn()
            .context(IoSnafu {
                path: program.clone(),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).context(IoSnafu {
                path: program.clone(),
            })?;
        }
        let task_name = args.task_name.clone();
        thread::Builder::new()
            .name(format!("reap-{}", task_name))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => debug!("{}: delegate exited", task_name),
                Ok(status) => warn!("{}: delegate exited with {}", task_name, status),
                Err(e) => warn!("{}: delegate could not be waited for: {}", task_name, e),
            })
            .context(IoSnafu {
                path: args.task_name.clone(),
            })?;
        Ok(())
    }
}

/// The invoker matching the delegation of the job.
pub fn invoker_for(ctx: &JobContext) -> AuditResult<Box<dyn Invoker>> {
    Ok(match ctx.settings.effective_delegation() {
        Delegation::InProcess => Box::new(InProcessInvoker::new(ctx)),
        Delegation::Threads => Box::new(ThreadInvoker::new(ctx)),
        Delegation::Lambda => Box::new(ProcessInvoker::from_settings(ctx)?),
    })
}

/// How the tasks of a stage ended.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
}

struct Join<'a> {
    ctx: &'a JobContext,
    tracker: Tracker,
    invoker: &'a dyn Invoker,
    cap: usize,
    outstanding: IndexMap<String, (String, TaskArgs)>,
    outcome: JoinOutcome,
    last_change: Instant,
}

impl<'a> Join<'a> {
    fn launch(&mut self, args: TaskArgs) -> AuditResult<()> {
        let request_id = Uuid::new_v4().to_string();
        self.tracker.mark_running(&request_id, &args)?;
        if let Err(e) = self.invoker.invoke(&request_id, &args) {
            warn!("dispatch: {} could not be invoked: {}", args.task_name, e);
            self.tracker
                .mark_failed(&request_id, &args, ErrorInfo::from_error(&e))?;
        }
        self.last_change = Instant::now();
        self.outstanding
            .insert(args.task_name.clone(), (request_id, args));
        Ok(())
    }

    /// Removes the tasks that reached a terminal state. Returns true if any did.
    fn poll(&mut self) -> AuditResult<bool> {
        let completed = self.tracker.tasks_in(TaskStatus::Completed)?;
        let failed = self.tracker.tasks_in(TaskStatus::Failed)?;
        let done: Vec<String> = self
            .outstanding
            .keys()
            .filter(|t| completed.contains(*t) || failed.contains(*t))
            .cloned()
            .collect();
        for t in done.iter() {
            self.outstanding.shift_remove(t);
            if failed.contains(t) {
                self.outcome.failed += 1;
            } else {
                self.outcome.completed += 1;
            }
        }
        Ok(!done.is_empty())
    }

    fn time_out(&mut self) -> AuditResult<()> {
        let secs = self.ctx.settings.stage_timeout_secs;
        for (task_name, (request_id, args)) in std::mem::take(&mut self.outstanding) {
            if self
                .tracker
                .mark_failed(&request_id, &args, ErrorInfo::timeout(secs))?
            {
                warn!("dispatch: {} timed out", task_name);
                self.outcome.timed_out += 1;
            } else if self.tracker.status(&task_name)? == Some(TaskStatus::Completed) {
                self.outcome.completed += 1;
            } else {
                self.outcome.failed += 1;
            }
        }
        Ok(())
    }

    /// Launches the queued tasks, at most `cap` at a time, and waits for all of
    /// them.
    fn run(&mut self, mut queue: VecDeque<TaskArgs>) -> AuditResult<()> {
        let poll_every = Duration::from_millis(self.ctx.settings.tracker_poll_ms.max(1));
        let timeout = Duration::from_secs(self.ctx.settings.stage_timeout_secs);
        loop {
            while self.outstanding.len() < self.cap {
                match queue.pop_front() {
                    Some(args) => self.launch(args)?,
                    None => break,
                }
            }
            if self.outstanding.is_empty() {
                return Ok(());
            }
            if self.poll()? {
                self.last_change = Instant::now();
                continue;
            }
            if self.last_change.elapsed() >= timeout {
                self.time_out()?;
                self.last_change = Instant::now();
                continue;
            }
            thread::sleep(poll_every);
        }
    }
}

/// Runs the tasks of a stage through the invoker and waits for them.
///
/// With `incremental`, a task whose result already exists is skipped. With
/// `one_lambda_first`, the first task runs alone and the stage is aborted if it
/// does not complete.
pub fn dispatch_and_join(
    ctx: &JobContext,
    stage: Stage,
    tasks: Vec<TaskArgs>,
    invoker: &dyn Invoker,
) -> AuditResult<JoinOutcome> {
    let mut outcome = JoinOutcome {
        tasks: tasks.len(),
        ..JoinOutcome::default()
    };
    let mut queue: VecDeque<TaskArgs> = VecDeque::new();
    for t in tasks {
        if ctx.settings.incremental && t.result_exists(&ctx.db)? {
            debug!("dispatch: {} already has a result", t.task_name);
            outcome.skipped += 1;
        } else {
            queue.push_back(t);
        }
    }
    let num_archives = ctx.settings.archives.len().max(1);
    let cap = (ctx.settings.max_lambda_concurrency / num_archives).max(1);
    info!(
        "dispatch: {}: {} tasks ({} skipped) through {}, at most {} at a time",
        stage,
        outcome.tasks,
        outcome.skipped,
        invoker.name(),
        cap
    );

    let mut join = Join {
        ctx,
        tracker: Tracker::new(&ctx.db),
        invoker,
        cap,
        outstanding: IndexMap::new(),
        outcome,
        last_change: Instant::now(),
    };
    if ctx.settings.one_lambda_first {
        if let Some(first) = queue.pop_front() {
            let first_name = first.task_name.clone();
            join.run(VecDeque::from([first]))?;
            if join.outcome.completed == 0 {
                return WorkerFailureSnafu {
                    task_name: first_name,
                    message: format!("the first task of stage {} did not complete, the stage is aborted", stage),
                }
                .fail();
            }
        }
    }
    join.run(queue)?;
    info!("dispatch: {}: {:?}", stage, join.outcome);
    Ok(join.outcome)
}
