mod args;
mod audit;

use std::io::Read;

use clap::Parser;
use log::{debug, error, info};
use snafu::prelude::*;

use crate::args::{Args, Command};
use crate::audit::context::JobContext;
use crate::audit::runner::{run_worker, WorkerRequest};
use crate::audit::settings::{JobSettings, Operation};
use crate::audit::*;

fn load_settings(path: &str, job_root: &Option<String>, overrides: &[String]) -> AuditResult<JobSettings> {
    let mut settings = JobSettings::load(path)?;
    if let Some(root) = job_root {
        settings.job_root = root.clone();
    }
    for pair in overrides.iter() {
        settings.set_pair(pair)?;
    }
    Ok(settings)
}

fn run(settings: JobSettings, ops: &[String]) -> AuditResult<()> {
    let ops: Vec<Operation> = if ops.is_empty() {
        match settings.op {
            Some(op) => vec![op],
            None => {
                return ConfigurationSnafu {
                    message: "no operation: pass --op or set `op` in the settings",
                }
                .fail()
            }
        }
    } else {
        ops.iter()
            .map(|s| Operation::parse(s))
            .collect::<AuditResult<Vec<Operation>>>()?
    };
    let ctx = JobContext::from_settings(settings)?;
    for op in ops {
        run_operation(&ctx, op)?;
    }
    Ok(())
}

fn worker() -> AuditResult<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context(IoSnafu { path: "stdin" })?;
    let request: WorkerRequest =
        serde_json::from_str(&input).context(JsonSnafu { location: "stdin" })?;
    debug!("worker: request {} for {}", request.request_id, request.task_args.task_name);
    let status = run_worker(&request)?;
    info!("worker: {} is {}", request.task_args.task_name, status);
    Ok(())
}

fn main() {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
    debug!("args: {:?}", args);

    let res = match &args.command {
        Command::Run {
            settings,
            ops,
            job_root,
            overrides,
        } => load_settings(settings, job_root, overrides).and_then(|s| run(s, ops)),
        Command::Worker => worker(),
        Command::Status { settings, job_root } => load_settings(settings, job_root, &[])
            .and_then(JobContext::from_settings)
            .and_then(|ctx| run_operation(&ctx, Operation::GetStatus)),
    };

    if let Err(e) = res {
        error!("{} error: {}", e.kind(), e.stack());
        std::process::exit(1);
    }
}
