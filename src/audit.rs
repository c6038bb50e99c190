use log::{info, warn};
use snafu::{prelude::*, Snafu};

pub mod analysis;
pub mod archive;
pub mod bif;
pub mod compare;
pub mod context;
pub mod cvr;
pub mod dispatch;
pub mod logs;
pub mod marks;
pub mod report;
pub mod runner;
pub mod settings;
pub mod stages;
pub mod store;
pub mod styles;
pub mod table;
pub mod tasks;
pub mod tracker;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
pub(crate) mod test_fixtures;

use crate::audit::context::JobContext;
use crate::audit::settings::Operation;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuditError {
    #[snafu(display("configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("data not found: {location}"))]
    DataNotFound { location: String },

    #[snafu(display("ballot {ballot_id}: {message}"))]
    BallotProcessing { ballot_id: String, message: String },

    #[snafu(display("style {style_num} could not be mapped: {message}"))]
    StyleMapping { style_num: String, message: String },

    #[snafu(display("task {task_name} failed: {message}"))]
    WorkerFailure { task_name: String, message: String },

    #[snafu(display("invariant violation: {message}"))]
    InvariantViolation { message: String },

    #[snafu(display("object store error on {location}"))]
    Store {
        source: object_store::Error,
        location: String,
    },

    #[snafu(display("error reading or writing the table {location}"))]
    Csv {
        source: csv::Error,
        location: String,
    },

    #[snafu(display("error reading or writing the JSON document {location}"))]
    Json {
        source: serde_json::Error,
        location: String,
    },

    #[snafu(display("error opening spreadsheet {path}"))]
    OpeningExcel {
        source: calamine::XlsxError,
        path: String,
    },

    #[snafu(display("the spreadsheet {path} has no data"))]
    EmptyExcel { path: String },

    #[snafu(display("I/O error on {path}"))]
    Io {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("invalid file pattern {pattern}"))]
    Pattern {
        source: glob::PatternError,
        pattern: String,
    },

    #[snafu(display("invalid contest definitions"))]
    Tally { source: contest_tally::TallyError },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl AuditError {
    /// The short name stored as `error_type` in the tracker records.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::Configuration { .. } | AuditError::Tally { .. } => "ConfigurationError",
            AuditError::DataNotFound { .. } => "DataNotFound",
            AuditError::BallotProcessing { .. } => "BallotProcessingError",
            AuditError::StyleMapping { .. } => "StyleMappingError",
            AuditError::WorkerFailure { .. } => "WorkerFailure",
            AuditError::InvariantViolation { .. } => "InvariantViolation",
            AuditError::Store { .. } | AuditError::Io { .. } | AuditError::Pattern { .. } => {
                "StorageError"
            }
            AuditError::Csv { .. }
            | AuditError::Json { .. }
            | AuditError::OpeningExcel { .. }
            | AuditError::EmptyExcel { .. } => "ParsingError",
            AuditError::Whatever { .. } => "Error",
        }
    }

    /// The message and the chain of causes, one per line.
    pub fn stack(&self) -> String {
        let mut lines = vec![self.to_string()];
        let mut cur: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(e) = cur {
            lines.push(format!("caused by: {}", e));
            cur = e.source();
        }
        lines.join("\n")
    }
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Runs one operation of the pipeline to completion.
pub fn run_operation(ctx: &JobContext, op: Operation) -> AuditResult<()> {
    ctx.settings.validate(op)?;
    info!("run_operation: job {}: starting {}", ctx.job_name, op);
    let res = match op {
        Operation::GenbifFromCvr => {
            stages::bootstrap(ctx, true)?;
            stages::gen_bif_from_cvr(ctx).map(|_| ())
        }
        Operation::GenbifFromBallots => {
            stages::bootstrap(ctx, true)?;
            stages::gen_bif_from_ballots(ctx).map(|_| ())
        }
        Operation::CreateBifReport => {
            stages::bootstrap(ctx, false)?;
            bif::create_bif_report(ctx).map(|_| ())
        }
        Operation::Gentemplates => {
            stages::bootstrap(ctx, false)?;
            stages::gen_templates(ctx).map(|_| ())
        }
        Operation::Genmaprois => {
            stages::bootstrap(ctx, false)?;
            stages::gen_maprois(ctx).map(|_| ())
        }
        Operation::Extractvote => {
            stages::bootstrap(ctx, false)?;
            stages::extract_votes(ctx).map(|_| ())
        }
        Operation::CmpcvrAndReport => {
            stages::bootstrap(ctx, false)?;
            stages::cmpcvr_and_report(ctx).map(|_| ())
        }
        Operation::GetStatus => {
            let status = stages::get_status(ctx)?;
            let js = serde_json::to_string_pretty(&status).context(JsonSnafu {
                location: "status",
            })?;
            println!("{}", js);
            Ok(())
        }
    };
    match &res {
        Ok(()) => info!("run_operation: job {}: {} done", ctx.job_name, op),
        Err(e) => warn!("run_operation: job {}: {} failed: {}", ctx.job_name, op, e),
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        let e = AuditError::DataNotFound {
            location: "bif/x.csv".to_string(),
        };
        assert_eq!(e.kind(), "DataNotFound");
        let e = AuditError::StyleMapping {
            style_num: "12".to_string(),
            message: "no contest".to_string(),
        };
        assert_eq!(e.kind(), "StyleMappingError");
        assert_eq!(e.to_string(), "style 12 could not be mapped: no contest");
    }

    #[test]
    fn stack_lists_causes() {
        let e = AuditError::Io {
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            path: "/tmp/x".to_string(),
        };
        assert_eq!(e.stack(), "I/O error on /tmp/x\ncaused by: disk full");
    }
}
