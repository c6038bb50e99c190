//! Comparison of the extracted marks with the cast vote records.
//!
//! The tasks mirror the extraction tasks: the task `{group}_chunk_{idx}`
//! compares the ballots of `marks/chunks/{group}_marks_chunk_{idx}.csv` and
//! only loads the CVR chunks named by the `cvr_file` of its ballots. Every task
//! writes four tables: the status of each ballot, the disagreements, the
//! overvoted contests and the blank ballots.

use std::collections::BTreeSet;
use std::fmt::Display;

use contest_tally::{
    audit_unified, compare_ballot, cvr_unified, BallotVerdict, ContestTally, Contests, MarkLine,
};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::audit::archive::archive_root;
use crate::audit::bif::BifRow;
use crate::audit::context::JobContext;
use crate::audit::cvr::{load_cvr_chunks, CvrBallots};
use crate::audit::logs::TaskLog;
use crate::audit::marks::{group_by_ballot, MarksRow, MARKS_DIR};
use crate::audit::store::Db;
use crate::audit::table::Table;
use crate::audit::tasks::{parse_task_name, result_name, Stage, TaskArgs, CHUNKS_DIR, TASKS_DIR};
use crate::audit::*;

pub const CMPCVR_DIR: &str = "cmpcvr";
pub const DISAGREED_PREFIX: &str = "disagreed";
pub const OVERVOTES_PREFIX: &str = "overvotes";
pub const BLANKS_PREFIX: &str = "blanks";

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStatus {
    Agreed,
    Disagreed,
    ContestsMismatch,
    MissingCvr,
}

impl CompareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareStatus::Agreed => "agreed",
            CompareStatus::Disagreed => "disagreed",
            CompareStatus::ContestsMismatch => "contests_mismatch",
            CompareStatus::MissingCvr => "missing_cvr",
        }
    }
}

impl Display for CompareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per compared ballot.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CmpcvrRow {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub cvr_file: String,
    pub status: CompareStatus,
    pub num_contests: usize,
    pub num_disagreed: usize,
    pub contests_mismatch: String,
}

impl Table for CmpcvrRow {
    const COLUMNS: &'static [&'static str] = &[
        "ballot_id",
        "style_num",
        "precinct",
        "cvr_file",
        "status",
        "num_contests",
        "num_disagreed",
        "contests_mismatch",
    ];
}

/// One row per disagreeing contest, or one row for the whole ballot when the
/// contests or the CVR record are missing.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisagreedRow {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub cvr_file: String,
    pub status: String,
    pub contest: String,
    pub audit_votes: String,
    pub cvr_votes: String,
    pub audit_tot_votes: u64,
    pub cvr_tot_votes: u64,
    pub audit_overvotes: u64,
    pub cvr_overvotes: u64,
    pub audit_undervotes: u64,
    pub cvr_undervotes: u64,
    pub audit_writeins: u64,
    pub cvr_writeins: u64,
    /// The pixel metric of each target of the contest, as `option:value`.
    pub pixel_metrics: String,
    pub contests_mismatch: String,
}

impl Table for DisagreedRow {
    const COLUMNS: &'static [&'static str] = &[
        "ballot_id",
        "style_num",
        "precinct",
        "cvr_file",
        "status",
        "contest",
        "audit_votes",
        "cvr_votes",
        "audit_tot_votes",
        "cvr_tot_votes",
        "audit_overvotes",
        "cvr_overvotes",
        "audit_undervotes",
        "cvr_undervotes",
        "audit_writeins",
        "cvr_writeins",
        "pixel_metrics",
        "contests_mismatch",
    ];
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct OvervoteRow {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub contest: String,
    pub num_marks: u32,
    pub pixel_metrics: String,
}

impl Table for OvervoteRow {
    const COLUMNS: &'static [&'static str] = &[
        "ballot_id",
        "style_num",
        "precinct",
        "contest",
        "num_marks",
        "pixel_metrics",
    ];
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BlankRow {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub num_contests: usize,
}

impl Table for BlankRow {
    const COLUMNS: &'static [&'static str] = &["ballot_id", "style_num", "precinct", "num_contests"];
}

/// The four outputs of a comparison task.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct CompareOutputs {
    pub ballots: Vec<CmpcvrRow>,
    pub disagreed: Vec<DisagreedRow>,
    pub overvotes: Vec<OvervoteRow>,
    pub blanks: Vec<BlankRow>,
    /// (ballot, contest, selection) exported selections that match no option.
    pub unrecognized: Vec<(String, String, String)>,
}

fn pixel_metrics(rows: &[MarksRow], contest: &str) -> String {
    rows.iter()
        .filter(|r| r.contest == contest && !r.is_header())
        .map(|r| format!("{}:{}", r.option, r.pixel_metric_value))
        .collect::<Vec<String>>()
        .join(";")
}

fn mismatch_text(audit_only: &[String], cvr_only: &[String]) -> String {
    format!(
        "audit only: {}; cvr only: {}",
        audit_only.join(", "),
        cvr_only.join(", ")
    )
}

fn disagreed_row(
    base: &DisagreedRow,
    contest: &str,
    audit: &ContestTally,
    cvr: &ContestTally,
    rows: &[MarksRow],
) -> DisagreedRow {
    DisagreedRow {
        contest: contest.to_string(),
        audit_votes: audit.votes_summary(),
        cvr_votes: cvr.votes_summary(),
        audit_tot_votes: audit.tot_votes,
        cvr_tot_votes: cvr.tot_votes,
        audit_overvotes: audit.overvotes,
        cvr_overvotes: cvr.overvotes,
        audit_undervotes: audit.undervotes,
        cvr_undervotes: cvr.undervotes,
        audit_writeins: audit.writeins,
        cvr_writeins: cvr.writeins,
        pixel_metrics: pixel_metrics(rows, contest),
        ..base.clone()
    }
}

/// Compares the ballots of one marks chunk with their CVR records.
///
/// `cvr_files` gives the CVR chunk of each ballot, as recorded in the BIF.
pub fn compare_chunk(
    contests: &Contests,
    marks: &[MarksRow],
    cvr_files: &IndexMap<String, String>,
    cvr: &CvrBallots,
) -> CompareOutputs {
    let mut out = CompareOutputs::default();
    for (ballot_id, rows) in group_by_ballot(marks) {
        let first = &rows[0];
        let cvr_file = cvr_files.get(&ballot_id).cloned().unwrap_or_default();
        let headers: Vec<&MarksRow> = rows.iter().filter(|r| r.is_header()).collect();

        for h in headers.iter().filter(|h| h.overvotes > 0) {
            out.overvotes.push(OvervoteRow {
                ballot_id: ballot_id.clone(),
                style_num: first.style_num.clone(),
                precinct: first.precinct.clone(),
                contest: h.contest.clone(),
                num_marks: h.num_marks,
                pixel_metrics: pixel_metrics(&rows, &h.contest),
            });
        }
        if !headers.is_empty() && headers.iter().all(|h| h.num_marks == 0) {
            out.blanks.push(BlankRow {
                ballot_id: ballot_id.clone(),
                style_num: first.style_num.clone(),
                precinct: first.precinct.clone(),
                num_contests: headers.len(),
            });
        }

        let mut row = CmpcvrRow {
            ballot_id: ballot_id.clone(),
            style_num: first.style_num.clone(),
            precinct: first.precinct.clone(),
            cvr_file: cvr_file.clone(),
            status: CompareStatus::Agreed,
            num_contests: headers.len(),
            num_disagreed: 0,
            contests_mismatch: "".to_string(),
        };
        let mut base = DisagreedRow {
            ballot_id: ballot_id.clone(),
            style_num: first.style_num.clone(),
            precinct: first.precinct.clone(),
            cvr_file,
            ..DisagreedRow::default()
        };

        let record = match cvr.get(&ballot_id) {
            Some(r) => r,
            None => {
                row.status = CompareStatus::MissingCvr;
                row.num_disagreed = 1;
                base.status = row.status.to_string();
                out.disagreed.push(base);
                out.ballots.push(row);
                continue;
            }
        };
        let lines: Vec<MarkLine> = rows.iter().map(|r| r.mark_line()).collect();
        let audit = audit_unified(&lines);
        let exported = cvr_unified(contests, &record.selections);
        for (contest, selection) in exported.unrecognized_selections.iter() {
            out.unrecognized
                .push((ballot_id.clone(), contest.clone(), selection.clone()));
        }
        match compare_ballot(&audit, &exported.contests) {
            BallotVerdict::Agreed => {}
            BallotVerdict::ContestsMismatch {
                audit_only,
                cvr_only,
            } => {
                row.status = CompareStatus::ContestsMismatch;
                row.num_disagreed = 1;
                row.contests_mismatch = mismatch_text(&audit_only, &cvr_only);
                base.status = row.status.to_string();
                base.contests_mismatch = row.contests_mismatch.clone();
                out.disagreed.push(base);
            }
            BallotVerdict::Disagreed(disagreements) => {
                row.status = CompareStatus::Disagreed;
                row.num_disagreed = disagreements.len();
                base.status = row.status.to_string();
                for d in disagreements.iter() {
                    out.disagreed
                        .push(disagreed_row(&base, &d.contest, &d.audit, &d.cvr, &rows));
                }
            }
        }
        out.ballots.push(row);
    }
    out
}

// ********* Planning ***********

/// Plans one comparison task per extraction task, with the same group, index
/// and manifest.
pub fn plan_cmpcvr_tasks(ctx: &JobContext) -> AuditResult<Vec<TaskArgs>> {
    let mut tasks: Vec<TaskArgs> = Vec::new();
    for name in ctx.db.list(MARKS_DIR, Some(TASKS_DIR), "*.csv")? {
        let stem = name.strip_suffix(".csv").unwrap_or(&name);
        let (group, idx) = match parse_task_name(stem) {
            Some(x) => x,
            None => {
                debug!("plan_cmpcvr_tasks: ignoring {}", name);
                continue;
            }
        };
        let rows: Vec<BifRow> = ctx.db.load_table(MARKS_DIR, Some(TASKS_DIR), &name)?;
        let args = TaskArgs::new(&ctx.settings, Stage::Cmpcvr, &group, idx);
        args.write_manifest(&ctx.db, &rows)?;
        tasks.push(args);
    }
    Ok(tasks)
}

// ********* Running ***********

pub fn run_cmpcvr_task(ctx: &JobContext, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<()> {
    let manifest: Vec<BifRow> = args.load_manifest(&ctx.db)?;
    let contests = ctx.load_contests()?;
    let marks: Vec<MarksRow> = ctx.db.load_table(
        MARKS_DIR,
        Some(CHUNKS_DIR),
        &result_name(&args.group, Stage::Marks, args.chunk_idx),
    )?;
    let cvr_files: IndexMap<String, String> = manifest
        .iter()
        .map(|r| (r.ballot_id.clone(), r.cvr_file.clone()))
        .collect();
    let chunk_names: Vec<String> = manifest
        .iter()
        .map(|r| r.cvr_file.clone())
        .filter(|f| !f.is_empty())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    let cvr = load_cvr_chunks(&ctx.db, &chunk_names)?;
    log.info(format!(
        "{} marks rows, {} CVR chunks, {} CVR ballots",
        marks.len(),
        chunk_names.len(),
        cvr.len()
    ));

    let out = compare_chunk(&contests, &marks, &cvr_files, &cvr);
    for (ballot, contest, selection) in out.unrecognized.iter() {
        log.exception(format!(
            "ballot {}: contest {}: unrecognized selection {:?}",
            ballot, contest, selection
        ));
    }
    args.save_result(&ctx.db, &out.ballots)?;
    let dir = Stage::Cmpcvr.dirname();
    ctx.db
        .save_table(&out.disagreed, dir, Some(CHUNKS_DIR), &args.prefixed_result_name(DISAGREED_PREFIX))?;
    ctx.db
        .save_table(&out.overvotes, dir, Some(CHUNKS_DIR), &args.prefixed_result_name(OVERVOTES_PREFIX))?;
    ctx.db
        .save_table(&out.blanks, dir, Some(CHUNKS_DIR), &args.prefixed_result_name(BLANKS_PREFIX))?;
    log.info(format!(
        "{} ballots compared, {} disagreed rows, {} overvoted contests, {} blank ballots",
        out.ballots.len(),
        out.disagreed.len(),
        out.overvotes.len(),
        out.blanks.len()
    ));
    Ok(())
}

// ********* Join ***********

fn prefixed(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{}_{}", p, name),
        None => name.to_string(),
    }
}

pub fn cmpcvr_name(prefix: Option<&str>, root: &str) -> String {
    prefixed(prefix, &format!("{}_cmpcvr.csv", root))
}

pub const OUTPUT_PREFIXES: [Option<&str>; 4] = [
    None,
    Some(DISAGREED_PREFIX),
    Some(OVERVOTES_PREFIX),
    Some(BLANKS_PREFIX),
];

/// Combines the four outputs of the chunks of each archive. Returns the number
/// of chunks skipped for a header mismatch.
pub fn combine_cmpcvr(ctx: &JobContext) -> AuditResult<usize> {
    let mut header_mismatches = 0;
    for location in ctx.settings.archives.iter() {
        let root = archive_root(location);
        for prefix in OUTPUT_PREFIXES {
            let stats = ctx.db.combine_chunks(
                CMPCVR_DIR,
                Some(CHUNKS_DIR),
                &cmpcvr_name(prefix, &root),
                &prefixed(prefix, &format!("{}_cmpcvr_chunk_*.csv", root)),
            )?;
            header_mismatches += stats.header_mismatches;
        }
        info!("combine_cmpcvr: {} combined", root);
    }
    Ok(header_mismatches)
}

pub fn load_cmpcvr<T: Table>(db: &Db, prefix: Option<&str>, root: &str) -> AuditResult<Vec<T>> {
    db.load_table(CMPCVR_DIR, None, &cmpcvr_name(prefix, root))
}
