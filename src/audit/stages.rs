//! The stage drivers: bootstrap of a job, then `plan -> dispatch -> join` for
//! each chunked stage.
//!
//! A driver reads the artifacts of the previous stages from the store, writes
//! the manifests of its tasks, hands them to the invoker chosen by the settings
//! and, once every task is terminal, combines the chunks and the task logs. The
//! outcome of the tasks is written to `{stage}/stage_summary.json`.

use contest_tally::builder::{ContestsBuilder, EifRow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::bif::{build_bif_from_cvr, create_bif_report, finalize_bifs, load_all_bifs, plan_bif_tasks, BifArchiveStats, BifRow};
use crate::audit::compare::{combine_cmpcvr, plan_cmpcvr_tasks};
use crate::audit::context::{JobContext, CONFIG_DIR, CONTESTS_NAME, EIF_NAME, SETTINGS_NAME, STYLE_LOOKUP_NAME};
use crate::audit::cvr::{has_cvr, persist_cvr, read_cvr};
use crate::audit::dispatch::{dispatch_and_join, invoker_for, JoinOutcome};
use crate::audit::logs::consolidate;
use crate::audit::marks::{combine_marks, plan_marks_tasks};
use crate::audit::report::{build_report, ReportSummary, REPORT_DIR, SUMMARY_NAME};
use crate::audit::settings::JobSettings;
use crate::audit::styles::{
    has_template, plan_styles, style_task, truncate_maps, write_map_report, StyleLookupRow, StylePlan,
    ROISMAP_DIR, ROISMAP_NAME, STYLES_DIR,
};
use crate::audit::table::{read_table, Table};
use crate::audit::tasks::{truncate_stage, Stage, StyleSteps, TaskArgs, CHUNKS_DIR, TASKS_DIR};
use crate::audit::tracker::{Tracker, TrackerCounts};
use crate::audit::*;

pub const STAGE_SUMMARY_NAME: &str = "stage_summary.json";

impl Table for EifRow {
    const COLUMNS: &'static [&'static str] = &[
        "official_contest_name",
        "contest_alias",
        "vote_for",
        "official_option",
        "option_alias",
    ];
}

/// The outcome of the last run of a stage.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    /// Chunks left out of a combined table because of their header.
    pub header_mismatches: usize,
    pub invariant_violations: usize,
    pub exception_lines: usize,
}

impl StageSummary {
    fn new(stage: Stage, outcome: JoinOutcome, exception_lines: usize) -> StageSummary {
        StageSummary {
            stage,
            tasks: outcome.tasks,
            completed: outcome.completed,
            failed: outcome.failed,
            timed_out: outcome.timed_out,
            skipped: outcome.skipped,
            header_mismatches: 0,
            invariant_violations: 0,
            exception_lines,
        }
    }
}

fn save_stage_summary(ctx: &JobContext, summary: &StageSummary) -> AuditResult<()> {
    ctx.db
        .save_json(summary, summary.stage.dirname(), None, STAGE_SUMMARY_NAME)?;
    info!("{}: {:?}", summary.stage, summary);
    Ok(())
}

// ********* Bootstrap ***********

fn read_eif(ctx: &JobContext, path: &str) -> AuditResult<Vec<EifRow>> {
    let bytes = ctx.db.read_location(path)?;
    read_table(&bytes, path)
}

/// Prepares the configuration of the job under `config/`.
///
/// The settings are always saved. The contests dictionary is built from the
/// EIF, and the CVR and the style lookup are copied in, when `force` is set or
/// when the job does not have them yet.
pub fn bootstrap(ctx: &JobContext, force: bool) -> AuditResult<()> {
    let settings = &ctx.settings;
    ctx.db.save_json(settings, CONFIG_DIR, None, SETTINGS_NAME)?;

    let has_contests = ctx.db.exists(CONFIG_DIR, None, CONTESTS_NAME)?;
    match settings.eif_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) if force || !has_contests => {
            let rows = read_eif(ctx, path)?;
            let mut builder = ContestsBuilder::new();
            for row in rows.iter() {
                builder.add_row(row).context(TallySnafu)?;
            }
            let contests = builder.build().context(TallySnafu)?;
            info!("bootstrap: {} contests read from {}", contests.len(), path);
            ctx.db.save_table(&rows, CONFIG_DIR, None, EIF_NAME)?;
            ctx.db.save_json(&contests, CONFIG_DIR, None, CONTESTS_NAME)?;
        }
        Some(_) => debug!("bootstrap: the contests are already built"),
        None if has_contests => debug!("bootstrap: no eif_path, using the saved contests"),
        None => {
            return ConfigurationSnafu {
                message: "eif_path is required the first time a job runs",
            }
            .fail()
        }
    }

    if let Some(path) = settings.cvr_path.as_deref().filter(|p| !p.is_empty()) {
        if force || !has_cvr(&ctx.db)? {
            let ballots = read_cvr(&ctx.db, settings.vendor, path)?;
            persist_cvr(&ctx.db, &ballots, settings.cvr_ballots_per_chunk)?;
        }
    }

    if let Some(path) = settings.style_lookup_path.as_deref().filter(|p| !p.is_empty()) {
        if force || !ctx.db.exists(CONFIG_DIR, None, STYLE_LOOKUP_NAME)? {
            let bytes = ctx.db.read_location(path)?;
            let rows: Vec<StyleLookupRow> = read_table(&bytes, path)?;
            ctx.db.save_table(&rows, CONFIG_DIR, None, STYLE_LOOKUP_NAME)?;
            info!("bootstrap: {} style lookup entries", rows.len());
        }
    }
    Ok(())
}

// ********* Chunked stages ***********

/// Clears the previous run of a stage. With `incremental`, the results are
/// kept so that their tasks can be skipped.
fn prepare_stage(ctx: &JobContext, stage: Stage) -> AuditResult<()> {
    if ctx.settings.incremental {
        ctx.db.delete(stage.dirname(), Some(TASKS_DIR), "*")?;
    } else {
        truncate_stage(&ctx.db, stage)?;
    }
    Tracker::new(&ctx.db).reset()?;
    Ok(())
}

fn run_chunked_stage(ctx: &JobContext, stage: Stage, tasks: Vec<TaskArgs>) -> AuditResult<StageSummary> {
    let invoker = invoker_for(ctx)?;
    let outcome = dispatch_and_join(ctx, stage, tasks, invoker.as_ref())?;
    let failed = Tracker::new(&ctx.db).failed_records()?;
    let exception_lines = consolidate(&ctx.db, stage, &failed)?;
    if outcome.failed + outcome.timed_out > 0 {
        warn!(
            "{}: {} tasks failed, {} timed out",
            stage, outcome.failed, outcome.timed_out
        );
    }
    Ok(StageSummary::new(stage, outcome, exception_lines))
}

/// Builds the BIFs from the CVR and the listing of the archives.
pub fn gen_bif_from_cvr(ctx: &JobContext) -> AuditResult<Vec<BifArchiveStats>> {
    let stats = build_bif_from_cvr(ctx)?;
    create_bif_report(ctx)?;
    Ok(stats)
}

/// Builds the BIFs by reading every ballot.
pub fn gen_bif_from_ballots(ctx: &JobContext) -> AuditResult<StageSummary> {
    prepare_stage(ctx, Stage::Bif)?;
    let tasks = plan_bif_tasks(ctx)?;
    let mut summary = run_chunked_stage(ctx, Stage::Bif, tasks)?;
    let (stats, header_mismatches) = finalize_bifs(ctx)?;
    summary.header_mismatches = header_mismatches;
    summary.invariant_violations = stats.iter().map(|s| s.duplicates_dropped).sum();
    save_stage_summary(ctx, &summary)?;
    create_bif_report(ctx)?;
    Ok(summary)
}

fn all_bif_rows(ctx: &JobContext) -> AuditResult<Vec<Vec<BifRow>>> {
    Ok(load_all_bifs(ctx)?.into_iter().map(|(_, rows)| rows).collect())
}

fn log_skipped_styles(settings: &JobSettings, skipped: &[StylePlan]) {
    for p in skipped.iter() {
        info!(
            "style {} skipped: {} eligible ballots, {} required",
            p.style_num, p.num_eligible, settings.min_ballots_required
        );
    }
}

/// Combines the region maps of the styles and writes the map report.
fn finish_maps(ctx: &JobContext, skipped: &[StylePlan], summary: &mut StageSummary) -> AuditResult<()> {
    let stats = ctx
        .db
        .combine_chunks(STYLES_DIR, Some(ROISMAP_DIR), ROISMAP_NAME, "*_roismap.csv")?;
    summary.header_mismatches += stats.header_mismatches;
    write_map_report(&ctx.db, skipped)?;
    Ok(())
}

/// Builds one template per style. The regions and the maps are built in the
/// same task when both `include_genrois` and `include_maprois` are set.
pub fn gen_templates(ctx: &JobContext) -> AuditResult<StageSummary> {
    let (plans, skipped) = plan_styles(&ctx.settings, &all_bif_rows(ctx)?);
    log_skipped_styles(&ctx.settings, &skipped);
    let fused = ctx.settings.include_genrois && ctx.settings.include_maprois;
    let steps = StyleSteps {
        template: true,
        rois: fused,
        maprois: fused,
    };
    prepare_stage(ctx, Stage::Styles)?;
    if fused {
        truncate_maps(&ctx.db)?;
    }
    let mut tasks: Vec<TaskArgs> = Vec::new();
    for p in plans.iter() {
        let args = style_task(&ctx.settings, &p.style_num, steps);
        args.write_manifest(&ctx.db, &p.rows)?;
        tasks.push(args);
    }
    info!("gen_templates: {} styles, {} skipped", plans.len(), skipped.len());
    let mut summary = run_chunked_stage(ctx, Stage::Styles, tasks)?;
    if fused {
        finish_maps(ctx, &skipped, &mut summary)?;
    }
    save_stage_summary(ctx, &summary)?;
    Ok(summary)
}

/// Finds the regions of the styles that have a template and maps them to the
/// contests.
pub fn gen_maprois(ctx: &JobContext) -> AuditResult<StageSummary> {
    let (plans, skipped) = plan_styles(&ctx.settings, &all_bif_rows(ctx)?);
    let steps = StyleSteps {
        template: false,
        rois: ctx.settings.include_genrois,
        maprois: true,
    };
    prepare_stage(ctx, Stage::Styles)?;
    truncate_maps(&ctx.db)?;
    let mut tasks: Vec<TaskArgs> = Vec::new();
    for p in plans.iter() {
        if !has_template(&ctx.db, &p.style_num)? {
            warn!("gen_maprois: style {} has no template", p.style_num);
            continue;
        }
        tasks.push(style_task(&ctx.settings, &p.style_num, steps));
    }
    let mut summary = run_chunked_stage(ctx, Stage::Styles, tasks)?;
    finish_maps(ctx, &skipped, &mut summary)?;
    save_stage_summary(ctx, &summary)?;
    Ok(summary)
}

/// Reads the marks of the ballots of mapped styles.
pub fn extract_votes(ctx: &JobContext) -> AuditResult<StageSummary> {
    prepare_stage(ctx, Stage::Marks)?;
    let tasks = plan_marks_tasks(ctx)?;
    let mut summary = run_chunked_stage(ctx, Stage::Marks, tasks)?;
    summary.header_mismatches = combine_marks(ctx)?;
    save_stage_summary(ctx, &summary)?;
    Ok(summary)
}

/// Compares the marks with the CVR, when the job has one, then writes the final
/// report.
pub fn cmpcvr_and_report(ctx: &JobContext) -> AuditResult<ReportSummary> {
    if has_cvr(&ctx.db)? {
        prepare_stage(ctx, Stage::Cmpcvr)?;
        let tasks = plan_cmpcvr_tasks(ctx)?;
        let mut summary = run_chunked_stage(ctx, Stage::Cmpcvr, tasks)?;
        summary.header_mismatches = combine_cmpcvr(ctx)?;
        save_stage_summary(ctx, &summary)?;
    } else {
        info!("cmpcvr_and_report: no CVR, the comparison is skipped");
    }
    build_report(ctx)
}

// ********* Status ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub manifests: usize,
    pub results: usize,
    /// The artifacts directly under the directory of the stage.
    pub artifacts: Vec<String>,
    pub last_run: Option<StageSummary>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    pub job_root: String,
    pub has_contests: bool,
    pub has_cvr: bool,
    pub stages: Vec<StageStatus>,
    pub tracker: TrackerCounts,
    pub report: Option<ReportSummary>,
}

/// What the job has produced so far.
pub fn get_status(ctx: &JobContext) -> AuditResult<JobStatus> {
    let db = &ctx.db;
    let mut stages: Vec<StageStatus> = Vec::new();
    for stage in Stage::ALL {
        let dir = stage.dirname();
        let last_run = if db.exists(dir, None, STAGE_SUMMARY_NAME)? {
            Some(db.load_json(dir, None, STAGE_SUMMARY_NAME)?)
        } else {
            None
        };
        stages.push(StageStatus {
            stage,
            manifests: db.list(dir, Some(TASKS_DIR), "*")?.len(),
            results: db.list(dir, Some(CHUNKS_DIR), "*")?.len(),
            artifacts: db.list(dir, None, "*")?,
            last_run,
        });
    }
    let report = if db.exists(REPORT_DIR, None, SUMMARY_NAME)? {
        Some(db.load_json(REPORT_DIR, None, SUMMARY_NAME)?)
    } else {
        None
    };
    Ok(JobStatus {
        job_name: ctx.job_name.clone(),
        job_root: db.root().to_string(),
        has_contests: db.exists(CONFIG_DIR, None, CONTESTS_NAME)?,
        has_cvr: has_cvr(db)?,
        stages,
        tracker: Tracker::new(db).counts()?,
        report,
    })
}
