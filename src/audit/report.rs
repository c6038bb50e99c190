// ********* Final report ***********
//
// Totals per contest from the marks of every archive, the discrepancies with
// the CVR and a summary of the whole job. Only per-contest counters are held in
// memory, the marks are read one archive at a time.

use std::collections::{BTreeMap, BTreeSet};

use contest_tally::{accumulate, audit_unified, check_conservation, ContestTally, Contests, MarkLine};
use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use text_diff::{diff, print_diff, Difference};

use crate::audit::bif::{bif_report, load_all_bifs};
use crate::audit::compare::{load_cmpcvr, CmpcvrRow, DisagreedRow, DISAGREED_PREFIX};
use crate::audit::context::JobContext;
use crate::audit::cvr::{has_cvr, load_cvr_index};
use crate::audit::marks::{extraction_rows, group_by_ballot, load_marks, marks_name, MarksRow, MARKS_DIR};
use crate::audit::stages::{StageSummary, STAGE_SUMMARY_NAME};
use crate::audit::store::Db;
use crate::audit::styles::mapped_styles;
use crate::audit::table::{read_table, Table};
use crate::audit::tasks::Stage;
use crate::audit::*;

pub const REPORT_DIR: &str = "report";
pub const TOTALS_NAME: &str = "totals.csv";
pub const TOTALS_JSON_NAME: &str = "totals.json";
pub const DISCREPANCIES_NAME: &str = "discrepancies.csv";
pub const SUMMARY_NAME: &str = "summary.json";

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ContestTotalsRow {
    pub contest: String,
    pub vote_for: u32,
    pub num_ballots: u64,
    pub tot_votes: u64,
    pub overvotes: u64,
    pub undervotes: u64,
    pub writeins: u64,
    pub votes: String,
}

impl Table for ContestTotalsRow {
    const COLUMNS: &'static [&'static str] = &[
        "contest",
        "vote_for",
        "num_ballots",
        "tot_votes",
        "overvotes",
        "undervotes",
        "writeins",
        "votes",
    ];
}

/// A line of the official results file.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct OfficialResultRow {
    pub contest: String,
    pub option: String,
    pub votes: u64,
}

impl Table for OfficialResultRow {
    const COLUMNS: &'static [&'static str] = &["contest", "option", "votes"];
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub num_ballots: usize,
    pub num_ballots_extracted: usize,
    pub num_ballots_compared: usize,
    /// Ballots left out of the extraction because their style is not mapped,
    /// by style.
    pub unmapped_ballots: BTreeMap<String, usize>,
    pub num_unmapped_ballots: usize,
    pub num_blank_ballots: usize,
    pub num_overvoted_contests: usize,
    pub compare_statuses: BTreeMap<String, usize>,
    pub num_discrepancies: usize,
    /// Failed or timed out tasks, by stage.
    pub stage_failures: BTreeMap<String, usize>,
    pub invariant_violations: usize,
    /// Lines that differ from the official results, when they are given.
    pub official_results_differences: Option<usize>,
}

// ********* Totals ***********

/// Zero totals, in the order of the contests dictionary, with every official
/// option present.
pub fn empty_totals(contests: &Contests) -> IndexMap<String, ContestTally> {
    contests
        .iter()
        .map(|(name, c)| {
            (
                name.clone(),
                ContestTally {
                    num_ballots: 0,
                    ..ContestTally::empty_ballot(c)
                },
            )
        })
        .collect()
}

/// Adds the ballots of one archive to the totals.
pub fn add_archive_totals(totals: &mut IndexMap<String, ContestTally>, rows: &[MarksRow]) {
    for (_, ballot_rows) in group_by_ballot(rows) {
        let lines: Vec<MarkLine> = ballot_rows.iter().map(|r| r.mark_line()).collect();
        accumulate(totals, &audit_unified(&lines));
    }
}

/// Per-contest totals of a sequence of archives.
pub fn contest_totals<'a>(
    contests: &Contests,
    archives: impl Iterator<Item = &'a [MarksRow]>,
) -> IndexMap<String, ContestTally> {
    let mut totals = empty_totals(contests);
    for rows in archives {
        add_archive_totals(&mut totals, rows);
    }
    totals
}

pub fn totals_rows(contests: &Contests, totals: &IndexMap<String, ContestTally>) -> Vec<ContestTotalsRow> {
    totals
        .iter()
        .map(|(name, t)| ContestTotalsRow {
            contest: name.clone(),
            vote_for: contests.get(name).map(|c| c.vote_for).unwrap_or(0),
            num_ballots: t.num_ballots,
            tot_votes: t.tot_votes,
            overvotes: t.overvotes,
            undervotes: t.undervotes,
            writeins: t.writeins,
            votes: t.votes_summary(),
        })
        .collect()
}

/// Checks vote conservation on every contest. Returns the number of contests
/// that violate it.
pub fn conservation_violations(contests: &Contests, totals: &IndexMap<String, ContestTally>) -> usize {
    let mut n = 0;
    for (name, t) in totals.iter() {
        let vote_for = contests.get(name).map(|c| c.vote_for).unwrap_or(1);
        if let Err(e) = check_conservation(name, t, vote_for) {
            warn!(
                "{}",
                AuditError::InvariantViolation {
                    message: e.to_string()
                }
            );
            n += 1;
        }
    }
    n
}

// ********* Official results ***********

fn results_text(lines: &BTreeMap<(String, String), u64>) -> String {
    let mut text = String::new();
    for ((contest, option), votes) in lines.iter() {
        text.push_str(&format!("{},{},{}\n", contest, option, votes));
    }
    text
}

/// Compares the totals with the official results. Returns the number of
/// differences found by the line diff.
pub fn compare_official_results(
    official: &[OfficialResultRow],
    totals: &IndexMap<String, ContestTally>,
) -> usize {
    let expected: BTreeMap<(String, String), u64> = official
        .iter()
        .map(|r| ((r.contest.trim().to_string(), r.option.trim().to_string()), r.votes))
        .collect();
    let computed: BTreeMap<(String, String), u64> = expected
        .keys()
        .map(|(c, o)| {
            let votes = totals.get(c).map(|t| t.option_votes(o)).unwrap_or(0);
            ((c.clone(), o.clone()), votes)
        })
        .collect();
    let expected_text = results_text(&expected);
    let computed_text = results_text(&computed);
    if expected_text == computed_text {
        info!("compare_official_results: {} lines match", expected.len());
        return 0;
    }
    warn!("Found differences with the official results");
    print_diff(expected_text.as_str(), computed_text.as_str(), "\n");
    let (_, changes) = diff(expected_text.as_str(), computed_text.as_str(), "\n");
    changes
        .iter()
        .filter(|c| matches!(c, Difference::Add(_) | Difference::Rem(_)))
        .count()
}

fn read_official_results(db: &Db, location: &str) -> AuditResult<Vec<OfficialResultRow>> {
    read_table(&db.read_location(location)?, location)
}

// ********* Assembly ***********

fn load_stage_summary(db: &Db, stage: Stage) -> AuditResult<Option<StageSummary>> {
    if !db.exists(stage.dirname(), None, STAGE_SUMMARY_NAME)? {
        return Ok(None);
    }
    Ok(Some(db.load_json(stage.dirname(), None, STAGE_SUMMARY_NAME)?))
}

/// Writes `report/totals.csv`, `report/totals.json`, `report/discrepancies.csv`
/// and `report/summary.json`.
pub fn build_report(ctx: &JobContext) -> AuditResult<ReportSummary> {
    let contests = ctx.load_contests()?;
    let mut summary = ReportSummary::default();

    let bifs = load_all_bifs(ctx)?;
    let mapped = mapped_styles(&ctx.db)?;
    for (_, bif) in bifs.iter() {
        summary.num_ballots += bif.len();
        let (_, unmapped) = extraction_rows(&ctx.settings, bif, &mapped);
        for (style, n) in unmapped {
            *summary.unmapped_ballots.entry(style).or_insert(0) += n;
        }
    }
    summary.num_unmapped_ballots = summary.unmapped_ballots.values().sum();
    let cvr_ids: BTreeSet<String> = load_cvr_index(&ctx.db)?.into_keys().collect();
    summary.invariant_violations += bif_report(&bifs, &cvr_ids).duplicate_ids.len();

    let mut totals = empty_totals(&contests);
    for (root, _) in bifs.iter() {
        if !ctx.db.exists(MARKS_DIR, None, &marks_name(root))? {
            warn!("build_report: no marks for archive {}", root);
            continue;
        }
        let rows = load_marks(&ctx.db, root)?;
        let ballots = group_by_ballot(&rows);
        summary.num_ballots_extracted += ballots.len();
        for (_, ballot_rows) in ballots.iter() {
            let headers: Vec<&MarksRow> = ballot_rows.iter().filter(|r| r.is_header()).collect();
            summary.num_overvoted_contests += headers.iter().filter(|h| h.overvotes > 0).count();
            if !headers.is_empty() && headers.iter().all(|h| h.num_marks == 0) {
                summary.num_blank_ballots += 1;
            }
        }
        add_archive_totals(&mut totals, &rows);
    }
    summary.invariant_violations += conservation_violations(&contests, &totals);

    let mut discrepancies: Vec<DisagreedRow> = Vec::new();
    if has_cvr(&ctx.db)? {
        for (root, _) in bifs.iter() {
            let statuses: Vec<CmpcvrRow> = match load_cmpcvr(&ctx.db, None, root) {
                Ok(r) => r,
                Err(AuditError::DataNotFound { location }) => {
                    warn!("build_report: no comparison for archive {}: {}", root, location);
                    continue;
                }
                Err(e) => return Err(e),
            };
            summary.num_ballots_compared += statuses.len();
            for s in statuses.iter() {
                *summary
                    .compare_statuses
                    .entry(s.status.to_string())
                    .or_insert(0) += 1;
            }
            let mut d: Vec<DisagreedRow> = load_cmpcvr(&ctx.db, Some(DISAGREED_PREFIX), root)?;
            discrepancies.append(&mut d);
        }
    }
    summary.num_discrepancies = discrepancies.len();
    ctx.db
        .save_table(&discrepancies, REPORT_DIR, None, DISCREPANCIES_NAME)?;

    for stage in Stage::ALL {
        if let Some(s) = load_stage_summary(&ctx.db, stage)? {
            summary.invariant_violations += s.header_mismatches + s.invariant_violations;
            let failures = s.failed + s.timed_out;
            if failures > 0 {
                summary.stage_failures.insert(stage.to_string(), failures);
            }
        }
    }

    if let Some(path) = ctx.settings.official_results_path.as_ref() {
        let official = read_official_results(&ctx.db, path)?;
        summary.official_results_differences = Some(compare_official_results(&official, &totals));
    }

    ctx.db
        .save_table(&totals_rows(&contests, &totals), REPORT_DIR, None, TOTALS_NAME)?;
    ctx.db.save_json(&totals, REPORT_DIR, None, TOTALS_JSON_NAME)?;
    ctx.db.save_json(&summary, REPORT_DIR, None, SUMMARY_NAME)?;
    info!(
        "build_report: {} ballots, {} extracted, {} unmapped, {} discrepancies",
        summary.num_ballots,
        summary.num_ballots_extracted,
        summary.num_unmapped_ballots,
        summary.num_discrepancies
    );
    Ok(summary)
}
