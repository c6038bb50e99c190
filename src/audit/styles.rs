//! Ballot styles: which style a ballot belongs to, and the per-style
//! templates and region maps.
//!
//! A style is processed by one task. The task combines up to `threshold`
//! ballots into a template, finds the regions of interest on the template and
//! maps them to the contests. The outputs for a style `S` are:
//!
//! - `styles/S/S_template.{ext}`, `styles/S/S_style.json`, `styles/S/S_rois.json`
//! - `styles/roismap/S_roismap.csv`
//! - `styles/S/S_redlined.{ext}`
//! - `styles/logs_good_maps/S.txt` or `styles/logs_failed_maps/S.txt`
//!
//! A style that cannot be mapped is not an error for the stage: its ballots
//! are left out of the extraction and reported as unmapped.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::audit::analysis::{AnalysisError, BallotImage, Region, StyleTemplate};
use crate::audit::archive::{location_of, ArchiveSource};
use crate::audit::bif::{BifRow, FILE_PATHS_SEP};
use crate::audit::context::{JobContext, CONFIG_DIR, STYLE_LOOKUP_NAME};
use crate::audit::logs::TaskLog;
use crate::audit::settings::{JobSettings, StylePriority};
use crate::audit::store::Db;
use crate::audit::table::{read_table, Table};
use crate::audit::tasks::{Stage, StyleSteps, TaskArgs};
use crate::audit::*;

pub const STYLES_DIR: &str = "styles";
pub const ROISMAP_DIR: &str = "roismap";
pub const ROISMAP_NAME: &str = "roismap.csv";
pub const GOOD_MAPS_DIR: &str = "logs_good_maps";
pub const FAILED_MAPS_DIR: &str = "logs_failed_maps";
pub const MAP_REPORT_NAME: &str = "map_report.txt";

/// One row of the roismap: where a contest or an option is printed on a style.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RoisMapRow {
    pub style_num: String,
    pub contest: String,
    pub option: String,
    pub page: u32,
    pub sheet0: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub pixel_metric_threshold: u32,
}

impl Table for RoisMapRow {
    const COLUMNS: &'static [&'static str] = &[
        "style_num",
        "contest",
        "option",
        "page",
        "sheet0",
        "x",
        "y",
        "w",
        "h",
        "pixel_metric_threshold",
    ];
}

/// The outcome of a styles task.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StyleSummaryRow {
    pub style_num: String,
    pub num_ballots: usize,
    pub num_rois: usize,
    pub num_roismap_rows: usize,
    pub mapped: u8,
    pub message: String,
}

impl Table for StyleSummaryRow {
    const COLUMNS: &'static [&'static str] = &[
        "style_num",
        "num_ballots",
        "num_rois",
        "num_roismap_rows",
        "mapped",
        "message",
    ];
}

/// The description of a style kept next to its template.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StyleInfo {
    pub style_num: String,
    pub num_ballots: usize,
    pub template_ext: String,
    pub ballot_ids: Vec<String>,
}

// ********* Style policy ***********

/// The style used in place of `style_num`, according to `merge_similar_styles`.
///
/// The most specific key wins: `party:style_num`, then `style_num/sheet0`, then
/// `style_num`. Styles that are not merged are their own effective style.
pub fn effective_style_of(settings: &JobSettings, style_num: &str, party: &str, sheet0: u32) -> String {
    let merge = &settings.merge_similar_styles;
    if merge.is_empty() || style_num.is_empty() {
        return style_num.to_string();
    }
    let keys = [
        format!("{}:{}", party, style_num),
        format!("{}/{}", style_num, sheet0),
        style_num.to_string(),
    ];
    for k in keys.iter() {
        if let Some(s) = merge.get(k) {
            return s.clone();
        }
    }
    style_num.to_string()
}

/// Card code to style number, read from the optional style lookup table.
pub type StyleLookup = IndexMap<String, String>;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StyleLookupRow {
    pub card_code: String,
    pub style_num: String,
}

impl Table for StyleLookupRow {
    const COLUMNS: &'static [&'static str] = &["card_code", "style_num"];
}

/// The lookup table saved at bootstrap, or an empty one.
pub fn load_style_lookup(db: &Db) -> AuditResult<StyleLookup> {
    if !db.exists(CONFIG_DIR, None, STYLE_LOOKUP_NAME)? {
        return Ok(StyleLookup::new());
    }
    let bytes = db.load_bytes(CONFIG_DIR, None, STYLE_LOOKUP_NAME)?;
    let rows: Vec<StyleLookupRow> = read_table(&bytes, STYLE_LOOKUP_NAME)?;
    Ok(rows
        .into_iter()
        .map(|r| (r.card_code.trim().to_string(), r.style_num.trim().to_string()))
        .collect())
}

/// Where the style of a ballot comes from.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum StyleSource {
    Cvr,
    Ballot,
}

/// The style read off the ballot: printed in clear, through the lookup table,
/// or the card code itself.
pub fn ballot_style(printed: Option<&str>, card_code: &str, lookup: &StyleLookup) -> Option<String> {
    if let Some(s) = printed.filter(|s| !s.is_empty()) {
        return Some(s.to_string());
    }
    if card_code.is_empty() {
        return None;
    }
    Some(lookup.get(card_code).cloned().unwrap_or_else(|| card_code.to_string()))
}

/// Chooses between the style given by the CVR and the style read off the
/// ballot, following `style_priority`.
pub fn resolve_style(
    priority: StylePriority,
    cvr_style: Option<&str>,
    ballot_style: Option<&str>,
) -> Option<(String, StyleSource)> {
    let cvr = cvr_style
        .filter(|s| !s.is_empty())
        .map(|s| (s.to_string(), StyleSource::Cvr));
    let ballot = ballot_style
        .filter(|s| !s.is_empty())
        .map(|s| (s.to_string(), StyleSource::Ballot));
    match priority {
        StylePriority::Cvr => cvr.or(ballot),
        StylePriority::CardCode => ballot.or(cvr),
    }
}

// ********* Planning ***********

/// The ballots chosen to build the template of a style.
#[derive(PartialEq, Debug, Clone)]
pub struct StylePlan {
    pub style_num: String,
    /// Number of eligible ballots of the style in all the BIFs.
    pub num_eligible: usize,
    pub rows: Vec<BifRow>,
}

fn template_eligible(row: &BifRow) -> bool {
    row.is_bmd == 0 && row.style_roi_corrupted == 0 && !row.style_num.is_empty()
}

/// Groups the ballots by effective style and keeps up to `threshold` of them
/// per style. Styles with fewer than `min_ballots_required` eligible ballots
/// are returned separately.
pub fn plan_styles(settings: &JobSettings, bifs: &[Vec<BifRow>]) -> (Vec<StylePlan>, Vec<StylePlan>) {
    let mut groups: IndexMap<String, StylePlan> = IndexMap::new();
    for row in bifs.iter().flatten().filter(|r| template_eligible(r)) {
        let style = effective_style_of(settings, &row.style_num, &row.party, row.sheet0);
        let plan = groups.entry(style.clone()).or_insert_with(|| StylePlan {
            style_num: style,
            num_eligible: 0,
            rows: vec![],
        });
        plan.num_eligible += 1;
        if plan.rows.len() < settings.threshold {
            plan.rows.push(row.clone());
        }
    }
    groups.sort_keys();
    groups
        .into_values()
        .partition(|p| p.num_eligible >= settings.min_ballots_required)
}

pub fn style_task(settings: &JobSettings, style_num: &str, steps: StyleSteps) -> TaskArgs {
    let mut args = TaskArgs::new(settings, Stage::Styles, style_num, 0);
    args.style_num = Some(style_num.to_string());
    args.style_steps = Some(steps);
    args
}

/// Removes the region maps and the map logs of a previous run.
pub fn truncate_maps(db: &Db) -> AuditResult<usize> {
    let mut n = db.delete(STYLES_DIR, Some(ROISMAP_DIR), "*")?;
    n += db.delete(STYLES_DIR, Some(GOOD_MAPS_DIR), "*")?;
    n += db.delete(STYLES_DIR, Some(FAILED_MAPS_DIR), "*")?;
    Ok(n)
}

// ********* Running ***********

fn template_name(style: &str, ext: &str) -> String {
    format!("{}_template.{}", style, ext)
}

fn style_info_name(style: &str) -> String {
    format!("{}_style.json", style)
}

fn rois_name(style: &str) -> String {
    format!("{}_rois.json", style)
}

pub fn roismap_name(style: &str) -> String {
    format!("{}_roismap.csv", style)
}

fn map_log_name(style: &str) -> String {
    format!("{}.txt", style)
}

fn read_ballot_images(
    ctx: &JobContext,
    row: &BifRow,
    archives: &mut IndexMap<String, ArchiveSource>,
) -> AuditResult<Vec<BallotImage>> {
    if !archives.contains_key(&row.archive_basename) {
        let location = location_of(&ctx.settings, &row.archive_basename)?;
        archives.insert(
            row.archive_basename.clone(),
            ArchiveSource::open(&ctx.db, &location),
        );
    }
    let paths: Vec<String> = row
        .file_paths
        .split(FILE_PATHS_SEP)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    match archives.get(&row.archive_basename) {
        Some(a) => a.read_images(&paths),
        None => DataNotFoundSnafu {
            location: format!("archive {}", row.archive_basename),
        }
        .fail(),
    }
}

fn build_template(ctx: &JobContext, style: &str, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<StyleInfo> {
    let rows: Vec<BifRow> = args.load_manifest(&ctx.db)?;
    let mut archives: IndexMap<String, ArchiveSource> = IndexMap::new();
    let mut ballots: Vec<Vec<BallotImage>> = Vec::new();
    let mut ballot_ids: Vec<String> = Vec::new();
    for row in rows.iter() {
        match read_ballot_images(ctx, row, &mut archives) {
            Ok(images) => {
                ballots.push(images);
                ballot_ids.push(row.ballot_id.clone());
            }
            Err(e) => log.exception(format!("style {}: ballot {}: {}", style, row.ballot_id, e)),
        }
    }
    let template = ctx
        .analyzer
        .build_template(style, &ballots)
        .map_err(|e| e.for_style(style))?;
    ctx.db.save_bytes(
        template.bytes.clone(),
        STYLES_DIR,
        Some(style),
        &template_name(style, &template.ext),
    )?;
    let info = StyleInfo {
        style_num: style.to_string(),
        num_ballots: template.num_ballots,
        template_ext: template.ext.clone(),
        ballot_ids,
    };
    ctx.db
        .save_json(&info, STYLES_DIR, Some(style), &style_info_name(style))?;
    log.info(format!(
        "style {}: template built from {} ballots",
        style, template.num_ballots
    ));
    Ok(info)
}

/// True if a previous run built the template of the style.
pub fn has_template(db: &Db, style: &str) -> AuditResult<bool> {
    db.exists(STYLES_DIR, Some(style), &style_info_name(style))
}

fn load_template(ctx: &JobContext, style: &str) -> AuditResult<(StyleInfo, StyleTemplate)> {
    let info: StyleInfo = ctx
        .db
        .load_json(STYLES_DIR, Some(style), &style_info_name(style))?;
    let bytes = ctx
        .db
        .load_bytes(STYLES_DIR, Some(style), &template_name(style, &info.template_ext))?;
    let template = StyleTemplate {
        style_num: style.to_string(),
        num_ballots: info.num_ballots,
        ext: info.template_ext.clone(),
        bytes,
    };
    Ok((info, template))
}

/// Runs the enabled steps for one style.
pub fn run_styles_task(ctx: &JobContext, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<()> {
    let style = args.style_num.clone().unwrap_or_else(|| args.group.clone());
    let steps = args.style_steps.unwrap_or(StyleSteps {
        template: true,
        rois: true,
        maprois: true,
    });
    debug!("run_styles_task: style {}: {:?}", style, steps);

    if steps.template {
        build_template(ctx, &style, args, log)?;
    }
    let (info, template) = load_template(ctx, &style)?;

    let regions: Vec<Region> = if steps.rois {
        let regions = ctx
            .analyzer
            .extract_rois(&template)
            .map_err(|e| e.for_style(&style))?;
        ctx.db
            .save_json(&regions, STYLES_DIR, Some(&style), &rois_name(&style))?;
        log.info(format!("style {}: {} regions", style, regions.len()));
        regions
    } else {
        ctx.db
            .load_json(STYLES_DIR, Some(&style), &rois_name(&style))?
    };

    let mut summary = StyleSummaryRow {
        style_num: style.clone(),
        num_ballots: info.num_ballots,
        num_rois: regions.len(),
        num_roismap_rows: 0,
        mapped: 0,
        message: "".to_string(),
    };
    if steps.maprois {
        let contests = ctx.load_contests()?;
        match ctx.analyzer.map_rois(&style, &regions, &contests) {
            Ok(rows) => {
                ctx.db
                    .save_table(&rows, STYLES_DIR, Some(ROISMAP_DIR), &roismap_name(&style))?;
                let (ext, preview) = ctx.analyzer.render_redline(&template, &rows);
                ctx.db.save_bytes(
                    preview,
                    STYLES_DIR,
                    Some(&style),
                    &format!("{}_redlined.{}", style, ext),
                )?;
                let contests_found: BTreeSet<&str> = rows.iter().map(|r| r.contest.as_str()).collect();
                let text = format!(
                    "style {}: mapped {} contests, {} roismap rows\n",
                    style,
                    contests_found.len(),
                    rows.len()
                );
                ctx.db
                    .save_text(&text, STYLES_DIR, Some(GOOD_MAPS_DIR), &map_log_name(&style))?;
                log.info(text.trim_end().to_string());
                summary.num_roismap_rows = rows.len();
                summary.mapped = 1;
            }
            Err(AnalysisError::Fatal(m)) => {
                return Err(AnalysisError::Fatal(m).for_style(&style));
            }
            Err(e) => {
                let err = e.for_style(&style);
                ctx.db.save_text(
                    &format!("{}\n", err),
                    STYLES_DIR,
                    Some(FAILED_MAPS_DIR),
                    &map_log_name(&style),
                )?;
                log.exception(err.to_string());
                summary.message = err.to_string();
            }
        }
    }
    args.save_result(&ctx.db, &[summary])?;
    Ok(())
}

// ********* Outcomes ***********

fn styles_in(db: &Db, subdir: &str) -> AuditResult<BTreeSet<String>> {
    Ok(db
        .list(STYLES_DIR, Some(subdir), "*.txt")?
        .iter()
        .filter_map(|n| n.strip_suffix(".txt").map(|s| s.to_string()))
        .collect())
}

pub fn mapped_styles(db: &Db) -> AuditResult<BTreeSet<String>> {
    styles_in(db, GOOD_MAPS_DIR)
}

pub fn failed_styles(db: &Db) -> AuditResult<BTreeSet<String>> {
    styles_in(db, FAILED_MAPS_DIR)
}

/// The roismap slice of one style.
pub fn load_roismap_slice(db: &Db, style: &str) -> AuditResult<Vec<RoisMapRow>> {
    db.load_table(STYLES_DIR, Some(ROISMAP_DIR), &roismap_name(style))
}

/// Writes `styles/map_report.txt` from the map logs and the skipped styles.
pub fn write_map_report(db: &Db, skipped: &[StylePlan]) -> AuditResult<String> {
    let good = mapped_styles(db)?;
    let failed = failed_styles(db)?;
    let mut text = format!(
        "{} styles mapped, {} styles failed, {} styles skipped\n",
        good.len(),
        failed.len(),
        skipped.len()
    );
    for s in good.iter() {
        text.push_str(&db.load_text(STYLES_DIR, Some(GOOD_MAPS_DIR), &map_log_name(s))?);
    }
    for s in failed.iter() {
        text.push_str(&format!(
            "FAILED {}",
            db.load_text(STYLES_DIR, Some(FAILED_MAPS_DIR), &map_log_name(s))?
        ));
    }
    for p in skipped.iter() {
        text.push_str(&format!(
            "SKIPPED style {}: {} eligible ballots\n",
            p.style_num, p.num_eligible
        ));
    }
    db.save_text(&text, STYLES_DIR, None, MAP_REPORT_NAME)?;
    info!(
        "write_map_report: {} mapped, {} failed, {} skipped",
        good.len(),
        failed.len(),
        skipped.len()
    );
    if !failed.is_empty() {
        warn!("write_map_report: styles not mapped: {:?}", failed);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    fn settings(json: &str) -> JobSettings {
        serde_json::from_str(json).unwrap()
    }

    fn row(id: &str, style: &str, is_bmd: u8, corrupted: u8) -> BifRow {
        BifRow {
            archive_basename: "a".to_string(),
            ballot_id: id.to_string(),
            style_num: style.to_string(),
            is_bmd,
            style_roi_corrupted: corrupted,
            ..BifRow::default()
        }
    }

    #[parameterized(
        unmerged = { "7", "", 0, "7" },
        by_style = { "12", "", 0, "10" },
        by_party = { "12", "DEM", 0, "20" },
        by_sheet = { "12", "REP", 1, "30" },
    )]
    fn merges_styles(style: &str, party: &str, sheet0: u32, expected: &str) {
        let s = settings(
            r#"{"job_name": "j", "job_root": "/tmp/j",
                "merge_similar_styles": {"12": "10", "DEM:12": "20", "12/1": "30"}}"#,
        );
        assert_eq!(effective_style_of(&s, style, party, sheet0), expected);
    }

    #[parameterized(
        cvr_first = { StylePriority::Cvr, Some("1"), Some("2"), Some("1") },
        card_first = { StylePriority::CardCode, Some("1"), Some("2"), Some("2") },
        fallback = { StylePriority::CardCode, Some("1"), None, Some("1") },
        nothing = { StylePriority::Cvr, Some(""), None, None },
    )]
    fn resolves_styles(p: StylePriority, cvr: Option<&str>, ballot: Option<&str>, expected: Option<&str>) {
        assert_eq!(
            resolve_style(p, cvr, ballot).map(|(s, _)| s),
            expected.map(|s| s.to_string())
        );
    }

    #[test]
    fn ballot_style_uses_the_lookup() {
        let lookup = StyleLookup::from([("C9".to_string(), "9".to_string())]);
        assert_eq!(ballot_style(None, "C9", &lookup), Some("9".to_string()));
        assert_eq!(ballot_style(None, "C1", &lookup), Some("C1".to_string()));
        assert_eq!(ballot_style(Some("4"), "C9", &lookup), Some("4".to_string()));
        assert_eq!(ballot_style(None, "", &lookup), None);
    }

    #[test]
    fn plans_templates_by_effective_style() {
        let s = settings(
            r#"{"job_name": "j", "job_root": "/tmp/j", "threshold": 2,
                "min_ballots_required": 2, "merge_similar_styles": {"11": "10"}}"#,
        );
        let bifs = vec![
            vec![
                row("1", "10", 0, 0),
                row("2", "11", 0, 0),
                row("3", "10", 0, 0),
                row("4", "10", 1, 0),
            ],
            vec![row("5", "20", 0, 0), row("6", "20", 0, 1)],
        ];
        let (plans, skipped) = plan_styles(&s, &bifs);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].style_num, "10");
        assert_eq!(plans[0].num_eligible, 3);
        let ids: Vec<&str> = plans[0].rows.iter().map(|r| r.ballot_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].style_num, "20");
    }
}
