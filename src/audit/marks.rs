//! Mark extraction.
//!
//! For every ballot of a mapped style, the analyzer measures each target of the
//! roismap slice of the style. The counting policy of `contest_tally` turns the
//! measures into votes. Each contest of a ballot gives a `#contest` header row,
//! with the over- and undervotes, followed by one row per target.

use std::collections::{BTreeMap, BTreeSet};

use contest_tally::{count_contest, Contests, MarkLine, OptionMark, CONTEST_HEADER};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::analysis::Observation;
use crate::audit::archive::{archive_root, location_of, ArchiveSource};
use crate::audit::bif::{load_all_bifs, BifRow};
use crate::audit::context::JobContext;
use crate::audit::logs::TaskLog;
use crate::audit::settings::JobSettings;
use crate::audit::store::Db;
use crate::audit::styles::{effective_style_of, load_roismap_slice, mapped_styles, RoisMapRow};
use crate::audit::table::{slices, Table};
use crate::audit::tasks::{Stage, TaskArgs, CHUNKS_DIR};
use crate::audit::*;

pub const MARKS_DIR: &str = "marks";

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarksRow {
    /// Position of the ballot in its chunk.
    pub idx: usize,
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub contest: String,
    pub option: String,
    pub has_indication: u8,
    pub num_marks: u32,
    pub num_votes: u32,
    pub pixel_metric_value: u32,
    pub writein_name: String,
    pub overvotes: u32,
    pub undervotes: u32,
    /// Position of the target in the roismap slice of the style.
    pub ssidx: usize,
    pub delta_y: i32,
}

impl Table for MarksRow {
    const COLUMNS: &'static [&'static str] = &[
        "idx",
        "ballot_id",
        "style_num",
        "precinct",
        "contest",
        "option",
        "has_indication",
        "num_marks",
        "num_votes",
        "pixel_metric_value",
        "writein_name",
        "overvotes",
        "undervotes",
        "ssidx",
        "delta_y",
    ];
}

impl MarksRow {
    pub fn mark_line(&self) -> MarkLine {
        MarkLine {
            contest: self.contest.clone(),
            option: self.option.clone(),
            num_marks: self.num_marks,
            num_votes: self.num_votes,
            overvotes: self.overvotes,
            undervotes: self.undervotes,
        }
    }

    pub fn is_header(&self) -> bool {
        self.option == CONTEST_HEADER
    }
}

pub fn marks_name(root: &str) -> String {
    format!("{}_marks.csv", root)
}

/// The rows of one ballot, in the order of the file.
pub fn group_by_ballot(rows: &[MarksRow]) -> IndexMap<String, Vec<MarksRow>> {
    let mut res: IndexMap<String, Vec<MarksRow>> = IndexMap::new();
    for r in rows.iter() {
        res.entry(r.ballot_id.clone()).or_default().push(r.clone());
    }
    res
}

// ********* Planning ***********

/// The style a BIF row is extracted with. It is derived from the current
/// merge map, as at template planning time, and not from the `pstyle_num`
/// recorded when the BIF was built.
pub fn extraction_style(settings: &JobSettings, row: &BifRow) -> String {
    effective_style_of(settings, &row.style_num, &row.party, row.sheet0)
}

fn passes_filters(settings: &JobSettings, row: &BifRow) -> bool {
    (settings.include_bmd || row.is_bmd == 0)
        && (settings.include_corrupted || row.style_roi_corrupted == 0)
}

/// The rows of a BIF that go to extraction, sorted by CVR chunk, and the
/// number of rows left out because their style is not mapped, by style.
pub fn extraction_rows(
    settings: &JobSettings,
    bif: &[BifRow],
    mapped: &BTreeSet<String>,
) -> (Vec<BifRow>, BTreeMap<String, usize>) {
    let mut rows: Vec<BifRow> = Vec::new();
    let mut unmapped: BTreeMap<String, usize> = BTreeMap::new();
    for r in bif.iter().filter(|r| passes_filters(settings, r)) {
        let style = extraction_style(settings, r);
        if mapped.contains(&style) {
            rows.push(r.clone());
        } else {
            *unmapped.entry(style).or_insert(0) += 1;
        }
    }
    rows.sort_by(|a, b| a.cvr_file.cmp(&b.cvr_file));
    (rows, unmapped)
}

/// Plans the extraction tasks: per archive, the ballots of mapped styles in
/// slices of `genmarks_ballots_per_chunk`. The manifests are BIF rows.
pub fn plan_marks_tasks(ctx: &JobContext) -> AuditResult<Vec<TaskArgs>> {
    let mapped = mapped_styles(&ctx.db)?;
    let mut tasks: Vec<TaskArgs> = Vec::new();
    for (root, bif) in load_all_bifs(ctx)? {
        let (rows, unmapped) = extraction_rows(&ctx.settings, &bif, &mapped);
        if !unmapped.is_empty() {
            info!(
                "plan_marks_tasks: {}: ballots of unmapped styles left out: {:?}",
                root, unmapped
            );
        }
        for (idx, chunk) in slices(&rows, ctx.settings.genmarks_ballots_per_chunk)
            .iter()
            .enumerate()
        {
            let args = TaskArgs::new(&ctx.settings, Stage::Marks, &root, idx);
            args.write_manifest(&ctx.db, chunk)?;
            tasks.push(args);
        }
    }
    Ok(tasks)
}

// ********* Running ***********

fn indication_threshold(threshold: u32) -> u32 {
    (threshold / 2).max(1)
}

/// Turns the observations of one ballot into marks rows.
pub fn ballot_marks(
    idx: usize,
    row: &BifRow,
    style: &str,
    roismap: &[RoisMapRow],
    observations: &[Observation],
    contests: &Contests,
) -> AuditResult<Vec<MarksRow>> {
    let by_roi: BTreeMap<usize, &Observation> = observations.iter().map(|o| (o.roi, o)).collect();
    let base = MarksRow {
        idx,
        ballot_id: row.ballot_id.clone(),
        style_num: style.to_string(),
        precinct: row.precinct.clone(),
        ..MarksRow::default()
    };

    // Contest header position, then the positions of its targets.
    let mut sections: Vec<(usize, Vec<usize>)> = Vec::new();
    for (pos, r) in roismap.iter().enumerate() {
        if r.option == CONTEST_HEADER {
            sections.push((pos, vec![]));
        } else if let Some((_, targets)) = sections.last_mut() {
            targets.push(pos);
        }
    }

    let mut res: Vec<MarksRow> = Vec::new();
    for (header_pos, targets) in sections.iter() {
        let contest_name = &roismap[*header_pos].contest;
        let contest = contests
            .get(contest_name)
            .context(BallotProcessingSnafu {
                ballot_id: row.ballot_id.clone(),
                message: format!("contest {} of style {} is not in the contests", contest_name, style),
            })?;
        let mut marks: Vec<OptionMark> = Vec::new();
        let mut rows: Vec<MarksRow> = Vec::new();
        for pos in targets.iter() {
            let target = &roismap[*pos];
            let obs = by_roi.get(pos);
            let metric = obs.map(|o| o.pixel_metric_value).unwrap_or(0);
            let marked = metric >= target.pixel_metric_threshold;
            let writein_name = if marked {
                obs.and_then(|o| o.writein_name.clone())
            } else {
                None
            };
            marks.push(OptionMark {
                option: target.option.clone(),
                marked,
                writein_name: writein_name.clone(),
            });
            rows.push(MarksRow {
                contest: contest_name.clone(),
                option: target.option.clone(),
                has_indication: (metric >= indication_threshold(target.pixel_metric_threshold)) as u8,
                num_marks: marked as u32,
                pixel_metric_value: metric,
                writein_name: writein_name.unwrap_or_default(),
                ssidx: *pos,
                delta_y: obs.map(|o| o.delta_y).unwrap_or(0),
                ..base.clone()
            });
        }
        let count = count_contest(contest.vote_for, &marks);
        for (r, (_, votes)) in rows.iter_mut().zip(count.votes.iter()) {
            r.num_votes = *votes;
        }
        res.push(MarksRow {
            contest: contest_name.clone(),
            option: CONTEST_HEADER.to_string(),
            has_indication: rows.iter().any(|r| r.has_indication != 0) as u8,
            num_marks: count.num_marks,
            num_votes: count.votes.iter().map(|(_, v)| v).sum(),
            overvotes: count.overvotes,
            undervotes: count.undervotes,
            ssidx: *header_pos,
            ..base.clone()
        });
        res.extend(rows);
    }
    Ok(res)
}

/// Extracts the marks of the ballots of one chunk. A ballot that cannot be
/// read or aligned is logged and left out.
pub fn run_marks_task(ctx: &JobContext, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<()> {
    let ballots: Vec<BifRow> = args.load_manifest(&ctx.db)?;
    let contests = ctx.load_contests()?;
    let mut roismaps: IndexMap<String, Vec<RoisMapRow>> = IndexMap::new();
    let mut sources: IndexMap<String, ArchiveSource> = IndexMap::new();
    let mut rows: Vec<MarksRow> = Vec::new();
    let mut dropped = 0;
    for (idx, b) in ballots.iter().enumerate() {
        let style = extraction_style(&ctx.settings, b);
        if !roismaps.contains_key(&style) {
            roismaps.insert(style.clone(), load_roismap_slice(&ctx.db, &style)?);
        }
        if !sources.contains_key(&b.archive_basename) {
            let location = location_of(&ctx.settings, &b.archive_basename)?;
            sources.insert(b.archive_basename.clone(), ArchiveSource::open(&ctx.db, &location));
        }
        let (roismap, source) = match (roismaps.get(&style), sources.get(&b.archive_basename)) {
            (Some(r), Some(s)) => (r, s),
            _ => whatever!("ballot {}: style {} or archive not loaded", b.ballot_id, style),
        };
        let observed = source.read_images(&b.file_paths()).and_then(|images| {
            ctx.analyzer
                .observe_marks(&b.ballot_id, &images, roismap)
                .map_err(|e| e.for_ballot(&b.ballot_id))
        });
        let ballot_rows = observed
            .and_then(|obs| ballot_marks(idx, b, &style, roismap, &obs, &contests));
        match ballot_rows {
            Ok(mut r) => rows.append(&mut r),
            Err(e @ AuditError::WorkerFailure { .. }) => return Err(e),
            Err(e) => {
                log.exception(e.to_string());
                dropped += 1;
            }
        }
    }
    log.info(format!(
        "{} ballots extracted, {} dropped, {} rows",
        ballots.len() - dropped,
        dropped,
        rows.len()
    ));
    debug!("run_marks_task: {}: {} styles", args.task_name, roismaps.len());
    args.save_result(&ctx.db, &rows)?;
    Ok(())
}

// ********* Join ***********

/// Combines the chunks of each archive into `marks/{archive_root}_marks.csv`.
/// Returns the number of chunks skipped for a header mismatch.
pub fn combine_marks(ctx: &JobContext) -> AuditResult<usize> {
    let mut header_mismatches = 0;
    for location in ctx.settings.archives.iter() {
        let root = archive_root(location);
        let stats = ctx.db.combine_chunks(
            MARKS_DIR,
            Some(CHUNKS_DIR),
            &marks_name(&root),
            &format!("{}_marks_chunk_*.csv", root),
        )?;
        info!("combine_marks: {}: {} chunks, {} rows", root, stats.chunks, stats.rows);
        header_mismatches += stats.header_mismatches;
    }
    Ok(header_mismatches)
}

pub fn load_marks(db: &Db, root: &str) -> AuditResult<Vec<MarksRow>> {
    db.load_table(MARKS_DIR, None, &marks_name(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contest_tally::builder::{ContestsBuilder, EifRow};
    use crate::audit::styles::plan_styles;

    fn contests() -> Contests {
        let mut b = ContestsBuilder::new();
        for o in ["A", "B", "writein:"] {
            b.add_row(&EifRow {
                official_contest_name: "Mayor".to_string(),
                contest_alias: "".to_string(),
                vote_for: "1".to_string(),
                official_option: o.to_string(),
                option_alias: "".to_string(),
            })
            .unwrap();
        }
        b.build().unwrap()
    }

    fn roismap() -> Vec<RoisMapRow> {
        [CONTEST_HEADER, "A", "B", "writein_0"]
            .iter()
            .enumerate()
            .map(|(i, o)| RoisMapRow {
                style_num: "1".to_string(),
                contest: "Mayor".to_string(),
                option: o.to_string(),
                page: 0,
                sheet0: 0,
                x: 100,
                y: 100 + 30 * i as u32,
                w: 24,
                h: 16,
                pixel_metric_threshold: 40,
            })
            .collect()
    }

    fn obs(roi: usize, metric: u32, writein: Option<&str>) -> Observation {
        Observation {
            roi,
            pixel_metric_value: metric,
            writein_name: writein.map(|s| s.to_string()),
            delta_y: 0,
        }
    }

    fn ballot() -> BifRow {
        BifRow {
            ballot_id: "0001".to_string(),
            precinct: "P1".to_string(),
            style_num: "1".to_string(),
            ..BifRow::default()
        }
    }

    #[test]
    fn single_vote() {
        let o = vec![obs(1, 120, None), obs(2, 3, None), obs(3, 3, None)];
        let rows = ballot_marks(0, &ballot(), "1", &roismap(), &o, &contests()).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].is_header());
        assert_eq!((rows[0].num_marks, rows[0].num_votes), (1, 1));
        assert_eq!((rows[0].overvotes, rows[0].undervotes), (0, 0));
        assert_eq!(rows[1].num_votes, 1);
        assert_eq!(rows[2].has_indication, 0);
        assert_eq!(rows[3].ssidx, 3);
    }

    #[test]
    fn overvote_gives_no_vote() {
        let o = vec![obs(1, 120, None), obs(2, 120, None), obs(3, 3, None)];
        let rows = ballot_marks(0, &ballot(), "1", &roismap(), &o, &contests()).unwrap();
        assert_eq!((rows[0].num_marks, rows[0].overvotes), (2, 1));
        assert!(rows.iter().all(|r| r.num_votes == 0));
    }

    #[test]
    fn blank_contest_is_an_undervote() {
        let o = vec![obs(1, 3, None), obs(2, 3, None), obs(3, 3, None)];
        let rows = ballot_marks(0, &ballot(), "1", &roismap(), &o, &contests()).unwrap();
        assert_eq!((rows[0].num_marks, rows[0].undervotes), (0, 1));
    }

    #[test]
    fn writein_keeps_the_name() {
        let o = vec![obs(1, 3, None), obs(2, 3, None), obs(3, 120, Some("Zed"))];
        let rows = ballot_marks(0, &ballot(), "1", &roismap(), &o, &contests()).unwrap();
        assert_eq!(rows[3].option, "writein_0");
        assert_eq!(rows[3].num_votes, 1);
        assert_eq!(rows[3].writein_name, "Zed");
        let lines: Vec<MarkLine> = rows.iter().map(|r| r.mark_line()).collect();
        let t = contest_tally::audit_unified(&lines);
        assert_eq!(t["Mayor"].writeins, 1);
    }

    #[test]
    fn extraction_leaves_out_unmapped_and_filtered_rows() {
        let s: JobSettings =
            serde_json::from_str(r#"{"job_name": "j", "job_root": "/tmp/j"}"#).unwrap();
        let row = |id: &str, cvr: &str, style: &str, bmd: u8| BifRow {
            ballot_id: id.to_string(),
            cvr_file: cvr.to_string(),
            style_num: style.to_string(),
            pstyle_num: style.to_string(),
            is_bmd: bmd,
            ..BifRow::default()
        };
        let bif = vec![
            row("1", "c1", "1", 0),
            row("2", "c0", "1", 0),
            row("3", "c0", "9", 0),
            row("4", "c0", "1", 1),
        ];
        let mapped: BTreeSet<String> = ["1".to_string()].into();
        let (rows, unmapped) = extraction_rows(&s, &bif, &mapped);
        let ids: Vec<&str> = rows.iter().map(|r| r.ballot_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(unmapped.get("9"), Some(&1));
    }

    #[test]
    fn templates_and_extraction_share_the_merged_style() {
        let mut s: JobSettings =
            serde_json::from_str(r#"{"job_name": "j", "job_root": "/tmp/j"}"#).unwrap();
        let bif = vec![BifRow {
            ballot_id: "1".to_string(),
            style_num: "11".to_string(),
            pstyle_num: "11".to_string(),
            ..BifRow::default()
        }];
        // The merge map changed after the BIF was built.
        s.merge_similar_styles.insert("11".to_string(), "10".to_string());
        let (plans, _) = plan_styles(&s, &[bif.clone()]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].style_num, "10");
        assert_eq!(extraction_style(&s, &bif[0]), "10");

        let mapped: BTreeSet<String> = [plans[0].style_num.clone()].into();
        let (rows, unmapped) = extraction_rows(&s, &bif, &mapped);
        assert_eq!(rows.len(), 1);
        assert!(unmapped.is_empty());
    }
}
