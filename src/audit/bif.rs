//! The ballot information files (BIF): one table per archive, one row per
//! ballot.
//!
//! The BIF is built either by reading every ballot (`genbif_from_ballots`,
//! chunked) or from the CVR joined with the listing of the archives
//! (`genbif_from_cvr`, no image read). In both cases the rows are enriched
//! with the CVR index, the style policy is applied and the table is sorted by
//! `(cvr_file, ballot_id)` so that later chunks only touch a few CVR chunks.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::analysis::BallotAttributes;
use crate::audit::archive::{archive_basename, archive_root, location_of, ArchiveSource, BallotFiles};
use crate::audit::context::JobContext;
use crate::audit::cvr::{load_cvr_index, CvrIndexRow};
use crate::audit::logs::TaskLog;
use crate::audit::settings::JobSettings;
use crate::audit::store::Db;
use crate::audit::styles::{ballot_style, effective_style_of, load_style_lookup, resolve_style, StyleLookup, StyleSource};
use crate::audit::table::{slices, Table};
use crate::audit::tasks::{Stage, TaskArgs, CHUNKS_DIR};
use crate::audit::*;

pub const BIF_DIR: &str = "bif";
pub const BIF_REPORT_NAME: &str = "bif_report";
/// Separator of the paths in the `file_paths` column.
pub const FILE_PATHS_SEP: &str = ";";

/// One ballot of an archive.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BifRow {
    pub archive_basename: String,
    pub ballot_id: String,
    pub file_paths: String,
    pub cvr_file: String,
    pub precinct: String,
    pub party: String,
    pub style_num: String,
    pub card_code: String,
    /// The effective style, after merging similar styles.
    pub pstyle_num: String,
    pub ballot_type_id: String,
    pub sheet0: u32,
    pub is_bmd: u8,
    pub style_roi_corrupted: u8,
    pub comments: String,
    pub chunk_idx: usize,
}

impl Table for BifRow {
    const COLUMNS: &'static [&'static str] = &[
        "archive_basename",
        "ballot_id",
        "file_paths",
        "cvr_file",
        "precinct",
        "party",
        "style_num",
        "card_code",
        "pstyle_num",
        "ballot_type_id",
        "sheet0",
        "is_bmd",
        "style_roi_corrupted",
        "comments",
        "chunk_idx",
    ];
}

impl BifRow {
    pub fn file_paths(&self) -> Vec<String> {
        self.file_paths
            .split(FILE_PATHS_SEP)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    fn add_comment(&mut self, comment: &str) {
        if !self.comments.is_empty() {
            self.comments.push_str("; ");
        }
        self.comments.push_str(comment);
    }

    pub fn is_corrupted(&self) -> bool {
        self.style_roi_corrupted != 0
    }
}

/// A ballot to read, in the manifest of a BIF task.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BifTaskRow {
    pub archive_basename: String,
    pub ballot_id: String,
    pub file_paths: String,
}

impl Table for BifTaskRow {
    const COLUMNS: &'static [&'static str] = &["archive_basename", "ballot_id", "file_paths"];
}

pub fn bif_name(root: &str) -> String {
    format!("{}_bif.csv", root)
}

// ********* Building from the ballots ***********

/// Plans the BIF tasks: per archive, the ballots in slices of
/// `genbif_ballots_per_chunk`. The manifests are written.
pub fn plan_bif_tasks(ctx: &JobContext) -> AuditResult<Vec<TaskArgs>> {
    let mut tasks: Vec<TaskArgs> = Vec::new();
    for location in ctx.settings.archives.iter() {
        let source = ArchiveSource::open(&ctx.db, location);
        let ballots = source.ballots(ctx.settings.vendor)?;
        let basename = source.basename();
        let root = source.root();
        let chunks = slices(&ballots, ctx.settings.genbif_ballots_per_chunk);
        info!(
            "plan_bif_tasks: archive {}: {} ballots in {} chunks",
            basename,
            ballots.len(),
            chunks.len()
        );
        for (idx, chunk) in chunks.iter().enumerate() {
            let args = TaskArgs::new(&ctx.settings, Stage::Bif, &root, idx);
            let rows: Vec<BifTaskRow> = chunk
                .iter()
                .map(|b: &BallotFiles| BifTaskRow {
                    archive_basename: basename.clone(),
                    ballot_id: b.ballot_id.clone(),
                    file_paths: b.file_paths.join(FILE_PATHS_SEP),
                })
                .collect();
            args.write_manifest(&ctx.db, &rows)?;
            tasks.push(args);
        }
    }
    Ok(tasks)
}

fn attributes_row(task: &BifTaskRow, attrs: &BallotAttributes, chunk_idx: usize) -> BifRow {
    BifRow {
        archive_basename: task.archive_basename.clone(),
        ballot_id: task.ballot_id.clone(),
        file_paths: task.file_paths.clone(),
        precinct: attrs.precinct.clone(),
        party: attrs.party.clone(),
        style_num: attrs.style_num.clone().unwrap_or_default(),
        card_code: attrs.card_code.clone(),
        ballot_type_id: attrs.ballot_type_id.clone(),
        sheet0: attrs.sheet0,
        is_bmd: attrs.is_bmd as u8,
        chunk_idx,
        ..BifRow::default()
    }
}

/// Reads the ballots of one BIF task. A ballot that cannot be read is kept as
/// a corrupted row, with the reason in `comments`.
pub fn run_bif_task(ctx: &JobContext, args: &TaskArgs, log: &mut TaskLog) -> AuditResult<()> {
    let tasks: Vec<BifTaskRow> = args.load_manifest(&ctx.db)?;
    let mut sources: IndexMap<String, ArchiveSource> = IndexMap::new();
    let mut rows: Vec<BifRow> = Vec::new();
    for t in tasks.iter() {
        if !sources.contains_key(&t.archive_basename) {
            let location = location_of(&ctx.settings, &t.archive_basename)?;
            sources.insert(t.archive_basename.clone(), ArchiveSource::open(&ctx.db, &location));
        }
        let source = sources.get(&t.archive_basename).context(DataNotFoundSnafu {
            location: format!("archive {}", t.archive_basename),
        })?;
        let paths: Vec<String> = t
            .file_paths
            .split(FILE_PATHS_SEP)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        let read = source
            .read_images(&paths)
            .and_then(|images| {
                ctx.analyzer
                    .read_ballot(&t.ballot_id, &images)
                    .map_err(|e| e.for_ballot(&t.ballot_id))
            });
        match read {
            Ok(attrs) => rows.push(attributes_row(t, &attrs, args.chunk_idx)),
            Err(e @ AuditError::WorkerFailure { .. }) => return Err(e),
            Err(e) => {
                log.exception(e.to_string());
                let mut row = attributes_row(t, &BallotAttributes::default(), args.chunk_idx);
                row.style_roi_corrupted = 1;
                row.add_comment(&e.to_string());
                rows.push(row);
            }
        }
    }
    log.info(format!("{} ballots read", rows.len()));
    args.save_result(&ctx.db, &rows)?;
    Ok(())
}

// ********* Finalization ***********

/// Counts kept for the stage summary and the BIF report.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BifArchiveStats {
    pub archive: String,
    pub ballots: usize,
    pub corrupted: usize,
    pub bmd: usize,
    pub not_in_cvr: usize,
    pub duplicates_dropped: usize,
}

struct Enricher<'a> {
    settings: &'a JobSettings,
    cvr_index: &'a IndexMap<String, CvrIndexRow>,
    lookup: &'a StyleLookup,
}

impl<'a> Enricher<'a> {
    /// Joins the row with the CVR index and decides its style.
    fn enrich(&self, row: &mut BifRow) {
        let cvr = self.cvr_index.get(&row.ballot_id);
        if let Some(c) = cvr {
            row.cvr_file = c.cvr_file.clone();
            if row.precinct.is_empty() {
                row.precinct = c.precinct.clone();
            }
            if row.party.is_empty() {
                row.party = c.party.clone();
            }
        } else if !self.cvr_index.is_empty() {
            row.add_comment("not in CVR");
        }
        if row.is_corrupted() {
            return;
        }
        let read = ballot_style(Some(row.style_num.as_str()), &row.card_code, self.lookup);
        let from_cvr = cvr.map(|c| c.style_num.as_str());
        match resolve_style(self.settings.style_priority, from_cvr, read.as_deref()) {
            Some((style, source)) => {
                if let (Some(c), Some(r)) = (from_cvr.filter(|s| !s.is_empty()), read.as_deref()) {
                    if c != r {
                        let other = if source == StyleSource::Cvr { r } else { c };
                        row.add_comment(&format!("style {} chosen over {}", style, other));
                    }
                }
                row.pstyle_num = effective_style_of(self.settings, &style, &row.party, row.sheet0);
                row.style_num = style;
            }
            None => {
                row.style_roi_corrupted = 1;
                row.add_comment("no card code and no style in the CVR or the lookup");
            }
        }
    }
}

/// Drops the second occurrences of a ballot id and sorts the rows by
/// `(cvr_file, ballot_id)`. Returns the number of dropped rows.
pub fn dedup_and_sort(rows: &mut Vec<BifRow>) -> usize {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let before = rows.len();
    rows.retain(|r| {
        let fresh = seen.insert(r.ballot_id.clone());
        if !fresh {
            warn!(
                "{}",
                AuditError::InvariantViolation {
                    message: format!(
                        "ballot {} appears twice in archive {}",
                        r.ballot_id, r.archive_basename
                    ),
                }
            );
        }
        fresh
    });
    rows.sort_by(|a, b| (&a.cvr_file, &a.ballot_id).cmp(&(&b.cvr_file, &b.ballot_id)));
    before - rows.len()
}

fn finish_bif(ctx: &JobContext, root: &str, archive: &str, mut rows: Vec<BifRow>, enricher: &Enricher) -> AuditResult<BifArchiveStats> {
    for r in rows.iter_mut() {
        enricher.enrich(r);
    }
    let duplicates_dropped = dedup_and_sort(&mut rows);
    ctx.db.save_table(&rows, BIF_DIR, None, &bif_name(root))?;
    let stats = BifArchiveStats {
        archive: archive.to_string(),
        ballots: rows.len(),
        corrupted: rows.iter().filter(|r| r.is_corrupted()).count(),
        bmd: rows.iter().filter(|r| r.is_bmd != 0).count(),
        not_in_cvr: if enricher.cvr_index.is_empty() {
            0
        } else {
            rows.iter().filter(|r| r.cvr_file.is_empty()).count()
        },
        duplicates_dropped,
    };
    info!("finish_bif: {}: {:?}", root, stats);
    Ok(stats)
}

/// Combines the chunks of every archive into its BIF.
pub fn finalize_bifs(ctx: &JobContext) -> AuditResult<(Vec<BifArchiveStats>, usize)> {
    let cvr_index = load_cvr_index(&ctx.db)?;
    let lookup = load_style_lookup(&ctx.db)?;
    let enricher = Enricher {
        settings: &ctx.settings,
        cvr_index: &cvr_index,
        lookup: &lookup,
    };
    let mut res: Vec<BifArchiveStats> = Vec::new();
    let mut header_mismatches = 0;
    for location in ctx.settings.archives.iter() {
        let root = archive_root(location);
        let combined = ctx.db.combine_chunks(
            BIF_DIR,
            Some(CHUNKS_DIR),
            &bif_name(&root),
            &format!("{}_bif_chunk_*.csv", root),
        )?;
        header_mismatches += combined.header_mismatches;
        let rows = load_bif(&ctx.db, &root)?;
        res.push(finish_bif(ctx, &root, &archive_basename(location), rows, &enricher)?);
    }
    Ok((res, header_mismatches))
}

// ********* Building from the CVR ***********

/// Builds the BIFs without reading any image: the ballots of each archive take
/// their attributes from the CVR.
pub fn build_bif_from_cvr(ctx: &JobContext) -> AuditResult<Vec<BifArchiveStats>> {
    let cvr_index = load_cvr_index(&ctx.db)?;
    ensure!(
        !cvr_index.is_empty(),
        ConfigurationSnafu {
            message: "genbif_from_cvr needs a CVR with at least one ballot"
        }
    );
    let lookup = load_style_lookup(&ctx.db)?;
    let enricher = Enricher {
        settings: &ctx.settings,
        cvr_index: &cvr_index,
        lookup: &lookup,
    };
    let mut res: Vec<BifArchiveStats> = Vec::new();
    for location in ctx.settings.archives.iter() {
        let source = ArchiveSource::open(&ctx.db, location);
        let basename = source.basename();
        let rows: Vec<BifRow> = source
            .ballots(ctx.settings.vendor)?
            .into_iter()
            .map(|b| BifRow {
                archive_basename: basename.clone(),
                ballot_id: b.ballot_id,
                file_paths: b.file_paths.join(FILE_PATHS_SEP),
                ..BifRow::default()
            })
            .collect();
        debug!("build_bif_from_cvr: {}: {} ballots", basename, rows.len());
        res.push(finish_bif(ctx, &source.root(), &basename, rows, &enricher)?);
    }
    Ok(res)
}

// ********* Loading ***********

pub fn load_bif(db: &Db, root: &str) -> AuditResult<Vec<BifRow>> {
    db.load_table(BIF_DIR, None, &bif_name(root))
}

/// The BIFs of all the archives of the job, by archive root.
pub fn load_all_bifs(ctx: &JobContext) -> AuditResult<Vec<(String, Vec<BifRow>)>> {
    ctx.settings
        .archives
        .iter()
        .map(|location| {
            let root = archive_root(location);
            let rows = load_bif(&ctx.db, &root)?;
            Ok((root, rows))
        })
        .collect()
}

// ********* Report ***********

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BifArchiveReport {
    pub archive: String,
    pub ballots: usize,
    pub bmd: usize,
    pub corrupted: usize,
    pub not_in_cvr: usize,
    pub styles: BTreeMap<String, usize>,
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BifReport {
    pub total_ballots: usize,
    pub archives: Vec<BifArchiveReport>,
    /// Ballot ids found in more than one archive, with the archives.
    pub duplicate_ids: BTreeMap<String, Vec<String>>,
    pub cvr_ballots_without_images: usize,
}

impl BifReport {
    pub fn to_text(&self) -> String {
        let mut lines: Vec<String> = vec![format!("{} ballots", self.total_ballots)];
        for a in self.archives.iter() {
            lines.push(format!(
                "archive {}: {} ballots, {} BMD, {} corrupted, {} not in CVR, {} styles",
                a.archive,
                a.ballots,
                a.bmd,
                a.corrupted,
                a.not_in_cvr,
                a.styles.len()
            ));
            for (s, n) in a.styles.iter() {
                lines.push(format!("    style {}: {}", s, n));
            }
        }
        lines.push(format!(
            "{} ballot ids in more than one archive",
            self.duplicate_ids.len()
        ));
        for (id, archives) in self.duplicate_ids.iter() {
            lines.push(format!("    {}: {}", id, archives.join(", ")));
        }
        lines.push(format!(
            "{} CVR ballots without images",
            self.cvr_ballots_without_images
        ));
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

pub fn bif_report(bifs: &[(String, Vec<BifRow>)], cvr_ids: &BTreeSet<String>) -> BifReport {
    let mut report = BifReport::default();
    let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (root, rows) in bifs.iter() {
        let mut a = BifArchiveReport {
            archive: root.clone(),
            ballots: rows.len(),
            ..BifArchiveReport::default()
        };
        for r in rows.iter() {
            if r.is_bmd != 0 {
                a.bmd += 1;
            }
            if r.is_corrupted() {
                a.corrupted += 1;
            } else {
                *a.styles.entry(r.pstyle_num.clone()).or_insert(0) += 1;
            }
            if !cvr_ids.is_empty() && r.cvr_file.is_empty() {
                a.not_in_cvr += 1;
            }
            seen.entry(r.ballot_id.clone()).or_default().push(root.clone());
        }
        report.total_ballots += rows.len();
        report.archives.push(a);
    }
    report.cvr_ballots_without_images = cvr_ids.iter().filter(|id| !seen.contains_key(*id)).count();
    report.duplicate_ids = seen.into_iter().filter(|(_, a)| a.len() > 1).collect();
    if !report.duplicate_ids.is_empty() {
        warn!(
            "{}",
            AuditError::InvariantViolation {
                message: format!(
                    "{} ballot ids appear in more than one archive",
                    report.duplicate_ids.len()
                ),
            }
        );
    }
    report
}

/// Writes `bif/bif_report.json` and `bif/bif_report.txt`.
pub fn create_bif_report(ctx: &JobContext) -> AuditResult<BifReport> {
    let bifs = load_all_bifs(ctx)?;
    let cvr_ids: BTreeSet<String> = load_cvr_index(&ctx.db)?.into_keys().collect();
    let report = bif_report(&bifs, &cvr_ids);
    ctx.db
        .save_json(&report, BIF_DIR, None, &format!("{}.json", BIF_REPORT_NAME))?;
    let text = report.to_text();
    ctx.db
        .save_text(&text, BIF_DIR, None, &format!("{}.txt", BIF_REPORT_NAME))?;
    info!("create_bif_report:\n{}", text);
    Ok(report)
}
