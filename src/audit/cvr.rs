//! Cast vote records.
//!
//! Each vendor export is read into the same normalized form, [`CvrBallots`],
//! then persisted in chunks under `cvr/chunks/` with an index
//! `cvr/ballot_index.csv` that tells in which chunk each ballot lives. Workers
//! only load the chunks of the ballots they handle.

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::audit::settings::Vendor;
use crate::audit::store::Db;
use crate::audit::table::{slices, Table};
use crate::audit::*;

pub mod cdf;
pub mod dominion;
pub mod ess;
pub mod long_csv;

pub const CVR_DIR: &str = "cvr";
pub const CVR_CHUNKS_DIR: &str = "chunks";
pub const CVR_INDEX_NAME: &str = "ballot_index.csv";

/// The record of one ballot in the CVR.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct CvrBallot {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub party: String,
    /// Exported contest name to the raw selections, in export order.
    pub selections: IndexMap<String, Vec<String>>,
}

pub type CvrBallots = IndexMap<String, CvrBallot>;

/// One selection of one ballot. The persisted chunks are lists of these rows.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CvrSelectionRow {
    pub ballot_id: String,
    pub style_num: String,
    pub precinct: String,
    pub party: String,
    pub contest: String,
    pub selection: String,
}

impl Table for CvrSelectionRow {
    const COLUMNS: &'static [&'static str] = &[
        "ballot_id",
        "style_num",
        "precinct",
        "party",
        "contest",
        "selection",
    ];
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CvrIndexRow {
    pub ballot_id: String,
    pub cvr_file: String,
    pub style_num: String,
    pub precinct: String,
    pub party: String,
}

impl Table for CvrIndexRow {
    const COLUMNS: &'static [&'static str] =
        &["ballot_id", "cvr_file", "style_num", "precinct", "party"];
}

/// Reads the CVR export of a vendor.
pub fn read_cvr(db: &Db, vendor: Vendor, location: &str) -> AuditResult<CvrBallots> {
    info!("Attempting to read CVR {:?} ({:?})", location, vendor);
    let ballots = match vendor {
        Vendor::Ess => ess::read_ess(db, location),
        Vendor::Dominion => dominion::read_dominion(db, location),
        Vendor::Cdf => cdf::read_cdf(db, location),
        Vendor::Csv => long_csv::read_long_csv(db, location),
    }?;
    info!("read_cvr: {} ballots", ballots.len());
    Ok(ballots)
}

pub fn ballots_to_rows<'a>(ballots: impl Iterator<Item = &'a CvrBallot>) -> Vec<CvrSelectionRow> {
    let mut rows: Vec<CvrSelectionRow> = Vec::new();
    for b in ballots {
        for (contest, sels) in b.selections.iter() {
            // An empty contest keeps one empty row so that it survives the round trip.
            let sels: Vec<String> = if sels.is_empty() {
                vec!["".to_string()]
            } else {
                sels.clone()
            };
            for s in sels {
                rows.push(CvrSelectionRow {
                    ballot_id: b.ballot_id.clone(),
                    style_num: b.style_num.clone(),
                    precinct: b.precinct.clone(),
                    party: b.party.clone(),
                    contest: contest.clone(),
                    selection: s,
                });
            }
        }
        if b.selections.is_empty() {
            rows.push(CvrSelectionRow {
                ballot_id: b.ballot_id.clone(),
                style_num: b.style_num.clone(),
                precinct: b.precinct.clone(),
                party: b.party.clone(),
                contest: "".to_string(),
                selection: "".to_string(),
            });
        }
    }
    rows
}

pub fn rows_to_ballots(rows: Vec<CvrSelectionRow>) -> CvrBallots {
    let mut res: CvrBallots = IndexMap::new();
    for r in rows {
        let b = res.entry(r.ballot_id.clone()).or_insert_with(|| CvrBallot {
            ballot_id: r.ballot_id.clone(),
            style_num: r.style_num.clone(),
            precinct: r.precinct.clone(),
            party: r.party.clone(),
            selections: IndexMap::new(),
        });
        if r.contest.is_empty() {
            continue;
        }
        let sels = b.selections.entry(r.contest).or_default();
        if !r.selection.is_empty() {
            sels.push(r.selection);
        }
    }
    res
}

fn chunk_name(idx: usize) -> String {
    format!("cvr_chunk_{:04}.csv", idx)
}

/// Writes the CVR in chunks of `ballots_per_chunk` ballots, with its index.
/// Returns the number of chunks.
pub fn persist_cvr(db: &Db, ballots: &CvrBallots, ballots_per_chunk: usize) -> AuditResult<usize> {
    db.delete(CVR_DIR, Some(CVR_CHUNKS_DIR), "*")?;
    let all: Vec<&CvrBallot> = ballots.values().collect();
    let chunks = slices(&all, ballots_per_chunk);
    let mut index: Vec<CvrIndexRow> = Vec::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        let name = chunk_name(idx);
        let rows = ballots_to_rows(chunk.iter().cloned());
        db.save_table(&rows, CVR_DIR, Some(CVR_CHUNKS_DIR), &name)?;
        for b in chunk.iter() {
            index.push(CvrIndexRow {
                ballot_id: b.ballot_id.clone(),
                cvr_file: name.clone(),
                style_num: b.style_num.clone(),
                precinct: b.precinct.clone(),
                party: b.party.clone(),
            });
        }
    }
    db.save_table(&index, CVR_DIR, None, CVR_INDEX_NAME)?;
    info!(
        "persist_cvr: {} ballots in {} chunks",
        index.len(),
        chunks.len()
    );
    Ok(chunks.len())
}

pub fn has_cvr(db: &Db) -> AuditResult<bool> {
    db.exists(CVR_DIR, None, CVR_INDEX_NAME)
}

/// The CVR index by ballot id. Empty when the job has no CVR.
pub fn load_cvr_index(db: &Db) -> AuditResult<IndexMap<String, CvrIndexRow>> {
    if !has_cvr(db)? {
        debug!("load_cvr_index: no CVR for this job");
        return Ok(IndexMap::new());
    }
    let rows: Vec<CvrIndexRow> = db.load_table(CVR_DIR, None, CVR_INDEX_NAME)?;
    let mut res: IndexMap<String, CvrIndexRow> = IndexMap::new();
    for r in rows {
        if res.contains_key(&r.ballot_id) {
            warn!("load_cvr_index: duplicate ballot id {} in the CVR", r.ballot_id);
            continue;
        }
        res.insert(r.ballot_id.clone(), r);
    }
    Ok(res)
}

/// Loads the given chunks of the persisted CVR.
pub fn load_cvr_chunks(db: &Db, names: &[String]) -> AuditResult<CvrBallots> {
    let mut rows: Vec<CvrSelectionRow> = Vec::new();
    for name in names.iter() {
        let mut chunk: Vec<CvrSelectionRow> = db.load_table(CVR_DIR, Some(CVR_CHUNKS_DIR), name)?;
        rows.append(&mut chunk);
    }
    Ok(rows_to_ballots(rows))
}
