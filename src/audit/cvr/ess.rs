// ES&S cast vote record exports (Excel, or CSV saved from Excel).

use std::io::Cursor;

use calamine::{DataType, Reader, Xlsx};
use log::debug;
use snafu::prelude::*;

use crate::audit::cvr::{CvrBallot, CvrBallots};
use crate::audit::store::Db;
use crate::audit::table::RawTable;
use crate::audit::*;

/// Columns that describe the ballot rather than a contest.
const ID_COLUMN: &str = "cast vote record";
const PRECINCT_COLUMN: &str = "precinct";
const STYLE_COLUMN: &str = "ballot style";
const PARTY_COLUMN: &str = "party";
const OTHER_META_COLUMNS: [&str; 5] = [
    "tabulator",
    "batch",
    "counting group",
    "precinct id",
    "ballot status",
];

pub fn read_ess(db: &Db, location: &str) -> AuditResult<CvrBallots> {
    let bytes = db.read_location(location)?;
    let (header, rows) = if location.to_lowercase().ends_with(".csv") {
        let t = RawTable::parse(&bytes, location)?;
        (t.header, t.rows)
    } else {
        read_excel(bytes, location)?
    };
    ess_rows_to_ballots(&header, &rows, location)
}

fn read_excel(bytes: Vec<u8>, path: &str) -> AuditResult<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).context(OpeningExcelSnafu { path })?;
    let wrange = workbook
        .worksheet_range_at(0)
        .context(EmptyExcelSnafu { path })?
        .context(OpeningExcelSnafu { path })?;
    let mut iter = wrange.rows();
    let header: Vec<String> = iter
        .next()
        .context(EmptyExcelSnafu { path })?
        .iter()
        .map(read_cell)
        .collect();
    debug!("read_excel: header: {:?}", header);
    let rows: Vec<Vec<String>> = iter.map(|row| row.iter().map(read_cell).collect()).collect();
    Ok((header, rows))
}

fn read_cell(cell: &DataType) -> String {
    match cell {
        DataType::Empty => "".to_string(),
        DataType::String(s) => s.trim().to_string(),
        // Ids and styles are stored as numbers.
        DataType::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        DataType::Int(i) => i.to_string(),
        x => x.to_string(),
    }
}

/// Interprets the sheet: one row per ballot, one column per contest seat.
/// A contest with `vote_for > 1` spans several columns with the same header.
pub fn ess_rows_to_ballots(header: &[String], rows: &[Vec<String>], location: &str) -> AuditResult<CvrBallots> {
    let lower: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
    let find = |name: &str| lower.iter().position(|h| h == name);
    let id_idx = find(ID_COLUMN).context(ConfigurationSnafu {
        message: format!("{}: missing column 'Cast Vote Record'", location),
    })?;
    let precinct_idx = find(PRECINCT_COLUMN);
    let style_idx = find(STYLE_COLUMN);
    let party_idx = find(PARTY_COLUMN);
    let contest_cols: Vec<usize> = (0..header.len())
        .filter(|i| {
            let h = lower[*i].as_str();
            h != ID_COLUMN
                && h != PRECINCT_COLUMN
                && h != STYLE_COLUMN
                && h != PARTY_COLUMN
                && !OTHER_META_COLUMNS.contains(&h)
                && !h.is_empty()
        })
        .collect();

    let cell = |row: &Vec<String>, idx: Option<usize>| -> String {
        idx.and_then(|i| row.get(i)).cloned().unwrap_or_default()
    };

    let mut res: CvrBallots = CvrBallots::new();
    for (lineno, row) in rows.iter().enumerate() {
        let ballot_id = cell(row, Some(id_idx));
        if ballot_id.is_empty() {
            debug!("ess_rows_to_ballots: {}: row {} has no id, skipping", location, lineno + 2);
            continue;
        }
        let mut b = CvrBallot {
            ballot_id: ballot_id.clone(),
            style_num: cell(row, style_idx),
            precinct: cell(row, precinct_idx),
            party: cell(row, party_idx),
            ..CvrBallot::default()
        };
        for i in contest_cols.iter() {
            let contest = header[*i].trim().to_string();
            let value = cell(row, Some(*i));
            let sels = b.selections.entry(contest).or_default();
            if !value.is_empty() {
                sels.push(value);
            }
        }
        if res.insert(ballot_id.clone(), b).is_some() {
            whatever!("{}: ballot {} appears twice in the CVR", location, ballot_id);
        }
    }
    Ok(res)
}
