// Primitives for reading and writing CSV tables.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::prelude::*;

use crate::audit::*;

/// A row type stored as a CSV table with a fixed set of columns.
///
/// The header is always written, so that an empty table still carries its
/// columns and can be combined with other chunks.
pub trait Table: Serialize + DeserializeOwned {
    const COLUMNS: &'static [&'static str];
}

fn writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(vec![])
}

fn finish(wtr: csv::Writer<Vec<u8>>, location: &str) -> AuditResult<Vec<u8>> {
    wtr.into_inner()
        .map_err(|e| e.into_error())
        .context(IoSnafu { path: location })
}

pub fn write_table<T: Table>(rows: &[T], location: &str) -> AuditResult<Vec<u8>> {
    let mut wtr = writer();
    wtr.write_record(T::COLUMNS)
        .context(CsvSnafu { location })?;
    for row in rows.iter() {
        wtr.serialize(row).context(CsvSnafu { location })?;
    }
    finish(wtr, location)
}

pub fn read_table<T: Table>(bytes: &[u8], location: &str) -> AuditResult<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let mut res: Vec<T> = Vec::new();
    for (idx, r) in rdr.deserialize().enumerate() {
        let row: T = r.context(CsvSnafu {
            location: format!("{} (row {})", location, idx + 1),
        })?;
        res.push(row);
    }
    Ok(res)
}

/// A table with no schema attached: the header and the string cells.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn parse(bytes: &[u8], location: &str) -> AuditResult<RawTable> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut records = rdr.records();
        let header: Vec<String> = match records.next() {
            Some(r) => r
                .context(CsvSnafu { location })?
                .iter()
                .map(|s| s.to_string())
                .collect(),
            None => return Ok(RawTable::default()),
        };
        let mut rows: Vec<Vec<String>> = Vec::new();
        for r in records {
            let record = r.context(CsvSnafu { location })?;
            rows.push(record.iter().map(|s| s.to_string()).collect());
        }
        Ok(RawTable { header, rows })
    }

    pub fn to_bytes(&self, location: &str) -> AuditResult<Vec<u8>> {
        let mut wtr = writer();
        if !self.header.is_empty() {
            wtr.write_record(&self.header)
                .context(CsvSnafu { location })?;
        }
        for row in self.rows.iter() {
            wtr.write_record(row).context(CsvSnafu { location })?;
        }
        finish(wtr, location)
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// The rows as a list of column-to-value dictionaries.
    pub fn records(&self) -> Vec<IndexMap<String, String>> {
        self.rows
            .iter()
            .map(|row| {
                self.header
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<IndexMap<String, String>>()
            })
            .collect()
    }
}

/// Splits `items` in consecutive slices of at most `size` elements.
pub fn slices<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items
        .chunks(size.max(1))
        .map(|c| c.to_vec())
        .collect::<Vec<Vec<T>>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    struct Row {
        name: String,
        count: u32,
    }

    impl Table for Row {
        const COLUMNS: &'static [&'static str] = &["name", "count"];
    }

    #[test]
    fn empty_table_keeps_its_header() {
        let bytes = write_table::<Row>(&[], "t").unwrap();
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "name,count\n");
        assert!(read_table::<Row>(&bytes, "t").unwrap().is_empty());
        let raw = RawTable::parse(&bytes, "t").unwrap();
        assert_eq!(raw.header, vec!["name", "count"]);
        assert!(raw.rows.is_empty());
    }

    #[test]
    fn rows_are_newline_terminated() {
        let rows = vec![
            Row {
                name: "a,b".to_string(),
                count: 1,
            },
            Row {
                name: "c".to_string(),
                count: 2,
            },
        ];
        let bytes = write_table(&rows, "t").unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "name,count\n\"a,b\",1\nc,2\n"
        );
        assert_eq!(read_table::<Row>(&bytes, "t").unwrap(), rows);
        let raw = RawTable::parse(&bytes, "t").unwrap();
        assert_eq!(raw.records()[0].get("name").unwrap(), "a,b");
        assert_eq!(raw.to_bytes("t").unwrap(), bytes);
    }

    #[test]
    fn slices_cover_everything_once() {
        let items: Vec<u32> = (0..7).collect();
        let s = slices(&items, 3);
        assert_eq!(s, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(slices::<u32>(&[], 3).is_empty());
    }
}
