// The normalized CSV form: one row per selection, with the columns of
// `CvrSelectionRow`. It is also the form of the persisted CVR chunks.
//
// A row with a contest and an empty selection is a contest on the ballot that
// was left blank. It is read as an explicit undervote, since a contest with no
// selection at all is taken as absent from the ballot.

use crate::audit::cvr::{rows_to_ballots, CvrBallots, CvrSelectionRow};
use crate::audit::store::Db;
use crate::audit::table::read_table;
use crate::audit::*;

pub fn read_long_csv(db: &Db, location: &str) -> AuditResult<CvrBallots> {
    let bytes = db.read_location(location)?;
    let rows: Vec<CvrSelectionRow> = read_table(&bytes, location)?;
    let mut ballots = rows_to_ballots(rows);
    for ballot in ballots.values_mut() {
        for sels in ballot.selections.values_mut() {
            if sels.is_empty() {
                sels.push("undervote".to_string());
            }
        }
    }
    Ok(ballots)
}
