// Dominion cast vote record exports: a directory with CvrExport.json and the
// candidate and contest manifests.

use std::collections::HashMap;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::cvr::{CvrBallot, CvrBallots};
use crate::audit::store::Db;
use crate::audit::*;

fn read_json<T: DeserializeOwned>(db: &Db, location: &str, name: &str) -> AuditResult<T> {
    info!("Attempting to read {:?} in {:?}", name, location);
    let bytes = db.read_in_location(location, name)?;
    serde_json::from_slice(&bytes).context(JsonSnafu {
        location: format!("{}/{}", location, name),
    })
}

pub fn read_dominion(db: &Db, location: &str) -> AuditResult<CvrBallots> {
    let candidates: CandidateManifest = read_json(db, location, "CandidateManifest.json")?;
    let contests: ContestManifest = read_json(db, location, "ContestManifest.json")?;
    let export: CvrExport = read_json(db, location, "CvrExport.json")?;
    dominion_to_ballots(&candidates, &contests, &export)
}

fn dominion_to_ballots(
    candidates: &CandidateManifest,
    contests: &ContestManifest,
    export: &CvrExport,
) -> AuditResult<CvrBallots> {
    let candidate_names: HashMap<u32, &Candidate> =
        candidates.candidates.iter().map(|c| (c.id, c)).collect();
    let contest_defs: HashMap<u32, &ContestDef> =
        contests.contests.iter().map(|c| (c.id, c)).collect();
    debug!("dominion_to_ballots: {} candidates", candidate_names.len());

    let mut res: CvrBallots = CvrBallots::new();
    for s in export.sessions.iter() {
        let ballot_id = format!(
            "{:05}_{:05}_{:06}",
            s.tabulator_id, s.batch_id, s.record_id
        );
        // The adjudicated version wins over the scanned one.
        let record = s.modified.as_ref().unwrap_or(&s.original);
        let mut b = CvrBallot {
            ballot_id: ballot_id.clone(),
            style_num: record.ballot_type_id.map(|x| x.to_string()).unwrap_or_default(),
            precinct: record
                .precinct_portion_id
                .map(|x| x.to_string())
                .unwrap_or_default(),
            ..CvrBallot::default()
        };
        for card in record.cards.iter() {
            for contest in card.contests.iter() {
                let def = contest_defs.get(&contest.id).context(DataNotFoundSnafu {
                    location: format!("contest {} in ContestManifest.json", contest.id),
                })?;
                let sels = b.selections.entry(def.description.clone()).or_default();
                let votes: Vec<&Mark> = contest.marks.iter().filter(|m| m.is_vote).collect();
                if contest.marks.is_empty() {
                    sels.push("undervote".to_string());
                } else if votes.is_empty() && contest.marks.len() as u32 > def.vote_for {
                    sels.push("overvote".to_string());
                } else {
                    for m in votes {
                        let c = candidate_names.get(&m.candidate_id).context(DataNotFoundSnafu {
                            location: format!("candidate {} in CandidateManifest.json", m.candidate_id),
                        })?;
                        if c.kind == "WriteIn" {
                            sels.push(format!("write-in:{}", c.description));
                        } else {
                            sels.push(c.description.clone());
                        }
                    }
                }
            }
        }
        res.insert(ballot_id, b);
    }
    Ok(res)
}

fn default_true() -> bool {
    true
}
fn default_vote_for() -> u32 {
    1
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Mark {
    #[serde(rename = "CandidateId")]
    candidate_id: u32,
    #[serde(rename = "Rank", default)]
    rank: u32,
    #[serde(rename = "IsVote", default = "default_true")]
    is_vote: bool,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Contest {
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "Marks", default)]
    marks: Vec<Mark>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Card {
    #[serde(rename = "Contests")]
    contests: Vec<Contest>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "BallotTypeId", default)]
    ballot_type_id: Option<u32>,
    #[serde(rename = "PrecinctPortionId", default)]
    precinct_portion_id: Option<u32>,
    #[serde(rename = "Cards")]
    cards: Vec<Card>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Session {
    #[serde(rename = "TabulatorId")]
    tabulator_id: u32,
    #[serde(rename = "BatchId")]
    batch_id: u32,
    #[serde(rename = "RecordId")]
    record_id: u32,
    #[serde(rename = "Original")]
    original: Record,
    #[serde(rename = "Modified", default)]
    modified: Option<Record>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CvrExport {
    #[serde(rename = "Sessions")]
    sessions: Vec<Session>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Candidate {
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CandidateManifest {
    #[serde(rename = "List")]
    candidates: Vec<Candidate>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct ContestDef {
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "VoteFor", default = "default_vote_for")]
    vote_for: u32,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct ContestManifest {
    #[serde(rename = "List")]
    contests: Vec<ContestDef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_an_export_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("CandidateManifest.json"),
            r#"{"List": [{"Description": "Anna", "Id": 1}, {"Description": "Bob", "Id": 2},
                         {"Description": "Write-in", "Id": 3, "Type": "WriteIn"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("ContestManifest.json"),
            r#"{"List": [{"Description": "Mayor", "Id": 7, "VoteFor": 1}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("CvrExport.json"),
            r#"{"Sessions": [
                {"TabulatorId": 1, "BatchId": 2, "RecordId": 3,
                 "Original": {"BallotTypeId": 12, "PrecinctPortionId": 4,
                   "Cards": [{"Contests": [{"Id": 7, "Marks": [{"CandidateId": 1, "Rank": 1, "IsVote": true}]}]}]}},
                {"TabulatorId": 1, "BatchId": 2, "RecordId": 4,
                 "Original": {"BallotTypeId": 12,
                   "Cards": [{"Contests": [{"Id": 7, "Marks": [
                     {"CandidateId": 1, "Rank": 1, "IsVote": false},
                     {"CandidateId": 2, "Rank": 1, "IsVote": false}]}]}]}},
                {"TabulatorId": 1, "BatchId": 2, "RecordId": 5,
                 "Original": {"Cards": [{"Contests": [{"Id": 7, "Marks": []}]}]},
                 "Modified": {"Cards": [{"Contests": [{"Id": 7, "Marks": [{"CandidateId": 3, "Rank": 1}]}]}]}}
            ]}"#,
        )
        .unwrap();
        let db = Db::in_memory("t").unwrap();
        let b = read_dominion(&db, dir.path().to_str().unwrap()).unwrap();
        assert_eq!(b.len(), 3);
        let first = b.get("00001_00002_000003").unwrap();
        assert_eq!(first.style_num, "12");
        assert_eq!(first.precinct, "4");
        assert_eq!(first.selections.get("Mayor").unwrap(), &vec!["Anna".to_string()]);
        assert_eq!(
            b.get("00001_00002_000004").unwrap().selections.get("Mayor").unwrap(),
            &vec!["overvote".to_string()]
        );
        assert_eq!(
            b.get("00001_00002_000005").unwrap().selections.get("Mayor").unwrap(),
            &vec!["write-in:Write-in".to_string()]
        );
    }
}
