// NIST common data format (CDF) cast vote record reports, JSON flavor.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::audit::cvr::{CvrBallot, CvrBallots};
use crate::audit::store::Db;
use crate::audit::*;

pub fn read_cdf(db: &Db, location: &str) -> AuditResult<CvrBallots> {
    let bytes = db.read_location(location)?;
    let cvrr: CastVoteRecordReport =
        serde_json::from_slice(&bytes).context(JsonSnafu { location })?;
    cdf_to_ballots(&cvrr, location)
}

fn cdf_to_ballots(cvrr: &CastVoteRecordReport, location: &str) -> AuditResult<CvrBallots> {
    let e = cvrr.election.first().context(DataNotFoundSnafu {
        location: format!("{}: Election", location),
    })?;

    let candidate_names: HashMap<&str, &str> = e
        .candidates
        .iter()
        .map(|c| (c.candidate_id.as_str(), c.candidate_name.as_str()))
        .collect();
    let contest_names: HashMap<&str, &str> = e
        .contests
        .iter()
        .map(|c| (c.contest_id.as_str(), c.name.as_str()))
        .collect();
    // Selection id to the name of the candidate it stands for.
    let mut selection_names: HashMap<&str, String> = HashMap::new();
    for c in e.contests.iter() {
        for cs in c.contest_selection.iter() {
            let names: Vec<&str> = cs
                .candidate_ids
                .iter()
                .filter_map(|cid| candidate_names.get(cid.as_str()).cloned())
                .collect();
            let name = if cs.is_write_in {
                "write-in:".to_string()
            } else {
                names.join(" & ")
            };
            selection_names.insert(cs.candidate_selection_id.as_str(), name);
        }
    }
    debug!("cdf_to_ballots: {} selections", selection_names.len());

    let mut res: CvrBallots = CvrBallots::new();
    for (idx, cvr) in cvrr.cvr.iter().enumerate() {
        let ballot_id = cvr
            .ballot_id
            .clone()
            .unwrap_or_else(|| format!("{:06}", idx));
        // The current snapshot, or the last one.
        let snap = cvr
            .snapshots
            .iter()
            .find(|s| Some(&s.snapshot_id) == cvr.current_snapshot_id.as_ref())
            .or_else(|| cvr.snapshots.last());
        let mut b = CvrBallot {
            ballot_id: ballot_id.clone(),
            style_num: cvr.ballot_style_id.clone().unwrap_or_default(),
            precinct: cvr.ballot_style_unit_id.clone().unwrap_or_default(),
            ..CvrBallot::default()
        };
        if let Some(snap) = snap {
            for contest in snap.contests.iter() {
                let cname = contest_names
                    .get(contest.contest_id.as_str())
                    .cloned()
                    .context(DataNotFoundSnafu {
                        location: format!("{}: contest {}", location, contest.contest_id),
                    })?;
                let sels = b.selections.entry(cname.to_string()).or_default();
                if contest.overvotes > 0 {
                    sels.push("overvote".to_string());
                    continue;
                }
                for selection in contest.selection.iter() {
                    let voted = selection.positions.iter().any(|p| p.num_votes > 0);
                    if !voted {
                        continue;
                    }
                    let name = selection_names
                        .get(selection.selection_id.as_str())
                        .context(DataNotFoundSnafu {
                            location: format!("{}: selection {}", location, selection.selection_id),
                        })?;
                    sels.push(name.clone());
                }
                for _ in 0..contest.undervotes {
                    sels.push("undervote".to_string());
                }
            }
        }
        if res.insert(ballot_id.clone(), b).is_some() {
            whatever!("{}: ballot {} appears twice in the CVR", location, ballot_id);
        }
    }
    Ok(res)
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CVRSelectionPosition {
    #[serde(rename = "NumberVotes")]
    pub num_votes: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CVRContestSelection {
    #[serde(rename = "ContestSelectionId")]
    pub selection_id: String,
    #[serde(rename = "SelectionPosition", default)]
    pub positions: Vec<CVRSelectionPosition>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CVRContest {
    #[serde(rename = "ContestId")]
    pub contest_id: String,
    #[serde(rename = "Overvotes", default)]
    pub overvotes: u32,
    #[serde(rename = "Undervotes", default)]
    pub undervotes: u32,
    #[serde(rename = "CVRContestSelection", default)]
    pub selection: Vec<CVRContestSelection>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CVRSnapshot {
    #[serde(rename = "@id")]
    pub snapshot_id: String,
    #[serde(rename = "CVRContest", default)]
    pub contests: Vec<CVRContest>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Cvr {
    #[serde(rename = "BallotPrePrintedId", default)]
    pub ballot_id: Option<String>,
    #[serde(rename = "BallotStyleId", default)]
    pub ballot_style_id: Option<String>,
    #[serde(rename = "BallotStyleUnitId", default)]
    pub ballot_style_unit_id: Option<String>,
    #[serde(rename = "CurrentSnapshotId", default)]
    pub current_snapshot_id: Option<String>,
    #[serde(rename = "CVRSnapshot")]
    pub snapshots: Vec<CVRSnapshot>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Candidate {
    #[serde(rename = "@id")]
    pub candidate_id: String,
    #[serde(rename = "Name")]
    pub candidate_name: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CandidateSelection {
    #[serde(rename = "@id")]
    pub candidate_selection_id: String,
    #[serde(rename = "CandidateIds", default)]
    pub candidate_ids: Vec<String>,
    #[serde(rename = "IsWriteIn", default)]
    pub is_write_in: bool,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Contest {
    #[serde(rename = "@id")]
    pub contest_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ContestSelection", default)]
    pub contest_selection: Vec<CandidateSelection>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct Election {
    #[serde(rename = "Candidate", default)]
    pub candidates: Vec<Candidate>,
    #[serde(rename = "Contest")]
    pub contests: Vec<Contest>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct CastVoteRecordReport {
    #[serde(rename = "Election")]
    election: Vec<Election>,
    #[serde(rename = "CVR")]
    cvr: Vec<Cvr>,
}
