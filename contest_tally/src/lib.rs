pub mod builder;
mod config;
pub mod manual;

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub use crate::config::*;

// **** Counting policy ****

/// Applies the counting policy to the targets of one contest on one ballot.
///
/// - more marks than `vote_for`: the contest is overvoted. It contributes 0 votes
///   to every target and 1 to the overvotes.
/// - otherwise every marked target gets one vote and the missing marks are
///   counted as undervotes.
pub fn count_contest(vote_for: u32, marks: &[OptionMark]) -> ContestCount {
    let num_marks = marks.iter().filter(|m| m.marked).count() as u32;
    if num_marks > vote_for {
        return ContestCount {
            num_marks,
            overvotes: 1,
            undervotes: 0,
            votes: marks.iter().map(|m| (m.option.clone(), 0)).collect(),
        };
    }
    ContestCount {
        num_marks,
        overvotes: 0,
        undervotes: vote_for - num_marks,
        votes: marks
            .iter()
            .map(|m| (m.option.clone(), if m.marked { 1 } else { 0 }))
            .collect(),
    }
}

// **** Unified records ****

/// Builds the unified record of the audited side of one ballot from its marks.
///
/// The `#contest` header rows carry the over- and undervotes, the option rows
/// carry the votes. Write-in targets are summed into `writeins`.
pub fn audit_unified(lines: &[MarkLine]) -> IndexMap<String, ContestTally> {
    let mut res: IndexMap<String, ContestTally> = IndexMap::new();
    for line in lines.iter() {
        let tally = res.entry(line.contest.clone()).or_insert_with(|| ContestTally {
            num_ballots: 1,
            ..ContestTally::default()
        });
        if line.option == CONTEST_HEADER {
            tally.overvotes += line.overvotes as u64;
            tally.undervotes += line.undervotes as u64;
        } else if is_writein_option(&line.option) {
            tally.writeins += line.num_votes as u64;
            tally.tot_votes += line.num_votes as u64;
        } else {
            *tally.votes.entry(line.option.clone()).or_insert(0) += line.num_votes as u64;
            tally.tot_votes += line.num_votes as u64;
        }
    }
    res
}

fn party_prefix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:DEM|REP|REF|NPA|GRN|PNF|LIB)\s+").ok())
        .as_ref()
}

fn trailing_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(\d+\)\s*$").ok())
        .as_ref()
}

/// Removes the decorations vendors add to option names in their exports:
/// a party prefix (`DEM Jane Doe`) and a trailing identifier (`Jane Doe (12345)`).
pub fn normalize_selection(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    if let Some(re) = party_prefix() {
        s = re.replace(&s, "").to_string();
    }
    if let Some(re) = trailing_number() {
        s = re.replace(&s, "").to_string();
    }
    s.trim().to_string()
}

/// Interprets one exported selection for the given contest.
///
/// Returns `None` for empty cells.
pub fn classify_selection(contest: &Contest, raw: &str) -> Option<Selection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if lower == "overvote" {
        return Some(Selection::Overvote);
    }
    if lower == "undervote" {
        return Some(Selection::Undervote);
    }
    if let Some(rest) = lower.strip_prefix("write-in") {
        let name = rest.trim_start_matches(':').trim();
        // Keep the original casing of the name.
        let offset = trimmed.len().saturating_sub(name.len());
        let original = trimmed.get(offset..).unwrap_or(name);
        return Some(Selection::WriteIn(original.to_string()));
    }
    let normalized = normalize_selection(trimmed).to_lowercase();
    for option in contest.official_options_list.iter() {
        if normalize_selection(option).to_lowercase() == normalized {
            return Some(Selection::Option(option.clone()));
        }
    }
    for (option, aliases) in contest.option_aliases.iter() {
        if aliases
            .iter()
            .any(|a| normalize_selection(a).to_lowercase() == normalized)
        {
            return Some(Selection::Option(option.clone()));
        }
    }
    Some(Selection::Unrecognized(trimmed.to_string()))
}

/// Builds the unified record of the cast vote record side of one ballot.
///
/// `selections` maps the exported contest names (canonical or alias) to the raw
/// selections of that contest.
pub fn cvr_unified(contests: &Contests, selections: &IndexMap<String, Vec<String>>) -> CvrUnified {
    let mut res = CvrUnified::default();
    for (exported_name, raw_selections) in selections.iter() {
        let non_empty: Vec<&String> = raw_selections
            .iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if non_empty.is_empty() {
            continue;
        }
        let (name, contest) = match contests
            .canonical_name(exported_name)
            .and_then(|n| contests.get(n).map(|c| (n.to_string(), c)))
        {
            Some(x) => x,
            None => {
                for s in non_empty {
                    res.unrecognized_selections
                        .push((exported_name.clone(), s.clone()));
                }
                continue;
            }
        };
        let tally = res
            .contests
            .entry(name.clone())
            .or_insert_with(|| ContestTally::empty_ballot(contest));

        let classified: Vec<Selection> = non_empty
            .iter()
            .filter_map(|s| classify_selection(contest, s))
            .collect();
        if classified.contains(&Selection::Overvote) {
            tally.overvotes = 1;
            continue;
        }
        let mut explicit_undervotes: u64 = 0;
        for sel in classified {
            match sel {
                Selection::Undervote => explicit_undervotes += 1,
                Selection::WriteIn(_) => {
                    tally.writeins += 1;
                    tally.tot_votes += 1;
                }
                Selection::Option(o) => {
                    *tally.votes.entry(o).or_insert(0) += 1;
                    tally.tot_votes += 1;
                }
                Selection::Unrecognized(s) => {
                    debug!("cvr_unified: contest {}: unrecognized selection {:?}", name, s);
                    res.unrecognized_selections.push((name.clone(), s));
                }
                Selection::Overvote => {}
            }
        }
        let implied = (contest.vote_for as u64).saturating_sub(tally.tot_votes);
        tally.undervotes = explicit_undervotes.max(implied);
    }
    res
}

// **** Comparison ****

/// Compares the audited and the exported reading of one ballot.
///
/// The contest sets are compared first. When they agree, each contest is compared
/// on its totals and on the votes of the official options.
pub fn compare_ballot(
    audit: &IndexMap<String, ContestTally>,
    cvr: &IndexMap<String, ContestTally>,
) -> BallotVerdict {
    let audit_keys: BTreeSet<&String> = audit.keys().collect();
    let cvr_keys: BTreeSet<&String> = cvr.keys().collect();
    if audit_keys != cvr_keys {
        return BallotVerdict::ContestsMismatch {
            audit_only: audit_keys
                .difference(&cvr_keys)
                .map(|s| s.to_string())
                .collect(),
            cvr_only: cvr_keys
                .difference(&audit_keys)
                .map(|s| s.to_string())
                .collect(),
        };
    }

    let mut disagreements: Vec<ContestDisagreement> = Vec::new();
    for (contest, a) in audit.iter() {
        let c = match cvr.get(contest) {
            Some(c) => c,
            None => continue,
        };
        if !contest_agrees(a, c) {
            disagreements.push(ContestDisagreement {
                contest: contest.clone(),
                audit: a.clone(),
                cvr: c.clone(),
            });
        }
    }
    if disagreements.is_empty() {
        BallotVerdict::Agreed
    } else {
        BallotVerdict::Disagreed(disagreements)
    }
}

fn contest_agrees(audit: &ContestTally, cvr: &ContestTally) -> bool {
    if (audit.tot_votes, audit.overvotes, audit.undervotes, audit.writeins)
        != (cvr.tot_votes, cvr.overvotes, cvr.undervotes, cvr.writeins)
    {
        return false;
    }
    let options: BTreeSet<&String> = audit
        .votes
        .keys()
        .chain(cvr.votes.keys())
        .filter(|o| !is_writein_option(o))
        .collect();
    options
        .iter()
        .all(|o| audit.option_votes(o) == cvr.option_votes(o))
}

// **** Aggregation ****

/// Adds the contests of one ballot to running totals.
pub fn accumulate(
    totals: &mut IndexMap<String, ContestTally>,
    ballot: &IndexMap<String, ContestTally>,
) {
    for (contest, tally) in ballot.iter() {
        *totals.entry(contest.clone()).or_default() += tally;
    }
}

/// Checks that the totals of a contest conserve votes:
/// `tot_votes = Σ votes + writeins` and `num_ballots ≥ tot_votes / vote_for`.
pub fn check_conservation(
    contest: &str,
    tally: &ContestTally,
    vote_for: u32,
) -> Result<(), TallyError> {
    let option_sum: u64 = tally.votes.values().sum();
    if tally.tot_votes != option_sum + tally.writeins {
        return Err(TallyError::ConservationViolated {
            contest: contest.to_string(),
            detail: format!(
                "tot_votes {} != {} option votes + {} writeins",
                tally.tot_votes, option_sum, tally.writeins
            ),
        });
    }
    if tally.num_ballots * (vote_for.max(1) as u64) < tally.tot_votes {
        return Err(TallyError::ConservationViolated {
            contest: contest.to_string(),
            detail: format!(
                "{} ballots cannot hold {} votes with vote_for {}",
                tally.num_ballots, tally.tot_votes, vote_for
            ),
        });
    }
    Ok(())
}
