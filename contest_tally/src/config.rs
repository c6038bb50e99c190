// ********* Contest definitions ***********

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::Display;
use std::ops::AddAssign;

/// The option value used by the header row of a contest, in the roismap and in
/// the marks tables.
pub const CONTEST_HEADER: &str = "#contest";

/// Prefix of the option names given to write-in targets (`writein_0`, ...).
pub const WRITEIN_PREFIX: &str = "writein_";

/// A contest, as described by the Election Information File.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub vote_for: u32,
    pub official_options_list: Vec<String>,
    /// Other names under which the contest may be printed or exported.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Other names for an official option, keyed by the official option.
    #[serde(default)]
    pub option_aliases: IndexMap<String, Vec<String>>,
    /// Number of write-in targets printed on the ballot.
    #[serde(default)]
    pub writein_num: u32,
}

impl Contest {
    /// The names of the write-in targets, in order.
    pub fn writein_options(&self) -> Vec<String> {
        (0..self.writein_num)
            .map(|idx| format!("{}{}", WRITEIN_PREFIX, idx))
            .collect()
    }

    /// All the targets found on a ballot for this contest: the official options
    /// followed by the write-in targets.
    pub fn ballot_options(&self) -> Vec<String> {
        let mut res = self.official_options_list.clone();
        res.extend(self.writein_options());
        res
    }
}

pub fn is_writein_option(option: &str) -> bool {
    option.starts_with(WRITEIN_PREFIX)
}

/// The contests dictionary: canonical contest name to its definition.
///
/// The order of insertion is the order of the EIF and is preserved in the
/// serialized form.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contests {
    contests: IndexMap<String, Contest>,
}

impl Contests {
    pub fn new(contests: IndexMap<String, Contest>) -> Contests {
        Contests { contests }
    }

    pub fn get(&self, name: &str) -> Option<&Contest> {
        self.contests.get(name)
    }

    /// Resolves a contest name or one of its aliases to the canonical name.
    /// The comparison ignores case and surrounding whitespace.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        let needle = name.trim().to_lowercase();
        self.contests
            .iter()
            .find(|(cname, c)| {
                cname.to_lowercase() == needle
                    || c.aliases.iter().any(|a| a.trim().to_lowercase() == needle)
            })
            .map(|(cname, _)| cname.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Contest)> {
        self.contests.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.contests.keys()
    }

    pub fn len(&self) -> usize {
        self.contests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contests.is_empty()
    }
}

// ******** Counting structures *********

/// One target of a contest, as observed on one ballot.
#[derive(PartialEq, Debug, Clone)]
pub struct OptionMark {
    pub option: String,
    pub marked: bool,
    pub writein_name: Option<String>,
}

/// The outcome of applying the counting policy to one contest of one ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ContestCount {
    pub num_marks: u32,
    pub overvotes: u32,
    pub undervotes: u32,
    /// The number of votes credited to each target, in the order of the marks.
    pub votes: Vec<(String, u32)>,
}

impl ContestCount {
    pub fn is_overvoted(&self) -> bool {
        self.overvotes > 0
    }
}

/// A line of the marks table reduced to the fields needed for tallying.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct MarkLine {
    pub contest: String,
    pub option: String,
    pub num_marks: u32,
    pub num_votes: u32,
    pub overvotes: u32,
    pub undervotes: u32,
}

/// The unified record used to compare and aggregate contests.
///
/// For one ballot, `num_ballots` is 1. Aggregated over many ballots, every
/// field is a sum.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContestTally {
    pub overvotes: u64,
    pub undervotes: u64,
    pub tot_votes: u64,
    pub writeins: u64,
    pub num_ballots: u64,
    pub votes: IndexMap<String, u64>,
}

impl ContestTally {
    /// A tally with one ballot and every official option at zero.
    pub fn empty_ballot(contest: &Contest) -> ContestTally {
        ContestTally {
            num_ballots: 1,
            votes: contest
                .official_options_list
                .iter()
                .map(|o| (o.clone(), 0))
                .collect(),
            ..ContestTally::default()
        }
    }

    pub fn option_votes(&self, option: &str) -> u64 {
        self.votes.get(option).cloned().unwrap_or(0)
    }

    /// Renders the per-option counts as `A:1;B:0`.
    pub fn votes_summary(&self) -> String {
        self.votes
            .iter()
            .map(|(o, c)| format!("{}:{}", o, c))
            .collect::<Vec<String>>()
            .join(";")
    }
}

impl AddAssign<&ContestTally> for ContestTally {
    fn add_assign(&mut self, rhs: &ContestTally) {
        self.overvotes += rhs.overvotes;
        self.undervotes += rhs.undervotes;
        self.tot_votes += rhs.tot_votes;
        self.writeins += rhs.writeins;
        self.num_ballots += rhs.num_ballots;
        for (option, count) in rhs.votes.iter() {
            *self.votes.entry(option.clone()).or_insert(0) += count;
        }
    }
}

/// All the possible readings of a selection exported in a cast vote record.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum Selection {
    /// An official option, by its canonical name.
    Option(String),
    /// A write-in, with whatever name was exported.
    WriteIn(String),
    Overvote,
    Undervote,
    /// Some content that matches no official option.
    Unrecognized(String),
}

/// The cast vote record side of one ballot, in unified form.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct CvrUnified {
    pub contests: IndexMap<String, ContestTally>,
    /// (contest, raw selection) pairs that could not be matched.
    pub unrecognized_selections: Vec<(String, String)>,
}

// ******** Comparison structures *********

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ContestDisagreement {
    pub contest: String,
    pub audit: ContestTally,
    pub cvr: ContestTally,
}

/// The outcome of comparing the two unified records of a ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum BallotVerdict {
    Agreed,
    /// The two sides do not agree on which contests are on the ballot.
    ContestsMismatch {
        audit_only: Vec<String>,
        cvr_only: Vec<String>,
    },
    Disagreed(Vec<ContestDisagreement>),
}

impl BallotVerdict {
    pub fn is_agreed(&self) -> bool {
        matches!(self, BallotVerdict::Agreed)
    }
}

/// Errors raised while building or checking tallies.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum TallyError {
    EmptyElection,
    InvalidVoteFor { contest: String, value: String },
    InconsistentVoteFor { contest: String },
    UnknownContest(String),
    ConservationViolated { contest: String, detail: String },
}

impl Error for TallyError {}

impl Display for TallyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TallyError::EmptyElection => write!(f, "the election information file has no contest"),
            TallyError::InvalidVoteFor { contest, value } => {
                write!(f, "contest {}: invalid vote_for value {:?}", contest, value)
            }
            TallyError::InconsistentVoteFor { contest } => {
                write!(f, "contest {}: rows disagree on vote_for", contest)
            }
            TallyError::UnknownContest(c) => write!(f, "unknown contest {:?}", c),
            TallyError::ConservationViolated { contest, detail } => {
                write!(f, "contest {}: vote conservation violated: {}", contest, detail)
            }
        }
    }
}
