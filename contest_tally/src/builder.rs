pub use crate::config::*;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// One row of the Election Information File.
///
/// A contest spans several rows, one per option. `vote_for` and the aliases
/// only need to be filled on one of them. Alias cells may hold several names
/// separated by `;`.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct EifRow {
    pub official_contest_name: String,
    #[serde(default)]
    pub contest_alias: String,
    #[serde(default)]
    pub vote_for: String,
    pub official_option: String,
    #[serde(default)]
    pub option_alias: String,
}

/// A builder for the contests dictionary.
///
/// ```
/// use contest_tally::builder::{ContestsBuilder, EifRow};
/// # use contest_tally::TallyError;
///
/// let mut builder = ContestsBuilder::new();
/// builder.add_row(&EifRow {
///     official_contest_name: "Mayor".to_string(),
///     contest_alias: "".to_string(),
///     vote_for: "1".to_string(),
///     official_option: "Anna".to_string(),
///     option_alias: "".to_string(),
/// })?;
/// let contests = builder.build()?;
/// assert_eq!(contests.get("Mayor").map(|c| c.vote_for), Some(1));
///
/// # Ok::<(), TallyError>(())
/// ```
pub struct ContestsBuilder {
    pub(crate) _contests: IndexMap<String, PartialContest>,
}

#[derive(Default)]
pub(crate) struct PartialContest {
    vote_for: Option<u32>,
    options: Vec<String>,
    aliases: Vec<String>,
    option_aliases: IndexMap<String, Vec<String>>,
    writein_num: u32,
}

impl ContestsBuilder {
    pub fn new() -> ContestsBuilder {
        ContestsBuilder {
            _contests: IndexMap::new(),
        }
    }

    pub fn add_row(&mut self, row: &EifRow) -> Result<(), TallyError> {
        let name = row.official_contest_name.trim().to_string();
        if name.is_empty() {
            warn!("add_row: skipping EIF row without contest name: {:?}", row);
            return Ok(());
        }
        let entry = self._contests.entry(name.clone()).or_default();

        let vote_for = row.vote_for.trim();
        if !vote_for.is_empty() {
            let vf = vote_for
                .parse::<u32>()
                .ok()
                .filter(|x| *x > 0)
                .ok_or(TallyError::InvalidVoteFor {
                    contest: name.clone(),
                    value: vote_for.to_string(),
                })?;
            match entry.vote_for {
                Some(prev) if prev != vf => {
                    return Err(TallyError::InconsistentVoteFor { contest: name });
                }
                _ => entry.vote_for = Some(vf),
            }
        }

        for alias in split_aliases(&row.contest_alias) {
            if !entry.aliases.contains(&alias) {
                entry.aliases.push(alias);
            }
        }

        let option = row.official_option.trim().to_string();
        if option.is_empty() {
            return Ok(());
        }
        if is_writein_label(&option) {
            entry.writein_num += 1;
            return Ok(());
        }
        if !entry.options.contains(&option) {
            entry.options.push(option.clone());
        }
        let aliases = split_aliases(&row.option_alias);
        if !aliases.is_empty() {
            let known = entry.option_aliases.entry(option).or_default();
            for alias in aliases {
                if !known.contains(&alias) {
                    known.push(alias);
                }
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<Contests, TallyError> {
        if self._contests.is_empty() {
            return Err(TallyError::EmptyElection);
        }
        let mut res: IndexMap<String, Contest> = IndexMap::new();
        for (name, pc) in self._contests {
            let vote_for = match pc.vote_for {
                Some(x) => x,
                None => {
                    debug!("build: contest {} has no vote_for, assuming 1", name);
                    1
                }
            };
            res.insert(
                name,
                Contest {
                    vote_for,
                    official_options_list: pc.options,
                    aliases: pc.aliases,
                    option_aliases: pc.option_aliases,
                    writein_num: pc.writein_num,
                },
            );
        }
        Ok(Contests::new(res))
    }
}

impl Default for ContestsBuilder {
    fn default() -> Self {
        ContestsBuilder::new()
    }
}

/// Write-in targets are declared in the EIF with an option starting with
/// `writein` (for instance `writein:` or `Writein 1`).
fn is_writein_label(option: &str) -> bool {
    let lower = option.to_lowercase();
    lower.starts_with("writein") || lower.starts_with("write-in")
}

fn split_aliases(cell: &str) -> Vec<String> {
    cell.split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
