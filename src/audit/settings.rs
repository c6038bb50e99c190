// ********* Job settings ***********

use std::fmt::Display;
use std::fs;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use snafu::prelude::*;

use crate::audit::store::is_s3_location;
use crate::audit::*;

/// The operations a job can run. Each one drives one or more stages.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GenbifFromCvr,
    GenbifFromBallots,
    CreateBifReport,
    Gentemplates,
    Genmaprois,
    Extractvote,
    CmpcvrAndReport,
    GetStatus,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::GenbifFromCvr,
        Operation::GenbifFromBallots,
        Operation::CreateBifReport,
        Operation::Gentemplates,
        Operation::Genmaprois,
        Operation::Extractvote,
        Operation::CmpcvrAndReport,
        Operation::GetStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::GenbifFromCvr => "genbif_from_cvr",
            Operation::GenbifFromBallots => "genbif_from_ballots",
            Operation::CreateBifReport => "create_bif_report",
            Operation::Gentemplates => "gentemplates",
            Operation::Genmaprois => "genmaprois",
            Operation::Extractvote => "extractvote",
            Operation::CmpcvrAndReport => "cmpcvr_and_report",
            Operation::GetStatus => "get_status",
        }
    }

    pub fn parse(name: &str) -> AuditResult<Operation> {
        let needle = name.trim().to_lowercase();
        Operation::ALL
            .iter()
            .find(|op| op.name() == needle)
            .cloned()
            .context(ConfigurationSnafu {
                message: format!("unknown operation {:?}", name),
            })
    }

    /// The settings that must be present to run the operation.
    pub fn required_settings(&self) -> &'static [&'static str] {
        match self {
            Operation::GenbifFromCvr => &["eif_path", "archives", "cvr_path"],
            Operation::GenbifFromBallots => &["eif_path", "archives"],
            Operation::CreateBifReport => &["archives"],
            Operation::Gentemplates | Operation::Genmaprois => &["archives"],
            Operation::Extractvote => &["archives"],
            Operation::CmpcvrAndReport => &["archives"],
            Operation::GetStatus => &[],
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How the tasks of a chunked stage are executed.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delegation {
    /// One after the other, in the calling process.
    InProcess,
    /// On threads of the calling process.
    Threads,
    /// In delegate processes, one per task.
    Lambda,
}

/// Which source decides the style of a ballot when both the CVR and the card
/// code printed on the ballot give one.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StylePriority {
    Cvr,
    CardCode,
}

/// The voting system that produced the ballot images and the CVR.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Vendor {
    #[serde(rename = "ES&S", alias = "ess")]
    Ess,
    #[serde(rename = "Dominion", alias = "dominion")]
    Dominion,
    #[serde(rename = "CDF", alias = "cdf")]
    Cdf,
    #[serde(rename = "CSV", alias = "csv")]
    Csv,
}

fn default_vendor() -> Vendor {
    Vendor::Ess
}
fn default_ballots_per_chunk() -> usize {
    200
}
fn default_cvr_ballots_per_chunk() -> usize {
    1000
}
fn default_threshold() -> usize {
    50
}
fn default_min_ballots_required() -> usize {
    1
}
fn default_max_lambda_concurrency() -> usize {
    1000
}
fn default_stage_timeout_secs() -> u64 {
    1200
}
fn default_tracker_poll_ms() -> u64 {
    2000
}
fn default_delegation() -> Delegation {
    Delegation::InProcess
}
fn default_style_priority() -> StylePriority {
    StylePriority::Cvr
}
fn default_analyzer() -> String {
    "synthetic".to_string()
}
fn default_true() -> bool {
    true
}

/// The settings of a job, read from a JSON document.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    pub job_name: String,
    pub job_root: String,
    #[serde(default)]
    pub op: Option<Operation>,

    // Inputs
    #[serde(default)]
    pub eif_path: Option<String>,
    /// Locations of the ballot image archives (local directories or `s3://`
    /// prefixes).
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub cvr_path: Option<String>,
    #[serde(default = "default_vendor")]
    pub vendor: Vendor,
    /// CSV file with the columns `card_code,style_num`.
    #[serde(default)]
    pub style_lookup_path: Option<String>,
    /// CSV file with the columns `contest,option,votes`.
    #[serde(default)]
    pub official_results_path: Option<String>,

    // Chunking
    #[serde(default = "default_ballots_per_chunk")]
    pub genbif_ballots_per_chunk: usize,
    #[serde(default = "default_ballots_per_chunk")]
    pub genmarks_ballots_per_chunk: usize,
    #[serde(default = "default_cvr_ballots_per_chunk")]
    pub cvr_ballots_per_chunk: usize,

    // Styles
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_min_ballots_required")]
    pub min_ballots_required: usize,
    /// Style equivalences: `style_num`, `party:style_num` or
    /// `style_num/sheet0` to the style used in its place.
    #[serde(default)]
    pub merge_similar_styles: IndexMap<String, String>,
    #[serde(default = "default_style_priority")]
    pub style_priority: StylePriority,
    #[serde(default = "default_true")]
    pub include_genrois: bool,
    #[serde(default = "default_true")]
    pub include_maprois: bool,

    // Filters
    #[serde(default)]
    pub include_bmd: bool,
    #[serde(default)]
    pub include_corrupted: bool,

    // Delegation
    #[serde(default)]
    pub use_lambdas: bool,
    #[serde(default)]
    pub one_lambda_first: bool,
    #[serde(default = "default_delegation")]
    pub delegation: Delegation,
    /// The command that runs a delegate. The `worker` argument is appended.
    #[serde(default)]
    pub delegate_command: Option<Vec<String>>,
    #[serde(default = "default_max_lambda_concurrency")]
    pub max_lambda_concurrency: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_tracker_poll_ms")]
    pub tracker_poll_ms: u64,
    #[serde(default)]
    pub incremental: bool,

    #[serde(default = "default_analyzer")]
    pub analyzer: String,

    /// Keys that are not understood. They are kept and reported.
    #[serde(flatten)]
    pub extra: IndexMap<String, JSValue>,
}

impl JobSettings {
    pub fn from_json(contents: &str, location: &str) -> AuditResult<JobSettings> {
        let settings: JobSettings =
            serde_json::from_str(contents).context(JsonSnafu { location })?;
        for key in settings.extra.keys() {
            warn!("settings: {}: unknown key {:?} is ignored", location, key);
        }
        Ok(settings)
    }

    pub fn load(path: &str) -> AuditResult<JobSettings> {
        let contents = fs::read_to_string(path).context(IoSnafu { path })?;
        debug!("settings: read {:?}", path);
        JobSettings::from_json(&contents, path)
    }

    /// Overrides one key. The value is read as JSON when possible, as a string
    /// otherwise.
    pub fn set(&mut self, key: &str, value: &str) -> AuditResult<()> {
        let mut js = serde_json::to_value(&*self).context(JsonSnafu { location: key })?;
        let v: JSValue =
            serde_json::from_str(value).unwrap_or_else(|_| JSValue::String(value.to_string()));
        match js.as_object_mut() {
            Some(obj) => {
                obj.insert(key.to_string(), v);
            }
            None => whatever!("settings are not an object"),
        }
        *self = serde_json::from_value(js).context(JsonSnafu { location: key })?;
        Ok(())
    }

    /// Applies a `key=value` override given on the command line.
    pub fn set_pair(&mut self, pair: &str) -> AuditResult<()> {
        let (k, v) = pair.split_once('=').context(ConfigurationSnafu {
            message: format!("expected key=value, got {:?}", pair),
        })?;
        self.set(k.trim(), v.trim())
    }

    /// The delegation actually used: `use_lambdas` forces delegate processes.
    pub fn effective_delegation(&self) -> Delegation {
        if self.use_lambdas {
            Delegation::Lambda
        } else {
            self.delegation
        }
    }

    fn has_setting(&self, key: &str) -> bool {
        match key {
            "eif_path" => self.eif_path.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
            "cvr_path" => self.cvr_path.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
            "archives" => !self.archives.is_empty(),
            _ => self.extra.contains_key(key),
        }
    }

    /// Checks the settings before running an operation.
    pub fn validate(&self, op: Operation) -> AuditResult<()> {
        ensure!(
            !self.job_name.trim().is_empty(),
            ConfigurationSnafu {
                message: "job_name is empty"
            }
        );
        ensure!(
            !self.job_root.trim().is_empty(),
            ConfigurationSnafu {
                message: "job_root is empty"
            }
        );
        for key in op.required_settings() {
            ensure!(
                self.has_setting(key),
                ConfigurationSnafu {
                    message: format!("operation {} requires the setting {}", op, key),
                }
            );
        }
        ensure!(
            !self.use_lambdas || is_s3_location(&self.job_root),
            ConfigurationSnafu {
                message: format!(
                    "use_lambdas requires an s3:// job root, got {:?}",
                    self.job_root
                ),
            }
        );
        for (name, v) in [
            ("genbif_ballots_per_chunk", self.genbif_ballots_per_chunk),
            ("genmarks_ballots_per_chunk", self.genmarks_ballots_per_chunk),
            ("cvr_ballots_per_chunk", self.cvr_ballots_per_chunk),
            ("threshold", self.threshold),
        ] {
            ensure!(
                v > 0,
                ConfigurationSnafu {
                    message: format!("{} must be positive", name),
                }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    fn minimal() -> JobSettings {
        JobSettings::from_json(
            r#"{"job_name": "j", "job_root": "/tmp/j", "archives": ["/data/a"]}"#,
            "t",
        )
        .unwrap()
    }

    #[test]
    fn defaults() {
        let s = minimal();
        assert_eq!(s.genbif_ballots_per_chunk, 200);
        assert_eq!(s.genmarks_ballots_per_chunk, 200);
        assert_eq!(s.threshold, 50);
        assert_eq!(s.min_ballots_required, 1);
        assert_eq!(s.max_lambda_concurrency, 1000);
        assert_eq!(s.stage_timeout_secs, 1200);
        assert_eq!(s.delegation, Delegation::InProcess);
        assert_eq!(s.style_priority, StylePriority::Cvr);
        assert_eq!(s.vendor, Vendor::Ess);
        assert!(s.include_genrois && s.include_maprois);
        assert!(!s.include_bmd && !s.incremental);
    }

    #[test]
    fn unknown_keys_are_kept() {
        let s = JobSettings::from_json(
            r#"{"job_name": "j", "job_root": "/tmp/j", "color": "blue", "vendor": "Dominion"}"#,
            "t",
        )
        .unwrap();
        assert_eq!(s.extra.get("color"), Some(&JSValue::String("blue".to_string())));
        assert_eq!(s.vendor, Vendor::Dominion);
    }

    #[test]
    fn overrides() {
        let mut s = minimal();
        s.set_pair("threshold=3").unwrap();
        s.set_pair("delegation=threads").unwrap();
        s.set_pair("cvr_path=/data/cvr.xlsx").unwrap();
        assert_eq!(s.threshold, 3);
        assert_eq!(s.delegation, Delegation::Threads);
        assert_eq!(s.cvr_path.as_deref(), Some("/data/cvr.xlsx"));
        assert!(s.set_pair("threshold").is_err());
        assert!(s.set_pair("threshold=many").is_err());
    }

    #[parameterized(
        genbif_from_cvr = { "genbif_from_cvr", Operation::GenbifFromCvr },
        extract = { "extractvote", Operation::Extractvote },
        upper = { "CMPCVR_AND_REPORT", Operation::CmpcvrAndReport },
    )]
    fn parses_operations(name: &str, expected: Operation) {
        assert_eq!(Operation::parse(name).unwrap(), expected);
    }

    #[test]
    fn validation() {
        let mut s = minimal();
        assert!(s.validate(Operation::Extractvote).is_ok());
        let err = s.validate(Operation::GenbifFromCvr).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");

        s.use_lambdas = true;
        assert!(s.validate(Operation::GetStatus).is_err());
        s.job_root = "s3://bucket/jobs/j".to_string();
        assert!(s.validate(Operation::GetStatus).is_ok());
        assert_eq!(s.effective_delegation(), Delegation::Lambda);

        s.genmarks_ballots_per_chunk = 0;
        assert!(s.validate(Operation::GetStatus).is_err());
        assert!(Operation::parse("launch").is_err());
    }
}
