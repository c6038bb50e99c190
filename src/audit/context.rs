// The context of a job, passed explicitly to every stage and task.

use std::sync::Arc;

use contest_tally::Contests;
use log::debug;

use crate::audit::analysis::{analyzer_by_name, BallotAnalyzer};
use crate::audit::settings::JobSettings;
use crate::audit::store::Db;
use crate::audit::*;

pub const CONFIG_DIR: &str = "config";
pub const CONTESTS_NAME: &str = "contests.json";
pub const SETTINGS_NAME: &str = "settings.json";
pub const EIF_NAME: &str = "EIF.csv";
pub const STYLE_LOOKUP_NAME: &str = "style_lookup.csv";

/// Everything a stage driver or a worker needs: the validated settings, the
/// store of the job and the analyzer.
#[derive(Clone)]
pub struct JobContext {
    pub job_name: String,
    pub settings: JobSettings,
    pub db: Db,
    pub analyzer: Arc<dyn BallotAnalyzer>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_name", &self.job_name)
            .field("db", &self.db)
            .field("analyzer", &self.analyzer.name())
            .finish()
    }
}

impl JobContext {
    pub fn new(settings: JobSettings, db: Db, analyzer: Arc<dyn BallotAnalyzer>) -> JobContext {
        JobContext {
            job_name: settings.job_name.clone(),
            settings,
            db,
            analyzer,
        }
    }

    /// Opens the store of the job and the analyzer named in the settings.
    /// A delegate rebuilds its context this way from the settings of its task.
    pub fn from_settings(settings: JobSettings) -> AuditResult<JobContext> {
        let db = Db::open(&settings.job_root)?;
        let analyzer = analyzer_by_name(&settings.analyzer)?;
        debug!(
            "from_settings: job {} at {} with analyzer {}",
            settings.job_name,
            db.root(),
            analyzer.name()
        );
        Ok(JobContext::new(settings, db, analyzer))
    }

    /// The same job with other settings, sharing the store and the analyzer.
    pub fn with_settings(&self, settings: JobSettings) -> JobContext {
        JobContext::new(settings, self.db.clone(), self.analyzer.clone())
    }

    /// The contests dictionary written at bootstrap.
    pub fn load_contests(&self) -> AuditResult<Contests> {
        self.db.load_json(CONFIG_DIR, None, CONTESTS_NAME)
    }
}
