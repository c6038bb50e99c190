// Synthetic jobs on the local file system, for the end-to-end tests.

use std::path::PathBuf;
use std::sync::Arc;

use contest_tally::{ContestTally, Contests};
use indexmap::IndexMap;
use serde_json::json;
use tempfile::TempDir;

use crate::audit::analysis::{
    AnalysisError, AnalysisResult, BallotAnalyzer, BallotAttributes, BallotImage, Observation, PrintedContest,
    Region, StyleTemplate, SyntheticAnalyzer, SyntheticPage,
};
use crate::audit::context::JobContext;
use crate::audit::report::{ReportSummary, REPORT_DIR, SUMMARY_NAME, TOTALS_JSON_NAME};
use crate::audit::settings::{JobSettings, Operation, Vendor};
use crate::audit::store::Db;
use crate::audit::styles::RoisMapRow;
use crate::audit::*;

pub(crate) fn printed(title: &str, options: &[&str]) -> PrintedContest {
    PrintedContest {
        title: title.to_string(),
        options: options.iter().map(|s| s.to_string()).collect(),
    }
}

/// One single-page ballot of an archive.
#[derive(Debug, Clone)]
pub(crate) struct FixtureBallot {
    pub id: String,
    pub page: SyntheticPage,
}

/// A ballot of the given style, with the options marked per printed contest.
pub(crate) fn ballot(id: &str, style: &str, layout: &[PrintedContest], marks: &[(&str, &[&str])]) -> FixtureBallot {
    FixtureBallot {
        id: id.to_string(),
        page: SyntheticPage {
            card_code: format!("C{}", style),
            style_num: Some(style.to_string()),
            precinct: "P1".to_string(),
            layout: layout.to_vec(),
            marks: marks
                .iter()
                .map(|(c, opts)| (c.to_string(), opts.iter().map(|o| o.to_string()).collect()))
                .collect(),
            ..SyntheticPage::default()
        },
    }
}

impl FixtureBallot {
    pub fn with_writein(mut self, contest: &str, name: &str) -> FixtureBallot {
        self.page.writeins.insert(contest.to_string(), name.to_string());
        self
    }

    pub fn unreadable(mut self) -> FixtureBallot {
        self.page.unreadable = true;
        self
    }

    /// The CVR rows matching the marks of the ballot.
    pub fn cvr_rows(&self) -> Vec<[String; 6]> {
        let style = self.page.style_num.clone().unwrap_or_default();
        let mut rows = Vec::new();
        for c in self.page.layout.iter() {
            let marked: Vec<String> = self.page.marks.get(&c.title).cloned().unwrap_or_default();
            let sels = if marked.is_empty() { vec!["".to_string()] } else { marked };
            for s in sels {
                rows.push([
                    self.id.clone(),
                    style.clone(),
                    self.page.precinct.clone(),
                    "".to_string(),
                    c.title.clone(),
                    s,
                ]);
            }
        }
        rows
    }
}

/// A job with its inputs in a temporary directory.
pub(crate) struct JobFixture {
    pub dir: TempDir,
    pub settings: JobSettings,
}

impl JobFixture {
    pub fn new() -> JobFixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("job");
        let settings: JobSettings = serde_json::from_value(json!({
            "job_name": "fixture",
            "job_root": root.to_string_lossy(),
            "tracker_poll_ms": 5,
            "stage_timeout_secs": 30,
        }))
        .unwrap();
        JobFixture { dir, settings }
    }

    fn input_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("inputs").join(name)
    }

    fn write_input(&self, name: &str, text: &str) -> String {
        let path = self.input_path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().to_string()
    }

    /// Rows of `(contest, vote_for, option)`.
    pub fn with_eif(mut self, rows: &[(&str, &str, &str)]) -> JobFixture {
        let mut text = "official_contest_name,contest_alias,vote_for,official_option,option_alias\n".to_string();
        for (c, vf, o) in rows.iter() {
            text.push_str(&format!("{},,{},{},\n", c, vf, o));
        }
        self.settings.eif_path = Some(self.write_input("eif.csv", &text));
        self
    }

    pub fn with_archive(mut self, name: &str, ballots: &[FixtureBallot]) -> JobFixture {
        for b in ballots.iter() {
            let text = serde_json::to_string_pretty(&b.page).unwrap();
            self.write_input(&format!("{}/{}.json", name, b.id), &text);
        }
        let location = self.input_path(name).to_string_lossy().to_string();
        self.settings.archives.push(location);
        self
    }

    /// A normalized CSV export with the votes of the ballots as marked.
    pub fn with_cvr_of(mut self, ballots: &[FixtureBallot]) -> JobFixture {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(["ballot_id", "style_num", "precinct", "party", "contest", "selection"])
            .unwrap();
        for b in ballots.iter() {
            for r in b.cvr_rows() {
                wtr.write_record(&r).unwrap();
            }
        }
        let text = String::from_utf8(wtr.into_inner().unwrap()).unwrap();
        self.settings.cvr_path = Some(self.write_input("cvr.csv", &text));
        self.settings.vendor = Vendor::Csv;
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> JobFixture {
        self.settings.set(key, value).unwrap();
        self
    }

    pub fn ctx(&self) -> JobContext {
        self.ctx_with(Arc::new(SyntheticAnalyzer::default()))
    }

    pub fn ctx_with(&self, analyzer: Arc<dyn BallotAnalyzer>) -> JobContext {
        let db = Db::open(&self.settings.job_root).unwrap();
        JobContext::new(self.settings.clone(), db, analyzer)
    }
}

/// The operations of a full run, in order.
pub(crate) const PIPELINE: [Operation; 4] = [
    Operation::GenbifFromBallots,
    Operation::Gentemplates,
    Operation::Extractvote,
    Operation::CmpcvrAndReport,
];

pub(crate) fn run_pipeline(ctx: &JobContext) {
    for op in PIPELINE {
        run_operation(ctx, op).unwrap();
    }
}

pub(crate) fn report_totals(ctx: &JobContext) -> IndexMap<String, ContestTally> {
    ctx.db.load_json(REPORT_DIR, None, TOTALS_JSON_NAME).unwrap()
}

pub(crate) fn report_summary(ctx: &JobContext) -> ReportSummary {
    ctx.db.load_json(REPORT_DIR, None, SUMMARY_NAME).unwrap()
}

/// The synthetic analyzer, except that one ballot brings the whole task down.
pub(crate) struct FailingAnalyzer {
    pub inner: SyntheticAnalyzer,
    pub ballot_id: String,
}

impl FailingAnalyzer {
    pub fn on(ballot_id: &str) -> FailingAnalyzer {
        FailingAnalyzer {
            inner: SyntheticAnalyzer::default(),
            ballot_id: ballot_id.to_string(),
        }
    }
}

impl BallotAnalyzer for FailingAnalyzer {
    fn name(&self) -> &str {
        "failing"
    }

    fn read_ballot(&self, ballot_id: &str, images: &[BallotImage]) -> AnalysisResult<BallotAttributes> {
        self.inner.read_ballot(ballot_id, images)
    }

    fn build_template(&self, style_num: &str, ballots: &[Vec<BallotImage>]) -> AnalysisResult<StyleTemplate> {
        self.inner.build_template(style_num, ballots)
    }

    fn extract_rois(&self, template: &StyleTemplate) -> AnalysisResult<Vec<Region>> {
        self.inner.extract_rois(template)
    }

    fn map_rois(&self, style_num: &str, regions: &[Region], contests: &Contests) -> AnalysisResult<Vec<RoisMapRow>> {
        self.inner.map_rois(style_num, regions, contests)
    }

    fn observe_marks(
        &self,
        ballot_id: &str,
        images: &[BallotImage],
        roismap: &[RoisMapRow],
    ) -> AnalysisResult<Vec<Observation>> {
        if ballot_id == self.ballot_id {
            return Err(AnalysisError::Fatal(format!("injected failure on {}", ballot_id)));
        }
        self.inner.observe_marks(ballot_id, images, roismap)
    }
}
