//! The ballot analysis seam.
//!
//! The pixel-level work (reading the ballot header, aligning images into a
//! template, finding the targets, mapping them to contests and measuring the
//! marks) happens behind [`BallotAnalyzer`]. The pipeline only moves the inputs
//! and outputs of these operations around.
//!
//! [`SyntheticAnalyzer`] interprets machine-readable ballot descriptors in place
//! of images. It drives the whole pipeline on test fixtures and dry runs.

use std::fmt::Display;
use std::sync::Arc;

use contest_tally::{classify_selection, Contests, Selection, CONTEST_HEADER, WRITEIN_PREFIX};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::audit::styles::RoisMapRow;
use crate::audit::*;

/// One image file of a ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BallotImage {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// What can be read off a ballot without a template.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct BallotAttributes {
    pub card_code: String,
    /// The style, when the ballot prints it in readable form.
    pub style_num: Option<String>,
    pub precinct: String,
    pub party: String,
    pub ballot_type_id: String,
    pub sheet0: u32,
    pub is_bmd: bool,
}

/// The combined image of the ballots of one style.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct StyleTemplate {
    pub style_num: String,
    pub num_ballots: usize,
    /// Extension of the template artifact.
    pub ext: String,
    pub bytes: Vec<u8>,
}

/// A region of interest found on a template.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub page: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// `true` for a contest title, `false` for a voting target.
    pub is_title: bool,
    /// The text printed next to the region.
    pub text: String,
}

/// The measure of one roismap row on one ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Observation {
    /// Index of the row in the roismap slice given to `observe_marks`.
    pub roi: usize,
    pub pixel_metric_value: u32,
    pub writein_name: Option<String>,
    /// Vertical offset of the target relative to the template.
    pub delta_y: i32,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum AnalysisError {
    /// The ballot cannot be processed. Other ballots are not affected.
    Ballot(String),
    /// The regions of a style cannot be mapped to the contests.
    Mapping(String),
    /// Nothing can be done in this task.
    Fatal(String),
}

impl std::error::Error for AnalysisError {}

impl Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisError::Ballot(m) => write!(f, "ballot error: {}", m),
            AnalysisError::Mapping(m) => write!(f, "mapping error: {}", m),
            AnalysisError::Fatal(m) => write!(f, "analysis error: {}", m),
        }
    }
}

impl AnalysisError {
    pub fn for_ballot(self, ballot_id: &str) -> AuditError {
        match self {
            AnalysisError::Ballot(message) | AnalysisError::Mapping(message) => {
                AuditError::BallotProcessing {
                    ballot_id: ballot_id.to_string(),
                    message,
                }
            }
            AnalysisError::Fatal(message) => AuditError::WorkerFailure {
                task_name: format!("ballot {}", ballot_id),
                message,
            },
        }
    }

    pub fn for_style(self, style_num: &str) -> AuditError {
        match self {
            AnalysisError::Fatal(message) => AuditError::WorkerFailure {
                task_name: format!("style {}", style_num),
                message,
            },
            AnalysisError::Ballot(message) | AnalysisError::Mapping(message) => {
                AuditError::StyleMapping {
                    style_num: style_num.to_string(),
                    message,
                }
            }
        }
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// The image analysis operations used by the pipeline.
pub trait BallotAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    fn read_ballot(&self, ballot_id: &str, images: &[BallotImage]) -> AnalysisResult<BallotAttributes>;

    /// Combines the aligned images of several ballots of one style.
    fn build_template(&self, style_num: &str, ballots: &[Vec<BallotImage>]) -> AnalysisResult<StyleTemplate>;

    fn extract_rois(&self, template: &StyleTemplate) -> AnalysisResult<Vec<Region>>;

    /// Assigns the regions to contests and options. Fails for the whole style
    /// when nothing sensible can be assigned.
    fn map_rois(&self, style_num: &str, regions: &[Region], contests: &Contests) -> AnalysisResult<Vec<RoisMapRow>>;

    /// Measures every target row of the roismap slice of the ballot's style.
    fn observe_marks(
        &self,
        ballot_id: &str,
        images: &[BallotImage],
        roismap: &[RoisMapRow],
    ) -> AnalysisResult<Vec<Observation>>;

    /// A preview of the template with the mapped regions outlined.
    fn render_redline(&self, template: &StyleTemplate, roismap: &[RoisMapRow]) -> (String, Vec<u8>) {
        let mut lines = vec![format!(
            "style {} ({} ballots)",
            template.style_num, template.num_ballots
        )];
        for r in roismap.iter() {
            lines.push(format!(
                "page {} [{},{} {}x{}] {} / {}",
                r.page, r.x, r.y, r.w, r.h, r.contest, r.option
            ));
        }
        ("txt".to_string(), lines.join("\n").into_bytes())
    }
}

/// Returns the analyzer registered under a name.
pub fn analyzer_by_name(name: &str) -> AuditResult<Arc<dyn BallotAnalyzer>> {
    match name {
        "synthetic" => Ok(Arc::new(SyntheticAnalyzer::default())),
        x => ConfigurationSnafu {
            message: format!("unknown analyzer {:?}", x),
        }
        .fail(),
    }
}

// ********* Synthetic ballots ***********

/// The pixel metric above which a synthetic target counts as marked.
pub const SYNTHETIC_THRESHOLD: u32 = 40;
const MARKED_METRIC: u32 = 120;
const UNMARKED_METRIC: u32 = 3;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PrintedContest {
    pub title: String,
    pub options: Vec<String>,
}

/// The descriptor of one synthetic ballot page.
///
/// `marks` and `writeins` are keyed by the contest title as printed.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyntheticPage {
    #[serde(default)]
    pub card_code: String,
    #[serde(default)]
    pub style_num: Option<String>,
    #[serde(default)]
    pub precinct: String,
    #[serde(default)]
    pub party: String,
    #[serde(default)]
    pub ballot_type_id: String,
    #[serde(default)]
    pub sheet0: u32,
    #[serde(default)]
    pub is_bmd: bool,
    #[serde(default)]
    pub unreadable: bool,
    #[serde(default)]
    pub layout: Vec<PrintedContest>,
    #[serde(default)]
    pub marks: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub writeins: IndexMap<String, String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
struct SyntheticTemplate {
    style_num: String,
    num_ballots: usize,
    pages: Vec<Vec<PrintedContest>>,
}

fn is_writein_label(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.starts_with("writein") || lower.starts_with("write-in")
}

/// The regions of a sequence of printed pages. The geometry only depends on
/// the position of the text in the layout.
fn layout_regions(pages: &[Vec<PrintedContest>]) -> Vec<Region> {
    let mut res: Vec<Region> = Vec::new();
    for (page, contests) in pages.iter().enumerate() {
        let mut y: u32 = 100;
        for c in contests.iter() {
            res.push(Region {
                page: page as u32,
                x: 80,
                y,
                w: 400,
                h: 30,
                is_title: true,
                text: c.title.clone(),
            });
            y += 40;
            for o in c.options.iter() {
                res.push(Region {
                    page: page as u32,
                    x: 100,
                    y,
                    w: 24,
                    h: 16,
                    is_title: false,
                    text: o.clone(),
                });
                y += 30;
            }
            y += 20;
        }
    }
    res
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticAnalyzer {}

impl SyntheticAnalyzer {
    fn parse_pages(&self, images: &[BallotImage]) -> AnalysisResult<Vec<SyntheticPage>> {
        images
            .iter()
            .map(|img| {
                serde_json::from_slice::<SyntheticPage>(&img.bytes)
                    .map_err(|e| AnalysisError::Ballot(format!("{}: unreadable image: {}", img.path, e)))
            })
            .collect()
    }
}

impl BallotAnalyzer for SyntheticAnalyzer {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn read_ballot(&self, ballot_id: &str, images: &[BallotImage]) -> AnalysisResult<BallotAttributes> {
        let pages = self.parse_pages(images)?;
        let first = pages
            .first()
            .ok_or_else(|| AnalysisError::Ballot(format!("{}: no image", ballot_id)))?;
        if pages.iter().any(|p| p.unreadable) {
            return Err(AnalysisError::Ballot(format!(
                "{}: the ballot header cannot be read",
                ballot_id
            )));
        }
        Ok(BallotAttributes {
            card_code: first.card_code.clone(),
            style_num: first.style_num.clone(),
            precinct: first.precinct.clone(),
            party: first.party.clone(),
            ballot_type_id: first.ballot_type_id.clone(),
            sheet0: first.sheet0,
            is_bmd: first.is_bmd,
        })
    }

    fn build_template(&self, style_num: &str, ballots: &[Vec<BallotImage>]) -> AnalysisResult<StyleTemplate> {
        let mut pages: Option<Vec<Vec<PrintedContest>>> = None;
        let mut num_ballots = 0;
        for images in ballots.iter() {
            let ballot_pages = match self.parse_pages(images) {
                Ok(p) => p,
                Err(e) => {
                    debug!("build_template: style {}: skipping ballot: {}", style_num, e);
                    continue;
                }
            };
            let layout: Vec<Vec<PrintedContest>> = ballot_pages.into_iter().map(|p| p.layout).collect();
            match &pages {
                None => pages = Some(layout),
                Some(l) if *l != layout => {
                    debug!("build_template: style {}: ballot layout differs from the template", style_num);
                }
                _ => {}
            }
            num_ballots += 1;
        }
        let pages = pages.ok_or_else(|| {
            AnalysisError::Fatal(format!("style {}: no readable ballot to build a template", style_num))
        })?;
        let t = SyntheticTemplate {
            style_num: style_num.to_string(),
            num_ballots,
            pages,
        };
        let bytes = serde_json::to_vec_pretty(&t).map_err(|e| AnalysisError::Fatal(e.to_string()))?;
        Ok(StyleTemplate {
            style_num: style_num.to_string(),
            num_ballots,
            ext: "json".to_string(),
            bytes,
        })
    }

    fn extract_rois(&self, template: &StyleTemplate) -> AnalysisResult<Vec<Region>> {
        let t: SyntheticTemplate = serde_json::from_slice(&template.bytes)
            .map_err(|e| AnalysisError::Fatal(format!("style {}: bad template: {}", template.style_num, e)))?;
        Ok(layout_regions(&t.pages))
    }

    fn map_rois(&self, style_num: &str, regions: &[Region], contests: &Contests) -> AnalysisResult<Vec<RoisMapRow>> {
        let mut rows: Vec<RoisMapRow> = Vec::new();
        let mut current: Option<(String, usize)> = None;
        let mut unknown_titles: Vec<String> = Vec::new();
        let mut unknown_options: Vec<String> = Vec::new();
        for r in regions.iter() {
            let row = |contest: &str, option: &str| RoisMapRow {
                style_num: style_num.to_string(),
                contest: contest.to_string(),
                option: option.to_string(),
                page: r.page,
                sheet0: 0,
                x: r.x,
                y: r.y,
                w: r.w,
                h: r.h,
                pixel_metric_threshold: SYNTHETIC_THRESHOLD,
            };
            if r.is_title {
                current = contests.canonical_name(&r.text).map(|n| (n.to_string(), 0));
                match &current {
                    Some((name, _)) => rows.push(row(name, CONTEST_HEADER)),
                    None => unknown_titles.push(r.text.clone()),
                }
                continue;
            }
            let (name, writein_idx) = match current.as_mut() {
                Some(x) => x,
                None => continue,
            };
            let contest = match contests.get(name) {
                Some(c) => c,
                None => continue,
            };
            if is_writein_label(&r.text) {
                let option = format!("{}{}", WRITEIN_PREFIX, writein_idx);
                *writein_idx += 1;
                rows.push(row(name, &option));
                continue;
            }
            match classify_selection(contest, &r.text) {
                Some(Selection::Option(o)) => rows.push(row(name, &o)),
                _ => unknown_options.push(format!("{}: {}", name, r.text)),
            }
        }
        if !unknown_titles.is_empty() {
            debug!("map_rois: style {}: unknown contest titles {:?}", style_num, unknown_titles);
        }
        if rows.is_empty() {
            return Err(AnalysisError::Mapping(format!(
                "no contest recognized among {:?}",
                unknown_titles
            )));
        }
        if !unknown_options.is_empty() {
            return Err(AnalysisError::Mapping(format!(
                "unknown options {:?}",
                unknown_options
            )));
        }
        Ok(rows)
    }

    fn observe_marks(
        &self,
        ballot_id: &str,
        images: &[BallotImage],
        roismap: &[RoisMapRow],
    ) -> AnalysisResult<Vec<Observation>> {
        let pages = self.parse_pages(images)?;
        if pages.iter().any(|p| p.unreadable) {
            return Err(AnalysisError::Ballot(format!("{}: the ballot cannot be aligned", ballot_id)));
        }
        let layout: Vec<Vec<PrintedContest>> = pages.iter().map(|p| p.layout.clone()).collect();
        let regions = layout_regions(&layout);
        let mut res: Vec<Observation> = Vec::new();
        for (idx, row) in roismap.iter().enumerate() {
            if row.option == CONTEST_HEADER {
                continue;
            }
            let region = regions
                .iter()
                .position(|r| !r.is_title && r.page == row.page && r.y == row.y);
            let (printed_option, printed_title) = match region {
                Some(pos) => {
                    let title = regions[..pos]
                        .iter()
                        .rev()
                        .find(|r| r.is_title)
                        .map(|r| r.text.clone())
                        .unwrap_or_default();
                    (regions[pos].text.clone(), title)
                }
                None => {
                    res.push(Observation {
                        roi: idx,
                        pixel_metric_value: 0,
                        writein_name: None,
                        delta_y: 0,
                    });
                    continue;
                }
            };
            let page = &pages[row.page as usize];
            let marked = page
                .marks
                .get(&printed_title)
                .map(|l| l.iter().any(|o| o.trim() == printed_option.trim()))
                .unwrap_or(false);
            let writein_name = if marked && is_writein_label(&printed_option) {
                page.writeins.get(&printed_title).cloned()
            } else {
                None
            };
            res.push(Observation {
                roi: idx,
                pixel_metric_value: if marked { MARKED_METRIC } else { UNMARKED_METRIC },
                writein_name,
                delta_y: 0,
            });
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contest_tally::builder::{ContestsBuilder, EifRow};

    fn contests() -> Contests {
        let mut b = ContestsBuilder::new();
        for (c, o) in [("Mayor", "Anna"), ("Mayor", "Bob"), ("Mayor", "writein:")] {
            b.add_row(&EifRow {
                official_contest_name: c.to_string(),
                contest_alias: "".to_string(),
                vote_for: "1".to_string(),
                official_option: o.to_string(),
                option_alias: "".to_string(),
            })
            .unwrap();
        }
        b.build().unwrap()
    }

    fn image(page: &SyntheticPage) -> BallotImage {
        BallotImage {
            path: "a/0001.json".to_string(),
            bytes: serde_json::to_vec(page).unwrap(),
        }
    }

    fn page(title: &str, marks: &[&str]) -> SyntheticPage {
        SyntheticPage {
            card_code: "C1".to_string(),
            layout: vec![PrintedContest {
                title: title.to_string(),
                options: vec!["DEM Anna".to_string(), "Bob".to_string(), "Write-in".to_string()],
            }],
            marks: IndexMap::from([(
                title.to_string(),
                marks.iter().map(|s| s.to_string()).collect(),
            )]),
            writeins: IndexMap::from([(title.to_string(), "Zed".to_string())]),
            ..SyntheticPage::default()
        }
    }

    #[test]
    fn maps_and_observes_a_style() {
        let a = SyntheticAnalyzer::default();
        let p = page("MAYOR", &["Bob", "Write-in"]);
        let t = a.build_template("1", &[vec![image(&p)]]).unwrap();
        assert_eq!(t.num_ballots, 1);
        let regions = a.extract_rois(&t).unwrap();
        assert_eq!(regions.len(), 4);
        let rows = a.map_rois("1", &regions, &contests()).unwrap();
        let options: Vec<&str> = rows.iter().map(|r| r.option.as_str()).collect();
        assert_eq!(options, vec![CONTEST_HEADER, "Anna", "Bob", "writein_0"]);

        let obs = a.observe_marks("0001", &[image(&p)], &rows).unwrap();
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].pixel_metric_value, UNMARKED_METRIC);
        assert_eq!(obs[1].pixel_metric_value, MARKED_METRIC);
        assert_eq!(obs[2].writein_name.as_deref(), Some("Zed"));
        assert_eq!(obs[2].roi, 3);
    }

    #[test]
    fn unknown_layout_cannot_be_mapped() {
        let a = SyntheticAnalyzer::default();
        let t = a
            .build_template("9", &[vec![image(&page("Dog Catcher", &[]))]])
            .unwrap();
        let regions = a.extract_rois(&t).unwrap();
        match a.map_rois("9", &regions, &contests()) {
            Err(AnalysisError::Mapping(_)) => {}
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn unreadable_ballots_are_ballot_errors() {
        let a = SyntheticAnalyzer::default();
        let bad = BallotImage {
            path: "x.json".to_string(),
            bytes: b"not json".to_vec(),
        };
        match a.read_ballot("x", &[bad]) {
            Err(e @ AnalysisError::Ballot(_)) => {
                assert_eq!(e.for_ballot("x").kind(), "BallotProcessingError")
            }
            x => panic!("unexpected {:?}", x),
        }
        assert!(analyzer_by_name("opencv").is_err());
    }
}
