// Task identity, manifests and result names.

use std::fmt::Display;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::audit::settings::JobSettings;
use crate::audit::store::Db;
use crate::audit::table::Table;
use crate::audit::*;

/// Width of the zero-padded chunk index, so that lexicographic order of the
/// names is the numeric order of the chunks.
pub const CHUNK_IDX_WIDTH: usize = 4;

pub const TASKS_DIR: &str = "tasks";
pub const CHUNKS_DIR: &str = "chunks";
pub const LOGS_DIR: &str = "logs";

/// The chunked stages, by the directory they own under the job root.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Bif,
    Styles,
    Marks,
    Cmpcvr,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Bif, Stage::Styles, Stage::Marks, Stage::Cmpcvr];

    pub fn dirname(&self) -> &'static str {
        match self {
            Stage::Bif => "bif",
            Stage::Styles => "styles",
            Stage::Marks => "marks",
            Stage::Cmpcvr => "cmpcvr",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dirname())
    }
}

pub fn task_name(group: &str, chunk_idx: usize) -> String {
    format!("{}_chunk_{:0width$}", group, chunk_idx, width = CHUNK_IDX_WIDTH)
}

/// The group and the chunk index of a task name.
pub fn parse_task_name(name: &str) -> Option<(String, usize)> {
    let (group, idx) = name.rsplit_once("_chunk_")?;
    let idx = idx.parse::<usize>().ok()?;
    Some((group.to_string(), idx))
}

pub fn result_name(group: &str, stage: Stage, chunk_idx: usize) -> String {
    format!(
        "{}_{}_chunk_{:0width$}.csv",
        group,
        stage.dirname(),
        chunk_idx,
        width = CHUNK_IDX_WIDTH
    )
}

/// The sub-steps run by a task of the styles stage.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StyleSteps {
    pub template: bool,
    pub rois: bool,
    pub maprois: bool,
}

/// Everything a worker needs to run one task. The settings travel with the task
/// so that a delegate process can rebuild its context from them alone.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TaskArgs {
    pub job_name: String,
    pub stage: Stage,
    pub group: String,
    pub chunk_idx: usize,
    pub task_name: String,
    #[serde(default)]
    pub style_num: Option<String>,
    #[serde(default)]
    pub style_steps: Option<StyleSteps>,
    pub argsdict: JobSettings,
}

impl TaskArgs {
    pub fn new(settings: &JobSettings, stage: Stage, group: &str, chunk_idx: usize) -> TaskArgs {
        TaskArgs {
            job_name: settings.job_name.clone(),
            stage,
            group: group.to_string(),
            chunk_idx,
            task_name: task_name(group, chunk_idx),
            style_num: None,
            style_steps: None,
            argsdict: settings.clone(),
        }
    }

    pub fn manifest_name(&self) -> String {
        format!("{}.csv", self.task_name)
    }

    pub fn result_name(&self) -> String {
        result_name(&self.group, self.stage, self.chunk_idx)
    }

    /// The name of a sibling result, such as `disagreed_{group}_cmpcvr_chunk_0000.csv`.
    pub fn prefixed_result_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.result_name())
    }

    pub fn write_manifest<T: Table>(&self, db: &Db, rows: &[T]) -> AuditResult<()> {
        db.save_table(rows, self.stage.dirname(), Some(TASKS_DIR), &self.manifest_name())?;
        Ok(())
    }

    pub fn load_manifest<T: Table>(&self, db: &Db) -> AuditResult<Vec<T>> {
        db.load_table(self.stage.dirname(), Some(TASKS_DIR), &self.manifest_name())
    }

    pub fn save_result<T: Table>(&self, db: &Db, rows: &[T]) -> AuditResult<()> {
        db.save_table(rows, self.stage.dirname(), Some(CHUNKS_DIR), &self.result_name())?;
        Ok(())
    }

    pub fn result_exists(&self, db: &Db) -> AuditResult<bool> {
        db.exists(self.stage.dirname(), Some(CHUNKS_DIR), &self.result_name())
    }
}

/// Removes the manifests, the results and the logs of the previous run of a
/// stage. The other stages are not touched.
pub fn truncate_stage(db: &Db, stage: Stage) -> AuditResult<usize> {
    let mut n = 0;
    for subdir in [TASKS_DIR, CHUNKS_DIR, LOGS_DIR] {
        n += db.delete(stage.dirname(), Some(subdir), "*")?;
    }
    debug!("truncate_stage: {}: {} files removed", stage, n);
    Ok(n)
}
