// Ballot image archives.

use indexmap::IndexMap;
use log::debug;
use snafu::prelude::*;

use crate::audit::analysis::BallotImage;
use crate::audit::settings::{JobSettings, Vendor};
use crate::audit::store::Db;
use crate::audit::*;

/// The last segment of an archive location.
pub fn archive_basename(location: &str) -> String {
    let trimmed = location.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// The basename without its extension. It names the archive in the artifacts.
pub fn archive_root(location: &str) -> String {
    let basename = archive_basename(location);
    match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => basename,
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

const DOMINION_SIDE_MARKERS: [&str; 5] = ["_front", "_back", "_F", "_B", "_R"];

/// The ballot a file belongs to. ES&S stores one file per ballot. Dominion
/// stores one file per side, with a side marker after the ballot id.
pub fn ballot_id_of_path(vendor: Vendor, path: &str) -> String {
    let stem = file_stem(path);
    match vendor {
        Vendor::Dominion => {
            for marker in DOMINION_SIDE_MARKERS.iter() {
                if let Some(id) = stem.strip_suffix(marker) {
                    if !id.is_empty() {
                        return id.to_string();
                    }
                }
            }
            stem.to_string()
        }
        _ => stem.to_string(),
    }
}

/// The files of one ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BallotFiles {
    pub ballot_id: String,
    pub file_paths: Vec<String>,
}

/// Groups the files of an archive into ballots, in the order of the files.
pub fn group_ballots(vendor: Vendor, files: &[String]) -> Vec<BallotFiles> {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for f in files.iter() {
        let name = f.rsplit('/').next().unwrap_or(f);
        if name.starts_with('.') {
            continue;
        }
        groups
            .entry(ballot_id_of_path(vendor, f))
            .or_default()
            .push(f.clone());
    }
    groups
        .into_iter()
        .map(|(ballot_id, file_paths)| BallotFiles {
            ballot_id,
            file_paths,
        })
        .collect()
}

/// Read access to one archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    location: String,
    db: Db,
}

impl ArchiveSource {
    pub fn open(db: &Db, location: &str) -> ArchiveSource {
        ArchiveSource {
            location: location.to_string(),
            db: db.clone(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn basename(&self) -> String {
        archive_basename(&self.location)
    }

    pub fn root(&self) -> String {
        archive_root(&self.location)
    }

    /// The files of the archive, in lexicographic order.
    pub fn list_files(&self) -> AuditResult<Vec<String>> {
        let files = self.db.list_location(&self.location)?;
        debug!("list_files: {}: {} files", self.location, files.len());
        Ok(files)
    }

    pub fn ballots(&self, vendor: Vendor) -> AuditResult<Vec<BallotFiles>> {
        Ok(group_ballots(vendor, &self.list_files()?))
    }

    pub fn read_images(&self, file_paths: &[String]) -> AuditResult<Vec<BallotImage>> {
        file_paths
            .iter()
            .map(|p| {
                Ok(BallotImage {
                    path: p.clone(),
                    bytes: self.db.read_in_location(&self.location, p)?,
                })
            })
            .collect()
    }
}

/// Finds the configured archive with the given basename.
pub fn location_of(settings: &JobSettings, basename: &str) -> AuditResult<String> {
    settings
        .archives
        .iter()
        .find(|a| archive_basename(a) == basename)
        .cloned()
        .context(DataNotFoundSnafu {
            location: format!("archive {}", basename),
        })
}
