//! Storage of the job artifacts, locally or in an object store.
//!
//! Every artifact of a job is addressed by `(dirname, subdir, name)` under the
//! job root. The job root is either a local directory or an `s3://bucket/prefix`
//! location. Both are accessed through [`object_store`], so the pipeline code
//! does not depend on where the job lives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use indexmap::IndexMap;
use log::{debug, info, warn};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{BackoffConfig, ObjectStore, PutMode, PutOptions, PutPayload, RetryConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JSValue;
use snafu::prelude::*;
use tokio::runtime::Runtime;

use crate::audit::table::{read_table, write_table, RawTable, Table};
use crate::audit::*;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts `s3://bucket` and `s3://bucket/key/path`. The key may be empty.
pub fn parse_s3_uri(uri: &str) -> AuditResult<(&str, &str)> {
    let without_scheme = uri.strip_prefix("s3://").context(ConfigurationSnafu {
        message: format!("invalid S3 URI: expected 's3://' prefix in '{}'", uri),
    })?;
    let (bucket, key) = without_scheme
        .split_once('/')
        .unwrap_or((without_scheme, ""));
    ensure!(
        !bucket.is_empty(),
        ConfigurationSnafu {
            message: format!("invalid S3 URI: missing bucket in '{}'", uri),
        }
    );
    Ok((bucket, key.trim_end_matches('/')))
}

pub fn is_s3_location(location: &str) -> bool {
    location.starts_with("s3://")
}

fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Credentials and region are loaded from the environment
/// (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION, ...).
fn create_s3_store(bucket: &str) -> AuditResult<Arc<dyn ObjectStore>> {
    info!("Creating S3 client for bucket: {}", bucket);
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_retry(create_retry_config())
        .build()
        .context(StoreSnafu { location: bucket })?;
    Ok(Arc::new(store))
}

fn build_runtime() -> AuditResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("baudit-io")
        .enable_all()
        .build()
        .context(IoSnafu {
            path: "tokio runtime",
        })
}

fn join_path(prefix: &Path, parts: &[&str]) -> Path {
    let mut segments: Vec<String> = prefix.parts().map(|p| p.as_ref().to_string()).collect();
    for part in parts.iter() {
        for s in part.split('/') {
            if !s.is_empty() {
                segments.push(s.to_string());
            }
        }
    }
    Path::from_iter(segments)
}

fn relative_name(prefix: &Path, location: &Path) -> Option<String> {
    location
        .prefix_match(prefix)
        .map(|parts| parts.map(|p| p.as_ref().to_string()).collect::<Vec<String>>().join("/"))
}

/// The formats in which artifacts are saved.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Format {
    Csv,
    Json,
    Png,
    Zip,
    Raw,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Png => "png",
            Format::Zip => "zip",
            Format::Raw => "",
        }
    }
}

/// The shapes in which artifacts are loaded.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Shape {
    /// A table: header and rows.
    DataFrame,
    /// A list of dictionaries, one per row.
    Lod,
    /// A JSON document.
    Dict,
}

#[derive(PartialEq, Debug, Clone)]
pub enum Loaded {
    DataFrame(RawTable),
    Lod(Vec<IndexMap<String, String>>),
    Dict(JSValue),
}

/// Outcome of a `combine_chunks` call.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct CombineStats {
    pub chunks: usize,
    pub rows: usize,
    pub header_mismatches: usize,
}

/// The data store of one job.
///
/// The store is asynchronous. A small runtime owned by the `Db` drives it, so
/// that the rest of the pipeline stays synchronous. Cloning a `Db` is cheap.
#[derive(Clone)]
pub struct Db {
    root: String,
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    runtime: Arc<Runtime>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("root", &self.root).finish()
    }
}

impl Db {
    /// Opens the store of a job root: a local directory (created if needed) or
    /// an `s3://bucket/prefix` location.
    pub fn open(job_root: &str) -> AuditResult<Db> {
        let runtime = Arc::new(build_runtime()?);
        if is_s3_location(job_root) {
            let (bucket, key) = parse_s3_uri(job_root)?;
            let store = create_s3_store(bucket)?;
            Ok(Db {
                root: job_root.to_string(),
                store,
                prefix: Path::from(key),
                runtime,
            })
        } else {
            std::fs::create_dir_all(job_root).context(IoSnafu { path: job_root })?;
            let store = LocalFileSystem::new_with_prefix(job_root)
                .context(StoreSnafu { location: job_root })?;
            info!("Creating local store at: {}", job_root);
            Ok(Db {
                root: job_root.to_string(),
                store: Arc::new(store),
                prefix: Path::default(),
                runtime,
            })
        }
    }

    /// A store that lives in memory, for tests and dry runs.
    pub fn in_memory(name: &str) -> AuditResult<Db> {
        Ok(Db {
            root: format!("memory://{}", name),
            store: Arc::new(InMemory::new()),
            prefix: Path::default(),
            runtime: Arc::new(build_runtime()?),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_remote(&self) -> bool {
        is_s3_location(&self.root)
    }

    pub(crate) fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.runtime.block_on(f)
    }

    pub fn path_for(&self, dirname: &str, subdir: Option<&str>, name: &str) -> Path {
        match subdir {
            Some(s) => join_path(&self.prefix, &[dirname, s, name]),
            None => join_path(&self.prefix, &[dirname, name]),
        }
    }

    fn display(&self, path: &Path) -> String {
        format!("{}:{}", self.root, path)
    }

    // ********* Saving *********

    /// Writes an artifact. Local writes go through a temporary file that is
    /// renamed in place, object store writes replace the object at once.
    pub fn save_bytes(
        &self,
        data: Vec<u8>,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<Path> {
        let path = self.path_for(dirname, subdir, name);
        debug!("save_bytes: {} ({} bytes)", path, data.len());
        self.block_on(self.store.put(&path, PutPayload::from(data)))
            .context(StoreSnafu {
                location: self.display(&path),
            })?;
        Ok(path)
    }

    /// Writes an artifact only if nothing exists at its location yet.
    /// Returns false if the artifact already existed.
    pub fn save_bytes_new(
        &self,
        data: Vec<u8>,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<bool> {
        let path = self.path_for(dirname, subdir, name);
        let opts = PutOptions::from(PutMode::Create);
        match self.block_on(self.store.put_opts(&path, PutPayload::from(data.clone()), opts)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(object_store::Error::NotImplemented) => {
                // Some backends have no conditional writes.
                if self.exists(dirname, subdir, name)? {
                    Ok(false)
                } else {
                    self.save_bytes(data, dirname, subdir, name)?;
                    Ok(true)
                }
            }
            Err(e) => Err(e).context(StoreSnafu {
                location: self.display(&path),
            }),
        }
    }

    pub fn save_text(
        &self,
        text: &str,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<Path> {
        self.save_bytes(text.as_bytes().to_vec(), dirname, subdir, name)
    }

    pub fn save_table<T: Table>(
        &self,
        rows: &[T],
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<Path> {
        let bytes = write_table(rows, name)?;
        self.save_bytes(bytes, dirname, subdir, name)
    }

    pub fn save_json<T: Serialize>(
        &self,
        value: &T,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<Path> {
        let bytes = serde_json::to_vec_pretty(value).context(JsonSnafu { location: name })?;
        self.save_bytes(bytes, dirname, subdir, name)
    }

    /// Saves a loaded value back, in the given format. `name` is given without
    /// extension.
    pub fn save(
        &self,
        data: &Loaded,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
        format: Format,
    ) -> AuditResult<Path> {
        let full_name = match format {
            Format::Raw => name.to_string(),
            f => format!("{}.{}", name, f.extension()),
        };
        let bytes = match (data, format) {
            (Loaded::DataFrame(t), Format::Csv) => t.to_bytes(&full_name)?,
            (Loaded::Lod(records), Format::Csv) => {
                let header: Vec<String> = records
                    .first()
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default();
                let rows = records
                    .iter()
                    .map(|r| {
                        header
                            .iter()
                            .map(|h| r.get(h).cloned().unwrap_or_default())
                            .collect()
                    })
                    .collect();
                RawTable { header, rows }.to_bytes(&full_name)?
            }
            (Loaded::Lod(records), _) => serde_json::to_vec_pretty(records)
                .context(JsonSnafu {
                    location: full_name.clone(),
                })?,
            (Loaded::Dict(js), _) => serde_json::to_vec_pretty(js).context(JsonSnafu {
                location: full_name.clone(),
            })?,
            (Loaded::DataFrame(t), _) => t.to_bytes(&full_name)?,
        };
        self.save_bytes(bytes, dirname, subdir, &full_name)
    }

    // ********* Loading *********

    /// Reads an artifact. A missing artifact is a `DataNotFound` error.
    pub fn load_bytes(&self, dirname: &str, subdir: Option<&str>, name: &str) -> AuditResult<Vec<u8>> {
        let path = self.path_for(dirname, subdir, name);
        self.get_path(&self.store, &path)
    }

    fn get_path(&self, store: &Arc<dyn ObjectStore>, path: &Path) -> AuditResult<Vec<u8>> {
        let res = self.block_on(async {
            let r = store.get(path).await?;
            r.bytes().await
        });
        match res {
            Ok(b) => Ok(b.to_vec()),
            Err(object_store::Error::NotFound { .. }) => DataNotFoundSnafu {
                location: self.display(path),
            }
            .fail(),
            Err(e) => Err(e).context(StoreSnafu {
                location: self.display(path),
            }),
        }
    }

    pub fn load_text(&self, dirname: &str, subdir: Option<&str>, name: &str) -> AuditResult<String> {
        let bytes = self.load_bytes(dirname, subdir, name)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn load_table<T: Table>(
        &self,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<Vec<T>> {
        let bytes = self.load_bytes(dirname, subdir, name)?;
        read_table(&bytes, name)
    }

    pub fn load_json<T: DeserializeOwned>(
        &self,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
    ) -> AuditResult<T> {
        let bytes = self.load_bytes(dirname, subdir, name)?;
        serde_json::from_slice(&bytes).context(JsonSnafu { location: name })
    }

    /// Loads an artifact in the requested shape. With `silent_error`, a missing
    /// artifact gives an empty value instead of an error.
    pub fn load(
        &self,
        dirname: &str,
        subdir: Option<&str>,
        name: &str,
        shape: Shape,
        silent_error: bool,
    ) -> AuditResult<Loaded> {
        let bytes = match self.load_bytes(dirname, subdir, name) {
            Ok(b) => b,
            Err(AuditError::DataNotFound { location }) if silent_error => {
                debug!("load: {} not found, returning an empty value", location);
                return Ok(match shape {
                    Shape::DataFrame => Loaded::DataFrame(RawTable::default()),
                    Shape::Lod => Loaded::Lod(vec![]),
                    Shape::Dict => Loaded::Dict(JSValue::Object(serde_json::Map::new())),
                });
            }
            Err(e) => return Err(e),
        };
        let is_json = name.ends_with(".json");
        match shape {
            Shape::DataFrame => Ok(Loaded::DataFrame(RawTable::parse(&bytes, name)?)),
            Shape::Lod if is_json => {
                let records: Vec<IndexMap<String, String>> =
                    serde_json::from_slice(&bytes).context(JsonSnafu { location: name })?;
                Ok(Loaded::Lod(records))
            }
            Shape::Lod => Ok(Loaded::Lod(RawTable::parse(&bytes, name)?.records())),
            Shape::Dict => {
                let js: JSValue =
                    serde_json::from_slice(&bytes).context(JsonSnafu { location: name })?;
                Ok(Loaded::Dict(js))
            }
        }
    }

    // ********* Listing *********

    pub fn exists(&self, dirname: &str, subdir: Option<&str>, name: &str) -> AuditResult<bool> {
        let path = self.path_for(dirname, subdir, name);
        match self.block_on(self.store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).context(StoreSnafu {
                location: self.display(&path),
            }),
        }
    }

    /// The names of the artifacts directly under `dirname/subdir` matching a glob
    /// pattern, in lexicographic order.
    pub fn list(&self, dirname: &str, subdir: Option<&str>, file_pattern: &str) -> AuditResult<Vec<String>> {
        let pattern = glob::Pattern::new(file_pattern).context(PatternSnafu {
            pattern: file_pattern,
        })?;
        let prefix = match subdir {
            Some(s) => join_path(&self.prefix, &[dirname, s]),
            None => join_path(&self.prefix, &[dirname]),
        };
        let listed = match self.block_on(self.store.list_with_delimiter(Some(&prefix))) {
            Ok(l) => l.objects,
            Err(object_store::Error::NotFound { .. }) => vec![],
            Err(e) => {
                return Err(e).context(StoreSnafu {
                    location: self.display(&prefix),
                })
            }
        };
        let mut names: Vec<String> = listed
            .iter()
            .filter_map(|m| m.location.filename().map(|s| s.to_string()))
            .filter(|n| pattern.matches(n))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Deletes the artifacts directly under `dirname/subdir` matching a glob
    /// pattern. Returns the number of deleted artifacts.
    pub fn delete(&self, dirname: &str, subdir: Option<&str>, file_pattern: &str) -> AuditResult<usize> {
        let names = self.list(dirname, subdir, file_pattern)?;
        for name in names.iter() {
            let path = self.path_for(dirname, subdir, name);
            match self.block_on(self.store.delete(&path)) {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => {
                    return Err(e).context(StoreSnafu {
                        location: self.display(&path),
                    })
                }
            }
        }
        if !names.is_empty() {
            debug!(
                "delete: removed {} files from {}/{}",
                names.len(),
                dirname,
                subdir.unwrap_or("")
            );
        }
        Ok(names.len())
    }

    /// Concatenates the chunks under `dirname/subdir` matching `file_pattern`,
    /// in lexicographic order, into `dirname/dest_name`.
    ///
    /// CSV chunks keep the first header. A chunk with a different header is
    /// skipped and counted in `header_mismatches`. For JSON, lists are
    /// concatenated and other values appended.
    pub fn combine_chunks(
        &self,
        dirname: &str,
        subdir: Option<&str>,
        dest_name: &str,
        file_pattern: &str,
    ) -> AuditResult<CombineStats> {
        let names = self.list(dirname, subdir, file_pattern)?;
        let mut stats = CombineStats::default();
        if dest_name.ends_with(".json") {
            let mut items: Vec<JSValue> = Vec::new();
            for name in names.iter() {
                let js: JSValue = self.load_json(dirname, subdir, name)?;
                stats.chunks += 1;
                match js {
                    JSValue::Array(mut l) => {
                        stats.rows += l.len();
                        items.append(&mut l);
                    }
                    x => {
                        stats.rows += 1;
                        items.push(x);
                    }
                }
            }
            self.save_json(&items, dirname, None, dest_name)?;
            return Ok(stats);
        }

        let mut combined = RawTable::default();
        for name in names.iter() {
            let t = RawTable::parse(&self.load_bytes(dirname, subdir, name)?, name)?;
            stats.chunks += 1;
            if t.is_empty() {
                continue;
            }
            if combined.is_empty() {
                combined.header = t.header.clone();
            } else if combined.header != t.header {
                warn!(
                    "combine_chunks: {}: header {:?} differs from {:?}, skipping the chunk",
                    name, t.header, combined.header
                );
                stats.header_mismatches += 1;
                continue;
            }
            stats.rows += t.rows.len();
            combined.rows.extend(t.rows);
        }
        self.save_bytes(combined.to_bytes(dest_name)?, dirname, None, dest_name)?;
        debug!(
            "combine_chunks: {}/{}: {} chunks, {} rows",
            dirname, dest_name, stats.chunks, stats.rows
        );
        Ok(stats)
    }

    // ********* Locations outside of the job *********

    fn open_location(&self, location: &str) -> AuditResult<(Arc<dyn ObjectStore>, Path)> {
        if is_s3_location(location) {
            let (bucket, key) = parse_s3_uri(location)?;
            Ok((create_s3_store(bucket)?, Path::from(key)))
        } else {
            let path = Path::from_filesystem_path(location).map_err(|e| AuditError::DataNotFound {
                location: format!("{} ({})", location, e),
            })?;
            Ok((Arc::new(LocalFileSystem::new()), path))
        }
    }

    /// Reads a file given as a local path or an `s3://` URI.
    pub fn read_location(&self, location: &str) -> AuditResult<Vec<u8>> {
        let (store, path) = self.open_location(location)?;
        self.get_path(&store, &path)
    }

    /// Lists all the files below a local directory or an `s3://` prefix. The
    /// names are relative to the location and sorted.
    pub fn list_location(&self, location: &str) -> AuditResult<Vec<String>> {
        let (store, prefix) = self.open_location(location)?;
        let metas = self
            .block_on(store.list(Some(&prefix)).try_collect::<Vec<_>>())
            .context(StoreSnafu { location })?;
        let mut names: Vec<String> = metas
            .iter()
            .filter_map(|m| relative_name(&prefix, &m.location))
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Reads a file below a location listed with [`Db::list_location`].
    pub fn read_in_location(&self, location: &str, name: &str) -> AuditResult<Vec<u8>> {
        let (store, prefix) = self.open_location(location)?;
        let path = join_path(&prefix, &[name]);
        self.get_path(&store, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    struct Row {
        ballot_id: String,
        value: u32,
    }

    impl Table for Row {
        const COLUMNS: &'static [&'static str] = &["ballot_id", "value"];
    }

    fn rows(prefix: &str, n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row {
                ballot_id: format!("{}{:03}", prefix, i),
                value: i as u32,
            })
            .collect()
    }

    fn backends() -> Vec<(Db, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        let local = Db::open(dir.path().to_str().unwrap()).unwrap();
        vec![
            (Db::in_memory("test").unwrap(), None),
            (local, Some(dir)),
        ]
    }

    #[test]
    fn test_parse_s3_uri() {
        assert_eq!(
            parse_s3_uri("s3://my-bucket/jobs/job1").unwrap(),
            ("my-bucket", "jobs/job1")
        );
        assert_eq!(parse_s3_uri("s3://my-bucket").unwrap(), ("my-bucket", ""));
        assert!(parse_s3_uri("bucket/key").is_err());
        assert!(parse_s3_uri("s3:///key").is_err());
    }

    #[test]
    fn path_for_joins_segments() {
        let db = Db::in_memory("test").unwrap();
        assert_eq!(
            db.path_for("marks", Some("chunks"), "a_marks_chunk_0000.csv").as_ref(),
            "marks/chunks/a_marks_chunk_0000.csv"
        );
        assert_eq!(db.path_for("config", None, "contests.json").as_ref(), "config/contests.json");
    }

    #[test]
    fn missing_artifacts() {
        for (db, _dir) in backends() {
            let err = db.load_bytes("bif", None, "nope.csv").unwrap_err();
            assert_eq!(err.kind(), "DataNotFound");
            assert!(!db.exists("bif", None, "nope.csv").unwrap());
            match db.load("bif", None, "nope.csv", Shape::DataFrame, true).unwrap() {
                Loaded::DataFrame(t) => assert!(t.is_empty()),
                x => panic!("unexpected {:?}", x),
            }
            assert!(db.list("bif", Some("chunks"), "*.csv").unwrap().is_empty());
        }
    }

    #[test]
    fn list_and_delete_by_pattern() {
        for (db, _dir) in backends() {
            for name in ["b_chunk_0001.csv", "a_chunk_0000.csv", "a_chunk_0001.json"] {
                db.save_text("x", "bif", Some("tasks"), name).unwrap();
            }
            assert_eq!(
                db.list("bif", Some("tasks"), "*.csv").unwrap(),
                vec!["a_chunk_0000.csv", "b_chunk_0001.csv"]
            );
            assert_eq!(db.delete("bif", Some("tasks"), "a_*").unwrap(), 2);
            assert_eq!(db.list("bif", Some("tasks"), "*").unwrap(), vec!["b_chunk_0001.csv"]);
        }
    }

    #[test]
    fn create_only_once() {
        for (db, _dir) in backends() {
            assert!(db.save_bytes_new(b"1".to_vec(), "lambda_tracker", Some("Failed"), "t.json").unwrap());
            assert!(!db.save_bytes_new(b"2".to_vec(), "lambda_tracker", Some("Failed"), "t.json").unwrap());
            assert_eq!(db.load_text("lambda_tracker", Some("Failed"), "t.json").unwrap(), "1");
        }
    }

    #[test]
    fn combine_skips_mismatched_headers() {
        for (db, _dir) in backends() {
            db.save_table(&rows("a", 2), "marks", Some("chunks"), "a_marks_chunk_0000.csv")
                .unwrap();
            db.save_table(&rows("a", 3), "marks", Some("chunks"), "a_marks_chunk_0001.csv")
                .unwrap();
            db.save_text("other,header\n1,2\n", "marks", Some("chunks"), "a_marks_chunk_0002.csv")
                .unwrap();
            let stats = db
                .combine_chunks("marks", Some("chunks"), "a_marks.csv", "a_marks_chunk_*.csv")
                .unwrap();
            assert_eq!(
                stats,
                CombineStats {
                    chunks: 3,
                    rows: 5,
                    header_mismatches: 1
                }
            );
            let combined: Vec<Row> = db.load_table("marks", None, "a_marks.csv").unwrap();
            assert_eq!(combined.len(), 5);
            assert_eq!(combined[2].ballot_id, "a000");
        }
    }

    #[test]
    fn combine_concatenates_json_lists() {
        let db = Db::in_memory("test").unwrap();
        db.save_json(&vec![1, 2], "report", Some("parts"), "p0.json").unwrap();
        db.save_json(&serde_json::json!({"a": 1}), "report", Some("parts"), "p1.json")
            .unwrap();
        let stats = db
            .combine_chunks("report", Some("parts"), "all.json", "*.json")
            .unwrap();
        assert_eq!(stats.rows, 3);
        let js: JSValue = db.load_json("report", None, "all.json").unwrap();
        assert_eq!(js, serde_json::json!([1, 2, {"a": 1}]));
    }

    #[test]
    fn loads_in_every_shape() {
        let db = Db::in_memory("test").unwrap();
        db.save_table(&rows("b", 2), "bif", None, "x_bif.csv").unwrap();
        match db.load("bif", None, "x_bif.csv", Shape::Lod, false).unwrap() {
            Loaded::Lod(l) => {
                assert_eq!(l.len(), 2);
                assert_eq!(l[1].get("ballot_id").unwrap(), "b001");
            }
            x => panic!("unexpected {:?}", x),
        }
        let loaded = db.load("bif", None, "x_bif.csv", Shape::DataFrame, false).unwrap();
        db.save(&loaded, "bif", None, "copy", Format::Csv).unwrap();
        assert_eq!(
            db.load_bytes("bif", None, "copy.csv").unwrap(),
            db.load_bytes("bif", None, "x_bif.csv").unwrap()
        );
    }

    #[test]
    fn lists_local_locations_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("sub").join("a.json"), "[]").unwrap();
        let db = Db::in_memory("test").unwrap();
        let loc = dir.path().to_str().unwrap();
        assert_eq!(db.list_location(loc).unwrap(), vec!["b.json", "sub/a.json"]);
        assert_eq!(db.read_in_location(loc, "sub/a.json").unwrap(), b"[]".to_vec());
        let f = dir.path().join("b.json");
        assert_eq!(db.read_location(f.to_str().unwrap()).unwrap(), b"{}".to_vec());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn combined_rows_are_the_sum_of_chunks(sizes in proptest::collection::vec(0usize..20, 1..6)) {
            let db = Db::in_memory("prop").unwrap();
            for (idx, n) in sizes.iter().enumerate() {
                db.save_table(&rows(&format!("c{}_", idx), *n), "cmpcvr", Some("chunks"),
                    &format!("g_cmpcvr_chunk_{:04}.csv", idx)).unwrap();
            }
            let stats = db.combine_chunks("cmpcvr", Some("chunks"), "g_cmpcvr.csv", "g_cmpcvr_chunk_*.csv").unwrap();
            prop_assert_eq!(stats.rows, sizes.iter().sum::<usize>());
            prop_assert_eq!(stats.chunks, sizes.len());
            let t = RawTable::parse(&db.load_bytes("cmpcvr", None, "g_cmpcvr.csv").unwrap(), "g").unwrap();
            prop_assert_eq!(t.header, vec!["ballot_id".to_string(), "value".to_string()]);
            prop_assert_eq!(t.rows.len(), sizes.iter().sum::<usize>());
        }
    }
}
