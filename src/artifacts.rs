//! On-disk artifact tree for harvest jobs.
//!
//! Every job owns `{tenant_root}/emodal/queries/{query_id}/` and writes all
//! of its output there; master mirrors at `{tenant_root}/emodal/` are
//! overwritten as stages complete. All writes are atomic replaces (temp file
//! in the same directory, fsync, rename), so a reader sees either the old or
//! the new complete content, never a partial file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Container listing sheet name (stage 1 output and master mirror).
pub const ALL_CONTAINERS_SHEET: &str = "all_containers.xlsx";
/// Filtered + enriched sheet name (stages 2-4 output).
pub const FILTERED_CONTAINERS_SHEET: &str = "filtered_containers.xlsx";
/// Appointment listing sheet name (stage 5 output and master mirror).
pub const ALL_APPOINTMENTS_SHEET: &str = "all_appointments.xlsx";
/// Stage-4 checkpoint file name.
pub const PROGRESS_FILE: &str = "check_progress.json";

const ATTEMPTS_DIR: &str = "containers_checking_attempts";
const RESPONSES_DIR: &str = "responses";
const SCREENSHOTS_DIR: &str = "screenshots";

/// Terminal state of one stage-4 item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Probe succeeded.
    Ok,
    /// Probe exhausted its attempts or had no usable identifier.
    Failed,
    /// Export probe found no booking calendar; recorded but not a failure.
    Warned,
}

/// Checkpoint record for one item in `check_progress.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeProgress {
    /// Terminal state of the item.
    pub status: ProbeStatus,
    /// Unix seconds of the attempt, matching the response/screenshot names.
    pub stage4_epoch: i64,
}

/// Map of item id to checkpoint state.
pub type ProgressMap = BTreeMap<String, ProbeProgress>;

/// The `emodal` subtree under a tenant root.
pub fn tenant_emodal_dir(tenant_root: &Path) -> PathBuf {
    tenant_root.join("emodal")
}

/// The directory owned by one job.
pub fn job_dir(tenant_root: &Path, query_id: &str) -> PathBuf {
    tenant_emodal_dir(tenant_root).join("queries").join(query_id)
}

/// Handle to one job's artifact directory.
#[derive(Debug, Clone)]
pub struct JobArtifacts {
    dir: PathBuf,
}

impl JobArtifacts {
    /// Create the job directory tree (including probe attempt dirs) and
    /// return a handle to it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub fn create(tenant_root: &Path, query_id: &str) -> anyhow::Result<Self> {
        let dir = job_dir(tenant_root, query_id);
        let attempts = dir.join(ATTEMPTS_DIR);
        for sub in [
            dir.clone(),
            attempts.join(RESPONSES_DIR),
            attempts.join(SCREENSHOTS_DIR),
        ] {
            fs::create_dir_all(&sub)
                .with_context(|| format!("failed to create job directory {}", sub.display()))?;
        }
        Ok(Self { dir })
    }

    /// Open a handle without creating anything (read paths, zip download).
    pub fn open(tenant_root: &Path, query_id: &str) -> Self {
        Self {
            dir: job_dir(tenant_root, query_id),
        }
    }

    /// The job's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the raw container listing sheet.
    pub fn containers_sheet(&self) -> PathBuf {
        self.dir.join(ALL_CONTAINERS_SHEET)
    }

    /// Path of the filtered + enriched sheet.
    pub fn filtered_sheet(&self) -> PathBuf {
        self.dir.join(FILTERED_CONTAINERS_SHEET)
    }

    /// Path of the raw appointment listing sheet.
    pub fn appointments_sheet(&self) -> PathBuf {
        self.dir.join(ALL_APPOINTMENTS_SHEET)
    }

    /// Path of the stage-4 checkpoint file.
    pub fn progress_file(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    /// Atomically write one of the job's spreadsheets.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn write_sheet(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.dir.join(name), bytes)
    }

    /// Persist a probe response payload under the attempts tree.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn write_response(&self, item_id: &str, epoch: i64, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self
            .dir
            .join(ATTEMPTS_DIR)
            .join(RESPONSES_DIR)
            .join(format!("{item_id}_{epoch}.json"));
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Persist a probe screenshot under the attempts tree.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn write_screenshot(
        &self,
        item_id: &str,
        epoch: i64,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self
            .dir
            .join(ATTEMPTS_DIR)
            .join(SCREENSHOTS_DIR)
            .join(format!("{item_id}_{epoch}.png"));
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Atomically replace `check_progress.json` with the given map.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or filesystem failure.
    pub fn write_progress(&self, map: &ProgressMap) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(map).context("failed to serialize progress map")?;
        write_atomic(&self.progress_file(), &json)
    }

    /// Read the checkpoint map; a missing or corrupt file yields an empty map.
    pub fn read_progress(&self) -> ProgressMap {
        let Ok(bytes) = fs::read(self.progress_file()) else {
            return ProgressMap::new();
        };
        serde_json::from_slice(&bytes).unwrap_or_default()
    }

    /// Zip the whole job directory for download.
    ///
    /// Built lazily on request; nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be walked or archived.
    pub fn zip(&self) -> anyhow::Result<Vec<u8>> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip_dir(&mut writer, &self.dir, &self.dir, options)?;
            writer.finish().context("failed to finish zip archive")?;
        }
        Ok(buffer.into_inner())
    }
}

fn zip_dir(
    writer: &mut zip::ZipWriter<&mut std::io::Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
    options: zip::write::SimpleFileOptions,
) -> anyhow::Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        let relative = path
            .strip_prefix(root)
            .context("entry escaped the job directory")?
            .to_string_lossy()
            .into_owned();
        if path.is_dir() {
            zip_dir(writer, root, &path, options)?;
        } else {
            writer
                .start_file(relative, options)
                .context("failed to start zip entry")?;
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            writer.write_all(&bytes).context("failed to write zip entry")?;
        }
    }
    Ok(())
}

/// Overwrite a tenant's master mirror of a listing sheet.
///
/// # Errors
///
/// Returns an error on any filesystem failure.
pub fn write_master_mirror(tenant_root: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = tenant_emodal_dir(tenant_root);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    write_atomic(&dir.join(name), bytes)
}

/// Atomic replace: write to a temp file in the target directory, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("artifact path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("artifact path has no file name: {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("failed to create temp file {}", tmp.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
