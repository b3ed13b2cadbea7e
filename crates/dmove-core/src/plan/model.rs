//! Records persisted in a plan directory: the transfer ends, part
//! generators, and task models.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PlanError;
use crate::remote::RemoteStore;
use crate::task::TransferType;

/// Extended attribute holding the per-chunk done flags (`'0'`/`'1'`) of a
/// partially finished multi-chunk object.
pub const SUBTASKS_ATTRIBUTE: &str = "_subtasks";

/// One side of a transfer. Stores and credentials are never persisted; the
/// URLs are for reporting and for locating local paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferEnd {
    LocalFile { url: String },
    LocalDirectory { url: String },
    RemoteObject { url: String, name: String },
    RemoteFolder { url: String, prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
    Copy,
}

fn absolute(path: &Path) -> Result<PathBuf, PlanError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(PlanError::io_at(path))?;
    Ok(cwd.join(path))
}

impl TransferEnd {
    pub fn local_file(path: &Path) -> Result<Self, PlanError> {
        let url = Url::from_file_path(absolute(path)?)
            .map_err(|()| PlanError::Invalid(format!("not a file path: {}", path.display())))?;
        Ok(TransferEnd::LocalFile { url: url.into() })
    }

    pub fn local_directory(path: &Path) -> Result<Self, PlanError> {
        let url = Url::from_directory_path(absolute(path)?)
            .map_err(|()| PlanError::Invalid(format!("not a directory path: {}", path.display())))?;
        Ok(TransferEnd::LocalDirectory { url: url.into() })
    }

    pub fn remote_object(store: &dyn RemoteStore, name: &str) -> Self {
        TransferEnd::RemoteObject {
            url: store.object_url(name),
            name: name.to_string(),
        }
    }

    pub fn remote_folder(store: &dyn RemoteStore, prefix: &str) -> Self {
        let prefix = normalize_prefix(prefix);
        TransferEnd::RemoteFolder {
            url: store.object_url(&prefix),
            prefix,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            TransferEnd::LocalFile { url }
            | TransferEnd::LocalDirectory { url }
            | TransferEnd::RemoteObject { url, .. }
            | TransferEnd::RemoteFolder { url, .. } => url,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            TransferEnd::RemoteObject { .. } | TransferEnd::RemoteFolder { .. }
        )
    }

    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            TransferEnd::LocalDirectory { .. } | TransferEnd::RemoteFolder { .. }
        )
    }

    /// Local path of a local end.
    pub fn local_path(&self) -> Result<PathBuf, PlanError> {
        let url = match self {
            TransferEnd::LocalFile { url } | TransferEnd::LocalDirectory { url } => url,
            _ => return Err(PlanError::Invalid(format!("{} is not a local path", self.url()))),
        };
        Url::parse(url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| PlanError::Invalid(format!("bad file url {url}")))
    }

    /// Local path of entry `rel` under this end (`rel` empty = the end itself).
    /// `rel` must stay below the end: absolute paths and `..` are refused.
    pub fn local_child(&self, rel: &str) -> Result<PathBuf, PlanError> {
        let base = self.local_path()?;
        if rel.is_empty() {
            return Ok(base);
        }
        if !is_plain_relative(rel) {
            return Err(PlanError::Invalid(format!(
                "{rel:?} escapes {}",
                base.display()
            )));
        }
        Ok(base.join(rel))
    }

    /// Object name of entry `rel` under this end.
    pub fn remote_child(&self, rel: &str) -> Result<String, PlanError> {
        match self {
            TransferEnd::RemoteObject { name, .. } if rel.is_empty() => Ok(name.clone()),
            TransferEnd::RemoteFolder { prefix, .. } => Ok(format!("{prefix}{rel}")),
            _ => Err(PlanError::Invalid(format!("{} has no entry {rel:?}", self.url()))),
        }
    }

    /// Reporting URL of entry `rel` under this end.
    pub fn child_url(&self, rel: &str) -> String {
        if rel.is_empty() {
            return self.url().to_string();
        }
        format!("{}/{}", self.url().trim_end_matches('/'), rel)
    }
}

/// Folder prefix with no leading `/` and exactly one trailing `/` (empty
/// stays empty and means the whole store).
/// True when every component of `rel` is a plain name, so joining it onto a
/// directory lands inside that directory.
pub fn is_plain_relative(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// The `job_info` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobModel {
    pub source: TransferEnd,
    pub destination: TransferEnd,
}

impl JobModel {
    pub fn transfer_type(&self) -> Result<TransferType, PlanError> {
        use TransferEnd::*;
        Ok(match (&self.source, &self.destination) {
            (LocalFile { .. }, RemoteObject { .. }) => TransferType::SingleUpload,
            (LocalDirectory { .. }, RemoteFolder { .. }) => TransferType::DirectoryUpload,
            (RemoteObject { .. }, LocalFile { .. }) => TransferType::SingleDownload,
            (RemoteFolder { .. }, LocalDirectory { .. }) => TransferType::DirectoryDownload,
            (RemoteObject { .. }, RemoteObject { .. }) => TransferType::SingleCopy,
            (RemoteFolder { .. }, RemoteFolder { .. }) => TransferType::DirectoryCopy,
            (s, d) => {
                return Err(PlanError::Invalid(format!(
                    "cannot transfer {} to {}",
                    s.url(),
                    d.url()
                )))
            }
        })
    }

    pub fn direction(&self) -> Result<Direction, PlanError> {
        Ok(match self.transfer_type()? {
            TransferType::SingleUpload | TransferType::DirectoryUpload => Direction::Upload,
            TransferType::SingleDownload | TransferType::DirectoryDownload => Direction::Download,
            TransferType::SingleCopy | TransferType::DirectoryCopy => Direction::Copy,
        })
    }
}

/// Unexpanded listing work. `source` and `destination` are paths relative to
/// the job's ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartGenerator {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

impl PartGenerator {
    /// Generator covering the whole job.
    pub fn root() -> Self {
        Self {
            source: String::new(),
            destination: String::new(),
            continuation_token: None,
        }
    }
}

/// One object to transfer, claiming one done bit per chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskModel {
    pub source: String,
    pub destination: String,
    pub object_size: u64,
    /// 0 = the object is a single subtask.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_attributes: BTreeMap<String, String>,
}

impl TaskModel {
    pub fn new(source: String, destination: String, object_size: u64, chunk_size: u64) -> Self {
        Self {
            source,
            destination,
            object_size,
            chunk_size,
            extended_attributes: BTreeMap::new(),
        }
    }

    /// Number of done bits: one per chunk, at least one.
    pub fn num_subtasks(&self) -> u32 {
        if self.chunk_size == 0 {
            return 1;
        }
        let n = self.object_size.div_ceil(self.chunk_size).max(1);
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Per-chunk done flags recorded under [`SUBTASKS_ATTRIBUTE`]; all false
    /// when absent.
    pub fn done_chunks(&self) -> Vec<bool> {
        let n = self.num_subtasks() as usize;
        match self.extended_attributes.get(SUBTASKS_ATTRIBUTE) {
            Some(flags) => {
                let mut done: Vec<bool> = flags.bytes().map(|b| b == b'1').collect();
                done.resize(n, false);
                done
            }
            None => vec![false; n],
        }
    }

    pub fn set_done_chunks(&mut self, done: &[bool]) {
        let flags: String = done.iter().map(|&d| if d { '1' } else { '0' }).collect();
        self.extended_attributes
            .insert(SUBTASKS_ATTRIBUTE.to_string(), flags);
    }
}
