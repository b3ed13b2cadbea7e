//! Remote blob store capability.
//!
//! The engine talks to the remote side only through [`RemoteStore`]: object
//! metadata, ranged reads, whole-object and block-staged writes, paged
//! listing, and server-side copies. Authentication, HTTP pipelines and wire
//! formats belong to whoever implements the trait.

mod local;

pub use local::LocalDirStore;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure reported by a [`RemoteStore`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("throttled by remote store")]
    Throttled,
    #[error("remote operation timed out")]
    Timeout,
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("remote i/o: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => RemoteError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => RemoteError::Timeout,
            _ => RemoteError::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectProperties {
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    /// Full object name, including the listing prefix.
    pub name: String,
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    /// Token for the next page; `None` once the listing is exhausted.
    pub continuation: Option<String>,
}

/// State of a server-side copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyState {
    Pending,
    Success,
    Failed(String),
}

/// A container of named objects. Object names use `/` as the separator.
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// Base URL of the container, without credentials.
    fn url(&self) -> String;

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.url().trim_end_matches('/'), name)
    }

    fn properties(&self, name: &str) -> Result<ObjectProperties, RemoteError>;

    fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>, RemoteError>;

    /// Create or replace `name` with `data` in one call.
    fn put_object(&self, name: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Stage one block of a multi-block object. Staging the same block id
    /// twice replaces the earlier data.
    fn stage_block(&self, name: &str, block_id: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Assemble `name` from staged blocks in `block_ids` order.
    fn commit_blocks(&self, name: &str, block_ids: &[String]) -> Result<(), RemoteError>;

    /// List objects whose names start with `prefix`, in name order.
    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteError>;

    /// Start copying `source_name` from `source` into `name` of this store.
    /// Returns a copy id for [`RemoteStore::copy_state`].
    fn start_copy(
        &self,
        source: Arc<dyn RemoteStore>,
        source_name: &str,
        name: &str,
    ) -> Result<String, RemoteError>;

    fn copy_state(&self, name: &str, copy_id: &str) -> Result<CopyState, RemoteError>;
}
