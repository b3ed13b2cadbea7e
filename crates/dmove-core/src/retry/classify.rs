//! Map remote store errors onto retry policy error kinds.

use crate::remote::RemoteError;
use crate::retry::policy::ErrorKind;

pub fn classify(e: &RemoteError) -> ErrorKind {
    match e {
        RemoteError::Timeout => ErrorKind::Timeout,
        RemoteError::Throttled => ErrorKind::Throttled,
        RemoteError::Connection(_) => ErrorKind::Connection,
        RemoteError::NotFound(_) | RemoteError::Io(_) | RemoteError::Other(_) => ErrorKind::Other,
    }
}
