use std::io;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use super::resource::{ObjectList, Resource};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("api server error, status: {}, reason: {}, message: {}", .0.status, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("transport failed, {0}")]
    Transport(#[from] io::Error),
    #[error("deserialize response failed, {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl Error {
    /// The requested resource version has been compacted away server side.
    /// The only recovery is a fresh list.
    pub fn is_expired(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.code == 410 || resp.reason == "Expired")
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Transport(err) if err.kind() == io::ErrorKind::ConnectionRefused)
    }

    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Error::Transport(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// An error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

/// Common query parameters for list and watch calls on collections.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// A selector to restrict the list of returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields,
    /// as comma-joined `<field>=<op>:<value>` predicates.
    pub field_selector: Option<String>,

    /// Server side timeout in seconds. This limits the duration of the call,
    /// regardless of any activity or inactivity.
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK".
    ///
    /// Servers that do not implement bookmarks ignore this flag; clients must
    /// not assume bookmarks are returned at any specific interval.
    pub bookmarks: bool,

    /// Limit the number of results per page.
    ///
    /// If there are more results, the server responds with a continue token
    /// which can be used to fetch the next page.
    pub limit: Option<u32>,

    /// Continuation token from a previous paged list.
    pub continue_token: Option<String>,

    /// An explicit resource version to list or watch from. The token is
    /// opaque; "0" permits cache-served reads.
    pub resource_version: Option<String>,
}

impl ListOptions {
    /// Appends a predicate to the field selector, comma separated.
    pub fn append_field_selector(&mut self, selector: &str) {
        match &mut self.field_selector {
            Some(existing) if !existing.is_empty() => {
                existing.push(',');
                existing.push_str(selector);
            }
            _ => self.field_selector = Some(selector.to_string()),
        }
    }
}

/// A raw event returned from a watch stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<R> {
    /// Resource was added
    Added(R),
    /// Resource was modified
    Modified(R),
    /// Resource was deleted
    Deleted(R),
    /// Server heartbeat carrying only a resource version. `Bookmark` is a
    /// slimmed down `R`.
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

/// Can only be relied upon to have metadata with a resource version.
#[derive(Debug, Deserialize)]
pub struct Bookmark {
    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

#[derive(Debug, Deserialize)]
pub struct BookmarkMeta {
    /// The only field we need from a bookmark event.
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

/// A stream of watch events. Dropping the stream stops the watch; transports
/// must make that cancellation idempotent.
pub type WatchStream<R> = BoxStream<'static, Result<WatchEvent<R>, Error>>;

/// The transport surface a reflector mirrors from.
///
/// `list` returns a single page honoring `limit`/`continue_token`; `watch`
/// opens a long-lived event stream following `resource_version`. Both apply
/// the label and field selectors carried in the options.
#[async_trait]
pub trait ListerWatcher<R: Resource>: Send + Sync {
    async fn list(&self, options: &ListOptions) -> Result<ObjectList<R>, Error>;

    async fn watch(&self, options: &ListOptions) -> Result<WatchStream<R>, Error>;
}
