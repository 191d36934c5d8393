pub mod atom;
pub mod rss;
pub mod store;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use url::Url;

use crate::model::{ExportConfig, Format, Post, Queue};

pub use self::atom::AtomPublisher;
pub use self::rss::RssPublisher;
pub use self::store::ArtifactStore;

/// A point-in-time view of a queue and the posts that take part in its artifacts.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub queue: Queue,
    pub posts: Vec<Post>,
    /// Increases with every snapshot taken. Artifacts of an older revision never replace newer ones.
    pub revision: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct PubError {
    pub message: String,
}

impl PubError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The outcome of running one publisher during a deployment pass.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PubResult {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub publisher_ident: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PubError>,
}

impl PubResult {
    pub fn success(publisher_ident: &str, timestamp: OffsetDateTime, urls: Vec<Url>) -> Self {
        Self {
            timestamp,
            publisher_ident: publisher_ident.into(),
            urls: urls.into_iter().map(String::from).collect(),
            errors: vec![],
        }
    }

    pub fn failure(publisher_ident: &str, timestamp: OffsetDateTime, error: PubError) -> Self {
        Self {
            timestamp,
            publisher_ident: publisher_ident.into(),
            urls: vec![],
            errors: vec![error],
        }
    }

    /// A result for a publisher that declined to run.
    pub fn skipped(publisher_ident: &str, timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            publisher_ident: publisher_ident.into(),
            urls: vec![],
            errors: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.urls.is_empty()
    }
}

/// Renders a queue snapshot into a syndication artifact and makes it available.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn format(&self) -> Format;

    fn ident(&self) -> &'static str {
        self.format().publisher_ident()
    }

    /// Whether this publisher should run for the queue at all.
    fn applies_to(&self, queue: &Queue) -> bool {
        ExportConfig::is_enabled(queue.export_config.as_ref(), self.format())
    }

    /// Publishes the snapshot, returning the URLs the artifact is available at.
    async fn publish(&self, snapshot: &Snapshot, timestamp: OffsetDateTime) -> Result<Vec<Url>>;
}
