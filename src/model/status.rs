use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Pending action recorded on a post. `None` in a `PostLifecycle` means no action is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostPubStatus {
    PubPending,
    DepubPending,
    Archived,
}

impl PostPubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PubPending => "PUB_PENDING",
            Self::DepubPending => "DEPUB_PENDING",
            Self::Archived => "ARCHIVED",
        }
    }

    /// Parses a status literal as supplied by a caller in a status update.
    ///
    /// Only the two pending actions are accepted here; archiving has its own operation.
    pub fn parse_requested(s: &str) -> Result<Self, UnknownStatus> {
        match s.parse()? {
            Self::Archived => Err(UnknownStatus(s.into())),
            status => Ok(status),
        }
    }
}

impl Display for PostPubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for PostPubStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PUB_PENDING" => Self::PubPending,
            "DEPUB_PENDING" => Self::DepubPending,
            "ARCHIVED" => Self::Archived,
            _ => return Err(UnknownStatus(s.into())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    #[default]
    Enabled,
    Disabled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        }
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ENABLED" => Self::Enabled,
            "DISABLED" => Self::Disabled,
            _ => return Err(UnknownStatus(s.into())),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("the post is archived")]
    Archived,
}

/// What a deployment pass did to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Published,
    Depublished,
    Unchanged,
}

/// Publication state of a post.
///
/// The fields can only be changed through the transition methods, which keep the pending status
/// and the published flag consistent with each other.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostLifecycle {
    status: Option<PostPubStatus>,
    published: bool,
    archived: bool,
    publish_timestamp: Option<OffsetDateTime>,
}

impl PostLifecycle {
    /// Reassembles a lifecycle from stored columns.
    pub fn restore(
        status: Option<PostPubStatus>,
        published: bool,
        archived: bool,
        publish_timestamp: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            status,
            published,
            archived: archived || status == Some(PostPubStatus::Archived),
            publish_timestamp,
        }
    }

    pub fn status(&self) -> Option<PostPubStatus> {
        self.status
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn publish_timestamp(&self) -> Option<OffsetDateTime> {
        self.publish_timestamp
    }

    /// Whether the post takes part in rendered artifacts.
    pub fn is_live(&self) -> bool {
        self.published && !self.archived
    }

    /// Sets or clears the pending action. Returns `false` if nothing changed.
    pub fn request(&mut self, action: Option<PostPubStatus>) -> Result<bool, TransitionError> {
        if self.archived {
            return Err(TransitionError::Archived);
        }

        if action == Some(PostPubStatus::Archived) {
            return self.archive().map(|()| true);
        }

        if self.status == action {
            return Ok(false);
        }

        self.status = action;

        Ok(true)
    }

    /// Marks the post for removal ahead of a delete. Archived posts are left alone since they are
    /// not part of any artifact already.
    pub fn force_depublish(&mut self) -> bool {
        if self.archived {
            return false;
        }

        self.request(Some(PostPubStatus::DepubPending))
            .unwrap_or(false)
    }

    pub fn archive(&mut self) -> Result<(), TransitionError> {
        if self.archived {
            return Err(TransitionError::Archived);
        }

        self.status = Some(PostPubStatus::Archived);
        self.archived = true;

        Ok(())
    }

    /// Consumes the pending action during a deployment pass.
    pub fn apply_deployment(&mut self, now: OffsetDateTime) -> Processed {
        match self.status {
            Some(PostPubStatus::PubPending) => {
                self.published = true;
                self.publish_timestamp = Some(now);
                self.status = None;

                Processed::Published
            }

            Some(PostPubStatus::DepubPending) => {
                self.published = false;
                self.status = None;

                Processed::Depublished
            }

            Some(PostPubStatus::Archived) | None => Processed::Unchanged,
        }
    }
}
