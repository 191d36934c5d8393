use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::deploy::DeployResult;
use crate::error::Error;
use crate::model::{ExportConfig, Post, PostContent, Queue, QueueProperties};

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Self::QueueNotFound(_) | Self::PostNotFound(_) => {
                error_body(StatusCode::NOT_FOUND, self.to_string())
            }

            Self::Validation(message) => error_body(StatusCode::BAD_REQUEST, message),

            Self::Internal(e) => {
                tracing::error!("Error occured while processing an HTTP request: {e:#}");

                error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

/// The request did not say who is making it.
#[derive(Debug, Clone, Copy)]
pub struct MissingCaller;

impl IntoResponse for MissingCaller {
    fn into_response(self) -> Response {
        error_body(StatusCode::UNAUTHORIZED, "the X-Forwarded-User header is required")
    }
}

/// A feed of an authenticated queue was requested without valid credentials.
#[derive(Debug, Clone, Copy)]
pub struct FeedUnauthorized;

impl IntoResponse for FeedUnauthorized {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="feedqueue", charset="UTF-8""#)],
            "This feed requires authentication",
        )
            .into_response()
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub id: i64,
    pub ident: String,
    pub transport_ident: String,
    #[serde(flatten)]
    pub properties: QueueProperties,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_config: Option<ExportConfig>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_deployed: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl From<Queue> for QueueView {
    fn from(queue: Queue) -> Self {
        Self {
            id: queue.id,
            ident: queue.ident,
            transport_ident: queue.transport_ident,
            properties: queue.properties,
            status: queue.status.as_str(),
            export_config: queue.export_config,
            last_deployed: queue.last_deployed,
            created: queue.created,
            last_updated: queue.last_updated,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub id: i64,
    pub queue_id: i64,
    pub content: PostContent,
    pub pub_status: Option<&'static str>,
    pub is_published: bool,
    pub is_archived: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub import_timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub publish_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiration_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl From<Post> for PostView {
    fn from(post: Post) -> Self {
        Self {
            id: post.id,
            queue_id: post.queue_id,
            pub_status: post.lifecycle.status().map(|status| status.as_str()),
            is_published: post.lifecycle.is_published(),
            is_archived: post.lifecycle.is_archived(),
            publish_timestamp: post.lifecycle.publish_timestamp(),
            content: post.content,
            import_timestamp: post.import_timestamp,
            expiration_timestamp: post.expiration_timestamp,
            last_updated: post.last_updated,
        }
    }
}

/// An entity after a change, with the deployment pass the change triggered.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Deployed<T> {
    #[serde(flatten)]
    pub entity: T,
    pub deploy_result: DeployResult,
}

impl<T> Deployed<T> {
    pub fn new(entity: impl Into<T>, deploy_result: DeployResult) -> Self {
        Self {
            entity: entity.into(),
            deploy_result,
        }
    }
}
