use anyhow::{anyhow, Context as _};
use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use base64::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::deploy::DeployResult;
use crate::error::{Error, Result};
use crate::model::{
    ExportConfig, Format, FormatConfig, PostContent, QueueProperties, QueueStatus, UpdateMode,
};
use crate::service::FeedAccess;
use crate::state::State as AppState;
use crate::template::Template;

use super::responses::{Deployed, FeedUnauthorized, MissingCaller, PostView, QueueView};

/// The user on whose behalf a request is made, as established by the fronting proxy.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = MissingCaller;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-forwarded-user")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|username| !username.is_empty())
            .map(|username| Caller(username.to_owned()))
            .ok_or(MissingCaller)
    }
}

/// Decodes a JSON body. A malformed body is a validation error, the same as a bad literal in it.
fn parse_body<T: DeserializeOwned>(body: serde_json::Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::validation(format!("invalid request body: {e}")))
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64_STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some((username.into(), password.into()))
}

pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    static DATE_FORMAT: &[BorrowedFormatItem<'_>] = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second] \
            [offset_hour sign:mandatory]:[offset_minute]"
    );

    #[derive(Serialize, Debug, Clone)]
    struct FeedLink {
        format: &'static str,
        url: String,
    }

    #[derive(Serialize, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    struct QueueDescription {
        title: String,
        last_deployed: String,
        post_count: usize,
        feeds: Vec<FeedLink>,
    }

    #[derive(Serialize, Debug, Clone)]
    struct Context {
        queues: Vec<QueueDescription>,
    }

    let artifacts = state.service.artifacts();
    let mut queues = vec![];

    for info in state.service.get_public_queues().await? {
        let last_deployed = match info.last_deployed {
            Some(last_deployed) => last_deployed
                .format(DATE_FORMAT)
                .with_context(|| anyhow!("could not format the date {last_deployed}"))?,

            None => "never".into(),
        };

        let feeds = state
            .cfg
            .publishers
            .iter()
            .map(|format| -> anyhow::Result<FeedLink> {
                let url = artifacts.url_for(&info.transport_ident, format.file_name())?;

                Ok(FeedLink {
                    format: format.as_str(),
                    url: url.into(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        queues.push(QueueDescription {
            title: info.title,
            last_deployed,
            post_count: info.post_count,
            feeds,
        });
    }

    let html = state
        .template
        .render(Template::Index.as_str(), &Context { queues })
        .context("could not render the HTML template")?;

    Ok(Html(html))
}

pub async fn get_feed(
    State(state): State<AppState>,
    Path((transport_ident, file_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let Some(format) = Format::from_file_name(&file_name) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let credentials = basic_credentials(&headers);
    let credentials = credentials
        .as_ref()
        .map(|(username, password)| (username.as_str(), password.as_str()));

    let queue = match state.service.authorize_feed(&transport_ident, credentials).await? {
        FeedAccess::Granted(queue) => queue,
        FeedAccess::Denied => return Ok(FeedUnauthorized.into_response()),
        FeedAccess::NotFound => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let body = state
        .service
        .artifacts()
        .get(&queue.transport_ident, format.file_name())
        .await?;

    Ok(match body {
        Some(body) => ([(header::CONTENT_TYPE, format.content_type())], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewQueue {
    ident: String,
    properties: QueueProperties,
}

pub async fn create_queue(
    State(state): State<AppState>,
    Caller(username): Caller,
    Json(req): Json<NewQueue>,
) -> Result<(StatusCode, Json<QueueView>)> {
    let queue = state
        .service
        .create_queue(&username, &req.ident, req.properties)
        .await?;

    Ok((StatusCode::CREATED, Json(queue.into())))
}

pub async fn list_queues(
    State(state): State<AppState>,
    Caller(username): Caller,
) -> Result<Json<Vec<QueueView>>> {
    let queues = state.service.get_queues(&username).await?;

    Ok(Json(queues.into_iter().map(Into::into).collect()))
}

pub async fn get_queue(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
) -> Result<Json<QueueView>> {
    Ok(Json(state.service.get_queue(&username, queue_id).await?.into()))
}

pub async fn update_queue(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
    Json(props): Json<QueueProperties>,
) -> Result<Json<Deployed<QueueView>>> {
    let (queue, result) = state
        .service
        .update_queue_properties(&username, queue_id, props)
        .await?;

    Ok(Json(Deployed::new(queue, result)))
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueueStatusRequest {
    status: String,
}

pub async fn update_queue_status(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Deployed<QueueView>>> {
    let req: QueueStatusRequest = parse_body(body)?;
    let status: QueueStatus = req.status.parse()?;
    let (queue, result) = state
        .service
        .update_queue_status(&username, queue_id, status)
        .await?;

    Ok(Json(Deployed::new(queue, result)))
}

pub async fn delete_queue(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
) -> Result<Json<DeployResult>> {
    Ok(Json(state.service.delete_queue(&username, queue_id).await?))
}

pub async fn deploy_queue(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
) -> Result<Json<DeployResult>> {
    Ok(Json(state.service.deploy_queue(&username, queue_id).await?))
}

async fn update_export_config(
    state: AppState,
    username: String,
    queue_id: i64,
    body: serde_json::Value,
    mode: UpdateMode,
) -> Result<Json<DeployResult>> {
    let cfg = ExportConfig::parse(body)?;

    Ok(Json(
        state
            .service
            .update_export_config(&username, queue_id, cfg, mode)
            .await?,
    ))
}

pub async fn put_export_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<DeployResult>> {
    update_export_config(state, username, queue_id, body, UpdateMode::Replace).await
}

pub async fn patch_export_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<DeployResult>> {
    update_export_config(state, username, queue_id, body, UpdateMode::Merge).await
}

pub async fn clear_export_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
) -> Result<Json<DeployResult>> {
    Ok(Json(
        state
            .service
            .clear_export_config(&username, queue_id, None)
            .await?,
    ))
}

async fn update_format_config(
    state: AppState,
    username: String,
    queue_id: i64,
    format: &str,
    body: serde_json::Value,
    mode: UpdateMode,
) -> Result<Json<DeployResult>> {
    let cfg = FormatConfig::parse(format.parse::<Format>()?, body)?;

    Ok(Json(
        state
            .service
            .update_format_config(&username, queue_id, cfg, mode)
            .await?,
    ))
}

pub async fn put_format_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path((queue_id, format)): Path<(i64, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<DeployResult>> {
    update_format_config(state, username, queue_id, &format, body, UpdateMode::Replace).await
}

pub async fn patch_format_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path((queue_id, format)): Path<(i64, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<DeployResult>> {
    update_format_config(state, username, queue_id, &format, body, UpdateMode::Merge).await
}

pub async fn clear_format_config(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path((queue_id, format)): Path<(i64, String)>,
) -> Result<Json<DeployResult>> {
    let format: Format = format.parse()?;

    Ok(Json(
        state
            .service
            .clear_export_config(&username, queue_id, Some(format))
            .await?,
    ))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CredentialRequest {
    password: String,
}

pub async fn put_credential(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path((queue_id, basic_username)): Path<(i64, String)>,
    Json(req): Json<CredentialRequest>,
) -> Result<StatusCode> {
    state
        .service
        .put_credential(&username, queue_id, &basic_username, &req.password)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_credential(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path((queue_id, basic_username)): Path<(i64, String)>,
) -> Result<StatusCode> {
    let deleted = state
        .service
        .delete_credential(&username, queue_id, &basic_username)
        .await?;

    Ok(if deleted {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewPost {
    content: PostContent,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expiration_timestamp: Option<OffsetDateTime>,
}

pub async fn create_post(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
    Json(req): Json<NewPost>,
) -> Result<(StatusCode, Json<PostView>)> {
    let post = state
        .service
        .create_post(&username, queue_id, req.content, req.expiration_timestamp)
        .await?;

    Ok((StatusCode::CREATED, Json(post.into())))
}

pub async fn list_posts(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(queue_id): Path<i64>,
) -> Result<Json<Vec<PostView>>> {
    let posts = state.service.get_posts(&username, queue_id).await?;

    Ok(Json(posts.into_iter().map(Into::into).collect()))
}

pub async fn get_post(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(post_id): Path<i64>,
) -> Result<Json<PostView>> {
    Ok(Json(state.service.get_post(&username, post_id).await?.into()))
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct PostStatusRequest {
    #[serde(default)]
    status: Option<String>,
}

pub async fn update_post_status(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(post_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Deployed<PostView>>> {
    let req: PostStatusRequest = parse_body(body)?;
    let (post, result) = state
        .service
        .update_post_status(&username, post_id, req.status.as_deref())
        .await?;

    Ok(Json(Deployed::new(post, result)))
}

pub async fn archive_post(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(post_id): Path<i64>,
) -> Result<Json<Deployed<PostView>>> {
    let (post, result) = state.service.archive_post(&username, post_id).await?;

    Ok(Json(Deployed::new(post, result)))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpirationRequest {
    #[serde(default, with = "time::serde::rfc3339::option")]
    expiration_timestamp: Option<OffsetDateTime>,
}

pub async fn update_post_expiration(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(post_id): Path<i64>,
    Json(req): Json<ExpirationRequest>,
) -> Result<Json<Deployed<PostView>>> {
    let (post, result) = state
        .service
        .set_post_expiration(&username, post_id, req.expiration_timestamp)
        .await?;

    Ok(Json(Deployed::new(post, result)))
}

pub async fn delete_post(
    State(state): State<AppState>,
    Caller(username): Caller,
    Path(post_id): Path<i64>,
) -> Result<Json<DeployResult>> {
    Ok(Json(state.service.delete_post(&username, post_id).await?))
}
