use anyhow::{anyhow, Context, Result};
use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;
use url::Url;

use crate::model::{self, ExportConfig, PostContent, PostLifecycle, QueueProperties};

#[derive(FromRow, Debug, Clone)]
pub struct Queue {
    pub id: i64,
    pub username: String,
    pub ident: String,
    pub transport_ident: String,
    pub title: String,
    pub description: Option<String>,
    pub generator: Option<String>,
    pub copyright: Option<String>,
    pub language: Option<String>,
    pub image_src: Option<String>,
    pub is_authenticated: bool,
    pub status: String,
    pub export_config: Option<Json<ExportConfig>>,
    pub last_deployed: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
    pub last_updated: OffsetDateTime,
}

impl TryFrom<Queue> for model::Queue {
    type Error = anyhow::Error;

    fn try_from(row: Queue) -> Result<Self> {
        let status = row
            .status
            .parse()
            .with_context(|| anyhow!("queue {} has a malformed status", row.id))?;
        let image_src = row
            .image_src
            .as_deref()
            .map(Url::parse)
            .transpose()
            .with_context(|| anyhow!("queue {} has a malformed image URL", row.id))?;

        Ok(model::Queue {
            id: row.id,
            username: row.username,
            ident: row.ident,
            transport_ident: row.transport_ident,
            properties: QueueProperties {
                title: row.title,
                description: row.description,
                generator: row.generator,
                copyright: row.copyright,
                language: row.language,
                image_src,
                is_authenticated: row.is_authenticated,
            },
            status,
            export_config: row.export_config.map(|Json(cfg)| cfg),
            last_deployed: row.last_deployed,
            created: row.created,
            last_updated: row.last_updated,
        })
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct Post {
    pub id: i64,
    pub username: String,
    pub queue_id: i64,
    pub content: Json<PostContent>,
    pub pub_status: Option<String>,
    pub is_published: bool,
    pub is_archived: bool,
    pub import_timestamp: OffsetDateTime,
    pub publish_timestamp: Option<OffsetDateTime>,
    pub expiration_timestamp: Option<OffsetDateTime>,
    pub last_updated: OffsetDateTime,
}

impl TryFrom<Post> for model::Post {
    type Error = anyhow::Error;

    fn try_from(row: Post) -> Result<Self> {
        let status = row
            .pub_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .with_context(|| anyhow!("post {} has a malformed publication status", row.id))?;

        Ok(model::Post {
            id: row.id,
            username: row.username,
            queue_id: row.queue_id,
            content: row.content.0,
            import_timestamp: row.import_timestamp,
            expiration_timestamp: row.expiration_timestamp,
            last_updated: row.last_updated,
            lifecycle: PostLifecycle::restore(
                status,
                row.is_published,
                row.is_archived,
                row.publish_timestamp,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub title: String,
    pub transport_ident: String,
    pub last_deployed: Option<OffsetDateTime>,
    pub post_count: usize,
}
