pub mod entities;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use crate::model::{ExportConfig, Post, PostContent, PostPubStatus, Queue, QueueProperties, QueueStatus};

use self::entities::QueueInfo;

const QUEUE_COLUMNS: &str = "id, username, ident, transport_ident, title, description, generator, \
    copyright, language, image_src, is_authenticated, status, export_config, last_deployed, \
    created, last_updated";

const POST_COLUMNS: &str = "id, username, queue_id, content, pub_status, is_published, \
    is_archived, import_timestamp, publish_timestamp, expiration_timestamp, last_updated";

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // transactions read before they write; with several connections, two of them upgrading
        // their locks at once fail with SQLITE_BUSY instead of waiting
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Delete)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!("Using an SQLite database `{}`", db_path.display());
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    #[instrument(level = "TRACE", skip(self, props))]
    pub async fn insert_queue(
        &mut self,
        username: &str,
        ident: &str,
        transport_ident: &str,
        props: &QueueProperties,
        now: OffsetDateTime,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT
            INTO queues (
              username,
              ident,
              transport_ident,
              title,
              description,
              generator,
              copyright,
              language,
              image_src,
              is_authenticated,
              status,
              created,
              last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            RETURNING id",
        )
        .bind(username)
        .bind(ident)
        .bind(transport_ident)
        .bind(&props.title)
        .bind(&props.description)
        .bind(&props.generator)
        .bind(&props.copyright)
        .bind(&props.language)
        .bind(props.image_src.as_ref().map(|url| url.as_str()))
        .bind(props.is_authenticated)
        .bind(QueueStatus::Enabled.as_str())
        .bind(now)
        .fetch_one(self.0.as_mut())
        .await
        .context("could not insert a queue")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_queue(&mut self, username: &str, queue_id: i64) -> Result<Option<Queue>> {
        let row: Option<entities::Queue> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS}
            FROM queues
            WHERE username = ?1 AND id = ?2"
        ))
        .bind(username)
        .bind(queue_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the queue")?;

        row.map(Queue::try_from).transpose()
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_queue_by_ident(&mut self, username: &str, ident: &str) -> Result<Option<Queue>> {
        let row: Option<entities::Queue> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS}
            FROM queues
            WHERE username = ?1 AND ident = ?2"
        ))
        .bind(username)
        .bind(ident)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the queue")?;

        row.map(Queue::try_from).transpose()
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_queue_by_transport_ident(
        &mut self,
        transport_ident: &str,
    ) -> Result<Option<Queue>> {
        let row: Option<entities::Queue> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS}
            FROM queues
            WHERE transport_ident = ?1"
        ))
        .bind(transport_ident)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the queue")?;

        row.map(Queue::try_from).transpose()
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_queues(&mut self, username: &str) -> Result<Vec<Queue>> {
        let rows: Vec<entities::Queue> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS}
            FROM queues
            WHERE username = ?1
            ORDER BY id ASC"
        ))
        .bind(username)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the queue list")?;

        rows.into_iter().map(Queue::try_from).collect()
    }

    /// Lists the queues whose feeds can be read without credentials.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_public_queues(&mut self) -> Result<Vec<QueueInfo>> {
        let rows: Vec<(String, String, Option<OffsetDateTime>, i64)> = sqlx::query_as(
            "SELECT queues.title, queues.transport_ident, queues.last_deployed,
              COUNT(posts.id) AS post_count
            FROM queues
              LEFT JOIN posts ON (
                queues.id = posts.queue_id AND posts.is_published AND NOT posts.is_archived
              )
            WHERE NOT queues.is_authenticated AND queues.status = ?1
            GROUP BY queues.id
            ORDER BY queues.id ASC",
        )
        .bind(QueueStatus::Enabled.as_str())
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the public queue list")?;

        Ok(rows
            .into_iter()
            .map(|(title, transport_ident, last_deployed, post_count)| QueueInfo {
                title,
                transport_ident,
                last_deployed,
                post_count: post_count as usize,
            })
            .collect())
    }

    #[instrument(level = "TRACE", skip(self, props))]
    pub async fn update_queue_properties(
        &mut self,
        queue_id: i64,
        props: &QueueProperties,
        now: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queues SET
              title = ?1,
              description = ?2,
              generator = ?3,
              copyright = ?4,
              language = ?5,
              image_src = ?6,
              is_authenticated = ?7,
              last_updated = ?8
            WHERE id = ?9",
        )
        .bind(&props.title)
        .bind(&props.description)
        .bind(&props.generator)
        .bind(&props.copyright)
        .bind(&props.language)
        .bind(props.image_src.as_ref().map(|url| url.as_str()))
        .bind(props.is_authenticated)
        .bind(now)
        .bind(queue_id)
        .execute(self.0.as_mut())
        .await
        .context("could not update the queue properties")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn set_queue_status(
        &mut self,
        queue_id: i64,
        status: QueueStatus,
        now: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queues
            SET status = ?1, last_updated = ?2
            WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(queue_id)
        .execute(self.0.as_mut())
        .await
        .context("could not update the queue status")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self, cfg))]
    pub async fn set_export_config(
        &mut self,
        queue_id: i64,
        cfg: Option<&ExportConfig>,
        now: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queues
            SET export_config = ?1, last_updated = ?2
            WHERE id = ?3",
        )
        .bind(cfg.map(Json))
        .bind(now)
        .bind(queue_id)
        .execute(self.0.as_mut())
        .await
        .context("could not update the export config")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn set_last_deployed(&mut self, queue_id: i64, timestamp: OffsetDateTime) -> Result<()> {
        sqlx::query(
            "UPDATE queues
            SET last_deployed = ?1
            WHERE id = ?2",
        )
        .bind(timestamp)
        .bind(queue_id)
        .execute(self.0.as_mut())
        .await
        .context("could not record the deployment time")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_queue(&mut self, queue_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queues WHERE id = ?1")
            .bind(queue_id)
            .execute(self.0.as_mut())
            .await
            .context("could not delete the queue")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self, content))]
    pub async fn insert_post(
        &mut self,
        username: &str,
        queue_id: i64,
        content: &PostContent,
        expiration_timestamp: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT
            INTO posts (
              username,
              queue_id,
              content,
              expiration_timestamp,
              import_timestamp,
              last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING id",
        )
        .bind(username)
        .bind(queue_id)
        .bind(Json(content))
        .bind(expiration_timestamp)
        .bind(now)
        .fetch_one(self.0.as_mut())
        .await
        .context("could not insert a post")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_post(&mut self, username: &str, post_id: i64) -> Result<Option<Post>> {
        let row: Option<entities::Post> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS}
            FROM posts
            WHERE username = ?1 AND id = ?2"
        ))
        .bind(username)
        .bind(post_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the post")?;

        row.map(Post::try_from).transpose()
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_posts(&mut self, queue_id: i64) -> Result<Vec<Post>> {
        let rows: Vec<entities::Post> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS}
            FROM posts
            WHERE queue_id = ?1
            ORDER BY id ASC"
        ))
        .bind(queue_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the post list")?;

        rows.into_iter().map(Post::try_from).collect()
    }

    /// Returns the posts of a queue with a pending publish or unpublish action.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_pending_posts(&mut self, queue_id: i64) -> Result<Vec<Post>> {
        let rows: Vec<entities::Post> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS}
            FROM posts
            WHERE queue_id = ?1 AND pub_status IN (?2, ?3)
            ORDER BY id ASC"
        ))
        .bind(queue_id)
        .bind(PostPubStatus::PubPending.as_str())
        .bind(PostPubStatus::DepubPending.as_str())
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve pending posts")?;

        rows.into_iter().map(Post::try_from).collect()
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_published_posts(&mut self, queue_id: i64) -> Result<Vec<Post>> {
        let rows: Vec<entities::Post> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS}
            FROM posts
            WHERE queue_id = ?1 AND is_published AND NOT is_archived
            ORDER BY publish_timestamp DESC, id DESC"
        ))
        .bind(queue_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve published posts")?;

        rows.into_iter().map(Post::try_from).collect()
    }

    /// Writes the lifecycle of a post if its stored status still equals `expected`.
    ///
    /// Returns `false` when another writer changed the status in the meantime.
    #[instrument(level = "TRACE", skip(self, post), fields(post_id = post.id))]
    pub async fn update_post_lifecycle(
        &mut self,
        post: &Post,
        expected: Option<PostPubStatus>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let lifecycle = &post.lifecycle;
        let result = sqlx::query(
            "UPDATE posts SET
              pub_status = ?1,
              is_published = ?2,
              is_archived = ?3,
              publish_timestamp = ?4,
              last_updated = ?5
            WHERE id = ?6 AND pub_status IS ?7",
        )
        .bind(lifecycle.status().map(|status| status.as_str()))
        .bind(lifecycle.is_published())
        .bind(lifecycle.is_archived())
        .bind(lifecycle.publish_timestamp())
        .bind(now)
        .bind(post.id)
        .bind(expected.map(|status| status.as_str()))
        .execute(self.0.as_mut())
        .await
        .context("could not update the post status")?;

        let updated = result.rows_affected() == 1;

        if !updated {
            debug!("Post status was changed concurrently");
        }

        Ok(updated)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn set_post_expiration(
        &mut self,
        post_id: i64,
        expiration_timestamp: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE posts
            SET expiration_timestamp = ?1, last_updated = ?2
            WHERE id = ?3",
        )
        .bind(expiration_timestamp)
        .bind(now)
        .bind(post_id)
        .execute(self.0.as_mut())
        .await
        .context("could not update the post expiration")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_post(&mut self, post_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM posts WHERE id = ?1")
            .bind(post_id)
            .execute(self.0.as_mut())
            .await
            .context("could not delete the post")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self, password_hash))]
    pub async fn upsert_credential(
        &mut self,
        queue_id: i64,
        basic_username: &str,
        password_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT
            INTO queue_credentials (queue_id, basic_username, password_hash)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (queue_id, basic_username) DO UPDATE SET
              password_hash = excluded.password_hash",
        )
        .bind(queue_id)
        .bind(basic_username)
        .bind(password_hash)
        .execute(self.0.as_mut())
        .await
        .context("could not store the credential")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_credential(&mut self, queue_id: i64, basic_username: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_credentials
            WHERE queue_id = ?1 AND basic_username = ?2",
        )
        .bind(queue_id)
        .bind(basic_username)
        .execute(self.0.as_mut())
        .await
        .context("could not delete the credential")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_password_hash(
        &mut self,
        queue_id: i64,
        basic_username: &str,
    ) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT password_hash
            FROM queue_credentials
            WHERE queue_id = ?1 AND basic_username = ?2",
        )
        .bind(queue_id)
        .bind(basic_username)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the credential")
    }
}
