use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use time::OffsetDateTime;
use tokio::task;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::deploy::{DeployResult, Deployer};
use crate::error::{Error, Result};
use crate::model::{
    self, ExportConfig, Format, FormatConfig, Post, PostContent, PostPubStatus, Queue,
    QueueProperties, QueueStatus, UpdateMode,
};
use crate::publish::ArtifactStore;
use crate::storage::entities::QueueInfo;
use crate::storage::{Storage, Tx};

const MAX_IDENT_LEN: usize = 64;

fn validate_ident(ident: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';

    if ident.is_empty() || ident.len() > MAX_IDENT_LEN || !ident.chars().all(valid_char) {
        return Err(Error::validation(format!(
            "queue idents must be 1 to {MAX_IDENT_LEN} characters of [A-Za-z0-9_-]"
        )));
    }

    Ok(())
}

fn validate_properties(props: &QueueProperties) -> Result<()> {
    if props.title.trim().is_empty() {
        return Err(Error::validation("the queue title must not be blank"));
    }

    Ok(())
}

/// Hashes a feed password with argon2 and a random salt, in PHC string format.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("could not hash the password: {e}").into())
}

fn verify_password(hash: &str, password: &str) -> bool {
    let hash = match PasswordHash::new(hash) {
        Ok(hash) => hash,

        Err(e) => {
            error!("Could not parse a stored password hash: {e}");

            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .is_ok()
}

/// Whether a feed may be served to a reader.
#[derive(Debug)]
pub enum FeedAccess {
    Granted(Queue),
    Denied,
    NotFound,
}

/// Queue and post operations. Every operation that affects published state ends with a
/// deployment pass and returns its result.
pub struct Service {
    storage: Arc<Storage>,
    deployer: Deployer,
    artifacts: Arc<ArtifactStore>,
}

impl Service {
    pub fn new(storage: Arc<Storage>, deployer: Deployer, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            storage,
            deployer,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    async fn owned_queue(tx: &mut Tx, username: &str, queue_id: i64) -> Result<Queue> {
        tx.get_queue(username, queue_id)
            .await?
            .ok_or(Error::QueueNotFound(queue_id))
    }

    async fn owned_post(tx: &mut Tx, username: &str, post_id: i64) -> Result<Post> {
        tx.get_post(username, post_id)
            .await?
            .ok_or(Error::PostNotFound(post_id))
    }

    /// Writes a changed post lifecycle, failing if the stored status moved under us.
    async fn store_lifecycle(
        tx: &mut Tx,
        post: &Post,
        expected: Option<PostPubStatus>,
        now: OffsetDateTime,
    ) -> Result<()> {
        if !tx.update_post_lifecycle(post, expected, now).await? {
            return Err(anyhow!("the status of post {} was changed concurrently", post.id).into());
        }

        Ok(())
    }

    #[instrument(level = "DEBUG", skip(self, props))]
    pub async fn create_queue(
        &self,
        username: &str,
        ident: &str,
        props: QueueProperties,
    ) -> Result<Queue> {
        validate_ident(ident)?;
        validate_properties(&props)?;

        let mut tx = self.storage.begin().await?;

        if tx.get_queue_by_ident(username, ident).await?.is_some() {
            return Err(Error::validation(format!("the queue ident `{ident}` is already in use")));
        }

        let transport_ident = Uuid::new_v4().to_string();
        let queue_id = tx
            .insert_queue(username, ident, &transport_ident, &props, model::now())
            .await?;
        let queue = Self::owned_queue(&mut tx, username, queue_id).await?;
        tx.commit().await?;

        info!(queue_id, %transport_ident, "Created a queue");

        Ok(queue)
    }

    pub async fn get_queue(&self, username: &str, queue_id: i64) -> Result<Queue> {
        let mut tx = self.storage.begin().await?;
        let queue = Self::owned_queue(&mut tx, username, queue_id).await?;
        tx.commit().await?;

        Ok(queue)
    }

    pub async fn get_queues(&self, username: &str) -> Result<Vec<Queue>> {
        let mut tx = self.storage.begin().await?;
        let queues = tx.get_queues(username).await?;
        tx.commit().await?;

        Ok(queues)
    }

    pub async fn get_public_queues(&self) -> Result<Vec<QueueInfo>> {
        let mut tx = self.storage.begin().await?;
        let queues = tx.get_public_queues().await?;
        tx.commit().await?;

        Ok(queues)
    }

    #[instrument(level = "DEBUG", skip(self, props))]
    pub async fn update_queue_properties(
        &self,
        username: &str,
        queue_id: i64,
        props: QueueProperties,
    ) -> Result<(Queue, DeployResult)> {
        validate_properties(&props)?;

        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        tx.update_queue_properties(queue_id, &props, model::now())
            .await?;
        tx.commit().await?;

        let result = self.deployer.deploy(username, queue_id).await?;

        Ok((self.get_queue(username, queue_id).await?, result))
    }

    /// Enables or disables a queue. Enabling deploys it. Disabling returns an empty result and
    /// stops serving the queue's feeds until it is enabled again.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn update_queue_status(
        &self,
        username: &str,
        queue_id: i64,
        status: QueueStatus,
    ) -> Result<(Queue, DeployResult)> {
        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        tx.set_queue_status(queue_id, status, model::now()).await?;
        tx.commit().await?;

        let result = match status {
            QueueStatus::Enabled => self.deployer.deploy(username, queue_id).await?,
            QueueStatus::Disabled => DeployResult::new(),
        };

        Ok((self.get_queue(username, queue_id).await?, result))
    }

    async fn store_export_config(
        &self,
        username: &str,
        queue_id: i64,
        resolve: impl FnOnce(Option<ExportConfig>) -> Option<ExportConfig>,
    ) -> Result<DeployResult> {
        let mut tx = self.storage.begin().await?;
        let queue = Self::owned_queue(&mut tx, username, queue_id).await?;
        let cfg = resolve(queue.export_config);

        if let Some(cfg) = &cfg {
            // a merge of two valid configs is not necessarily valid
            cfg.validate()?;
        }

        tx.set_export_config(queue_id, cfg.as_ref(), model::now())
            .await?;
        tx.commit().await?;

        self.deployer.deploy(username, queue_id).await
    }

    /// Applies a PUT or PATCH of a single format's config.
    #[instrument(level = "DEBUG", skip(self, cfg))]
    pub async fn update_format_config(
        &self,
        username: &str,
        queue_id: i64,
        cfg: FormatConfig,
        mode: UpdateMode,
    ) -> Result<DeployResult> {
        cfg.validate()?;

        self.store_export_config(username, queue_id, |stored| {
            Some(ExportConfig::resolve(stored.as_ref(), cfg, mode))
        })
        .await
    }

    /// Applies a PUT or PATCH of the whole export config.
    #[instrument(level = "DEBUG", skip(self, cfg))]
    pub async fn update_export_config(
        &self,
        username: &str,
        queue_id: i64,
        cfg: ExportConfig,
        mode: UpdateMode,
    ) -> Result<DeployResult> {
        self.store_export_config(username, queue_id, |stored| {
            let resolved = ExportConfig::resolve_all(stored.as_ref(), cfg, mode);

            (!resolved.is_empty()).then_some(resolved)
        })
        .await
    }

    /// Removes one format's config, or the whole export config.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn clear_export_config(
        &self,
        username: &str,
        queue_id: i64,
        format: Option<Format>,
    ) -> Result<DeployResult> {
        self.store_export_config(username, queue_id, |stored| {
            ExportConfig::clear(stored, format)
        })
        .await
    }

    pub async fn deploy_queue(&self, username: &str, queue_id: i64) -> Result<DeployResult> {
        self.deployer.deploy(username, queue_id).await
    }

    /// Unpublishes every post of the queue, redeploys, then deletes the queue with its posts and
    /// artifacts.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn delete_queue(&self, username: &str, queue_id: i64) -> Result<DeployResult> {
        let now = model::now();
        let mut tx = self.storage.begin().await?;
        let queue = Self::owned_queue(&mut tx, username, queue_id).await?;

        for mut post in tx.get_posts(queue_id).await? {
            let expected = post.lifecycle.status();

            if post.lifecycle.force_depublish() {
                Self::store_lifecycle(&mut tx, &post, expected, now).await?;
            }
        }

        tx.commit().await?;

        let result = self.deployer.deploy(username, queue_id).await?;

        let mut tx = self.storage.begin().await?;
        tx.delete_queue(queue_id).await?;
        tx.commit().await?;
        self.deployer.forget_queue(queue_id);
        self.artifacts.remove(&queue.transport_ident).await?;

        info!(queue_id, "Deleted a queue");

        Ok(result)
    }

    #[instrument(level = "DEBUG", skip(self, content))]
    pub async fn create_post(
        &self,
        username: &str,
        queue_id: i64,
        content: PostContent,
        expiration_timestamp: Option<OffsetDateTime>,
    ) -> Result<Post> {
        if content.title.trim().is_empty() {
            return Err(Error::validation("the post title must not be blank"));
        }

        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        let post_id = tx
            .insert_post(username, queue_id, &content, expiration_timestamp, model::now())
            .await?;
        let post = Self::owned_post(&mut tx, username, post_id).await?;
        tx.commit().await?;

        Ok(post)
    }

    pub async fn get_post(&self, username: &str, post_id: i64) -> Result<Post> {
        let mut tx = self.storage.begin().await?;
        let post = Self::owned_post(&mut tx, username, post_id).await?;
        tx.commit().await?;

        Ok(post)
    }

    pub async fn get_posts(&self, username: &str, queue_id: i64) -> Result<Vec<Post>> {
        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        let posts = tx.get_posts(queue_id).await?;
        tx.commit().await?;

        Ok(posts)
    }

    /// Sets (`PUB_PENDING`, `DEPUB_PENDING`) or clears (`None`) the pending action of a post and
    /// deploys its queue.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn update_post_status(
        &self,
        username: &str,
        post_id: i64,
        status: Option<&str>,
    ) -> Result<(Post, DeployResult)> {
        let status = status.map(PostPubStatus::parse_requested).transpose()?;

        self.change_post(username, post_id, |post| {
            post.lifecycle.request(status).map_err(Error::from)
        })
        .await
    }

    /// Archives a post, taking it out of every future deployment.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn archive_post(&self, username: &str, post_id: i64) -> Result<(Post, DeployResult)> {
        self.change_post(username, post_id, |post| {
            post.lifecycle.archive()?;

            Ok(true)
        })
        .await
    }

    async fn change_post(
        &self,
        username: &str,
        post_id: i64,
        change: impl FnOnce(&mut Post) -> Result<bool>,
    ) -> Result<(Post, DeployResult)> {
        let now = model::now();
        let mut tx = self.storage.begin().await?;
        let mut post = Self::owned_post(&mut tx, username, post_id).await?;
        let expected = post.lifecycle.status();

        if change(&mut post)? {
            Self::store_lifecycle(&mut tx, &post, expected, now).await?;
        }

        tx.commit().await?;

        let result = self.deployer.deploy(username, post.queue_id).await?;

        Ok((self.get_post(username, post_id).await?, result))
    }

    #[instrument(level = "DEBUG", skip(self))]
    pub async fn set_post_expiration(
        &self,
        username: &str,
        post_id: i64,
        expiration_timestamp: Option<OffsetDateTime>,
    ) -> Result<(Post, DeployResult)> {
        let mut tx = self.storage.begin().await?;
        let post = Self::owned_post(&mut tx, username, post_id).await?;
        tx.set_post_expiration(post_id, expiration_timestamp, model::now())
            .await?;
        tx.commit().await?;

        let result = self.deployer.deploy(username, post.queue_id).await?;

        Ok((self.get_post(username, post_id).await?, result))
    }

    /// Unpublishes a post through a deployment pass, then deletes it.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn delete_post(&self, username: &str, post_id: i64) -> Result<DeployResult> {
        let mut tx = self.storage.begin().await?;
        let mut post = Self::owned_post(&mut tx, username, post_id).await?;
        let expected = post.lifecycle.status();

        if post.lifecycle.force_depublish() {
            Self::store_lifecycle(&mut tx, &post, expected, model::now()).await?;
        }

        tx.commit().await?;

        let result = self.deployer.deploy(username, post.queue_id).await?;

        let mut tx = self.storage.begin().await?;
        tx.delete_post(post_id).await?;
        tx.commit().await?;

        info!(post_id, "Deleted a post");

        Ok(result)
    }

    #[instrument(level = "DEBUG", skip(self, password))]
    pub async fn put_credential(
        &self,
        username: &str,
        queue_id: i64,
        basic_username: &str,
        password: &str,
    ) -> Result<()> {
        if basic_username.is_empty() || basic_username.contains(':') {
            return Err(Error::validation("invalid basic auth username"));
        }

        let password = password.to_owned();
        let hash = task::spawn_blocking(move || hash_password(&password))
            .await
            .context("the password hashing task failed")??;

        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        tx.upsert_credential(queue_id, basic_username, &hash)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Returns `false` if there was no such credential.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn delete_credential(
        &self,
        username: &str,
        queue_id: i64,
        basic_username: &str,
    ) -> Result<bool> {
        let mut tx = self.storage.begin().await?;
        Self::owned_queue(&mut tx, username, queue_id).await?;
        let deleted = tx.delete_credential(queue_id, basic_username).await?;
        tx.commit().await?;

        Ok(deleted)
    }

    /// Decides whether a reader may fetch the feed of a queue.
    ///
    /// Artifacts of a disabled queue are not redeployed, so they may be stale and are not served.
    pub async fn authorize_feed(
        &self,
        transport_ident: &str,
        credentials: Option<(&str, &str)>,
    ) -> Result<FeedAccess> {
        let mut tx = self.storage.begin().await?;
        let queue = match tx.get_queue_by_transport_ident(transport_ident).await? {
            Some(queue) if queue.status == QueueStatus::Enabled => queue,
            _ => return Ok(FeedAccess::NotFound),
        };

        if !queue.properties.is_authenticated {
            return Ok(FeedAccess::Granted(queue));
        }

        let Some((basic_username, password)) = credentials else {
            return Ok(FeedAccess::Denied);
        };

        let Some(hash) = tx.get_password_hash(queue.id, basic_username).await? else {
            return Ok(FeedAccess::Denied);
        };
        tx.commit().await?;

        let password = password.to_owned();
        let verified = task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .context("the password verification task failed")?;

        Ok(if verified {
            FeedAccess::Granted(queue)
        } else {
            FeedAccess::Denied
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::model::export::RssConfig;
    use crate::publish::{AtomPublisher, Publisher, RssPublisher};
    use crate::test_util::Env;

    pub(crate) fn service(env: &Env) -> Service {
        let artifacts = Arc::new(ArtifactStore::new(
            env.dir.path().join("feeds"),
            url::Url::parse("https://feeds.example.com/").unwrap(),
        ));
        let publishers: Vec<Arc<dyn Publisher>> = vec![
            Arc::new(RssPublisher::new(artifacts.clone(), "feedqueue-test")),
            Arc::new(AtomPublisher::new(artifacts.clone(), "feedqueue-test")),
        ];
        let deployer = Deployer::new(env.storage.clone(), publishers, Duration::from_secs(10));

        Service::new(env.storage.clone(), deployer, artifacts)
    }

    fn props(title: &str) -> QueueProperties {
        QueueProperties {
            title: title.into(),
            ..Default::default()
        }
    }

    fn content(title: &str) -> PostContent {
        PostContent {
            title: title.into(),
            ..Default::default()
        }
    }

    async fn artifact(svc: &Service, queue: &Queue, format: Format) -> Option<String> {
        svc.artifacts()
            .get(&queue.transport_ident, format.file_name())
            .await
            .unwrap()
            .map(|body| String::from_utf8(body).unwrap())
    }

    #[tokio::test]
    async fn publishing_a_post_end_to_end() {
        let env = Env::new().await;
        let svc = service(&env);
        let q1 = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let p1 = svc.create_post("alice", q1.id, content("P1"), None).await.unwrap();

        let (p1, result) = svc
            .update_post_status("alice", p1.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        assert_eq!(
            result.keys().map(String::as_str).collect::<Vec<_>>(),
            ["ATOM_10", "RSS_20"]
        );

        for r in result.values() {
            assert!(!r.urls.is_empty());
            assert!(r.errors.is_empty());
        }

        assert!(p1.lifecycle.is_published());
        assert_eq!(p1.lifecycle.status(), None);

        let q1 = svc.get_queue("alice", q1.id).await.unwrap();
        assert_eq!(q1.last_deployed, Some(result["RSS_20"].timestamp));

        assert!(artifact(&svc, &q1, Format::Rss).await.unwrap().contains("<title>P1</title>"));
        assert!(artifact(&svc, &q1, Format::Atom).await.unwrap().contains("P1"));
        assert_eq!(
            result["RSS_20"].urls,
            vec![format!("https://feeds.example.com/feeds/{}/rss.xml", q1.transport_ident)]
        );
    }

    #[tokio::test]
    async fn redeploying_yields_the_same_urls() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        let (_, first) = svc
            .update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        let second = svc.deploy_queue("alice", queue.id).await.unwrap();

        for (ident, result) in &first {
            assert_eq!(second[ident].urls, result.urls);
        }

        assert!(svc.get_post("alice", post.id).await.unwrap().lifecycle.is_published());
    }

    #[tokio::test]
    async fn depublishing_a_post() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        svc.update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        let (post, _) = svc
            .update_post_status("alice", post.id, Some("DEPUB_PENDING"))
            .await
            .unwrap();

        assert!(!post.lifecycle.is_published());
        assert_eq!(post.lifecycle.status(), None);
        assert!(!artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<title>P1</title>"));
    }

    #[tokio::test]
    async fn bad_status_literals_are_rejected() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();

        for literal in ["PUBLISHED", "ARCHIVED", "pub_pending", ""] {
            let err = svc
                .update_post_status("alice", post.id, Some(literal))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{literal}: {err:?}");
        }

        let post = svc.get_post("alice", post.id).await.unwrap();
        assert_eq!(post.lifecycle.status(), None);
        assert_eq!(svc.get_queue("alice", queue.id).await.unwrap().last_deployed, None);
    }

    #[tokio::test]
    async fn deleting_a_post_unpublishes_it_first() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let keep = svc.create_post("alice", queue.id, content("Keep"), None).await.unwrap();
        let p1 = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        svc.update_post_status("alice", keep.id, Some("PUB_PENDING"))
            .await
            .unwrap();
        svc.update_post_status("alice", p1.id, Some("PUB_PENDING"))
            .await
            .unwrap();
        assert!(artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<title>P1</title>"));

        let result = svc.delete_post("alice", p1.id).await.unwrap();

        assert!(result.values().all(|r| r.is_success()));
        let rss = artifact(&svc, &queue, Format::Rss).await.unwrap();
        assert!(!rss.contains("<title>P1</title>"));
        assert!(rss.contains("<title>Keep</title>"));
        assert!(matches!(
            svc.get_post("alice", p1.id).await.unwrap_err(),
            Error::PostNotFound(id) if id == p1.id
        ));
    }

    #[tokio::test]
    async fn deleting_a_queue_removes_everything() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        svc.update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        let result = svc.delete_queue("alice", queue.id).await.unwrap();

        assert_eq!(result.len(), 2);
        assert!(matches!(
            svc.get_queue("alice", queue.id).await.unwrap_err(),
            Error::QueueNotFound(_)
        ));
        assert!(matches!(
            svc.get_post("alice", post.id).await.unwrap_err(),
            Error::PostNotFound(_)
        ));
        assert_eq!(artifact(&svc, &queue, Format::Rss).await, None);
    }

    #[tokio::test]
    async fn patch_and_put_of_a_format_config() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let parse = |value| FormatConfig::parse(Format::Rss, value).unwrap();

        svc.update_format_config(
            "alice",
            queue.id,
            parse(json!({ "ttl": 60, "managingEditor": "ed@example.com" })),
            UpdateMode::Replace,
        )
        .await
        .unwrap();
        svc.update_format_config(
            "alice",
            queue.id,
            parse(json!({ "managingEditor": "chief@example.com" })),
            UpdateMode::Merge,
        )
        .await
        .unwrap();

        let stored = svc.get_queue("alice", queue.id).await.unwrap().export_config;
        assert_eq!(
            stored.and_then(|cfg| cfg.rss),
            Some(RssConfig {
                ttl: Some(60),
                managing_editor: Some("chief@example.com".into()),
                ..Default::default()
            })
        );
        assert!(artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<ttl>60</ttl>"));

        svc.update_format_config(
            "alice",
            queue.id,
            parse(json!({ "managingEditor": "chief@example.com" })),
            UpdateMode::Replace,
        )
        .await
        .unwrap();

        let stored = svc.get_queue("alice", queue.id).await.unwrap().export_config;
        assert_eq!(stored.unwrap().rss.unwrap().ttl, None);
        assert!(!artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<ttl>"));
    }

    #[tokio::test]
    async fn patches_that_merge_into_an_invalid_config_are_rejected() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let parse = |value| FormatConfig::parse(Format::Rss, value).unwrap();

        svc.update_format_config(
            "alice",
            queue.id,
            parse(json!({ "explicit": true })),
            UpdateMode::Replace,
        )
        .await
        .unwrap();

        let err = svc
            .update_format_config(
                "alice",
                queue.id,
                parse(json!({ "clean": true })),
                UpdateMode::Merge,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err:?}");

        let cfg = ExportConfig::parse(json!({ "rss": { "clean": true } })).unwrap();
        let err = svc
            .update_export_config("alice", queue.id, cfg, UpdateMode::Merge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err:?}");

        let rss = svc
            .get_queue("alice", queue.id)
            .await
            .unwrap()
            .export_config
            .and_then(|cfg| cfg.rss)
            .unwrap();
        assert_eq!(rss.explicit, Some(true));
        assert_eq!(rss.clean, None);
    }

    #[tokio::test]
    async fn clearing_and_disabling_formats() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();

        let cfg = ExportConfig::parse(json!({ "atom": { "enabled": false }, "rss": { "ttl": 5 } }))
            .unwrap();
        let result = svc
            .update_export_config("alice", queue.id, cfg, UpdateMode::Replace)
            .await
            .unwrap();
        assert!(result["RSS_20"].is_success());
        assert!(result["ATOM_10"].urls.is_empty() && result["ATOM_10"].errors.is_empty());

        let result = svc
            .clear_export_config("alice", queue.id, Some(Format::Atom))
            .await
            .unwrap();
        assert!(result["ATOM_10"].is_success());
        let stored = svc.get_queue("alice", queue.id).await.unwrap().export_config.unwrap();
        assert!(stored.atom.is_none() && stored.rss.is_some());

        svc.clear_export_config("alice", queue.id, None).await.unwrap();
        assert_eq!(svc.get_queue("alice", queue.id).await.unwrap().export_config, None);
    }

    #[tokio::test]
    async fn disabled_queues_do_not_deploy() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();

        let (queue, result) = svc
            .update_queue_status("alice", queue.id, QueueStatus::Disabled)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(queue.status, QueueStatus::Disabled);

        let (post, result) = svc
            .update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(post.lifecycle.status(), Some(PostPubStatus::PubPending));
        assert_eq!(svc.get_queue("alice", queue.id).await.unwrap().last_deployed, None);

        let (queue, result) = svc
            .update_queue_status("alice", queue.id, QueueStatus::Enabled)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert!(queue.last_deployed.is_some());
        assert!(svc.get_post("alice", post.id).await.unwrap().lifecycle.is_published());
    }

    #[tokio::test]
    async fn disabled_queues_are_not_served() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("Secret"), None).await.unwrap();
        svc.update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        svc.update_queue_status("alice", queue.id, QueueStatus::Disabled)
            .await
            .unwrap();
        svc.delete_post("alice", post.id).await.unwrap();

        assert!(matches!(
            svc.authorize_feed(&queue.transport_ident, None).await.unwrap(),
            FeedAccess::NotFound
        ));

        let (_, result) = svc
            .update_queue_status("alice", queue.id, QueueStatus::Enabled)
            .await
            .unwrap();
        assert!(result.values().all(|r| r.is_success()));
        assert!(matches!(
            svc.authorize_feed(&queue.transport_ident, None).await.unwrap(),
            FeedAccess::Granted(_)
        ));
        assert!(!artifact(&svc, &queue, Format::Rss).await.unwrap().contains("Secret"));
    }

    #[tokio::test]
    async fn archived_posts_leave_the_feed() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        svc.update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        let (post, _) = svc.archive_post("alice", post.id).await.unwrap();

        assert!(post.lifecycle.is_archived());
        assert!(!artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<title>P1</title>"));
        assert!(matches!(
            svc.update_post_status("alice", post.id, None).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn queues_are_private_to_their_owner() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();

        assert!(matches!(
            svc.get_queue("bob", queue.id).await.unwrap_err(),
            Error::QueueNotFound(_)
        ));
        assert!(matches!(
            svc.update_post_status("bob", post.id, Some("PUB_PENDING"))
                .await
                .unwrap_err(),
            Error::PostNotFound(_)
        ));
        assert!(matches!(
            svc.delete_queue("bob", queue.id).await.unwrap_err(),
            Error::QueueNotFound(_)
        ));

        // the same ident is fine for another user, but not twice for the same one
        svc.create_queue("bob", "q1", props("Q1")).await.unwrap();
        assert!(matches!(
            svc.create_queue("alice", "q1", props("Q1")).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            svc.create_queue("alice", "bad ident", props("Q1")).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn authenticated_feeds_need_credentials() {
        let env = Env::new().await;
        let svc = service(&env);
        let public = svc.create_queue("alice", "open", props("Open")).await.unwrap();
        let private = svc
            .create_queue(
                "alice",
                "closed",
                QueueProperties {
                    is_authenticated: true,
                    ..props("Closed")
                },
            )
            .await
            .unwrap();
        svc.put_credential("alice", private.id, "reader", "s3cret")
            .await
            .unwrap();
        svc.put_credential("alice", private.id, "editor", "s3cret")
            .await
            .unwrap();

        let mut tx = env.storage.begin().await.unwrap();
        let reader = tx.get_password_hash(private.id, "reader").await.unwrap().unwrap();
        let editor = tx.get_password_hash(private.id, "editor").await.unwrap().unwrap();
        tx.commit().await.unwrap();
        assert!(reader.starts_with("$argon2id$"));
        assert!(!reader.contains("s3cret"));
        assert_ne!(reader, editor);

        assert!(matches!(
            svc.authorize_feed(&public.transport_ident, None).await.unwrap(),
            FeedAccess::Granted(_)
        ));
        assert!(matches!(
            svc.authorize_feed(&private.transport_ident, None).await.unwrap(),
            FeedAccess::Denied
        ));
        assert!(matches!(
            svc.authorize_feed(&private.transport_ident, Some(("reader", "wrong")))
                .await
                .unwrap(),
            FeedAccess::Denied
        ));
        assert!(matches!(
            svc.authorize_feed(&private.transport_ident, Some(("reader", "s3cret")))
                .await
                .unwrap(),
            FeedAccess::Granted(_)
        ));
        assert!(matches!(
            svc.authorize_feed("nope", None).await.unwrap(),
            FeedAccess::NotFound
        ));

        assert!(svc.delete_credential("alice", private.id, "reader").await.unwrap());
        assert!(!svc.delete_credential("alice", private.id, "reader").await.unwrap());
        assert!(matches!(
            svc.authorize_feed(&private.transport_ident, Some(("reader", "s3cret")))
                .await
                .unwrap(),
            FeedAccess::Denied
        ));
    }

    #[test]
    fn password_hashes() {
        let hash = hash_password("correct horse").unwrap();

        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "correct horse "));
        assert!(!verify_password("not a hash", "correct horse"));
        assert_ne!(hash, hash_password("correct horse").unwrap());
    }

    #[tokio::test]
    async fn expired_posts_are_not_rendered() {
        let env = Env::new().await;
        let svc = service(&env);
        let queue = svc.create_queue("alice", "q1", props("Q1")).await.unwrap();
        let post = svc.create_post("alice", queue.id, content("P1"), None).await.unwrap();
        svc.update_post_status("alice", post.id, Some("PUB_PENDING"))
            .await
            .unwrap();

        let expired_at = model::now() - time::Duration::minutes(5);
        let (post, _) = svc
            .set_post_expiration("alice", post.id, Some(expired_at))
            .await
            .unwrap();

        assert_eq!(post.expiration_timestamp, Some(expired_at));
        assert!(post.lifecycle.is_published());
        assert!(!artifact(&svc, &queue, Format::Rss).await.unwrap().contains("<title>P1</title>"));
    }
}
