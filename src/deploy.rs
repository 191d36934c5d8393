use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::time::OffsetDateTime;
use anyhow::{anyhow, Context as _};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::error::{Error, Result};
use crate::model::{self, QueueStatus};
use crate::publish::{PubError, PubResult, Publisher, Snapshot};
use crate::storage::Storage;

/// Publisher ident → result of one deployment pass.
pub type DeployResult = BTreeMap<String, PubResult>;

/// Builds the result map of a pass.
pub fn aggregate(results: impl IntoIterator<Item = PubResult>) -> DeployResult {
    results.into_iter().fold(DeployResult::new(), |mut acc, result| {
        acc.insert(result.publisher_ident.clone(), result);
        acc
    })
}

/// Serializes the state-changing part of deployment passes per queue.
#[derive(Default)]
struct QueueLocks(Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>);

impl QueueLocks {
    async fn lock(&self, queue_id: i64) -> OwnedMutexGuard<()> {
        let lock = self.0.lock().unwrap().entry(queue_id).or_default().clone();

        lock.lock_owned().await
    }

    fn forget(&self, queue_id: i64) {
        self.0.lock().unwrap().remove(&queue_id);
    }
}

struct Inner {
    storage: Arc<Storage>,
    publishers: Vec<Arc<dyn Publisher>>,
    publish_timeout: Duration,
    locks: QueueLocks,
    revisions: AtomicU64,
}

/// Runs deployment passes: applies pending post transitions and invokes every publisher.
#[derive(Clone)]
pub struct Deployer(Arc<Inner>);

impl Deployer {
    pub fn new(
        storage: Arc<Storage>,
        publishers: Vec<Arc<dyn Publisher>>,
        publish_timeout: Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            storage,
            publishers,
            publish_timeout,
            locks: Default::default(),
            revisions: AtomicU64::new(0),
        }))
    }

    /// Runs a deployment pass for a queue owned by `username`.
    ///
    /// The pass runs in a separate task, so it completes even if the caller goes away.
    pub async fn deploy(&self, username: &str, queue_id: i64) -> Result<DeployResult> {
        let this = self.clone();
        let username = username.to_owned();

        tokio::spawn(
            async move { this.run_pass(&username, queue_id).await }
                .instrument(info_span!("deploy", queue_id)),
        )
        .await
        .context("the deployment task failed")?
    }

    /// Drops the lock of a queue that no longer exists.
    pub fn forget_queue(&self, queue_id: i64) {
        self.0.locks.forget(queue_id);
    }

    async fn run_pass(&self, username: &str, queue_id: i64) -> Result<DeployResult> {
        let timestamp = model::now();

        let Some(snapshot) = self.prepare(username, queue_id, timestamp).await? else {
            info!("The queue is disabled; skipping the deployment");

            return Ok(DeployResult::new());
        };

        let result = aggregate(self.run_publishers(Arc::new(snapshot), timestamp).await);
        let succeeded = result.values().filter(|r| r.is_success()).count();

        if succeeded > 0 {
            let mut tx = self.0.storage.begin().await?;
            tx.set_last_deployed(queue_id, timestamp).await?;
            tx.commit().await?;
        }

        info!(
            "Deployed the queue: {succeeded} of {} publishers succeeded",
            result.len()
        );

        Ok(result)
    }

    /// Applies pending post transitions and captures what the publishers will see.
    ///
    /// Returns `None` for a disabled queue, in which case nothing is changed.
    async fn prepare(
        &self,
        username: &str,
        queue_id: i64,
        timestamp: OffsetDateTime,
    ) -> Result<Option<Snapshot>> {
        let _guard = self.0.locks.lock(queue_id).await;
        let mut tx = self.0.storage.begin().await?;

        let queue = tx
            .get_queue(username, queue_id)
            .await?
            .ok_or(Error::QueueNotFound(queue_id))?;

        if queue.status == QueueStatus::Disabled {
            return Ok(None);
        }

        for mut post in tx.get_pending_posts(queue.id).await? {
            let expected = post.lifecycle.status();
            let processed = post.lifecycle.apply_deployment(timestamp);

            if !tx.update_post_lifecycle(&post, expected, timestamp).await? {
                return Err(anyhow!("post {} was modified during the deployment", post.id).into());
            }

            debug!(post_id = post.id, ?processed, "Processed a pending post");
        }

        let posts = tx
            .get_published_posts(queue.id)
            .await?
            .into_iter()
            .filter(|post| post.lifecycle.is_live() && !post.is_expired_at(timestamp))
            .collect();
        tx.commit().await?;

        // taken under the queue lock, so revisions of one queue follow the order of its passes
        let revision = self.0.revisions.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Some(Snapshot {
            queue,
            posts,
            revision,
        }))
    }

    async fn run_publishers(&self, snapshot: Arc<Snapshot>, timestamp: OffsetDateTime) -> Vec<PubResult> {
        type Task = JoinHandle<Result<anyhow::Result<Vec<Url>>, time::error::Elapsed>>;

        let limit = self.0.publish_timeout;
        let tasks: Vec<(&'static str, Option<Task>)> = self
            .0
            .publishers
            .iter()
            .map(|publisher| {
                let ident = publisher.ident();

                if !publisher.applies_to(&snapshot.queue) {
                    debug!(publisher = ident, "The format is disabled for this queue");

                    return (ident, None);
                }

                let publisher = publisher.clone();
                let snapshot = snapshot.clone();
                let task = tokio::spawn(
                    async move { time::timeout(limit, publisher.publish(&snapshot, timestamp)).await }
                        .instrument(info_span!("publish", publisher = ident)),
                );

                (ident, Some(task))
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());

        for (ident, task) in tasks {
            let Some(task) = task else {
                results.push(PubResult::skipped(ident, timestamp));
                continue;
            };

            let outcome = match task.await {
                Ok(Ok(Ok(urls))) if !urls.is_empty() => Ok(urls),
                Ok(Ok(Ok(_))) => Err("the publisher produced no artifacts".to_owned()),
                Ok(Ok(Err(e))) => Err(format!("{e:#}")),
                Ok(Err(_)) => Err(format!("the publisher timed out after {}s", limit.as_secs_f64())),
                Err(e) if e.is_panic() => Err("the publisher panicked".to_owned()),
                Err(e) => Err(format!("the publisher task failed: {e}")),
            };

            results.push(match outcome {
                Ok(urls) => PubResult::success(ident, timestamp, urls),

                Err(message) => {
                    warn!(publisher = ident, "Publishing failed: {message}");

                    PubResult::failure(ident, timestamp, PubError::new(message))
                }
            });
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use async_trait::async_trait;

    use super::*;
    use crate::model::{ExportConfig, Format, PostPubStatus};
    use crate::publish::{ArtifactStore, AtomPublisher, RssPublisher};
    use crate::test_util::{self, Env};

    enum Behavior {
        Succeed,
        Fail,
        Hang,
        Panic,
    }

    struct FakePublisher {
        format: Format,
        behavior: Behavior,
        seen: Mutex<Vec<Vec<i64>>>,
    }

    impl FakePublisher {
        fn new(format: Format, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                format,
                behavior,
                seen: Default::default(),
            })
        }

        fn seen(&self) -> Vec<Vec<i64>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        fn format(&self) -> Format {
            self.format
        }

        async fn publish(&self, snapshot: &Snapshot, _timestamp: OffsetDateTime) -> anyhow::Result<Vec<Url>> {
            self.seen
                .lock()
                .unwrap()
                .push(snapshot.posts.iter().map(|post| post.id).collect());

            match self.behavior {
                Behavior::Succeed => Ok(vec![Url::parse(&format!(
                    "https://feeds.example.com/{}/{}",
                    snapshot.queue.transport_ident,
                    self.format.file_name(),
                ))?]),
                Behavior::Fail => bail!("renderer exploded"),
                Behavior::Hang => {
                    time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
                Behavior::Panic => panic!("renderer panicked"),
            }
        }
    }

    fn deployer(env: &Env, publishers: Vec<Arc<dyn Publisher>>) -> Deployer {
        Deployer::new(env.storage.clone(), publishers, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn one_failing_publisher_does_not_spoil_the_others() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;
        let post_id = test_util::create_post(&env, "alice", queue_id, "P1").await;
        test_util::request_status(&env, "alice", post_id, Some(PostPubStatus::PubPending)).await;

        let deployer = deployer(
            &env,
            vec![
                FakePublisher::new(Format::Rss, Behavior::Succeed),
                FakePublisher::new(Format::Atom, Behavior::Fail),
            ],
        );
        let result = deployer.deploy("alice", queue_id).await.unwrap();

        assert_eq!(result.len(), 2);
        let rss = &result["RSS_20"];
        assert_eq!(rss.urls.len(), 1);
        assert!(rss.errors.is_empty());
        let atom = &result["ATOM_10"];
        assert!(atom.urls.is_empty());
        assert_eq!(atom.errors, vec![PubError::new("renderer exploded")]);

        let queue = test_util::queue(&env, "alice", queue_id).await;
        assert_eq!(queue.last_deployed, Some(rss.timestamp));
        assert!(test_util::post(&env, "alice", post_id).await.lifecycle.is_published());
    }

    #[tokio::test]
    async fn total_failure_leaves_last_deployed_alone() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;

        let deployer = deployer(
            &env,
            vec![
                FakePublisher::new(Format::Rss, Behavior::Fail),
                FakePublisher::new(Format::Atom, Behavior::Panic),
            ],
        );
        let result = deployer.deploy("alice", queue_id).await.unwrap();

        assert!(result.values().all(|r| !r.errors.is_empty() && r.urls.is_empty()));
        assert_eq!(result["ATOM_10"].errors, vec![PubError::new("the publisher panicked")]);
        assert_eq!(test_util::queue(&env, "alice", queue_id).await.last_deployed, None);
    }

    #[tokio::test]
    async fn hung_publishers_time_out() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;

        let deployer = deployer(
            &env,
            vec![
                FakePublisher::new(Format::Rss, Behavior::Succeed),
                FakePublisher::new(Format::Atom, Behavior::Hang),
            ],
        );
        let result = time::timeout(Duration::from_secs(10), deployer.deploy("alice", queue_id))
            .await
            .unwrap()
            .unwrap();

        assert!(result["RSS_20"].is_success());
        let errors = &result["ATOM_10"].errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn disabled_queues_are_skipped() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;
        let post_id = test_util::create_post(&env, "alice", queue_id, "P1").await;
        test_util::request_status(&env, "alice", post_id, Some(PostPubStatus::PubPending)).await;

        let mut tx = env.storage.begin().await.unwrap();
        tx.set_queue_status(queue_id, QueueStatus::Disabled, model::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let rss = FakePublisher::new(Format::Rss, Behavior::Succeed);
        let deployer = deployer(&env, vec![rss.clone()]);
        let result = deployer.deploy("alice", queue_id).await.unwrap();

        assert!(result.is_empty());
        assert!(rss.seen().is_empty());

        let post = test_util::post(&env, "alice", post_id).await;
        assert_eq!(post.lifecycle.status(), Some(PostPubStatus::PubPending));
        assert!(!post.lifecycle.is_published());
        assert_eq!(test_util::queue(&env, "alice", queue_id).await.last_deployed, None);
    }

    #[tokio::test]
    async fn disabled_formats_decline() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;

        let cfg = ExportConfig::parse(serde_json::json!({ "atom": { "enabled": false } })).unwrap();
        let mut tx = env.storage.begin().await.unwrap();
        tx.set_export_config(queue_id, Some(&cfg), model::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let atom = FakePublisher::new(Format::Atom, Behavior::Succeed);
        let deployer = deployer(
            &env,
            vec![FakePublisher::new(Format::Rss, Behavior::Succeed), atom.clone()],
        );
        let result = deployer.deploy("alice", queue_id).await.unwrap();

        assert!(atom.seen().is_empty());
        let skipped = &result["ATOM_10"];
        assert!(skipped.urls.is_empty() && skipped.errors.is_empty());
        assert!(result["RSS_20"].is_success());
    }

    #[tokio::test]
    async fn publishers_see_live_posts_only() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;
        let live = test_util::create_post(&env, "alice", queue_id, "live").await;
        let pending_removal = test_util::create_post(&env, "alice", queue_id, "gone").await;
        let expired = test_util::create_post(&env, "alice", queue_id, "expired").await;
        let untouched = test_util::create_post(&env, "alice", queue_id, "draft").await;

        for id in [live, pending_removal, expired] {
            test_util::request_status(&env, "alice", id, Some(PostPubStatus::PubPending)).await;
        }

        let rss = FakePublisher::new(Format::Rss, Behavior::Succeed);
        let deployer = deployer(&env, vec![rss.clone()]);
        deployer.deploy("alice", queue_id).await.unwrap();

        test_util::request_status(&env, "alice", pending_removal, Some(PostPubStatus::DepubPending)).await;
        let mut tx = env.storage.begin().await.unwrap();
        tx.set_post_expiration(expired, Some(model::now() - ::time::Duration::hours(1)), model::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        deployer.deploy("alice", queue_id).await.unwrap();

        let seen = rss.seen();
        assert_eq!(seen.len(), 2);
        let mut first = seen[0].clone();
        first.sort();
        assert_eq!(first, vec![live, pending_removal, expired]);
        assert_eq!(seen[1], vec![live]);

        let removed = test_util::post(&env, "alice", pending_removal).await;
        assert!(!removed.lifecycle.is_published());
        assert_eq!(removed.lifecycle.status(), None);
        assert!(!test_util::post(&env, "alice", untouched).await.lifecycle.is_published());
    }

    #[tokio::test]
    async fn foreign_queues_are_not_found() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;

        let deployer = deployer(&env, vec![FakePublisher::new(Format::Rss, Behavior::Succeed)]);
        let err = deployer.deploy("mallory", queue_id).await.unwrap_err();

        assert!(matches!(err, Error::QueueNotFound(id) if id == queue_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_on_one_queue() {
        let env = Arc::new(Env::new().await);
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;
        let mut post_ids = Vec::new();

        for i in 0..6 {
            post_ids.push(test_util::create_post(&env, "alice", queue_id, &format!("P{i}")).await);
        }

        let artifacts = Arc::new(ArtifactStore::new(
            env.dir.path().join("feeds"),
            Url::parse("https://feeds.example.com/").unwrap(),
        ));
        let publishers: Vec<Arc<dyn Publisher>> = vec![
            Arc::new(RssPublisher::new(artifacts.clone(), "feedqueue-test")),
            Arc::new(AtomPublisher::new(artifacts.clone(), "feedqueue-test")),
        ];
        let deployer = Deployer::new(env.storage.clone(), publishers, Duration::from_secs(10));

        let tasks = post_ids
            .iter()
            .map(|&post_id| {
                let env = env.clone();
                let deployer = deployer.clone();

                tokio::spawn(async move {
                    let mut results = Vec::new();

                    for status in [
                        PostPubStatus::PubPending,
                        PostPubStatus::DepubPending,
                        PostPubStatus::PubPending,
                    ] {
                        test_util::request_status(&env, "alice", post_id, Some(status)).await;
                        results.push(deployer.deploy("alice", queue_id).await?);
                    }

                    Ok::<_, Error>(results)
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            for result in task.await.unwrap().unwrap() {
                assert_eq!(result.len(), 2);
                assert!(result.values().all(|r| r.is_success()), "{result:?}");
            }
        }

        for &post_id in &post_ids {
            let post = test_util::post(&env, "alice", post_id).await;
            assert_eq!(post.lifecycle.status(), None);
            assert!(post.lifecycle.is_published());
        }

        let rss = artifacts.get("alice-q1", "rss.xml").await.unwrap().unwrap();
        let rss = String::from_utf8(rss).unwrap();

        for i in 0..post_ids.len() {
            assert!(rss.contains(&format!("<title>P{i}</title>")), "P{i} is missing");
        }
    }

    #[tokio::test]
    async fn stale_status_writes_are_refused() {
        let env = Env::new().await;
        let queue_id = test_util::create_queue(&env, "alice", "q1").await;
        let post_id = test_util::create_post(&env, "alice", queue_id, "P1").await;
        let mut post = test_util::post(&env, "alice", post_id).await;
        test_util::request_status(&env, "alice", post_id, Some(PostPubStatus::PubPending)).await;

        post.lifecycle.request(Some(PostPubStatus::DepubPending)).unwrap();
        let mut tx = env.storage.begin().await.unwrap();
        let written = tx
            .update_post_lifecycle(&post, None, model::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(!written);
        let post = test_util::post(&env, "alice", post_id).await;
        assert_eq!(post.lifecycle.status(), Some(PostPubStatus::PubPending));
    }

    #[test]
    fn aggregation_keys_by_publisher() {
        let ts = model::now();
        let result = aggregate([
            PubResult::skipped("A", ts),
            PubResult::failure("B", ts, PubError::new("x")),
        ]);

        assert_eq!(result.keys().map(String::as_str).collect::<Vec<_>>(), ["A", "B"]);
    }
}
