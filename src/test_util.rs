use std::sync::Arc;

use tempfile::TempDir;

use crate::model::{self, Post, PostContent, PostPubStatus, Queue, QueueProperties};
use crate::storage::Storage;

pub struct Env {
    pub dir: TempDir,
    pub storage: Arc<Storage>,
}

impl Env {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("test.sqlite3")).await.unwrap());

        Self { dir, storage }
    }
}

pub async fn create_queue(env: &Env, username: &str, ident: &str) -> i64 {
    let props = QueueProperties {
        title: format!("Queue {ident}"),
        ..Default::default()
    };

    let mut tx = env.storage.begin().await.unwrap();
    let id = tx
        .insert_queue(username, ident, &format!("{username}-{ident}"), &props, model::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    id
}

pub async fn create_post(env: &Env, username: &str, queue_id: i64, title: &str) -> i64 {
    let content = PostContent {
        title: title.into(),
        ..Default::default()
    };

    let mut tx = env.storage.begin().await.unwrap();
    let id = tx
        .insert_post(username, queue_id, &content, None, model::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    id
}

pub async fn request_status(env: &Env, username: &str, post_id: i64, status: Option<PostPubStatus>) {
    let mut tx = env.storage.begin().await.unwrap();
    let mut post = tx.get_post(username, post_id).await.unwrap().unwrap();
    let expected = post.lifecycle.status();
    post.lifecycle.request(status).unwrap();
    assert!(tx
        .update_post_lifecycle(&post, expected, model::now())
        .await
        .unwrap());
    tx.commit().await.unwrap();
}

pub async fn queue(env: &Env, username: &str, queue_id: i64) -> Queue {
    let mut tx = env.storage.begin().await.unwrap();
    let queue = tx.get_queue(username, queue_id).await.unwrap().unwrap();
    tx.commit().await.unwrap();

    queue
}

pub async fn post(env: &Env, username: &str, post_id: i64) -> Post {
    let mut tx = env.storage.begin().await.unwrap();
    let post = tx.get_post(username, post_id).await.unwrap().unwrap();
    tx.commit().await.unwrap();

    post
}
