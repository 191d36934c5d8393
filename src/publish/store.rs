use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Guards the writes of one artifact and holds the revision it was last written from.
type WriteSlot = Arc<tokio::sync::Mutex<u64>>;

/// Where rendered artifacts are written and served from.
///
/// Artifacts live at `<root>/<transport ident>/<file name>` and are published under
/// `<public url>/feeds/<transport ident>/<file name>`.
pub struct ArtifactStore {
    root: PathBuf,
    public_url: Url,
    slots: Mutex<HashMap<(String, String), WriteSlot>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_url: Url) -> Self {
        Self {
            root: root.into(),
            public_url,
            slots: Default::default(),
        }
    }

    fn slot(&self, transport_ident: &str, file_name: &str) -> WriteSlot {
        self.slots
            .lock()
            .unwrap()
            .entry((transport_ident.to_owned(), file_name.to_owned()))
            .or_default()
            .clone()
    }

    pub fn url_for(&self, transport_ident: &str, file_name: &str) -> Result<Url> {
        let path = format!(
            "feeds/{}/{}",
            urlencoding::encode(transport_ident),
            urlencoding::encode(file_name),
        );

        self.public_url
            .join(&path)
            .with_context(|| anyhow!("could not build an artifact URL for `{path}`"))
    }

    /// Atomically replaces the artifact and returns its public URL.
    ///
    /// Writes of the same artifact are serialized. A body rendered from an older `revision` than
    /// the one already stored is dropped.
    pub async fn put(
        &self,
        transport_ident: &str,
        file_name: &str,
        revision: u64,
        body: &[u8],
    ) -> Result<Url> {
        let url = self.url_for(transport_ident, file_name)?;
        let slot = self.slot(transport_ident, file_name);
        let mut written = slot.lock().await;

        if revision < *written {
            debug!(revision, stored = *written, "Skipped an outdated artifact");

            return Ok(url);
        }

        let dir = self.root.join(transport_ident);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| anyhow!("could not create the directory `{}`", dir.display()))?;

        let path = dir.join(file_name);
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp_path, body)
            .await
            .with_context(|| anyhow!("could not write `{}`", tmp_path.display()))?;

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            if let Err(e) = fs::remove_file(&tmp_path).await {
                warn!(path = %tmp_path.display(), "Could not remove a temporary file: {e}");
            }

            return Err(e)
                .with_context(|| anyhow!("could not move the artifact to `{}`", path.display()));
        }

        *written = revision;
        debug!(path = %path.display(), size = body.len(), revision, "Stored an artifact");

        Ok(url)
    }

    pub async fn get(&self, transport_ident: &str, file_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(transport_ident).join(file_name);

        match fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| anyhow!("could not read `{}`", path.display())),
        }
    }

    /// Removes every artifact of a queue.
    pub async fn remove(&self, transport_ident: &str) -> Result<()> {
        self.slots
            .lock()
            .unwrap()
            .retain(|(ident, _), _| ident != transport_ident);

        let dir = self.root.join(transport_ident);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| anyhow!("could not remove the directory `{}`", dir.display()))
            }
        }
    }
}
