use std::sync::Arc;

use anyhow::Result;
use handlebars::Handlebars;

use crate::config::Config;
use crate::deploy::Deployer;
use crate::model::Format;
use crate::publish::{ArtifactStore, AtomPublisher, Publisher, RssPublisher};
use crate::service::Service;
use crate::storage::Storage;
use crate::template;

#[derive(Clone)]
pub struct State {
    pub cfg: Arc<Config>,
    pub service: Arc<Service>,
    pub template: Arc<Handlebars<'static>>,
}

impl State {
    pub async fn new(cfg: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&cfg.db_path).await?);
        let artifacts = Arc::new(ArtifactStore::new(
            cfg.output_dir.clone(),
            cfg.public_url.clone(),
        ));
        let publishers = make_publishers(&cfg, &artifacts);
        let deployer = Deployer::new(storage.clone(), publishers, cfg.publish_timeout.into());
        let service = Arc::new(Service::new(storage, deployer, artifacts));

        Ok(Self::from_parts(cfg, service))
    }

    pub fn from_parts(cfg: Config, service: Arc<Service>) -> Self {
        State {
            cfg: Arc::new(cfg),
            service,
            template: Arc::new(template::new()),
        }
    }
}

fn make_publishers(cfg: &Config, artifacts: &Arc<ArtifactStore>) -> Vec<Arc<dyn Publisher>> {
    let generator = format!("feedqueue {}", env!("CARGO_PKG_VERSION"));

    cfg.publishers
        .iter()
        .map(|format| -> Arc<dyn Publisher> {
            match format {
                Format::Rss => Arc::new(RssPublisher::new(artifacts.clone(), generator.clone())),
                Format::Atom => Arc::new(AtomPublisher::new(artifacts.clone(), generator.clone())),
            }
        })
        .collect()
}
