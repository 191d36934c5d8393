use std::sync::Arc;

use ::rss::extension::dublincore::DublinCoreExtension;
use ::rss::extension::itunes::{ITunesChannelExtensionBuilder, ITunesItemExtensionBuilder};
use ::rss::{Category, ChannelBuilder, Enclosure, GuidBuilder, ImageBuilder, Item, ItemBuilder};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use url::Url;

use crate::model::export::RssConfig;
use crate::model::{Format, Person, Post};

use super::{ArtifactStore, Publisher, Snapshot};

fn format_date(date: OffsetDateTime) -> Result<String> {
    date.format(&Rfc2822)
        .with_context(|| anyhow!("could not format the date {date}"))
}

fn format_author(person: &Person) -> String {
    match &person.email {
        Some(email) => format!("{email} ({})", person.name),
        None => person.name.clone(),
    }
}

/// Renders an RSS 2.0 document. The output only depends on the snapshot and `timestamp`.
pub fn render(
    snapshot: &Snapshot,
    timestamp: OffsetDateTime,
    self_url: &Url,
    default_generator: &str,
) -> Result<String> {
    let queue = &snapshot.queue;
    let props = &queue.properties;
    let default_cfg = RssConfig::default();
    let cfg = queue
        .export_config
        .as_ref()
        .and_then(|cfg| cfg.rss.as_ref())
        .unwrap_or(&default_cfg);

    let image = match (&cfg.image, &props.image_src) {
        (Some(image), _) => Some(
            ImageBuilder::default()
                .url(image.url.as_str())
                .title(image.title.clone().unwrap_or_else(|| props.title.clone()))
                .link(image.link.as_ref().unwrap_or(self_url).as_str())
                .build(),
        ),

        (None, Some(src)) => Some(
            ImageBuilder::default()
                .url(src.as_str())
                .title(props.title.clone())
                .link(self_url.as_str())
                .build(),
        ),

        (None, None) => None,
    };

    let explicit = match (cfg.clean, cfg.explicit) {
        (Some(true), _) => Some("clean".to_owned()),
        (_, Some(explicit)) => Some(explicit.to_string()),
        _ => None,
    };
    let itunes = (explicit.is_some() || cfg.itunes_author.is_some()).then(|| {
        ITunesChannelExtensionBuilder::default()
            .author(cfg.itunes_author.clone())
            .explicit(explicit)
            .build()
    });

    let mut posts = snapshot.posts.iter().collect::<Vec<_>>();
    posts.sort_by_key(|post| std::cmp::Reverse((post.lifecycle.publish_timestamp(), post.id)));

    let items = posts
        .into_iter()
        .map(|post| render_item(&queue.transport_ident, post))
        .collect::<Result<Vec<_>>>()?;

    let categories = cfg
        .categories
        .iter()
        .flatten()
        .map(|name| Category {
            name: name.clone(),
            domain: None,
        })
        .collect::<Vec<_>>();

    let channel = ChannelBuilder::default()
        .title(props.title.clone())
        .link(self_url.as_str())
        .description(props.description.clone().unwrap_or_default())
        .language(props.language.clone())
        .copyright(props.copyright.clone())
        .managing_editor(cfg.managing_editor.clone())
        .webmaster(cfg.web_master.clone())
        .docs(cfg.docs.as_ref().map(|docs| docs.to_string()))
        .ttl(cfg.ttl.map(|ttl| ttl.to_string()))
        .categories(categories)
        .image(image)
        .itunes_ext(itunes)
        .generator(Some(
            props
                .generator
                .clone()
                .unwrap_or_else(|| default_generator.to_owned()),
        ))
        .last_build_date(Some(format_date(timestamp)?))
        .items(items)
        .build();

    Ok(channel.to_string())
}

fn render_item(transport_ident: &str, post: &Post) -> Result<Item> {
    let content = &post.content;

    let enclosure = content.enclosures.first().map(|enclosure| Enclosure {
        url: enclosure.url.to_string(),
        length: enclosure.length.to_string(),
        mime_type: enclosure.mime_type.clone(),
    });

    let dublin_core = (!content.contributors.is_empty() || content.rights.is_some()).then(|| {
        DublinCoreExtension {
            contributors: content.contributors.iter().map(|p| p.name.clone()).collect(),
            rights: content.rights.iter().cloned().collect(),
            ..Default::default()
        }
    });

    let itunes = content.itunes.as_ref().map(|itunes| {
        ITunesItemExtensionBuilder::default()
            .author(itunes.author.clone())
            .subtitle(itunes.subtitle.clone())
            .summary(itunes.summary.clone())
            .duration(itunes.duration.clone())
            .explicit(itunes.explicit.map(|explicit| explicit.to_string()))
            .image(itunes.image.as_ref().map(|url| url.to_string()))
            .build()
    });

    let pub_date = post
        .lifecycle
        .publish_timestamp()
        .map(format_date)
        .transpose()?;

    Ok(ItemBuilder::default()
        .title(Some(content.title.clone()))
        .link(content.url.as_ref().map(|url| url.to_string()))
        .description(content.description.clone())
        .author(content.authors.first().map(format_author))
        .categories(
            content
                .categories
                .iter()
                .map(|name| Category {
                    name: name.clone(),
                    domain: None,
                })
                .collect::<Vec<_>>(),
        )
        .comments(content.comment.clone())
        .enclosure(enclosure)
        .guid(Some(
            GuidBuilder::default()
                .value(format!("feedqueue/{}/{}", transport_ident, post.id))
                .permalink(false)
                .build(),
        ))
        .pub_date(pub_date)
        .content(content.contents.first().map(|c| c.value.clone()))
        .dublin_core_ext(dublin_core)
        .itunes_ext(itunes)
        .build())
}

pub struct RssPublisher {
    store: Arc<ArtifactStore>,
    generator: String,
}

impl RssPublisher {
    pub fn new(store: Arc<ArtifactStore>, generator: impl Into<String>) -> Self {
        Self {
            store,
            generator: generator.into(),
        }
    }
}

#[async_trait]
impl Publisher for RssPublisher {
    fn format(&self) -> Format {
        Format::Rss
    }

    async fn publish(&self, snapshot: &Snapshot, timestamp: OffsetDateTime) -> Result<Vec<Url>> {
        let transport_ident = &snapshot.queue.transport_ident;
        let file_name = self.format().file_name();
        let self_url = self.store.url_for(transport_ident, file_name)?;
        let body = render(snapshot, timestamp, &self_url, &self.generator)
            .context("could not render the RSS feed")?;
        let url = self
            .store
            .put(transport_ident, file_name, snapshot.revision, body.as_bytes())
            .await?;

        Ok(vec![url])
    }
}
