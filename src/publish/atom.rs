use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use atom_syndication::{
    Category, Content, Entry, Feed, FixedDateTime, Generator, Link, Person, Text,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::model::export::AtomConfig;
use crate::model::{self, Format, Post};

use super::{ArtifactStore, Publisher, Snapshot};

fn convert_date(date: OffsetDateTime) -> Result<FixedDateTime> {
    let formatted = date
        .format(&Rfc3339)
        .with_context(|| anyhow!("could not format the date {date}"))?;

    FixedDateTime::parse_from_rfc3339(&formatted)
        .map_err(|e| anyhow!("could not convert the date {formatted}: {e}"))
}

fn convert_person(person: &model::Person) -> Person {
    Person {
        name: person.name.clone(),
        email: person.email.clone(),
        uri: person.uri.clone(),
        ..Default::default()
    }
}

fn convert_category(term: &str) -> Category {
    Category {
        term: term.into(),
        ..Default::default()
    }
}

fn link(href: &Url, rel: &str) -> Link {
    Link {
        href: href.to_string(),
        rel: rel.into(),
        ..Default::default()
    }
}

/// Renders an Atom 1.0 document. The output only depends on the snapshot and `timestamp`.
pub fn render(
    snapshot: &Snapshot,
    timestamp: OffsetDateTime,
    self_url: &Url,
    default_generator: &str,
) -> Result<String> {
    let queue = &snapshot.queue;
    let props = &queue.properties;
    let default_cfg = AtomConfig::default();
    let cfg = queue
        .export_config
        .as_ref()
        .and_then(|cfg| cfg.atom.as_ref())
        .unwrap_or(&default_cfg);

    let authors = match &cfg.authors {
        Some(authors) => authors.iter().map(convert_person).collect(),

        None => vec![Person {
            name: queue.username.clone(),
            ..Default::default()
        }],
    };

    let mut posts = snapshot.posts.iter().collect::<Vec<_>>();
    posts.sort_by_key(|post| std::cmp::Reverse((post.lifecycle.publish_timestamp(), post.id)));

    let entries = posts
        .into_iter()
        .map(|post| render_entry(&queue.transport_ident, post))
        .collect::<Result<Vec<_>>>()?;

    let feed = Feed {
        title: Text::plain(props.title.clone()),
        id: format!("urn:feedqueue:{}", queue.transport_ident),
        updated: convert_date(timestamp)?,
        authors,
        categories: cfg
            .categories
            .iter()
            .flatten()
            .map(|term| convert_category(term))
            .collect(),
        generator: Some(Generator {
            value: props
                .generator
                .clone()
                .unwrap_or_else(|| default_generator.to_owned()),
            ..Default::default()
        }),
        icon: cfg.icon.as_ref().map(|url| url.to_string()),
        logo: cfg
            .logo
            .as_ref()
            .or(props.image_src.as_ref())
            .map(|url| url.to_string()),
        links: vec![link(self_url, "self")],
        rights: cfg
            .rights
            .clone()
            .or_else(|| props.copyright.clone())
            .map(Text::plain),
        subtitle: cfg
            .subtitle
            .clone()
            .or_else(|| props.description.clone())
            .map(Text::plain),
        lang: props.language.clone(),
        entries,
        ..Default::default()
    };

    let xml = feed
        .write_to(Vec::new())
        .context("could not serialize the Atom feed")?;

    String::from_utf8(xml).context("the Atom feed is not valid UTF-8")
}

fn render_entry(transport_ident: &str, post: &Post) -> Result<Entry> {
    let content = &post.content;

    let mut links = Vec::with_capacity(1 + content.urls.len() + content.enclosures.len());
    links.extend(content.url.iter().map(|url| link(url, "alternate")));
    links.extend(content.urls.iter().map(|url| link(url, "related")));
    links.extend(content.enclosures.iter().map(|enclosure| Link {
        href: enclosure.url.to_string(),
        rel: "enclosure".into(),
        mime_type: Some(enclosure.mime_type.clone()),
        length: Some(enclosure.length.to_string()),
        ..Default::default()
    }));

    let body = content.contents.first().map(|body| Content {
        value: Some(body.value.clone()),
        content_type: Some(body.mime_type.clone().unwrap_or_else(|| "html".into())),
        ..Default::default()
    });

    Ok(Entry {
        title: Text::plain(content.title.clone()),
        id: format!("urn:feedqueue:{}:{}", transport_ident, post.id),
        updated: convert_date(post.last_updated)?,
        published: post
            .lifecycle
            .publish_timestamp()
            .map(convert_date)
            .transpose()?,
        authors: content.authors.iter().map(convert_person).collect(),
        contributors: content.contributors.iter().map(convert_person).collect(),
        categories: content.categories.iter().map(|term| convert_category(term)).collect(),
        links,
        rights: content.rights.clone().map(Text::plain),
        summary: content.description.clone().map(Text::plain),
        content: body,
        ..Default::default()
    })
}

pub struct AtomPublisher {
    store: Arc<ArtifactStore>,
    generator: String,
}

impl AtomPublisher {
    pub fn new(store: Arc<ArtifactStore>, generator: impl Into<String>) -> Self {
        Self {
            store,
            generator: generator.into(),
        }
    }
}

#[async_trait]
impl Publisher for AtomPublisher {
    fn format(&self) -> Format {
        Format::Atom
    }

    async fn publish(&self, snapshot: &Snapshot, timestamp: OffsetDateTime) -> Result<Vec<Url>> {
        let transport_ident = &snapshot.queue.transport_ident;
        let file_name = self.format().file_name();
        let self_url = self.store.url_for(transport_ident, file_name)?;
        let body = render(snapshot, timestamp, &self_url, &self.generator)
            .context("could not render the Atom feed")?;
        let url = self
            .store
            .put(transport_ident, file_name, snapshot.revision, body.as_bytes())
            .await?;

        Ok(vec![url])
    }
}
