use std::fmt::{self, Display};
use std::str::FromStr;

use derive_more::From;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::Person;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid export config: {0}")]
pub struct InvalidConfig(pub String);

/// A syndication format the service can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Rss,
    Atom,
}

impl Format {
    pub const ALL: [Format; 2] = [Format::Rss, Format::Atom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Atom => "atom",
        }
    }

    /// The identifier a publisher of this format reports results under.
    pub fn publisher_ident(&self) -> &'static str {
        match self {
            Self::Rss => "RSS_20",
            Self::Atom => "ATOM_10",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Rss => "rss.xml",
            Self::Atom => "atom.xml",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Rss => "application/rss+xml",
            Self::Atom => "application/atom+xml",
        }
    }

    pub fn from_file_name(file_name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.file_name() == file_name)
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Format {
    type Err = InvalidConfig;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| InvalidConfig(format!("unknown format `{s}`")))
    }
}

/// How an incoming config is combined with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// PUT: the incoming value replaces the stored one; missing fields revert to defaults.
    Replace,

    /// PATCH: fields present in the incoming value overwrite; missing fields are kept.
    Merge,
}

fn parse_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, InvalidConfig> {
    serde_json::from_value(value).map_err(|e| InvalidConfig(e.to_string()))
}

fn patch<T>(dst: Option<T>, src: Option<T>) -> Option<T> {
    src.or(dst)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RssImage {
    pub url: Url,
    pub title: Option<String>,
    pub link: Option<Url>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RssConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managing_editor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_master: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<RssImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub itunes_author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean: Option<bool>,
}

impl RssConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.explicit == Some(true) && self.clean == Some(true) {
            return Err(InvalidConfig(
                "`explicit` and `clean` cannot both be set".into(),
            ));
        }

        if let Some(categories) = &self.categories {
            if categories.iter().any(|c| c.trim().is_empty()) {
                return Err(InvalidConfig("RSS categories must not be blank".into()));
            }
        }

        Ok(())
    }

    /// Overlays the fields present in `other` onto `self`. Nested values are replaced whole.
    pub fn merge(self, other: Self) -> Self {
        Self {
            enabled: patch(self.enabled, other.enabled),
            ttl: patch(self.ttl, other.ttl),
            docs: patch(self.docs, other.docs),
            managing_editor: patch(self.managing_editor, other.managing_editor),
            web_master: patch(self.web_master, other.web_master),
            categories: patch(self.categories, other.categories),
            image: patch(self.image, other.image),
            itunes_author: patch(self.itunes_author, other.itunes_author),
            explicit: patch(self.explicit, other.explicit),
            clean: patch(self.clean, other.clean),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AtomConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<Person>>,
}

impl AtomConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if let Some(authors) = &self.authors {
            if authors.iter().any(|a| a.name.trim().is_empty()) {
                return Err(InvalidConfig("Atom authors must have a name".into()));
            }
        }

        if let Some(categories) = &self.categories {
            if categories.iter().any(|c| c.trim().is_empty()) {
                return Err(InvalidConfig("Atom categories must not be blank".into()));
            }
        }

        Ok(())
    }

    /// Overlays the fields present in `other` onto `self`. Nested values are replaced whole.
    pub fn merge(self, other: Self) -> Self {
        Self {
            enabled: patch(self.enabled, other.enabled),
            icon: patch(self.icon, other.icon),
            logo: patch(self.logo, other.logo),
            subtitle: patch(self.subtitle, other.subtitle),
            rights: patch(self.rights, other.rights),
            categories: patch(self.categories, other.categories),
            authors: patch(self.authors, other.authors),
        }
    }
}

/// A config for a single format slot.
#[derive(From, Debug, Clone, PartialEq, Eq)]
pub enum FormatConfig {
    Rss(RssConfig),
    Atom(AtomConfig),
}

impl FormatConfig {
    /// Parses and validates a request payload for the given format.
    pub fn parse(format: Format, value: serde_json::Value) -> Result<Self, InvalidConfig> {
        let cfg: Self = match format {
            Format::Rss => parse_json::<RssConfig>(value)?.into(),
            Format::Atom => parse_json::<AtomConfig>(value)?.into(),
        };
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn format(&self) -> Format {
        match self {
            Self::Rss(_) => Format::Rss,
            Self::Atom(_) => Format::Atom,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        match self {
            Self::Rss(cfg) => cfg.validate(),
            Self::Atom(cfg) => cfg.validate(),
        }
    }
}

/// Per-queue rendering options. A missing slot means "use the format defaults".
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atom: Option<AtomConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss: Option<RssConfig>,
}

impl ExportConfig {
    /// Parses and validates a full export config payload.
    pub fn parse(value: serde_json::Value) -> Result<Self, InvalidConfig> {
        let cfg: Self = parse_json(value)?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if let Some(rss) = &self.rss {
            rss.validate()?;
        }

        if let Some(atom) = &self.atom {
            atom.validate()?;
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.atom.is_none() && self.rss.is_none()
    }

    /// Whether the format may be published. Only an explicit `enabled = false` disables it.
    pub fn is_enabled(cfg: Option<&Self>, format: Format) -> bool {
        let enabled = cfg.and_then(|cfg| match format {
            Format::Rss => cfg.rss.as_ref().and_then(|rss| rss.enabled),
            Format::Atom => cfg.atom.as_ref().and_then(|atom| atom.enabled),
        });

        enabled.unwrap_or(true)
    }

    /// Computes the effective config after applying a single-format update.
    pub fn resolve(stored: Option<&Self>, incoming: FormatConfig, mode: UpdateMode) -> Self {
        let mut result = stored.cloned().unwrap_or_default();

        match (incoming, mode) {
            (FormatConfig::Rss(rss), UpdateMode::Replace) => result.rss = Some(rss),
            (FormatConfig::Atom(atom), UpdateMode::Replace) => result.atom = Some(atom),

            (FormatConfig::Rss(rss), UpdateMode::Merge) => {
                result.rss = Some(match result.rss.take() {
                    Some(stored) => stored.merge(rss),
                    None => rss,
                });
            }

            (FormatConfig::Atom(atom), UpdateMode::Merge) => {
                result.atom = Some(match result.atom.take() {
                    Some(stored) => stored.merge(atom),
                    None => atom,
                });
            }
        }

        result
    }

    /// Computes the effective config after applying a whole-config update.
    pub fn resolve_all(stored: Option<&Self>, incoming: Self, mode: UpdateMode) -> Self {
        match mode {
            UpdateMode::Replace => incoming,

            UpdateMode::Merge => {
                let mut result = stored.cloned().unwrap_or_default();

                if let Some(rss) = incoming.rss {
                    result = Self::resolve(Some(&result), rss.into(), mode);
                }

                if let Some(atom) = incoming.atom {
                    result = Self::resolve(Some(&result), atom.into(), mode);
                }

                result
            }
        }
    }

    /// Drops one format slot, or everything when `format` is `None`.
    pub fn clear(stored: Option<Self>, format: Option<Format>) -> Option<Self> {
        let mut cfg = stored?;

        match format {
            None => return None,
            Some(Format::Rss) => cfg.rss = None,
            Some(Format::Atom) => cfg.atom = None,
        }

        (!cfg.is_empty()).then_some(cfg)
    }
}
