mod types;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use take_mut::take;
use tracing::{debug, info};
use url::Url;

use crate::model::Format;

pub use self::types::*;

fn default_publish_timeout() -> Duration {
    Config::default().publish_timeout
}

fn default_publishers() -> Vec<Format> {
    Config::default().publishers
}

fn default_public_url() -> Url {
    Config::default().public_url
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub output_dir: PathBuf,

    #[serde(default = "default_public_url")]
    pub public_url: Url,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: Duration,

    #[serde(default = "default_publishers")]
    pub publishers: Vec<Format>,
}

impl Config {
    pub fn update(&mut self, args: crate::cli::Args) {
        fn set_if_some<T>(dst: &mut T, v: Option<T>) {
            if let Some(v) = v {
                *dst = v;
            }
        }

        set_if_some(&mut self.bind_addr, args.bind_addr);
        set_if_some(&mut self.db_path, args.db_path);
        set_if_some(&mut self.output_dir, args.output_dir);
        set_if_some(&mut self.public_url, args.public_url);
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        let config_dir = config_dir.as_ref();

        // rebuild the whole struct so that a new path field can't be forgotten here.
        take(self, |this| Self {
            bind_addr: this.bind_addr,
            db_path: config_dir.join(this.db_path),
            output_dir: config_dir.join(this.output_dir),
            public_url: this.public_url,
            publish_timeout: this.publish_timeout,
            publishers: this.publishers,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:20655".into(),
            db_path: "./feedqueue.sqlite3".into(),
            output_dir: "./feeds".into(),
            public_url: Url::parse("http://127.0.0.1:20655/").expect("the default URL is valid"),
            publish_timeout: Duration::from_secs(30),
            publishers: Format::ALL.to_vec(),
        }
    }
}

pub fn load(search_paths: &[PathBuf]) -> Result<Config> {
    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not load a config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of a config file `{}`",
                    path.display()
                )
            })?;
        }

        let mut cfg = parse(&contents)
            .with_context(|| anyhow!("could not load the config file `{}`", path.display()))?;

        if let Some(parent) = path.parent() {
            cfg.resolve_relative_paths(parent);
        }

        info!("Loaded a config file `{}`", path.display());

        return Ok(cfg);
    }

    info!("Using the default config");

    Ok(Default::default())
}

fn parse(contents: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(contents)?;

    if cfg.publishers.is_empty() {
        return Err(anyhow!("at least one publisher must be enabled"));
    }

    for (i, format) in cfg.publishers.iter().enumerate() {
        if cfg.publishers[..i].contains(format) {
            return Err(anyhow!("publisher `{}` is listed more than once", format.as_str()));
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse(
            r#"
            bind-addr = "0.0.0.0:8080"
            db-path = "queue.sqlite3"
            output-dir = "out"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.publishers, [Format::Rss, Format::Atom]);
        assert_eq!(
            std::time::Duration::from(cfg.publish_timeout),
            std::time::Duration::from_secs(30)
        );
    }

    #[test]
    fn full_config() {
        let cfg = parse(
            r#"
            bind-addr = "0.0.0.0:8080"
            db-path = "/var/lib/feedqueue/db.sqlite3"
            output-dir = "/var/lib/feedqueue/feeds"
            public-url = "https://feeds.example.com/"
            publish-timeout = "1m 30s"
            publishers = ["atom"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.public_url.as_str(), "https://feeds.example.com/");
        assert_eq!(
            std::time::Duration::from(cfg.publish_timeout),
            std::time::Duration::from_secs(90)
        );
        assert_eq!(cfg.publishers, [Format::Atom]);
    }

    #[test]
    fn rejects_bad_configs() {
        let base = r#"
            bind-addr = "0.0.0.0:8080"
            db-path = "db.sqlite3"
            output-dir = "out"
        "#;

        assert!(parse(&format!("{base}\nfetch-interval = 5")).is_err());
        assert!(parse(&format!("{base}\npublishers = []")).is_err());
        assert!(parse(&format!("{base}\npublishers = [\"json\"]")).is_err());

        let duplicated = format!("{base}\npublishers = [\"rss\", \"atom\", \"rss\"]");
        let err = parse(&duplicated).unwrap_err();
        assert_eq!(err.to_string(), "publisher `rss` is listed more than once");
        assert_eq!(
            parse(&format!("{base}\npublishers = [\"atom\"]")).unwrap().publishers,
            [Format::Atom]
        );
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedqueue.toml");
        fs::write(
            &path,
            r#"
            bind-addr = "127.0.0.1:1"
            db-path = "db.sqlite3"
            output-dir = "/srv/feeds"
            "#,
        )
        .unwrap();

        let cfg = load(&[dir.path().join("missing.toml"), path]).unwrap();

        assert_eq!(cfg.db_path, dir.path().join("db.sqlite3"));
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/feeds"));
    }

    #[test]
    fn falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&[dir.path().join("missing.toml")]).unwrap();

        assert_eq!(cfg.bind_addr, Config::default().bind_addr);
    }
}
