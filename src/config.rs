use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub images: ImageConfig,
    pub sources: SourcesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
    pub retry_initial_ms: u64,
    pub retry_max_elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub mangadex: SourceConfig,
    pub comick: SourceConfig,
    pub rawkuma: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub site_url: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub uploads_url: String,
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Defaults, then the TOML file at `path` (if given), then `MANGATRACK__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("MANGATRACK").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(&Config::default())?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite:data/mangatrack.db".to_string(),
                max_connections: 10,
            },
            http: HttpConfig {
                timeout_secs: 30,
                connect_timeout_secs: 10,
                user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:30.0) Gecko/20100101 Firefox/30.0"
                    .to_string(),
            },
            images: ImageConfig {
                width: 250,
                height: 355,
                retry_initial_ms: 1000,
                retry_max_elapsed_ms: 5000,
            },
            sources: SourcesConfig {
                mangadex: SourceConfig {
                    site_url: "https://mangadex.org".to_string(),
                    api_url: "https://api.mangadex.org".to_string(),
                    uploads_url: "https://uploads.mangadex.org".to_string(),
                    requests_per_second: Some(5),
                },
                comick: SourceConfig {
                    site_url: "https://comick.io".to_string(),
                    api_url: "https://api.comick.io".to_string(),
                    uploads_url: "https://meo.comick.pictures".to_string(),
                    requests_per_second: Some(3),
                },
                rawkuma: SourceConfig {
                    site_url: "https://rawkuma.com".to_string(),
                    api_url: String::new(),
                    uploads_url: String::new(),
                    requests_per_second: None,
                },
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "sqlite::memory:"

[sources.mangadex]
site_url = "https://mangadex.org"
api_url = "http://127.0.0.1:9999"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.sources.mangadex.api_url, "http://127.0.0.1:9999");
        assert_eq!(config.sources.mangadex.requests_per_second, Some(5));
        assert_eq!(config.images.width, 250);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn written_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.toml");
        Config::write_default(&path).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.sources.rawkuma.site_url, "https://rawkuma.com");
    }
}
