use crate::config::Config;
use crate::error::{MangaTrackError, Result};
use crate::models::{Chapter, ChapterQuery, Manga, MangaSearchResult};
use crate::sources::comick::ComickSource;
use crate::sources::mangadex::MangaDexSource;
use crate::sources::rawkuma::RawkumaSource;
use crate::traits::MangaSource;
use crate::utils::{HttpClient, ImageFetcher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// Maps source domains to adapters and forwards requests by manga URL.
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<dyn MangaSource>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in adapters, configured from `config`.
    pub async fn with_default_sources(config: &Config) -> Result<Self> {
        let http_client = HttpClient::new(&config.http)?;
        let images = ImageFetcher::new(http_client.clone(), config.images.clone());
        let sources = &config.sources;

        let registry = Self::new();
        registry
            .register_source(
                "mangadex.org",
                Arc::new(MangaDexSource::new(
                    http_client.with_rate_limit(sources.mangadex.requests_per_second),
                    images.clone(),
                    &sources.mangadex,
                )),
            )
            .await;
        registry
            .register_source(
                "comick.io",
                Arc::new(ComickSource::new(
                    http_client.with_rate_limit(sources.comick.requests_per_second),
                    images.clone(),
                    &sources.comick,
                )),
            )
            .await;
        registry
            .register_source(
                "rawkuma.com",
                Arc::new(RawkumaSource::new(
                    http_client.with_rate_limit(sources.rawkuma.requests_per_second),
                    images,
                    &sources.rawkuma,
                )),
            )
            .await;

        Ok(registry)
    }

    pub async fn register_source(&self, domain: &str, source: Arc<dyn MangaSource>) {
        info!("Registering source '{}'", domain);
        self.sources
            .write()
            .await
            .insert(domain.to_lowercase(), source);
    }

    pub async fn delete_source(&self, domain: &str) -> Option<Arc<dyn MangaSource>> {
        self.sources.write().await.remove(&domain.to_lowercase())
    }

    pub async fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The adapter registered under `name`.
    pub async fn get_source(&self, name: &str) -> Result<Arc<dyn MangaSource>> {
        self.sources
            .read()
            .await
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| MangaTrackError::source_not_found(name))
    }

    /// Resolves the adapter for `manga_url` by its host, returning the matched domain too.
    ///
    /// An exact domain match wins; otherwise the longest registered domain the
    /// host is a subdomain of (so `www.` and regional subdomains resolve).
    pub async fn source_for_url(&self, manga_url: &str) -> Result<(String, Arc<dyn MangaSource>)> {
        let host = url_host(manga_url)?;
        let sources = self.sources.read().await;

        if let Some(source) = sources.get(&host) {
            return Ok((host, source.clone()));
        }

        let mut candidates: Vec<(&String, &Arc<dyn MangaSource>)> = sources
            .iter()
            .filter(|(domain, _)| is_subdomain_of(&host, domain))
            .collect();
        // longest domain first so "sub.site.com" beats "site.com"
        candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let (domain, source) = candidates
            .into_iter()
            .next()
            .ok_or_else(|| MangaTrackError::source_not_found(host.clone()))?;
        debug!("URL '{}' resolved to source '{}'", manga_url, domain);
        Ok((domain.clone(), source.clone()))
    }

    pub async fn get_manga_metadata(&self, manga_url: &str, ignore_last_chapter_error: bool) -> Result<Manga> {
        let (domain, source) = self.source_for_url(manga_url).await?;
        source
            .get_manga_metadata(manga_url, ignore_last_chapter_error)
            .await
            .map_err(|e| {
                e.context(format!(
                    "({domain}) error while getting metadata of manga with URL '{manga_url}'"
                ))
            })
    }

    pub async fn get_chapter_metadata(
        &self,
        manga_url: &str,
        manga_internal_id: Option<&str>,
        query: &ChapterQuery,
    ) -> Result<Chapter> {
        query.validate()?;
        let (domain, source) = self.source_for_url(manga_url).await?;
        source
            .get_chapter_metadata(manga_url, manga_internal_id, query)
            .await
            .map_err(|e| {
                e.context(format!(
                    "({domain}) error while getting chapter metadata ({query}) of manga with URL '{manga_url}'"
                ))
            })
    }

    pub async fn get_last_chapter_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Chapter> {
        let (domain, source) = self.source_for_url(manga_url).await?;
        source
            .get_last_chapter_metadata(manga_url, manga_internal_id)
            .await
            .map_err(|e| {
                e.context(format!(
                    "({domain}) error while getting last chapter metadata of manga with URL '{manga_url}'"
                ))
            })
    }

    pub async fn get_chapters_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Vec<Chapter>> {
        let (domain, source) = self.source_for_url(manga_url).await?;
        source
            .get_chapters_metadata(manga_url, manga_internal_id)
            .await
            .map_err(|e| {
                e.context(format!(
                    "({domain}) error while getting chapters metadata of manga with URL '{manga_url}'"
                ))
            })
    }

    pub async fn search(&self, source_name: &str, term: &str, limit: usize) -> Result<Vec<MangaSearchResult>> {
        let source = self.get_source(source_name).await?;
        source
            .search(term, limit)
            .await
            .map_err(|e| e.context(format!("({source_name}) error while searching manga '{term}'")))
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_subdomain_of(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn url_host(manga_url: &str) -> Result<String> {
    let parsed = Url::parse(manga_url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| MangaTrackError::source_not_found(manga_url))?
        .to_lowercase();
    Ok(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}
