//! Rawkuma scraper. The site is a WordPress theme without a public API.

use crate::config::SourceConfig;
use crate::error::{MangaTrackError, Result};
use crate::models::{Chapter, ChapterQuery, ChapterType, Manga, MangaSearchResult, MangaStatus};
use crate::sources::{attach_cover, attach_last_chapter, capture, parse_datetime};
use crate::traits::MangaSource;
use crate::utils::{HttpClient, ImageFetcher};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

const SOURCE_NAME: &str = "rawkuma.com";

pub struct RawkumaSource {
    http_client: HttpClient,
    images: ImageFetcher,
    site_url: String,
}

#[derive(Debug)]
struct MangaPage {
    name: String,
    cover_url: Option<String>,
    internal_id: String,
}

impl RawkumaSource {
    pub fn new(http_client: HttpClient, images: ImageFetcher, config: &SourceConfig) -> Self {
        Self {
            http_client,
            images,
            site_url: config.site_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetches a page, mapping a 404 to `not_found`.
    async fn page(&self, url: &str, not_found: impl FnOnce() -> MangaTrackError) -> Result<String> {
        match self.http_client.get_text(url).await {
            Err(MangaTrackError::HttpStatus { status: 404, .. }) => Err(not_found()),
            other => other,
        }
    }

    async fn manga_page(&self, manga_url: &str) -> Result<MangaPage> {
        let body = self
            .page(manga_url, || MangaTrackError::manga_not_found(manga_url))
            .await?;
        debug!("[RAWKUMA] HTML length: {}", body.len());
        parse_manga_page(&body, manga_url)
    }

    async fn manga_internal_id(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<String> {
        match manga_internal_id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(id.to_string()),
            None => Ok(self.manga_page(manga_url).await?.internal_id),
        }
    }

    async fn chapter_list(&self, manga_internal_id: &str) -> Result<Vec<Chapter>> {
        let id: u64 = manga_internal_id
            .parse()
            .map_err(|_| MangaTrackError::MangaHasNoIdOrUrl)?;
        if id == 0 {
            return Err(MangaTrackError::MangaHasNoIdOrUrl);
        }

        let url = format!(
            "{}/wp-admin/admin-ajax.php?page=1&action=chapter_list&manga_id={}",
            self.site_url, id
        );
        let body = self
            .page(&url, || MangaTrackError::chapter_not_found(format!("chapter list of manga '{id}'")))
            .await?;
        parse_chapter_list(&body)
    }
}

#[async_trait::async_trait]
impl MangaSource for RawkumaSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get_manga_metadata(&self, manga_url: &str, ignore_last_chapter_error: bool) -> Result<Manga> {
        info!("[RAWKUMA] Getting metadata of {}", manga_url);
        let page = self.manga_page(manga_url).await?;

        let mut manga = Manga::new(SOURCE_NAME, manga_url, &page.name, MangaStatus::Reading);
        manga.internal_id = page.internal_id.clone();

        let last_chapter = self.get_last_chapter_metadata(manga_url, Some(&page.internal_id)).await;
        attach_last_chapter(&mut manga, last_chapter, ignore_last_chapter_error)?;

        if let Some(cover_url) = page.cover_url.as_deref() {
            attach_cover(&self.images, &mut manga, cover_url).await;
        }

        Ok(manga)
    }

    async fn get_chapter_metadata(
        &self,
        _manga_url: &str,
        _manga_internal_id: Option<&str>,
        query: &ChapterQuery,
    ) -> Result<Chapter> {
        query.validate()?;
        let chapter_url = query
            .url()
            .ok_or_else(|| MangaTrackError::not_implemented("rawkuma chapter lookup without a chapter URL"))?;

        let body = self
            .page(chapter_url, || MangaTrackError::chapter_not_found(chapter_url))
            .await?;
        parse_chapter_page(&body, chapter_url)
    }

    async fn get_last_chapter_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Chapter> {
        // the chapter list is newest first
        self.get_chapters_metadata(manga_url, manga_internal_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MangaTrackError::chapter_not_found(format!("manga '{manga_url}' has no chapters")))
    }

    async fn get_chapters_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Vec<Chapter>> {
        let id = self.manga_internal_id(manga_url, manga_internal_id).await?;
        self.chapter_list(&id).await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<MangaSearchResult>> {
        let url = Url::parse_with_params(&format!("{}/", self.site_url), &[("s", term)])?;
        let body = self.http_client.get_text(url.as_str()).await?;
        parse_search_results(&body, limit)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| MangaTrackError::scraping(format!("invalid selector '{css}': {e}")))
}

fn text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Chapter label from texts like "Chapter 12.5".
fn chapter_label(name: &str) -> Option<String> {
    name.split_once("Chapter ")
        .map(|(_, label)| label.trim().to_string())
        .filter(|label| !label.is_empty())
}

fn parse_manga_page(body: &str, manga_url: &str) -> Result<MangaPage> {
    let internal_id = capture(r"wp-admin/admin-ajax\.php\?manga_id=(\d+)", body, "manga ID")?;

    let document = Html::parse_document(body);
    let name = document
        .select(&selector("h1[itemprop='name']")?)
        .next()
        .map(text)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| MangaTrackError::manga_not_found(manga_url))?;
    let cover_url = document
        .select(&selector("article img.wp-post-image")?)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::to_string);

    Ok(MangaPage { name, cover_url, internal_id })
}

fn parse_chapter_list(body: &str) -> Result<Vec<Chapter>> {
    let document = Html::parse_document(body);
    let span = selector("span")?;
    let time = selector("time")?;

    let mut chapters = Vec::new();
    for link in document.select(&selector("div#chapter-list > div > a")?) {
        let url = link.value().attr("href").unwrap_or_default().to_string();
        let name = link.select(&span).next().map(text).unwrap_or_default();
        let label = chapter_label(&name)
            .ok_or_else(|| MangaTrackError::scraping(format!("no chapter number in '{name}'")))?;
        let updated_at = parse_datetime(link.select(&time).next().and_then(|t| t.value().attr("datetime")));

        chapters.push(Chapter::new(url, label, name, updated_at, ChapterType::Upload));
    }
    Ok(chapters)
}

fn parse_chapter_page(body: &str, chapter_url: &str) -> Result<Chapter> {
    let document = Html::parse_document(body);
    let created = document
        .select(&selector("time[itemprop='dateCreated']")?)
        .next()
        .ok_or_else(|| MangaTrackError::chapter_not_found(chapter_url))?;

    let heading = created
        .parent()
        .into_iter()
        .flat_map(|parent| parent.children())
        .filter_map(ElementRef::wrap)
        .find(|sibling| sibling.value().name() == "div")
        .map(text)
        .unwrap_or_default();
    let label = chapter_label(&heading).ok_or_else(|| MangaTrackError::chapter_not_found(chapter_url))?;

    Ok(Chapter::new(
        chapter_url,
        label.clone(),
        format!("Chapter {label}"),
        parse_datetime(created.value().attr("datetime")),
        ChapterType::Upload,
    ))
}

fn parse_search_results(body: &str, limit: usize) -> Result<Vec<MangaSearchResult>> {
    let document = Html::parse_document(body);
    let img = selector("img")?;
    let last_chapter = selector("div.epxs")?;
    let status = selector("div.status, span.status")?;

    Ok(document
        .select(&selector("div.bsx > a")?)
        .take(limit)
        .map(|link| {
            let url = link.value().attr("href").unwrap_or_default().to_string();
            let last = link.select(&last_chapter).next().map(text).unwrap_or_default();
            let last = chapter_label(&last).unwrap_or(last);
            MangaSearchResult {
                name: link.value().attr("title").unwrap_or_default().trim().to_string(),
                source: SOURCE_NAME.to_string(),
                cover_url: link
                    .select(&img)
                    .next()
                    .and_then(|i| i.value().attr("src"))
                    .unwrap_or_default()
                    .to_string(),
                status: link.select(&status).next().map(text).unwrap_or_default(),
                last_chapter_url: if last.is_empty() { String::new() } else { url.clone() },
                last_chapter: last,
                url,
                ..MangaSearchResult::default()
            }
        })
        .collect())
}
