//! Comick REST API adapter.

use crate::config::SourceConfig;
use crate::error::{ErrorContext, MangaTrackError, Result};
use crate::models::{Chapter, ChapterQuery, ChapterType, Manga, MangaSearchResult, MangaStatus};
use crate::pipeline::{self, ChapterFeed, FeedPage, PageCursor, Pagination};
use crate::sources::{attach_cover, attach_last_chapter, capture, label_and_name, parse_datetime};
use crate::traits::MangaSource;
use crate::utils::{HttpClient, ImageFetcher};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

const SOURCE_NAME: &str = "comick.io";

pub struct ComickSource {
    api: Api,
    images: ImageFetcher,
}

#[derive(Clone)]
struct Api {
    client: HttpClient,
    api_url: String,
    site_url: String,
    uploads_url: String,
}

impl Api {
    async fn comic(&self, slug: &str) -> Result<Comic> {
        let url = format!("{}/comic/{}", self.api_url, slug);
        let resp: ComicResponse = self
            .client
            .get_json(&url)
            .await
            .with_context(|| format!("error while getting comic '{slug}'"))?;
        Ok(resp.comic)
    }

    async fn chapters(&self, hid: &str, params: &[(&str, &str)]) -> Result<ChaptersResponse> {
        let url = Url::parse_with_params(
            &format!("{}/comic/{}/chapters", self.api_url, hid),
            [("lang", "en")].iter().chain(params),
        )?;
        self.client.get_json(url.as_str()).await
    }
}

/// Page-numbered chapter feed of one comic. The feed ends with an empty page.
struct Feed {
    api: Api,
    hid: String,
    manga_url: String,
}

#[async_trait::async_trait]
impl ChapterFeed for Feed {
    async fn fetch_page(&self, cursor: PageCursor) -> Result<FeedPage> {
        let page = match cursor {
            PageCursor::Page(page) => page,
            PageCursor::Offset { offset, limit } => offset / limit.max(1) + 1,
        };
        let page = page.to_string();
        let resp = self.api.chapters(&self.hid, &[("page", page.as_str())]).await?;
        Ok(FeedPage {
            chapters: resp
                .chapters
                .iter()
                .map(|c| chapter_from_resp(c, "", &self.manga_url))
                .collect(),
            total: resp.total,
        })
    }
}

impl ComickSource {
    pub fn new(http_client: HttpClient, images: ImageFetcher, config: &SourceConfig) -> Self {
        Self {
            api: Api {
                client: http_client,
                api_url: config.api_url.trim_end_matches('/').to_string(),
                site_url: config.site_url.trim_end_matches('/').to_string(),
                uploads_url: config.uploads_url.trim_end_matches('/').to_string(),
            },
            images,
        }
    }

    /// The comic's HID, from the caller when known or looked up by slug.
    async fn manga_hid(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<String> {
        match manga_internal_id.filter(|id| !id.is_empty()) {
            Some(hid) => Ok(hid.to_string()),
            None => Ok(self.api.comic(&manga_slug(manga_url)?).await?.hid),
        }
    }
}

#[async_trait::async_trait]
impl MangaSource for ComickSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get_manga_metadata(&self, manga_url: &str, ignore_last_chapter_error: bool) -> Result<Manga> {
        info!("[COMICK] Getting metadata of {}", manga_url);
        let comic = self.api.comic(&manga_slug(manga_url)?).await?;

        let mut manga = Manga::new(SOURCE_NAME, manga_url, comic.title.trim(), MangaStatus::Reading);
        manga.internal_id = comic.hid.clone();

        let last_chapter = self.get_last_chapter_metadata(manga_url, Some(&comic.hid)).await;
        attach_last_chapter(&mut manga, last_chapter, ignore_last_chapter_error)?;

        match comic.cover_key() {
            Some(key) => {
                let cover_url = format!("{}/{}", self.api.uploads_url, key);
                attach_cover(&self.images, &mut manga, &cover_url).await;
            }
            None => warn!("[COMICK] manga '{}' has no cover", manga_url),
        }

        Ok(manga)
    }

    async fn get_chapter_metadata(
        &self,
        manga_url: &str,
        manga_internal_id: Option<&str>,
        query: &ChapterQuery,
    ) -> Result<Chapter> {
        query.validate()?;

        let chapter_hid = query
            .internal_id()
            .map(str::to_string)
            .or_else(|| query.url().map(chapter_hid));
        if let Some(hid) = chapter_hid {
            let url = format!("{}/chapter/{}", self.api.api_url, hid);
            let by_url: Result<ChapterResponse> = self.api.client.get_json(&url).await;
            match (by_url, query.chapter()) {
                (Ok(resp), _) => return Ok(chapter_from_resp(&resp.chapter, query.chapter().unwrap_or_default(), manga_url)),
                // the label is a less reliable key, only used when the URL lookup failed
                (Err(err), Some(_)) => warn!("[COMICK] chapter lookup by URL failed, trying label: {}", err),
                (Err(err), None) => return Err(err),
            }
        }

        let label = query
            .chapter()
            .ok_or_else(|| MangaTrackError::validation("chapter doesn't have a chapter or URL"))?;
        let hid = self.manga_hid(manga_url, manga_internal_id).await?;
        let resp = self.api.chapters(&hid, &[("limit", "1"), ("chap", label)]).await?;
        resp.chapters
            .first()
            .map(|c| chapter_from_resp(c, label, manga_url))
            .ok_or_else(|| MangaTrackError::chapter_not_found(format!("chapter '{label}' of manga '{manga_url}'")))
    }

    async fn get_last_chapter_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Chapter> {
        let hid = self.manga_hid(manga_url, manga_internal_id).await?;
        // default order is chapter descending
        let resp = self.api.chapters(&hid, &[("limit", "1")]).await?;
        resp.chapters
            .first()
            .map(|c| chapter_from_resp(c, "", manga_url))
            .ok_or_else(|| MangaTrackError::chapter_not_found(format!("manga '{manga_url}' has no chapters")))
    }

    async fn get_chapters_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Vec<Chapter>> {
        let feed = Feed {
            api: self.api.clone(),
            hid: self.manga_hid(manga_url, manga_internal_id).await?,
            manga_url: manga_url.to_string(),
        };
        pipeline::generate_chapters(Arc::new(feed), manga_url, Pagination::Pages { first: 1 }).await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<MangaSearchResult>> {
        let limit = limit.to_string();
        let url = Url::parse_with_params(
            &format!("{}/v1.0/search", self.api.api_url),
            &[("q", term), ("limit", limit.as_str())],
        )?;
        let items: Vec<SearchItem> = self.api.client.get_json(url.as_str()).await?;

        Ok(items
            .into_iter()
            .map(|item| MangaSearchResult {
                url: format!("{}/comic/{}", self.api.site_url, item.slug),
                name: item.title.clone(),
                source: SOURCE_NAME.to_string(),
                cover_url: item
                    .md_covers
                    .iter()
                    .find_map(|c| c.b2key.as_deref())
                    .map(|key| format!("{}/{}", self.api.uploads_url, key))
                    .unwrap_or_default(),
                description: item.desc.clone().unwrap_or_default(),
                status: status_name(item.status).to_string(),
                last_chapter: item.last_chapter.map(format_chapter_number).unwrap_or_default(),
                last_chapter_url: String::new(),
                year: item.year,
            })
            .collect())
    }
}

/// Slug of a comic URL like `https://comick.io/comic/00-jujutsu-kaisen`.
fn manga_slug(manga_url: &str) -> Result<String> {
    capture(r"^https?://comick\.[^/]+/comic/([^/?#]+)", manga_url, "manga slug")
}

/// HID of a chapter URL like `.../comic/slug/PZKrW` or `.../comic/slug/PZKrW-chapter-121-en`.
fn chapter_hid(chapter_url: &str) -> String {
    let last = chapter_url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    last.split('-').next().unwrap_or_default().to_string()
}

fn chapter_from_resp(resp: &ChapterResp, fallback_label: &str, manga_url: &str) -> Chapter {
    let (label, name) = label_and_name(resp.chap.as_deref(), resp.title.as_deref(), fallback_label);
    Chapter::new(
        format!("{}/{}", manga_url.trim_end_matches('/'), resp.hid),
        label,
        name,
        parse_datetime(resp.created_at.as_deref()),
        ChapterType::Upload,
    )
    .with_internal_id(&resp.hid)
}

fn status_name(status: Option<i32>) -> &'static str {
    match status {
        Some(1) => "Ongoing",
        Some(2) => "Completed",
        Some(3) => "Cancelled",
        Some(4) => "Hiatus",
        _ => "",
    }
}

fn format_chapter_number(number: f64) -> String {
    if number.fract() == 0.0 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ComicResponse {
    comic: Comic,
}

#[derive(Debug, Deserialize)]
struct Comic {
    title: String,
    hid: String,
    #[serde(default)]
    md_covers: Vec<MdCover>,
}

impl Comic {
    fn cover_key(&self) -> Option<&str> {
        self.md_covers.iter().find_map(|c| c.b2key.as_deref().filter(|k| !k.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct MdCover {
    b2key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChaptersResponse {
    #[serde(default)]
    chapters: Vec<ChapterResp>,
    total: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    chapter: ChapterResp,
}

#[derive(Debug, Deserialize)]
struct ChapterResp {
    chap: Option<String>,
    title: Option<String>,
    created_at: Option<String>,
    hid: String,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    slug: String,
    title: String,
    desc: Option<String>,
    status: Option<i32>,
    year: Option<i32>,
    last_chapter: Option<f64>,
    #[serde(default)]
    md_covers: Vec<MdCover>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::utils::test_support::{http_client, image_fetcher};
    use mockito::{Matcher, Server};
    use serde_json::json;

    const MANGA_URL: &str = "https://comick.io/comic/00-jujutsu-kaisen";

    fn source(server: &Server) -> ComickSource {
        let mut config = Config::default().sources.comick;
        config.api_url = server.url();
        config.uploads_url = server.url();
        ComickSource::new(http_client(), image_fetcher(), &config)
    }

    fn chapter(hid: &str, chap: &str, title: Option<&str>) -> serde_json::Value {
        json!({"hid": hid, "chap": chap, "title": title, "created_at": "2023-10-08T14:46:12Z"})
    }

    async fn mock_comic(server: &mut Server) -> mockito::Mock {
        server
            .mock("GET", "/comic/00-jujutsu-kaisen")
            .with_body(
                json!({"comic": {"title": "Jujutsu Kaisen", "hid": "TA22I5O7", "md_covers": [{"b2key": null}, {"b2key": "cover.jpg"}]}})
                    .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn manga_metadata_uses_hid_for_last_chapter() {
        let mut server = Server::new_async().await;
        let _comic = mock_comic(&mut server).await;
        let _last = server
            .mock("GET", "/comic/TA22I5O7/chapters")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lang".into(), "en".into()),
                Matcher::UrlEncoded("limit".into(), "1".into()),
            ]))
            .with_body(json!({"chapters": [chapter("XyZ12", "271", None)], "total": 271}).to_string())
            .create_async()
            .await;
        // cover is missing on the CDN: metadata still succeeds
        let _cover = server.mock("GET", "/cover.jpg").with_status(404).create_async().await;

        let manga = source(&server).get_manga_metadata(MANGA_URL, false).await.unwrap();
        assert_eq!(manga.name, "Jujutsu Kaisen");
        assert_eq!(manga.internal_id, "TA22I5O7");
        assert_eq!(manga.cover_img_url, format!("{}/cover.jpg", server.url()));
        assert!(manga.cover_img.is_empty());
        let last = manga.last_upload_chapter.unwrap();
        assert_eq!(last.chapter, "271");
        assert_eq!(last.url, "https://comick.io/comic/00-jujutsu-kaisen/XyZ12");
        assert_eq!(last.updated_at.to_rfc3339(), "2023-10-08T14:46:12+00:00");
    }

    #[tokio::test]
    async fn chapters_walk_pages_until_empty() {
        let mut server = Server::new_async().await;
        let _comic = mock_comic(&mut server).await;
        let pages = [
            json!({"chapters": [chapter("a", "3", None), chapter("b", "2", Some("Two"))]}),
            json!({"chapters": [chapter("b2", "2", None), chapter("c", "1", None)]}),
            json!({"chapters": []}),
        ];
        let mut mocks = Vec::new();
        for (i, body) in pages.iter().enumerate() {
            mocks.push(
                server
                    .mock("GET", "/comic/TA22I5O7/chapters")
                    .match_query(Matcher::UrlEncoded("page".into(), (i + 1).to_string()))
                    .with_body(body.to_string())
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let chapters = source(&server).get_chapters_metadata(MANGA_URL, None).await.unwrap();
        let labels: Vec<_> = chapters.iter().map(|c| c.chapter.as_str()).collect();
        assert_eq!(labels, ["3", "2", "1"]);
        assert_eq!(chapters[1].name, "Two");
        assert_eq!(chapters[1].internal_id, "b");
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn chapter_lookup_falls_back_to_label() {
        let mut server = Server::new_async().await;
        let _by_hid = server
            .mock("GET", "/chapter/PZKrW")
            .with_status(404)
            .create_async()
            .await;
        let _by_label = server
            .mock("GET", "/comic/TA22I5O7/chapters")
            .match_query(Matcher::UrlEncoded("chap".into(), "121".into()))
            .with_body(json!({"chapters": [chapter("Q9", "121", None)]}).to_string())
            .create_async()
            .await;

        let query = ChapterQuery {
            chapter: Some("121".into()),
            url: Some(format!("{MANGA_URL}/PZKrW-chapter-121-en")),
            internal_id: None,
        };
        let chapter = source(&server)
            .get_chapter_metadata(MANGA_URL, Some("TA22I5O7"), &query)
            .await
            .unwrap();
        assert_eq!(chapter.chapter, "121");
        assert_eq!(chapter.url, format!("{MANGA_URL}/Q9"));

        let err = source(&server)
            .get_chapter_metadata(MANGA_URL, Some("TA22I5O7"), &ChapterQuery::by_url(format!("{MANGA_URL}/PZKrW")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn chapter_label_is_query_encoded() {
        let mut server = Server::new_async().await;
        let _by_label = server
            .mock("GET", "/comic/TA22I5O7/chapters")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lang".into(), "en".into()),
                Matcher::UrlEncoded("limit".into(), "1".into()),
                Matcher::UrlEncoded("chap".into(), "5 & 6".into()),
            ]))
            .with_body(json!({"chapters": [chapter("Q56", "5 & 6", None)]}).to_string())
            .create_async()
            .await;

        let chapter = source(&server)
            .get_chapter_metadata(MANGA_URL, Some("TA22I5O7"), &ChapterQuery::by_chapter("5 & 6"))
            .await
            .unwrap();
        assert_eq!(chapter.chapter, "5 & 6");
        assert_eq!(chapter.url, format!("{MANGA_URL}/Q56"));
    }

    #[tokio::test]
    async fn search_results() {
        let mut server = Server::new_async().await;
        let _search = server
            .mock("GET", "/v1.0/search")
            .match_query(Matcher::UrlEncoded("q".into(), "jujutsu".into()))
            .with_body(
                json!([{
                    "slug": "00-jujutsu-kaisen",
                    "title": "Jujutsu Kaisen",
                    "desc": "Curses.",
                    "status": 2,
                    "year": 2018,
                    "last_chapter": 271.0,
                    "md_covers": [{"b2key": "k.jpg"}]
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let results = source(&server).search("jujutsu", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, MANGA_URL);
        assert_eq!(results[0].status, "Completed");
        assert_eq!(results[0].last_chapter, "271");
        assert_eq!(results[0].cover_url, format!("{}/k.jpg", server.url()));
    }

    #[test]
    fn url_parsing() {
        assert_eq!(manga_slug("https://comick.io/comic/00-jujutsu-kaisen/XyZ").unwrap(), "00-jujutsu-kaisen");
        assert!(manga_slug("https://mangadex.org/title/x").is_err());
        assert_eq!(chapter_hid("https://comick.io/comic/slug/PZKrW-chapter-121-en"), "PZKrW");
        assert_eq!(chapter_hid("https://comick.io/comic/slug/PZKrW"), "PZKrW");
        assert_eq!(format_chapter_number(12.5), "12.5");
    }
}
