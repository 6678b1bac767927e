use crate::error::Result;
use crate::models::{Chapter, ChapterQuery, Manga, MangaSearchResult};

/// Adapter that turns one external site or API into canonical manga and chapters.
#[async_trait::async_trait]
pub trait MangaSource: Send + Sync {
    /// Name the source stamps on its mangas (usually its domain).
    fn name(&self) -> &str;

    /// Metadata of the manga at `manga_url`, including its last upload chapter.
    ///
    /// With `ignore_last_chapter_error`, a manga whose last chapter can't be
    /// fetched (e.g. nothing released yet) is returned without one.
    async fn get_manga_metadata(&self, manga_url: &str, ignore_last_chapter_error: bool) -> Result<Manga>;

    /// A single chapter, looked up by whichever keys of `query` the source supports.
    /// Unsupported lookup modes fail with `NotImplemented`.
    async fn get_chapter_metadata(
        &self,
        manga_url: &str,
        manga_internal_id: Option<&str>,
        query: &ChapterQuery,
    ) -> Result<Chapter>;

    async fn get_last_chapter_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Chapter>;

    async fn get_chapters_metadata(&self, manga_url: &str, manga_internal_id: Option<&str>) -> Result<Vec<Chapter>>;

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<MangaSearchResult>>;
}
