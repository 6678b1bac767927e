use crate::error::{MangaTrackError, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reading status shared by a manga (or by every member of a multimanga).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
#[repr(i16)]
pub enum MangaStatus {
    Reading = 1,
    Completed = 2,
    OnHold = 3,
    Dropped = 4,
    PlanToRead = 5,
}

impl TryFrom<i16> for MangaStatus {
    type Error = MangaTrackError;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Reading),
            2 => Ok(Self::Completed),
            3 => Ok(Self::OnHold),
            4 => Ok(Self::Dropped),
            5 => Ok(Self::PlanToRead),
            _ => Err(MangaTrackError::validation(
                "status should be >= 1 && <= 5",
            )),
        }
    }
}

impl From<MangaStatus> for i16 {
    fn from(status: MangaStatus) -> Self {
        status as i16
    }
}

impl fmt::Display for MangaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MangaStatus::Reading => write!(f, "Reading"),
            MangaStatus::Completed => write!(f, "Completed"),
            MangaStatus::OnHold => write!(f, "On Hold"),
            MangaStatus::Dropped => write!(f, "Dropped"),
            MangaStatus::PlanToRead => write!(f, "Plan to Read"),
        }
    }
}

/// Which slot a chapter fills. Stored as the integer code in `chapters.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
#[repr(i16)]
pub enum ChapterType {
    Upload = 1,
    Read = 2,
}

impl TryFrom<i16> for ChapterType {
    type Error = MangaTrackError;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Upload),
            2 => Ok(Self::Read),
            _ => Err(MangaTrackError::validation(
                "chapter type should be 1 (last upload) or 2 (last read)",
            )),
        }
    }
}

impl From<ChapterType> for i16 {
    fn from(chapter_type: ChapterType) -> Self {
        chapter_type as i16
    }
}

/// Standalone mangas are tracked on their own; members belong to a multimanga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
#[repr(i16)]
pub enum MangaType {
    Standalone = 1,
    Member = 2,
}

impl TryFrom<i16> for MangaType {
    type Error = MangaTrackError;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Standalone),
            2 => Ok(Self::Member),
            _ => Err(MangaTrackError::validation("manga type should be 1 or 2")),
        }
    }
}

impl From<MangaType> for i16 {
    fn from(manga_type: MangaType) -> Self {
        manga_type as i16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub url: String,
    /// Chapter label as the source shows it. Not always numeric ("60-End").
    pub chapter: String,
    pub name: String,
    #[serde(default)]
    pub internal_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub chapter_type: ChapterType,
}

impl Chapter {
    pub fn new(
        url: impl Into<String>,
        chapter: impl Into<String>,
        name: impl Into<String>,
        updated_at: DateTime<Utc>,
        chapter_type: ChapterType,
    ) -> Self {
        Self {
            url: url.into(),
            chapter: chapter.into(),
            name: name.into(),
            internal_id: String::new(),
            updated_at: truncate_to_second(updated_at),
            chapter_type,
        }
    }

    pub fn with_internal_id(mut self, internal_id: impl Into<String>) -> Self {
        self.internal_id = internal_id.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(MangaTrackError::validation("chapter URL can't be empty"));
        }
        if self.chapter.is_empty() {
            return Err(MangaTrackError::validation("chapter chapter can't be empty"));
        }
        if self.name.is_empty() {
            return Err(MangaTrackError::validation("chapter name can't be empty"));
        }
        Ok(())
    }

    fn validate_as(&self, expected: ChapterType, slot: &str) -> Result<()> {
        self.validate()
            .map_err(|e| e.context(format!("invalid {slot}")))?;
        if self.chapter_type != expected {
            return Err(MangaTrackError::validation(format!(
                "{slot} should be of type {}",
                i16::from(expected)
            )));
        }
        Ok(())
    }
}

/// Chapter timestamps are kept at second precision so they survive a store round-trip.
pub fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}

/// Selects a stored manga row: by ID when the manga has one, otherwise by URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MangaKey<'a> {
    Id(i64),
    Url(&'a str),
}

impl fmt::Display for MangaKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MangaKey::Id(id) => write!(f, "ID '{id}'"),
            MangaKey::Url(url) => write!(f, "URL '{url}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manga {
    /// Assigned by the store; `None` until inserted.
    pub id: Option<i64>,
    pub source: String,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub internal_id: String,
    pub status: MangaStatus,
    #[serde(default = "default_manga_type")]
    pub manga_type: MangaType,
    #[serde(default)]
    pub cover_img: Vec<u8>,
    #[serde(default)]
    pub cover_img_resized: bool,
    #[serde(default)]
    pub cover_img_url: String,
    /// Set when the cover was chosen by the user; metadata refreshes keep it.
    #[serde(default)]
    pub cover_img_fixed: bool,
    pub preferred_group: Option<String>,
    pub last_upload_chapter: Option<Chapter>,
    pub last_read_chapter: Option<Chapter>,
}

fn default_manga_type() -> MangaType {
    MangaType::Standalone
}

impl Manga {
    pub fn new(
        source: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
        status: MangaStatus,
    ) -> Self {
        Self {
            id: None,
            source: source.into(),
            url: url.into(),
            name: name.into(),
            internal_id: String::new(),
            status,
            manga_type: MangaType::Standalone,
            cover_img: Vec::new(),
            cover_img_resized: false,
            cover_img_url: String::new(),
            cover_img_fixed: false,
            preferred_group: None,
            last_upload_chapter: None,
            last_read_chapter: None,
        }
    }

    pub fn key(&self) -> Result<MangaKey<'_>> {
        match self.id {
            Some(id) if id > 0 => Ok(MangaKey::Id(id)),
            _ if !self.url.is_empty() => Ok(MangaKey::Url(&self.url)),
            _ => Err(MangaTrackError::MangaHasNoIdOrUrl),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(MangaTrackError::validation("manga source can't be empty"));
        }
        if self.url.is_empty() {
            return Err(MangaTrackError::validation("manga URL can't be empty"));
        }
        if self.name.is_empty() {
            return Err(MangaTrackError::validation("manga name can't be empty"));
        }
        if let Some(chapter) = &self.last_upload_chapter {
            chapter.validate_as(ChapterType::Upload, "last upload chapter")?;
        }
        if let Some(chapter) = &self.last_read_chapter {
            chapter.validate_as(ChapterType::Read, "last read chapter")?;
        }
        Ok(())
    }

    pub fn chapter(&self, chapter_type: ChapterType) -> Option<&Chapter> {
        match chapter_type {
            ChapterType::Upload => self.last_upload_chapter.as_ref(),
            ChapterType::Read => self.last_read_chapter.as_ref(),
        }
    }

    pub(crate) fn set_chapter(&mut self, chapter: Chapter) {
        match chapter.chapter_type {
            ChapterType::Upload => self.last_upload_chapter = Some(chapter),
            ChapterType::Read => self.last_read_chapter = Some(chapter),
        }
    }

    /// True when the last uploaded chapter differs from the last one read.
    pub fn has_unread_chapter(&self) -> bool {
        match (&self.last_upload_chapter, &self.last_read_chapter) {
            (Some(upload), Some(read)) => upload.chapter != read.chapter,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// One tracked series followed on several sources, with one active ("current") source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiManga {
    pub id: Option<i64>,
    pub status: MangaStatus,
    /// URL of the member that is the active source.
    pub current_manga_url: String,
    pub mangas: Vec<Manga>,
    pub last_read_chapter: Option<Chapter>,
    #[serde(default)]
    pub cover_img: Vec<u8>,
    #[serde(default)]
    pub cover_img_resized: bool,
    #[serde(default)]
    pub cover_img_url: String,
    /// When unset the current manga's cover stands in for the multimanga's own.
    #[serde(default)]
    pub cover_img_fixed: bool,
}

impl MultiManga {
    pub fn new(status: MangaStatus, mangas: Vec<Manga>, current_manga_url: impl Into<String>) -> Self {
        Self {
            id: None,
            status,
            current_manga_url: current_manga_url.into(),
            mangas,
            last_read_chapter: None,
            cover_img: Vec::new(),
            cover_img_resized: false,
            cover_img_url: String::new(),
            cover_img_fixed: false,
        }
    }

    pub fn current_manga(&self) -> Option<&Manga> {
        self.find_manga(&self.current_manga_url)
    }

    /// Cover image and URL to show: the fixed cover if set, else the current manga's.
    pub fn display_cover(&self) -> (&[u8], &str) {
        match self.current_manga() {
            Some(current) if !self.cover_img_fixed => (current.cover_img.as_slice(), current.cover_img_url.as_str()),
            _ => (self.cover_img.as_slice(), self.cover_img_url.as_str()),
        }
    }

    pub fn find_manga(&self, url: &str) -> Option<&Manga> {
        self.mangas.iter().find(|m| m.url == url)
    }

    /// The member with the most advanced last upload chapter.
    pub fn latest_manga(&self) -> Result<&Manga> {
        latest_manga(&self.mangas)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mangas.is_empty() {
            return Err(MangaTrackError::validation("multimanga manga list can't be empty"));
        }
        if self.current_manga_url.is_empty() {
            return Err(MangaTrackError::validation("multimanga current manga can't be empty"));
        }
        for manga in &self.mangas {
            manga
                .validate()
                .map_err(|e| e.context(format!("invalid multimanga member '{}'", manga.url)))?;
        }
        if self.current_manga().is_none() {
            return Err(MangaTrackError::validation(
                "multimanga current manga is not in the multimanga manga list",
            ));
        }
        if let Some(chapter) = &self.last_read_chapter {
            chapter.validate_as(ChapterType::Read, "multimanga last read chapter")?;
        }
        Ok(())
    }
}

/// Picks the manga whose last upload chapter is the most advanced.
///
/// Numeric labels are compared as numbers; on a tie or a non-numeric label the
/// more recently updated chapter wins. Mangas with no upload chapter lose to any
/// manga that has one.
pub fn latest_manga(mangas: &[Manga]) -> Result<&Manga> {
    let mut iter = mangas.iter();
    let mut latest = iter
        .next()
        .ok_or_else(|| MangaTrackError::validation("multimanga manga list can't be empty"))?;

    for manga in iter {
        let (current, candidate) = match (&latest.last_upload_chapter, &manga.last_upload_chapter) {
            (None, _) => {
                latest = manga;
                continue;
            }
            (_, None) => continue,
            (Some(current), Some(candidate)) => (current, candidate),
        };

        let by_number = match (current.chapter.parse::<f64>(), candidate.chapter.parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        let newer = match by_number {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => current.updated_at < candidate.updated_at,
        };
        if newer {
            latest = manga;
        }
    }

    Ok(latest)
}

/// Keeps the mangas that have a released chapter the user hasn't read.
pub fn filter_unread_chapter_mangas(mangas: Vec<Manga>) -> Vec<Manga> {
    mangas.into_iter().filter(Manga::has_unread_chapter).collect()
}

/// Sorts newest release first. Mangas without an upload chapter go last.
pub fn sort_mangas_by_last_upload(mangas: &mut [Manga]) {
    mangas.sort_by(|a, b| {
        let a_at = a.last_upload_chapter.as_ref().map(|c| c.updated_at);
        let b_at = b.last_upload_chapter.as_ref().map(|c| c.updated_at);
        b_at.cmp(&a_at)
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MangaSearchResult {
    pub url: String,
    pub name: String,
    pub source: String,
    pub cover_url: String,
    pub description: String,
    pub status: String,
    pub last_chapter: String,
    pub last_chapter_url: String,
    pub year: Option<i32>,
}

/// Lookup keys accepted by `get_chapter_metadata`. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterQuery {
    pub chapter: Option<String>,
    pub url: Option<String>,
    pub internal_id: Option<String>,
}

impl ChapterQuery {
    pub fn by_chapter(chapter: impl Into<String>) -> Self {
        Self {
            chapter: Some(chapter.into()),
            ..Self::default()
        }
    }

    pub fn by_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn by_internal_id(internal_id: impl Into<String>) -> Self {
        Self {
            internal_id: Some(internal_id.into()),
            ..Self::default()
        }
    }

    pub fn chapter(&self) -> Option<&str> {
        self.chapter.as_deref().filter(|s| !s.is_empty())
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|s| !s.is_empty())
    }

    pub fn internal_id(&self) -> Option<&str> {
        self.internal_id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chapter().is_none() && self.url().is_none() && self.internal_id().is_none() {
            return Err(MangaTrackError::validation(
                "chapter doesn't have a chapter, URL or internal ID",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ChapterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chapter '{}', URL '{}', internal ID '{}'",
            self.chapter().unwrap_or_default(),
            self.url().unwrap_or_default(),
            self.internal_id().unwrap_or_default()
        )
    }
}
