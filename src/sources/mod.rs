//! Built-in source adapters.

pub mod comick;
pub mod mangadex;
pub mod rawkuma;

use crate::error::{MangaTrackError, Result};
use crate::models::{Chapter, Manga};
use crate::utils::ImageFetcher;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

/// Downloads the cover into `manga`. A failed download leaves the manga without a cover.
pub(crate) async fn attach_cover(images: &ImageFetcher, manga: &mut Manga, cover_url: &str) {
    manga.cover_img_url = cover_url.to_string();
    match images.get_image_from_url(cover_url).await {
        Ok((bytes, resized)) => {
            manga.cover_img = bytes;
            manga.cover_img_resized = resized;
        }
        Err(err) => warn!("no cover for manga '{}': {}", manga.url, err),
    }
}

/// Sets the manga's last upload chapter from a lookup result, or tolerates its failure when asked to.
pub(crate) fn attach_last_chapter(
    manga: &mut Manga,
    last_chapter: Result<Chapter>,
    ignore_last_chapter_error: bool,
) -> Result<()> {
    match last_chapter {
        Ok(chapter) => {
            manga.last_upload_chapter = Some(chapter);
            Ok(())
        }
        Err(err) if ignore_last_chapter_error => {
            warn!("ignoring last chapter of manga '{}': {}", manga.url, err);
            manga.last_upload_chapter = None;
            Ok(())
        }
        Err(err) => Err(err.context("error while getting last chapter")),
    }
}

/// First capture group of `pattern` in `haystack`.
pub(crate) fn capture(pattern: &str, haystack: &str, what: &str) -> Result<String> {
    let re = Regex::new(pattern).map_err(|e| MangaTrackError::scraping(e.to_string()))?;
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| MangaTrackError::scraping(format!("{what} not found in '{haystack}'")))
}

/// RFC 3339 timestamp in UTC. Unparseable or missing values fall back to the Unix epoch.
pub(crate) fn parse_datetime(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Chapter label and display name from a feed entry's number and title.
pub(crate) fn label_and_name(number: Option<&str>, title: Option<&str>, fallback: &str) -> (String, String) {
    let number = number.map(str::trim).filter(|s| !s.is_empty());
    let title = title.map(str::trim).filter(|s| !s.is_empty());

    let label = number.or(title).unwrap_or(fallback).to_string();
    let name = match title {
        Some(title) => title.to_string(),
        None => format!("Ch. {label}"),
    };
    (label, name)
}
