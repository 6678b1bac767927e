//! Paginated chapter feeds.
//!
//! A producer task walks the feed page by page and pushes every chapter onto a
//! channel; a consumer task drops chapters whose label it has already seen. The
//! first page-fetch failure wins over any partially collected list.

use crate::error::{MangaTrackError, Result};
use crate::models::Chapter;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// How a feed is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Page numbers starting at `first`.
    Pages { first: u32 },
    /// Offsets `0, limit, 2*limit, ...`.
    Offset { limit: u32 },
}

impl Pagination {
    fn first_cursor(self) -> PageCursor {
        match self {
            Pagination::Pages { first } => PageCursor::Page(first),
            Pagination::Offset { limit } => PageCursor::Offset { offset: 0, limit },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    Page(u32),
    Offset { offset: u32, limit: u32 },
}

impl PageCursor {
    fn next(self) -> Self {
        match self {
            PageCursor::Page(page) => PageCursor::Page(page + 1),
            PageCursor::Offset { offset, limit } => PageCursor::Offset {
                offset: offset + limit,
                limit,
            },
        }
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCursor::Page(page) => write!(f, "page {page}"),
            PageCursor::Offset { offset, limit } => write!(f, "offset {offset} (limit {limit})"),
        }
    }
}

/// One page of a feed. `total` is the item count the server reports, when it reports one.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub chapters: Vec<Chapter>,
    pub total: Option<u32>,
}

/// A source's paginated chapter endpoint.
#[async_trait::async_trait]
pub trait ChapterFeed: Send + Sync + 'static {
    async fn fetch_page(&self, cursor: PageCursor) -> Result<FeedPage>;
}

/// Spawned task that is aborted when its handle is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Collects every chapter of a feed, deduplicated by chapter label in first-seen order.
pub async fn generate_chapters(
    feed: Arc<dyn ChapterFeed>,
    manga_url: &str,
    pagination: Pagination,
) -> Result<Vec<Chapter>> {
    let (chapter_tx, mut chapter_rx) = mpsc::unbounded_channel::<Chapter>();
    let (err_tx, mut err_rx) = oneshot::channel::<MangaTrackError>();

    let mut producer = AbortOnDrop::spawn(produce(
        feed,
        manga_url.to_string(),
        pagination,
        chapter_tx,
        err_tx,
    ));

    let mut consumer = AbortOnDrop::spawn(async move {
        let mut seen = HashSet::new();
        let mut chapters = Vec::new();
        while let Some(chapter) = chapter_rx.recv().await {
            if seen.insert(chapter.chapter.clone()) {
                chapters.push(chapter);
            }
        }
        chapters
    });

    // The producer reports an error before it closes the chapter channel, so
    // polling the error first means a failed feed never returns a partial list.
    tokio::select! {
        biased;

        Ok(err) = &mut err_rx => Err(err),
        chapters = &mut consumer => {
            let chapters = chapters?;
            (&mut producer).await?;
            debug!("collected {} chapters of manga '{}'", chapters.len(), manga_url);
            Ok(chapters)
        }
    }
}

async fn produce(
    feed: Arc<dyn ChapterFeed>,
    manga_url: String,
    pagination: Pagination,
    chapter_tx: mpsc::UnboundedSender<Chapter>,
    err_tx: oneshot::Sender<MangaTrackError>,
) {
    let mut cursor = pagination.first_cursor();
    let mut fetched: u64 = 0;

    loop {
        let page = match feed.fetch_page(cursor).await {
            Ok(page) => page,
            Err(err) => {
                let _ = err_tx.send(err.context(format!(
                    "error while getting chapters of manga '{manga_url}' at {cursor}"
                )));
                return;
            }
        };

        if page.chapters.is_empty() {
            break;
        }
        debug!("{} chapters at {} of manga '{}'", page.chapters.len(), cursor, manga_url);

        fetched += page.chapters.len() as u64;
        for chapter in page.chapters {
            if chapter_tx.send(chapter).is_err() {
                return;
            }
        }

        if page.total.is_some_and(|total| fetched >= u64::from(total)) {
            break;
        }
        cursor = cursor.next();
    }
}
