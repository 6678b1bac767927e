use thiserror::Error;

#[derive(Error, Debug)]
pub enum MangaTrackError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("manga not found in DB")]
    MangaNotFoundDB,

    #[error("multimanga not found in DB")]
    MultiMangaNotFoundDB,

    #[error("manga already exists in DB")]
    MangaAlreadyInDB,

    #[error("chapter already exists in DB")]
    ChapterAlreadyInDB,

    #[error("manga doesn't have an ID or URL")]
    MangaHasNoIdOrUrl,

    #[error("manga not found in multimanga")]
    MangaNotFoundInMultiManga,

    #[error("attempted to delete the current manga of a multimanga")]
    AttemptedToDeleteCurrentManga,

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("no source registered for '{0}'")]
    SourceNotFound(String),

    #[error("non-2xx status code ({status}) from '{url}': {body}")]
    HttpStatus { status: u16, url: String, body: String },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("Scraping error: {0}")]
    Scraping(String),

    #[error("Manga not found: {0}")]
    MangaNotFound(String),

    #[error("Chapter not found: {0}")]
    ChapterNotFound(String),

    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<MangaTrackError>,
    },
}

/// Coarse classification used by callers that need to react to a failure
/// (e.g. a route layer choosing a status code) without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    AlreadyExists,
    Source,
    Integrity,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::AlreadyExists | ErrorKind::Integrity => 409,
            ErrorKind::Source => 502,
            ErrorKind::Internal => 500,
        }
    }
}

impl MangaTrackError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn scraping(msg: impl Into<String>) -> Self {
        Self::Scraping(msg.into())
    }

    pub fn chapter_not_found(chapter: impl Into<String>) -> Self {
        Self::ChapterNotFound(chapter.into())
    }

    pub fn manga_not_found(manga: impl Into<String>) -> Self {
        Self::MangaNotFound(manga.into())
    }

    pub fn source_not_found(domain: impl Into<String>) -> Self {
        Self::SourceNotFound(domain.into())
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::IntegrityViolation(msg.into())
    }

    /// Wraps the error with a short description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every context layer.
    pub fn root(&self) -> &MangaTrackError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::MangaNotFoundDB
            | Self::MultiMangaNotFoundDB
            | Self::MangaNotFoundInMultiManga
            | Self::MangaNotFound(_)
            | Self::ChapterNotFound(_) => ErrorKind::NotFound,
            Self::HttpStatus { status: 404, .. } => ErrorKind::NotFound,
            Self::Validation(_) | Self::MangaHasNoIdOrUrl => ErrorKind::Validation,
            Self::MangaAlreadyInDB | Self::ChapterAlreadyInDB => ErrorKind::AlreadyExists,
            Self::AttemptedToDeleteCurrentManga | Self::IntegrityViolation(_) => {
                ErrorKind::Integrity
            }
            Self::SourceNotFound(_)
            | Self::HttpStatus { .. }
            | Self::NotImplemented(_)
            | Self::Scraping(_)
            | Self::Http(_)
            | Self::Url(_)
            | Self::Serialization(_) => ErrorKind::Source,
            _ => ErrorKind::Internal,
        }
    }
}

/// Adds operation context to any result whose error converts into [`MangaTrackError`].
pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<MangaTrackError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<MangaTrackError>::into(e).context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Into::<MangaTrackError>::into(e).context(f()))
    }
}

pub type Result<T> = std::result::Result<T, MangaTrackError>;
