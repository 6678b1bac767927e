//! SQLite persistence for mangas, their chapters and multimangas.
//!
//! Every mutating method runs in its own transaction. Reads borrow a pooled
//! connection for the duration of the call.

mod manga;
mod multimanga;

use crate::error::{MangaTrackError, Result};
use crate::models::{Chapter, ChapterType, Manga, MangaKey, MangaStatus, MangaType};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::info;

pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        if let Some(path) = database_file(database_url) {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    info!("Creating directory: {:?}", parent);
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        info!("Database connected successfully");
        Ok(Self { pool })
    }

    /// A private in-memory database with the schema already created.
    ///
    /// The pool holds a single connection that never expires, since the data
    /// lives only as long as that connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        info!("Initializing database schema...");
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mangas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source VARCHAR(30) NOT NULL,
                url VARCHAR(255) NOT NULL UNIQUE,
                name VARCHAR(255) NOT NULL,
                internal_id VARCHAR(100) NOT NULL DEFAULT '',
                status SMALLINT NOT NULL CHECK (status BETWEEN 1 AND 5),
                type SMALLINT NOT NULL DEFAULT 1,
                cover_img BLOB,
                cover_img_resized BOOLEAN,
                cover_img_url VARCHAR(255),
                cover_img_fixed BOOLEAN NOT NULL DEFAULT 0,
                preferred_group VARCHAR(30),
                last_upload_chapter INTEGER REFERENCES chapters (id),
                last_read_chapter INTEGER REFERENCES chapters (id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // A chapter belongs either to a manga or to a multimanga, one row per slot.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chapters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                manga_id INTEGER REFERENCES mangas (id) ON DELETE CASCADE,
                multimanga_id INTEGER REFERENCES multimangas (id) ON DELETE CASCADE,
                url VARCHAR(255) NOT NULL,
                chapter VARCHAR(255) NOT NULL,
                name VARCHAR(255) NOT NULL,
                internal_id VARCHAR(100) NOT NULL DEFAULT '',
                updated_at TIMESTAMP NOT NULL,
                type SMALLINT NOT NULL CHECK (type IN (1, 2)),
                UNIQUE (url, type),
                UNIQUE (manga_id, type),
                UNIQUE (multimanga_id, type),
                CHECK ((manga_id IS NULL) <> (multimanga_id IS NULL))
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS multimangas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status SMALLINT NOT NULL CHECK (status BETWEEN 1 AND 5),
                current_manga INTEGER NOT NULL REFERENCES mangas (id),
                last_read_chapter INTEGER REFERENCES chapters (id),
                cover_img BLOB,
                cover_img_resized BOOLEAN,
                cover_img_url VARCHAR(255),
                cover_img_fixed BOOLEAN NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS multimanga_mangas (
                multimanga_id INTEGER NOT NULL REFERENCES multimangas (id) ON DELETE CASCADE,
                manga_id INTEGER NOT NULL REFERENCES mangas (id) ON DELETE CASCADE,
                PRIMARY KEY (multimanga_id, manga_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mangas_type ON mangas (type)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_multimanga_mangas_manga_id ON multimanga_mangas (manga_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Database schema initialized successfully");
        Ok(())
    }
}

/// File path behind a `sqlite:` URL, if it names a file.
fn database_file(database_url: &str) -> Option<&str> {
    let path = database_url.strip_prefix("sqlite:")?;
    let path = path.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        None
    } else {
        Some(path)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_foreign_key_violation() || db.message().contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}

fn push_manga_key<'a>(qb: &mut QueryBuilder<'a, Sqlite>, key: MangaKey<'a>) {
    match key {
        MangaKey::Id(id) => qb.push(" WHERE id = ").push_bind(id),
        MangaKey::Url(url) => qb.push(" WHERE url = ").push_bind(url),
    };
}

/// Owner of a chapter row. Each owner has at most one chapter per type.
#[derive(Debug, Clone, Copy)]
enum ChapterOwner {
    Manga(i64),
    MultiManga(i64),
}

/// Inserts the owner's chapter of this type, or overwrites the existing one in place.
async fn upsert_chapter_row(conn: &mut SqliteConnection, owner: ChapterOwner, chapter: &Chapter) -> Result<i64> {
    let (column, owner_id) = match owner {
        ChapterOwner::Manga(id) => ("manga_id", id),
        ChapterOwner::MultiManga(id) => ("multimanga_id", id),
    };
    let chapter_type = i16::from(chapter.chapter_type);

    let existing: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM chapters WHERE {column} = ? AND type = ?"
    ))
    .bind(owner_id)
    .bind(chapter_type)
    .fetch_optional(&mut *conn)
    .await?;

    let result = match existing {
        Some(id) => sqlx::query(
            r#"
            UPDATE chapters
            SET url = ?, chapter = ?, name = ?, internal_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&chapter.url)
        .bind(&chapter.chapter)
        .bind(&chapter.name)
        .bind(&chapter.internal_id)
        .bind(chapter.updated_at)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map(|_| id),
        None => sqlx::query_scalar::<_, i64>(&format!(
            r#"
            INSERT INTO chapters ({column}, url, chapter, name, internal_id, updated_at, type)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#
        ))
        .bind(owner_id)
        .bind(&chapter.url)
        .bind(&chapter.chapter)
        .bind(&chapter.name)
        .bind(&chapter.internal_id)
        .bind(chapter.updated_at)
        .bind(chapter_type)
        .fetch_one(&mut *conn)
        .await,
    };

    result.map_err(|e| {
        if is_unique_violation(&e) {
            MangaTrackError::ChapterAlreadyInDB
        } else if is_foreign_key_violation(&e) {
            match owner {
                ChapterOwner::Manga(_) => MangaTrackError::MangaNotFoundDB,
                ChapterOwner::MultiManga(_) => MangaTrackError::MultiMangaNotFoundDB,
            }
        } else {
            e.into()
        }
    })
}

/// Chapter columns of a LEFT JOIN, all null when the slot is empty.
#[derive(Debug, Default)]
struct JoinedChapter {
    url: Option<String>,
    chapter: Option<String>,
    name: Option<String>,
    internal_id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    chapter_type: Option<i16>,
}

impl JoinedChapter {
    /// Resolves a chapter foreign key. A key whose row didn't join is an integrity error.
    fn resolve(self, chapter_id: Option<i64>) -> Result<Option<Chapter>> {
        let Some(chapter_id) = chapter_id else {
            return Ok(None);
        };
        match self {
            JoinedChapter {
                url: Some(url),
                chapter: Some(chapter),
                name: Some(name),
                internal_id,
                updated_at: Some(updated_at),
                chapter_type: Some(chapter_type),
            } => Ok(Some(Chapter {
                url,
                chapter,
                name,
                internal_id: internal_id.unwrap_or_default(),
                updated_at,
                chapter_type: ChapterType::try_from(chapter_type)?,
            })),
            _ => Err(MangaTrackError::integrity(format!(
                "chapter {chapter_id} is referenced but doesn't exist"
            ))),
        }
    }
}

const MANGA_SELECT: &str = r#"
    SELECT
        m.id, m.source, m.url, m.name, m.internal_id, m.status, m.type AS manga_type,
        m.cover_img, m.cover_img_resized, m.cover_img_url, m.cover_img_fixed, m.preferred_group,
        m.last_upload_chapter,
        cu.url AS upload_url, cu.chapter AS upload_chapter, cu.name AS upload_name,
        cu.internal_id AS upload_internal_id, cu.updated_at AS upload_updated_at, cu.type AS upload_type,
        m.last_read_chapter,
        cr.url AS read_url, cr.chapter AS read_chapter, cr.name AS read_name,
        cr.internal_id AS read_internal_id, cr.updated_at AS read_updated_at, cr.type AS read_type
    FROM mangas m
    LEFT JOIN chapters cu ON cu.id = m.last_upload_chapter
    LEFT JOIN chapters cr ON cr.id = m.last_read_chapter
"#;

#[derive(Debug, sqlx::FromRow)]
struct MangaRow {
    id: i64,
    source: String,
    url: String,
    name: String,
    internal_id: String,
    status: i16,
    manga_type: i16,
    cover_img: Option<Vec<u8>>,
    cover_img_resized: Option<bool>,
    cover_img_url: Option<String>,
    cover_img_fixed: bool,
    preferred_group: Option<String>,
    last_upload_chapter: Option<i64>,
    upload_url: Option<String>,
    upload_chapter: Option<String>,
    upload_name: Option<String>,
    upload_internal_id: Option<String>,
    upload_updated_at: Option<DateTime<Utc>>,
    upload_type: Option<i16>,
    last_read_chapter: Option<i64>,
    read_url: Option<String>,
    read_chapter: Option<String>,
    read_name: Option<String>,
    read_internal_id: Option<String>,
    read_updated_at: Option<DateTime<Utc>>,
    read_type: Option<i16>,
}

impl TryFrom<MangaRow> for Manga {
    type Error = MangaTrackError;

    fn try_from(row: MangaRow) -> Result<Self> {
        let last_upload_chapter = JoinedChapter {
            url: row.upload_url,
            chapter: row.upload_chapter,
            name: row.upload_name,
            internal_id: row.upload_internal_id,
            updated_at: row.upload_updated_at,
            chapter_type: row.upload_type,
        }
        .resolve(row.last_upload_chapter)?;
        let last_read_chapter = JoinedChapter {
            url: row.read_url,
            chapter: row.read_chapter,
            name: row.read_name,
            internal_id: row.read_internal_id,
            updated_at: row.read_updated_at,
            chapter_type: row.read_type,
        }
        .resolve(row.last_read_chapter)?;

        let manga = Manga {
            id: Some(row.id),
            source: row.source,
            url: row.url,
            name: row.name,
            internal_id: row.internal_id,
            status: MangaStatus::try_from(row.status)?,
            manga_type: MangaType::try_from(row.manga_type)?,
            cover_img: row.cover_img.unwrap_or_default(),
            cover_img_resized: row.cover_img_resized.unwrap_or_default(),
            cover_img_url: row.cover_img_url.unwrap_or_default(),
            cover_img_fixed: row.cover_img_fixed,
            preferred_group: row.preferred_group,
            last_upload_chapter,
            last_read_chapter,
        };
        manga
            .validate()
            .map_err(|e| e.context(format!("invalid manga '{}' in the DB", manga.url)))?;
        Ok(manga)
    }
}

/// Which stored mangas a read returns.
#[derive(Debug, Clone, Copy)]
enum MangaFilter<'a> {
    Key(MangaKey<'a>),
    Type(MangaType),
    MultiManga(i64),
    All,
}

async fn select_mangas(conn: &mut SqliteConnection, filter: MangaFilter<'_>) -> Result<Vec<Manga>> {
    let sql = match filter {
        MangaFilter::Key(MangaKey::Id(_)) => format!("{MANGA_SELECT} WHERE m.id = ?"),
        MangaFilter::Key(MangaKey::Url(_)) => format!("{MANGA_SELECT} WHERE m.url = ?"),
        MangaFilter::Type(_) => format!("{MANGA_SELECT} WHERE m.type = ? ORDER BY m.id"),
        MangaFilter::MultiManga(_) => format!(
            "{MANGA_SELECT} WHERE m.id IN (SELECT manga_id FROM multimanga_mangas WHERE multimanga_id = ?) ORDER BY m.id"
        ),
        MangaFilter::All => format!("{MANGA_SELECT} ORDER BY m.id"),
    };

    let query = sqlx::query_as::<_, MangaRow>(&sql);
    let query = match filter {
        MangaFilter::Key(MangaKey::Id(id)) => query.bind(id),
        MangaFilter::Key(MangaKey::Url(url)) => query.bind(url),
        MangaFilter::Type(manga_type) => query.bind(i16::from(manga_type)),
        MangaFilter::MultiManga(id) => query.bind(id),
        MangaFilter::All => query,
    };

    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(Manga::try_from).collect()
}

async fn select_manga(conn: &mut SqliteConnection, key: MangaKey<'_>) -> Result<Manga> {
    select_mangas(conn, MangaFilter::Key(key))
        .await?
        .into_iter()
        .next()
        .ok_or(MangaTrackError::MangaNotFoundDB)
}

async fn manga_id(conn: &mut SqliteConnection, key: MangaKey<'_>) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM mangas");
    push_manga_key(&mut qb, key);
    qb.build_query_scalar::<i64>()
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(MangaTrackError::MangaNotFoundDB)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_file_paths() {
        assert_eq!(database_file("sqlite:data/mangatrack.db"), Some("data/mangatrack.db"));
        assert_eq!(database_file("sqlite://data/m.db?mode=rwc"), Some("data/m.db"));
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file("postgres://x"), None);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.init().await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(tables, ["chapters", "mangas", "multimanga_mangas", "multimangas"]);
    }

    #[tokio::test]
    async fn file_database_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mangatrack.db");
        let url = format!("sqlite:{}", path.display());

        let db = Database::new(&url, 2).await.unwrap();
        db.init().await.unwrap();
        assert!(path.exists());
    }
}
