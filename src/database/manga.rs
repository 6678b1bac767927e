use super::{
    is_foreign_key_violation, is_unique_violation, manga_id, push_manga_key, select_manga, select_mangas,
    upsert_chapter_row, ChapterOwner, Database, MangaFilter,
};
use crate::error::{ErrorContext, MangaTrackError, Result};
use crate::models::{Chapter, ChapterType, Manga, MangaKey, MangaStatus, MangaType};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};

/// Inserts the manga row and its initial chapters. The caller validates and owns the transaction.
pub(super) async fn insert_manga_row(conn: &mut SqliteConnection, manga: &Manga) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO mangas
            (source, url, name, internal_id, status, type, cover_img, cover_img_resized, cover_img_url, cover_img_fixed, preferred_group)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&manga.source)
    .bind(&manga.url)
    .bind(&manga.name)
    .bind(&manga.internal_id)
    .bind(i16::from(manga.status))
    .bind(i16::from(manga.manga_type))
    .bind(&manga.cover_img)
    .bind(manga.cover_img_resized)
    .bind(&manga.cover_img_url)
    .bind(manga.cover_img_fixed)
    .bind(&manga.preferred_group)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            MangaTrackError::MangaAlreadyInDB
        } else {
            e.into()
        }
    })?;

    for chapter in [&manga.last_upload_chapter, &manga.last_read_chapter].into_iter().flatten() {
        let chapter_id = upsert_chapter_row(conn, ChapterOwner::Manga(id), chapter).await?;
        point_manga_chapter(conn, id, chapter.chapter_type, Some(chapter_id)).await?;
    }

    Ok(id)
}

/// Points the manga's upload or read slot at a chapter row.
pub(super) async fn point_manga_chapter(
    conn: &mut SqliteConnection,
    manga_id: i64,
    chapter_type: ChapterType,
    chapter_id: Option<i64>,
) -> Result<()> {
    let sql = match chapter_type {
        ChapterType::Upload => "UPDATE mangas SET last_upload_chapter = ? WHERE id = ?",
        ChapterType::Read => "UPDATE mangas SET last_read_chapter = ? WHERE id = ?",
    };
    let result = sqlx::query(sql).bind(chapter_id).bind(manga_id).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(MangaTrackError::MangaNotFoundDB);
    }
    Ok(())
}

/// Deletes a manga row. The row can't go while a multimanga has it as current manga.
pub(super) async fn delete_manga_row(conn: &mut SqliteConnection, key: MangaKey<'_>) -> Result<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM mangas");
    push_manga_key(&mut qb, key);
    let result = qb.build().execute(&mut *conn).await.map_err(|e| {
        if is_foreign_key_violation(&e) {
            MangaTrackError::AttemptedToDeleteCurrentManga
        } else {
            e.into()
        }
    })?;
    if result.rows_affected() == 0 {
        return Err(MangaTrackError::MangaNotFoundDB);
    }
    Ok(())
}

impl Database {
    /// Inserts a manga with its initial chapters and stores the assigned ID in `manga.id`.
    pub async fn insert_manga(&self, manga: &mut Manga) -> Result<i64> {
        manga.validate()?;

        let mut tx = self.pool.begin().await?;
        let id = insert_manga_row(&mut tx, manga)
            .await
            .with_context(|| format!("error while inserting manga '{}' in the DB", manga.url))?;
        tx.commit().await?;

        info!("Inserted manga '{}' with ID {}", manga.url, id);
        manga.id = Some(id);
        Ok(id)
    }

    pub async fn get_manga(&self, key: MangaKey<'_>) -> Result<Manga> {
        let mut conn = self.pool.acquire().await?;
        select_manga(&mut conn, key)
            .await
            .with_context(|| format!("error while getting manga with {key} from the DB"))
    }

    pub async fn get_manga_by_id(&self, id: i64) -> Result<Manga> {
        self.get_manga(MangaKey::Id(id)).await
    }

    pub async fn get_manga_by_url(&self, url: &str) -> Result<Manga> {
        self.get_manga(MangaKey::Url(url)).await
    }

    /// Every stored manga, multimanga members included, in insertion order.
    pub async fn get_mangas(&self) -> Result<Vec<Manga>> {
        let mut conn = self.pool.acquire().await?;
        select_mangas(&mut conn, MangaFilter::All)
            .await
            .context("error while getting mangas from the DB")
    }

    pub async fn get_mangas_by_type(&self, manga_type: MangaType) -> Result<Vec<Manga>> {
        let mut conn = self.pool.acquire().await?;
        select_mangas(&mut conn, MangaFilter::Type(manga_type))
            .await
            .context("error while getting mangas from the DB")
    }

    /// Records a new last upload or last read chapter, replacing the previous one of the same type.
    pub async fn upsert_manga_chapter(&self, manga: &mut Manga, chapter: &Chapter) -> Result<()> {
        chapter.validate()?;
        let context = || format!("error while upserting chapter '{}' of manga '{}' in the DB", chapter.chapter, manga.url);

        let mut tx = self.pool.begin().await?;
        let result: Result<()> = async {
            let id = manga_id(&mut tx, manga.key()?).await?;
            let chapter_id = upsert_chapter_row(&mut tx, ChapterOwner::Manga(id), chapter).await?;
            point_manga_chapter(&mut tx, id, chapter.chapter_type, Some(chapter_id)).await
        }
        .await;
        result.with_context(context)?;
        tx.commit().await?;

        debug!("Manga '{}' now has {:?} chapter '{}'", manga.url, chapter.chapter_type, chapter.chapter);
        manga.set_chapter(chapter.clone());
        Ok(())
    }

    /// Changes the reading status. Values outside 1..=5 are rejected before touching the DB.
    pub async fn update_manga_status(&self, manga: &mut Manga, status: i16) -> Result<()> {
        let status = MangaStatus::try_from(status)?;
        self.update_manga_column(manga.key()?, "status", i16::from(status))
            .await
            .with_context(|| format!("error while updating status of manga '{}' in the DB", manga.url))?;
        manga.status = status;
        Ok(())
    }

    pub async fn update_manga_name(&self, manga: &mut Manga, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(MangaTrackError::validation("manga name can't be empty"));
        }
        self.update_manga_column(manga.key()?, "name", name)
            .await
            .with_context(|| format!("error while updating name of manga '{}' in the DB", manga.url))?;
        manga.name = name.to_string();
        Ok(())
    }

    pub async fn update_manga_url(&self, manga: &mut Manga, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(MangaTrackError::validation("manga URL can't be empty"));
        }
        self.update_manga_column(manga.key()?, "url", url)
            .await
            .with_context(|| format!("error while updating URL of manga '{}' in the DB", manga.url))?;
        manga.url = url.to_string();
        Ok(())
    }

    pub async fn update_manga_preferred_group(&self, manga: &mut Manga, group: Option<&str>) -> Result<()> {
        self.update_manga_column(manga.key()?, "preferred_group", group)
            .await
            .with_context(|| format!("error while updating preferred group of manga '{}' in the DB", manga.url))?;
        manga.preferred_group = group.map(str::to_string);
        Ok(())
    }

    /// Replaces the cover. A `fixed` cover survives later metadata refreshes.
    pub async fn update_manga_cover_img(
        &self,
        manga: &mut Manga,
        cover_img: Vec<u8>,
        cover_img_resized: bool,
        cover_img_url: &str,
        fixed: bool,
    ) -> Result<()> {
        let cover = Cover {
            img: &cover_img,
            resized: cover_img_resized,
            url: cover_img_url,
            fixed,
        };
        let mut tx = self.pool.begin().await?;
        update_cover(&mut tx, manga.key()?, &cover)
            .await
            .with_context(|| format!("error while updating cover of manga '{}' in the DB", manga.url))?;
        tx.commit().await?;

        manga.cover_img = cover_img;
        manga.cover_img_resized = cover_img_resized;
        manga.cover_img_url = cover_img_url.to_string();
        manga.cover_img_fixed = fixed;
        Ok(())
    }

    /// Applies freshly fetched source metadata: name, cover and last upload chapter, all or nothing.
    ///
    /// A cover the user fixed is left alone.
    pub async fn update_manga_metadata(&self, manga: &mut Manga, fetched: &Manga) -> Result<()> {
        if fetched.name.is_empty() {
            return Err(MangaTrackError::validation("manga name can't be empty"));
        }
        if let Some(chapter) = &fetched.last_upload_chapter {
            chapter.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let result: Result<bool> = async {
            let id = manga_id(&mut tx, manga.key()?).await?;
            sqlx::query("UPDATE mangas SET name = ? WHERE id = ?")
                .bind(&fetched.name)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let fixed: bool = sqlx::query_scalar("SELECT cover_img_fixed FROM mangas WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            let replace_cover = !fixed && !fetched.cover_img.is_empty();
            if replace_cover {
                let cover = Cover {
                    img: &fetched.cover_img,
                    resized: fetched.cover_img_resized,
                    url: &fetched.cover_img_url,
                    fixed: false,
                };
                update_cover(&mut tx, MangaKey::Id(id), &cover).await?;
            } else if fixed {
                debug!("Keeping fixed cover of manga '{}'", manga.url);
            }

            if let Some(chapter) = &fetched.last_upload_chapter {
                let chapter_id = upsert_chapter_row(&mut tx, ChapterOwner::Manga(id), chapter).await?;
                point_manga_chapter(&mut tx, id, ChapterType::Upload, Some(chapter_id)).await?;
            }
            Ok(replace_cover)
        }
        .await;
        let replace_cover =
            result.with_context(|| format!("error while updating metadata of manga '{}' in the DB", manga.url))?;
        tx.commit().await?;

        manga.name = fetched.name.clone();
        if replace_cover {
            manga.cover_img_fixed = false;
            manga.cover_img = fetched.cover_img.clone();
            manga.cover_img_resized = fetched.cover_img_resized;
            manga.cover_img_url = fetched.cover_img_url.clone();
        }
        if let Some(chapter) = &fetched.last_upload_chapter {
            manga.last_upload_chapter = Some(chapter.clone());
        }
        Ok(())
    }

    /// Deletes the manga and its chapters.
    pub async fn delete_manga(&self, manga: &Manga) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_manga_row(&mut tx, manga.key()?)
            .await
            .with_context(|| format!("error while deleting manga '{}' from the DB", manga.url))?;
        tx.commit().await?;
        info!("Deleted manga '{}'", manga.url);
        Ok(())
    }

    async fn update_manga_column<'a, T>(&self, key: MangaKey<'a>, column: &str, value: T) -> Result<()>
    where
        T: 'a + Send + sqlx::Encode<'a, Sqlite> + sqlx::Type<Sqlite>,
    {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE mangas SET ");
        qb.push(column).push(" = ").push_bind(value);
        push_manga_key(&mut qb, key);

        let mut tx = self.pool.begin().await?;
        let result = qb.build().execute(&mut *tx).await.map_err(|e| {
            if is_unique_violation(&e) {
                MangaTrackError::MangaAlreadyInDB
            } else {
                e.into()
            }
        })?;
        if result.rows_affected() == 0 {
            return Err(MangaTrackError::MangaNotFoundDB);
        }
        tx.commit().await?;
        debug!("Updated {} of manga with {}", column, key);
        Ok(())
    }
}

/// Cover columns shared by mangas and multimangas.
pub(super) struct Cover<'a> {
    pub img: &'a [u8],
    pub resized: bool,
    pub url: &'a str,
    pub fixed: bool,
}

async fn update_cover(conn: &mut SqliteConnection, key: MangaKey<'_>, cover: &Cover<'_>) -> Result<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE mangas SET cover_img = ");
    qb.push_bind(cover.img)
        .push(", cover_img_resized = ")
        .push_bind(cover.resized)
        .push(", cover_img_url = ")
        .push_bind(cover.url)
        .push(", cover_img_fixed = ")
        .push_bind(cover.fixed);
    push_manga_key(&mut qb, key);

    let result = qb.build().execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(MangaTrackError::MangaNotFoundDB);
    }
    Ok(())
}
