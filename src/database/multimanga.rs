use super::manga::{delete_manga_row, insert_manga_row, point_manga_chapter, Cover};
use super::{
    is_foreign_key_violation, select_manga, select_mangas, upsert_chapter_row, ChapterOwner, Database,
    JoinedChapter, MangaFilter,
};
use crate::error::{ErrorContext, MangaTrackError, Result};
use crate::models::{Chapter, ChapterType, Manga, MangaKey, MangaStatus, MangaType, MultiManga};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info};

#[derive(Debug, sqlx::FromRow)]
struct MultiMangaRow {
    id: i64,
    status: i16,
    current_manga_url: String,
    cover_img: Option<Vec<u8>>,
    cover_img_resized: Option<bool>,
    cover_img_url: Option<String>,
    cover_img_fixed: bool,
    last_read_chapter: Option<i64>,
    read_url: Option<String>,
    read_chapter: Option<String>,
    read_name: Option<String>,
    read_internal_id: Option<String>,
    read_updated_at: Option<DateTime<Utc>>,
    read_type: Option<i16>,
}

fn multimanga_id(multimanga: &MultiManga) -> Result<i64> {
    multimanga
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| MangaTrackError::validation("multimanga doesn't have an ID"))
}

/// A manga as stored inside a multimanga: member type, reading progress and
/// fixed cover kept by the multimanga.
fn as_member(manga: &Manga) -> Manga {
    let mut member = manga.clone();
    member.manga_type = MangaType::Member;
    member.last_read_chapter = None;
    member.cover_img_fixed = false;
    member
}

async fn link_member(conn: &mut SqliteConnection, multimanga_id: i64, manga_id: i64) -> Result<()> {
    sqlx::query("INSERT INTO multimanga_mangas (multimanga_id, manga_id) VALUES (?, ?)")
        .bind(multimanga_id)
        .bind(manga_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                MangaTrackError::MultiMangaNotFoundDB
            } else {
                e.into()
            }
        })?;
    Ok(())
}

async fn insert_multimanga_row(
    conn: &mut SqliteConnection,
    status: MangaStatus,
    current_manga_id: i64,
    cover: &Cover<'_>,
) -> Result<i64> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO multimangas (status, current_manga, cover_img, cover_img_resized, cover_img_url, cover_img_fixed)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(i16::from(status))
    .bind(current_manga_id)
    .bind(cover.img)
    .bind(cover.resized)
    .bind(cover.url)
    .bind(cover.fixed)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

fn multimanga_cover(multimanga: &MultiManga) -> Cover<'_> {
    Cover {
        img: &multimanga.cover_img,
        resized: multimanga.cover_img_resized,
        url: &multimanga.cover_img_url,
        fixed: multimanga.cover_img_fixed,
    }
}

async fn upsert_multimanga_chapter_row(conn: &mut SqliteConnection, multimanga_id: i64, chapter: &Chapter) -> Result<()> {
    if chapter.chapter_type != ChapterType::Read {
        return Err(MangaTrackError::validation("multimanga chapter should be of type 2 (last read)"));
    }
    let chapter_id = upsert_chapter_row(conn, ChapterOwner::MultiManga(multimanga_id), chapter).await?;
    let result = sqlx::query("UPDATE multimangas SET last_read_chapter = ? WHERE id = ?")
        .bind(chapter_id)
        .bind(multimanga_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(MangaTrackError::MultiMangaNotFoundDB);
    }
    Ok(())
}

async fn select_multimanga(conn: &mut SqliteConnection, id: i64) -> Result<MultiManga> {
    let row = sqlx::query_as::<_, MultiMangaRow>(
        r#"
        SELECT
            mm.id, mm.status, cm.url AS current_manga_url,
            mm.cover_img, mm.cover_img_resized, mm.cover_img_url, mm.cover_img_fixed,
            mm.last_read_chapter,
            c.url AS read_url, c.chapter AS read_chapter, c.name AS read_name,
            c.internal_id AS read_internal_id, c.updated_at AS read_updated_at, c.type AS read_type
        FROM multimangas mm
        JOIN mangas cm ON cm.id = mm.current_manga
        LEFT JOIN chapters c ON c.id = mm.last_read_chapter
        WHERE mm.id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(MangaTrackError::MultiMangaNotFoundDB)?;

    let last_read_chapter = JoinedChapter {
        url: row.read_url,
        chapter: row.read_chapter,
        name: row.read_name,
        internal_id: row.read_internal_id,
        updated_at: row.read_updated_at,
        chapter_type: row.read_type,
    }
    .resolve(row.last_read_chapter)?;

    let multimanga = MultiManga {
        id: Some(row.id),
        status: MangaStatus::try_from(row.status)?,
        current_manga_url: row.current_manga_url,
        mangas: select_mangas(conn, MangaFilter::MultiManga(row.id)).await?,
        last_read_chapter,
        cover_img: row.cover_img.unwrap_or_default(),
        cover_img_resized: row.cover_img_resized.unwrap_or_default(),
        cover_img_url: row.cover_img_url.unwrap_or_default(),
        cover_img_fixed: row.cover_img_fixed,
    };
    multimanga
        .validate()
        .map_err(|e| e.context(format!("invalid multimanga {id} in the DB")))?;
    Ok(multimanga)
}

impl Database {
    /// Inserts the members, the multimanga and its membership links in one transaction.
    ///
    /// Members are stored as member mangas without a read chapter of their own. The
    /// multimanga's read chapter, if any, is stored at the multimanga level.
    pub async fn insert_multimanga(&self, multimanga: &mut MultiManga) -> Result<i64> {
        multimanga.validate()?;
        let members: Vec<Manga> = multimanga.mangas.iter().map(as_member).collect();

        let mut tx = self.pool.begin().await?;
        let result: Result<(i64, Vec<i64>)> = async {
            let mut member_ids = Vec::with_capacity(members.len());
            let mut current_id = None;
            for member in &members {
                let id = insert_manga_row(&mut tx, member)
                    .await
                    .with_context(|| format!("error while inserting multimanga member '{}'", member.url))?;
                if member.url == multimanga.current_manga_url {
                    current_id = Some(id);
                }
                member_ids.push(id);
            }
            let current_id = current_id.ok_or_else(|| {
                MangaTrackError::validation("multimanga current manga is not in the multimanga manga list")
            })?;

            let cover = multimanga_cover(multimanga);
            let id = insert_multimanga_row(&mut tx, multimanga.status, current_id, &cover).await?;
            for member_id in &member_ids {
                link_member(&mut tx, id, *member_id).await?;
            }
            if let Some(chapter) = &multimanga.last_read_chapter {
                upsert_multimanga_chapter_row(&mut tx, id, chapter).await?;
            }
            Ok((id, member_ids))
        }
        .await;
        let (id, member_ids) = result.context("error while inserting multimanga in the DB")?;
        tx.commit().await?;

        info!("Inserted multimanga {} with {} mangas", id, member_ids.len());
        multimanga.id = Some(id);
        multimanga.mangas = members;
        for (manga, member_id) in multimanga.mangas.iter_mut().zip(member_ids) {
            manga.id = Some(member_id);
        }
        Ok(id)
    }

    pub async fn get_multimanga(&self, id: i64) -> Result<MultiManga> {
        let mut conn = self.pool.acquire().await?;
        select_multimanga(&mut conn, id)
            .await
            .with_context(|| format!("error while getting multimanga {id} from the DB"))
    }

    pub async fn get_multimangas(&self) -> Result<Vec<MultiManga>> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM multimangas ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;

        let mut multimangas = Vec::with_capacity(ids.len());
        for id in ids {
            let multimanga = select_multimanga(&mut conn, id)
                .await
                .with_context(|| format!("error while getting multimanga {id} from the DB"))?;
            multimangas.push(multimanga);
        }
        Ok(multimangas)
    }

    /// Adds a new member. The manga is inserted as a member manga.
    pub async fn add_manga_to_multimanga(&self, multimanga: &mut MultiManga, manga: &Manga) -> Result<()> {
        let multimanga_id = multimanga_id(multimanga)?;
        let mut member = as_member(manga);
        member.validate()?;

        let mut tx = self.pool.begin().await?;
        let result: Result<i64> = async {
            let id = insert_manga_row(&mut tx, &member).await?;
            link_member(&mut tx, multimanga_id, id).await?;
            Ok(id)
        }
        .await;
        let id = result.with_context(|| {
            format!("error while adding manga '{}' to multimanga {multimanga_id}", member.url)
        })?;
        tx.commit().await?;

        member.id = Some(id);
        multimanga.mangas.push(member);
        Ok(())
    }

    /// Deletes a member manga. The current manga can't be removed: repoint the multimanga first.
    pub async fn remove_manga_from_multimanga(&self, multimanga: &mut MultiManga, manga_url: &str) -> Result<()> {
        let index = multimanga
            .mangas
            .iter()
            .position(|m| m.url == manga_url)
            .ok_or(MangaTrackError::MangaNotFoundInMultiManga)?;
        let key = match multimanga.mangas[index].id {
            Some(id) if id > 0 => MangaKey::Id(id),
            _ => MangaKey::Url(manga_url),
        };

        let mut tx = self.pool.begin().await?;
        delete_manga_row(&mut tx, key)
            .await
            .with_context(|| format!("error while removing manga '{manga_url}' from multimanga"))?;
        tx.commit().await?;

        multimanga.mangas.remove(index);
        Ok(())
    }

    /// Repoints the active source. `manga` must already be stored; membership isn't checked here.
    pub async fn update_multimanga_current_manga(&self, multimanga: &mut MultiManga, manga: &Manga) -> Result<()> {
        let multimanga_id = multimanga_id(multimanga)?;
        let manga_id = manga
            .id
            .filter(|id| *id > 0)
            .ok_or_else(|| MangaTrackError::validation("manga doesn't have an ID"))?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE multimangas SET current_manga = ? WHERE id = ?")
            .bind(manga_id)
            .bind(multimanga_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    MangaTrackError::MangaNotFoundDB
                } else {
                    e.into()
                }
            })
            .with_context(|| format!("error while updating current manga of multimanga {multimanga_id}"))?;
        if result.rows_affected() == 0 {
            return Err(MangaTrackError::MultiMangaNotFoundDB);
        }
        tx.commit().await?;

        multimanga.current_manga_url = manga.url.clone();
        Ok(())
    }

    /// Repoints the active source at the member with the most advanced upload chapter.
    pub async fn refresh_multimanga_current_manga(&self, multimanga: &mut MultiManga) -> Result<()> {
        let latest = multimanga.latest_manga()?.clone();
        if latest.url != multimanga.current_manga_url {
            info!("Multimanga {:?} current manga is now '{}'", multimanga.id, latest.url);
            self.update_multimanga_current_manga(multimanga, &latest).await?;
        }
        Ok(())
    }

    pub async fn update_multimanga_status(&self, multimanga: &mut MultiManga, status: i16) -> Result<()> {
        let status = MangaStatus::try_from(status)?;
        let multimanga_id = multimanga_id(multimanga)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE multimangas SET status = ? WHERE id = ?")
            .bind(i16::from(status))
            .bind(multimanga_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MangaTrackError::MultiMangaNotFoundDB);
        }
        tx.commit().await?;

        multimanga.status = status;
        Ok(())
    }

    /// Replaces the multimanga's own cover. While it isn't `fixed` readers fall back to
    /// the current manga's cover.
    pub async fn update_multimanga_cover_img(
        &self,
        multimanga: &mut MultiManga,
        cover_img: Vec<u8>,
        cover_img_resized: bool,
        cover_img_url: &str,
        fixed: bool,
    ) -> Result<()> {
        let multimanga_id = multimanga_id(multimanga)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE multimangas
            SET cover_img = ?, cover_img_resized = ?, cover_img_url = ?, cover_img_fixed = ?
            WHERE id = ?
            "#,
        )
        .bind(&cover_img)
        .bind(cover_img_resized)
        .bind(cover_img_url)
        .bind(fixed)
        .bind(multimanga_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("error while updating cover of multimanga {multimanga_id} in the DB"))?;
        if result.rows_affected() == 0 {
            return Err(MangaTrackError::MultiMangaNotFoundDB);
        }
        tx.commit().await?;

        debug!("Updated cover of multimanga {} (fixed: {})", multimanga_id, fixed);
        multimanga.cover_img = cover_img;
        multimanga.cover_img_resized = cover_img_resized;
        multimanga.cover_img_url = cover_img_url.to_string();
        multimanga.cover_img_fixed = fixed;
        Ok(())
    }

    /// Records the last read chapter of the multimanga, replacing the previous one.
    pub async fn upsert_multimanga_chapter(&self, multimanga: &mut MultiManga, chapter: &Chapter) -> Result<()> {
        chapter.validate()?;
        let multimanga_id = multimanga_id(multimanga)?;

        let mut tx = self.pool.begin().await?;
        upsert_multimanga_chapter_row(&mut tx, multimanga_id, chapter)
            .await
            .with_context(|| {
                format!("error while upserting chapter '{}' of multimanga {multimanga_id}", chapter.chapter)
            })?;
        tx.commit().await?;

        multimanga.last_read_chapter = Some(chapter.clone());
        Ok(())
    }

    /// Deletes the multimanga together with its member mangas and all their chapters.
    pub async fn delete_multimanga(&self, multimanga: &MultiManga) -> Result<()> {
        let multimanga_id = multimanga_id(multimanga)?;

        let mut tx = self.pool.begin().await?;
        let result: Result<()> = async {
            let member_ids: Vec<i64> =
                sqlx::query_scalar("SELECT manga_id FROM multimanga_mangas WHERE multimanga_id = ?")
                    .bind(multimanga_id)
                    .fetch_all(&mut *tx)
                    .await?;

            let deleted = sqlx::query("DELETE FROM multimangas WHERE id = ?")
                .bind(multimanga_id)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(MangaTrackError::MultiMangaNotFoundDB);
            }

            for member_id in member_ids {
                delete_manga_row(&mut tx, MangaKey::Id(member_id)).await?;
            }
            Ok(())
        }
        .await;
        result.with_context(|| format!("error while deleting multimanga {multimanga_id} from the DB"))?;
        tx.commit().await?;

        info!("Deleted multimanga {}", multimanga_id);
        Ok(())
    }

    /// Turns a stored standalone manga into the single member of a new multimanga.
    ///
    /// The manga's status and last read chapter move to the multimanga. On success
    /// `manga` is updated to its member form.
    pub async fn turn_into_multimanga(&self, manga: &mut Manga) -> Result<MultiManga> {
        let mut tx = self.pool.begin().await?;
        let result: Result<MultiManga> = async {
            let stored = select_manga(&mut tx, manga.key()?).await?;
            if stored.manga_type == MangaType::Member {
                return Err(MangaTrackError::validation("manga is already in a multimanga"));
            }
            let manga_id = stored.id.ok_or(MangaTrackError::MangaNotFoundDB)?;

            point_manga_chapter(&mut tx, manga_id, ChapterType::Read, None).await?;
            sqlx::query("DELETE FROM chapters WHERE manga_id = ? AND type = ?")
                .bind(manga_id)
                .bind(i16::from(ChapterType::Read))
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE mangas SET type = ?, cover_img_fixed = 0 WHERE id = ?")
                .bind(i16::from(MangaType::Member))
                .bind(manga_id)
                .execute(&mut *tx)
                .await?;

            // a fixed cover moves up to the multimanga
            let cover = if stored.cover_img_fixed {
                Cover {
                    img: &stored.cover_img,
                    resized: stored.cover_img_resized,
                    url: &stored.cover_img_url,
                    fixed: true,
                }
            } else {
                Cover {
                    img: &[],
                    resized: false,
                    url: "",
                    fixed: false,
                }
            };
            let id = insert_multimanga_row(&mut tx, stored.status, manga_id, &cover).await?;
            link_member(&mut tx, id, manga_id).await?;
            if let Some(chapter) = &stored.last_read_chapter {
                upsert_multimanga_chapter_row(&mut tx, id, chapter).await?;
            }

            let member = as_member(&stored);
            let mut multimanga = MultiManga::new(stored.status, vec![member], stored.url.clone());
            multimanga.id = Some(id);
            multimanga.last_read_chapter = stored.last_read_chapter.clone();
            if stored.cover_img_fixed {
                multimanga.cover_img = stored.cover_img.clone();
                multimanga.cover_img_resized = stored.cover_img_resized;
                multimanga.cover_img_url = stored.cover_img_url.clone();
                multimanga.cover_img_fixed = true;
            }
            Ok(multimanga)
        }
        .await;
        let multimanga = result.with_context(|| format!("error while turning manga '{}' into a multimanga", manga.url))?;
        tx.commit().await?;

        info!("Manga '{}' is now part of multimanga {:?}", manga.url, multimanga.id);
        *manga = multimanga.mangas[0].clone();
        Ok(multimanga)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::{chapter, manga};
    use crate::error::ErrorKind;

    async fn count(db: &Database, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(&db.pool).await.unwrap()
    }

    async fn two_member_multimanga(db: &Database) -> MultiManga {
        let mut a = manga("https://a.org/m", "10");
        a.last_read_chapter = Some(chapter("https://a.org/m/c8", "8", ChapterType::Read));
        let b = manga("https://b.org/m", "11");

        let mut multimanga = MultiManga::new(MangaStatus::Reading, vec![a, b], "https://a.org/m");
        multimanga.last_read_chapter = Some(chapter("https://a.org/m/c9", "9", ChapterType::Read));
        db.insert_multimanga(&mut multimanga).await.unwrap();
        multimanga
    }

    #[tokio::test]
    async fn insert_and_get_multimanga() {
        let db = Database::in_memory().await.unwrap();
        let multimanga = two_member_multimanga(&db).await;

        assert!(multimanga.mangas.iter().all(|m| m.manga_type == MangaType::Member && m.id.is_some()));
        assert!(multimanga.mangas[0].last_read_chapter.is_none());

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored, multimanga);
        assert_eq!(stored.current_manga().unwrap().url, "https://a.org/m");
        assert_eq!(stored.last_read_chapter.as_ref().unwrap().chapter, "9");

        assert_eq!(db.get_multimangas().await.unwrap(), vec![stored]);
        assert_eq!(db.get_mangas_by_type(MangaType::Member).await.unwrap().len(), 2);
        assert!(db.get_mangas_by_type(MangaType::Standalone).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn current_manga_outside_members_writes_nothing() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = MultiManga::new(
            MangaStatus::Reading,
            vec![manga("https://a.org/m", "1"), manga("https://b.org/m", "1")],
            "https://c.org/m",
        );

        let err = db.insert_multimanga(&mut multimanga).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(multimanga.id, None);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM mangas").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM multimangas").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM chapters").await, 0);
    }

    #[tokio::test]
    async fn failing_member_rolls_back_whole_insert() {
        let db = Database::in_memory().await.unwrap();
        db.insert_manga(&mut manga("https://b.org/m", "1")).await.unwrap();

        let mut multimanga = MultiManga::new(
            MangaStatus::Reading,
            vec![manga("https://a.org/m", "1"), manga("https://b.org/m", "2")],
            "https://a.org/m",
        );
        let err = db.insert_multimanga(&mut multimanga).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM mangas").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM multimangas").await, 0);
    }

    #[tokio::test]
    async fn current_manga_cannot_be_removed_until_repointed() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = two_member_multimanga(&db).await;

        let err = db
            .remove_manga_from_multimanga(&mut multimanga, "https://a.org/m")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), MangaTrackError::AttemptedToDeleteCurrentManga));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(multimanga.mangas.len(), 2);

        let b = multimanga.find_manga("https://b.org/m").unwrap().clone();
        db.update_multimanga_current_manga(&mut multimanga, &b).await.unwrap();
        db.remove_manga_from_multimanga(&mut multimanga, "https://a.org/m")
            .await
            .unwrap();

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored.mangas.len(), 1);
        assert_eq!(stored.mangas[0].url, "https://b.org/m");
        assert_eq!(stored.current_manga_url, "https://b.org/m");
        assert_eq!(stored, multimanga);
    }

    #[tokio::test]
    async fn last_member_cannot_be_removed() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = MultiManga::new(MangaStatus::Reading, vec![manga("https://a.org/m", "1")], "https://a.org/m");
        db.insert_multimanga(&mut multimanga).await.unwrap();

        let err = db.remove_manga_from_multimanga(&mut multimanga, "https://a.org/m").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        let err = db.remove_manga_from_multimanga(&mut multimanga, "https://x.org/m").await.unwrap_err();
        assert!(matches!(err, MangaTrackError::MangaNotFoundInMultiManga));

        // deleting the member directly hits the same guard
        let err = db.delete_manga(&multimanga.mangas[0]).await.unwrap_err();
        assert!(matches!(err.root(), MangaTrackError::AttemptedToDeleteCurrentManga));
    }

    #[tokio::test]
    async fn add_member_and_refresh_current() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = two_member_multimanga(&db).await;

        let mut c = manga("https://c.org/m", "12");
        c.last_read_chapter = Some(chapter("https://c.org/m/c3", "3", ChapterType::Read));
        db.add_manga_to_multimanga(&mut multimanga, &c).await.unwrap();
        assert_eq!(multimanga.mangas.len(), 3);
        assert!(multimanga.mangas[2].last_read_chapter.is_none());

        db.refresh_multimanga_current_manga(&mut multimanga).await.unwrap();
        assert_eq!(multimanga.current_manga_url, "https://c.org/m");

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored, multimanga);

        let err = db.add_manga_to_multimanga(&mut multimanga, &c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(multimanga.mangas.len(), 3);
    }

    #[tokio::test]
    async fn read_chapter_upsert_and_status() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = two_member_multimanga(&db).await;

        let c10 = chapter("https://b.org/m/c10", "10", ChapterType::Read);
        db.upsert_multimanga_chapter(&mut multimanga, &c10).await.unwrap();
        let upload = chapter("https://b.org/m/c11", "11", ChapterType::Upload);
        let err = db.upsert_multimanga_chapter(&mut multimanga, &upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = db.update_multimanga_status(&mut multimanga, 9).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        db.update_multimanga_status(&mut multimanga, 3).await.unwrap();

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored.status, MangaStatus::OnHold);
        assert_eq!(stored.last_read_chapter, Some(c10));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM chapters WHERE type = 2").await, 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_members_and_chapters() {
        let db = Database::in_memory().await.unwrap();
        let multimanga = two_member_multimanga(&db).await;
        db.insert_manga(&mut manga("https://other.org/m", "1")).await.unwrap();

        db.delete_multimanga(&multimanga).await.unwrap();
        let err = db.get_multimanga(multimanga.id.unwrap()).await.unwrap_err();
        assert!(matches!(err.root(), MangaTrackError::MultiMangaNotFoundDB));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM mangas").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM chapters").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM multimanga_mangas").await, 0);

        let err = db.delete_multimanga(&multimanga).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn standalone_manga_becomes_multimanga() {
        let db = Database::in_memory().await.unwrap();
        let mut m = manga("https://a.org/m", "5");
        m.status = MangaStatus::OnHold;
        m.last_read_chapter = Some(chapter("https://a.org/m/c4", "4", ChapterType::Read));
        db.insert_manga(&mut m).await.unwrap();

        let multimanga = db.turn_into_multimanga(&mut m).await.unwrap();
        assert_eq!(m.manga_type, MangaType::Member);
        assert!(m.last_read_chapter.is_none());
        assert_eq!(multimanga.status, MangaStatus::OnHold);
        assert_eq!(multimanga.last_read_chapter.as_ref().unwrap().chapter, "4");

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored, multimanga);
        assert_eq!(db.get_manga_by_url("https://a.org/m").await.unwrap(), m);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM chapters WHERE manga_id IS NOT NULL AND type = 2").await, 0);

        let err = db.turn_into_multimanga(&mut m).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn current_manga_update_does_not_check_membership() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = two_member_multimanga(&db).await;
        let mut outsider = manga("https://x.org/m", "1");
        db.insert_manga(&mut outsider).await.unwrap();

        db.update_multimanga_current_manga(&mut multimanga, &outsider).await.unwrap();

        let err = db.get_multimanga(multimanga.id.unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let unsaved = manga("https://y.org/m", "1");
        let err = db.update_multimanga_current_manga(&mut multimanga, &unsaved).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn multimanga_cover_update() {
        let db = Database::in_memory().await.unwrap();
        let mut multimanga = two_member_multimanga(&db).await;

        db.update_multimanga_cover_img(&mut multimanga, vec![4, 2], true, "https://me/cover.png", true)
            .await
            .unwrap();
        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored.cover_img, vec![4, 2]);
        assert!(stored.cover_img_resized);
        assert_eq!(stored.cover_img_url, "https://me/cover.png");
        assert!(stored.cover_img_fixed);
        assert_eq!(stored, multimanga);

        db.update_multimanga_cover_img(&mut multimanga, Vec::new(), false, "", false)
            .await
            .unwrap();
        assert!(!db.get_multimanga(multimanga.id.unwrap()).await.unwrap().cover_img_fixed);

        let mut ghost = MultiManga::new(MangaStatus::Reading, multimanga.mangas.clone(), "https://a.org/m");
        ghost.id = Some(999);
        let err = db.update_multimanga_cover_img(&mut ghost, vec![1], false, "", true).await.unwrap_err();
        assert!(matches!(err, MangaTrackError::MultiMangaNotFoundDB));
        assert!(!ghost.cover_img_fixed);
    }

    #[tokio::test]
    async fn fixed_cover_moves_to_multimanga() {
        let db = Database::in_memory().await.unwrap();
        let mut m = manga("https://a.org/m", "5");
        db.insert_manga(&mut m).await.unwrap();
        db.update_manga_cover_img(&mut m, vec![3], false, "https://me/c.png", true).await.unwrap();

        let multimanga = db.turn_into_multimanga(&mut m).await.unwrap();
        assert!(multimanga.cover_img_fixed);
        assert_eq!(multimanga.cover_img, vec![3]);
        assert!(!m.cover_img_fixed);

        let stored = db.get_multimanga(multimanga.id.unwrap()).await.unwrap();
        assert_eq!(stored, multimanga);
        assert_eq!(stored.display_cover(), (&[3u8][..], "https://me/c.png"));

        let mut fixed_member = manga("https://b.org/m", "6");
        fixed_member.cover_img_fixed = true;
        let mut multimanga = stored;
        db.add_manga_to_multimanga(&mut multimanga, &fixed_member).await.unwrap();
        assert!(!db.get_manga_by_url("https://b.org/m").await.unwrap().cover_img_fixed);
    }
}
