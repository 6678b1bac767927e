use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mangatrack::config::Config;
use mangatrack::database::Database;
use mangatrack::models::{
    filter_unread_chapter_mangas, sort_mangas_by_last_upload, ChapterQuery, ChapterType, Manga, MangaType, MultiManga,
};
use mangatrack::registry::SourceRegistry;
use mangatrack::utils::{HttpClient, ImageFetcher};

const REFRESH_CONCURRENCY: usize = 4;

#[derive(Parser)]
#[command(name = "mangatrack")]
#[command(about = "Track manga releases and reading progress across sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init {
        /// Also write a default configuration file to this path
        #[arg(long)]
        write_config: Option<PathBuf>,
    },
    /// Start tracking the manga at URL
    Add {
        url: String,
        /// Track it even if its last chapter can't be fetched
        #[arg(long)]
        ignore_last_chapter_error: bool,
    },
    /// List tracked mangas, newest release first
    List {
        /// Only mangas with an unread chapter
        #[arg(short, long)]
        unread: bool,
    },
    /// Show a tracked manga
    Show { url: String },
    /// List every chapter the source has for URL
    Chapters { url: String },
    /// Search a source, e.g. `search mangadex.org "one piece"`
    Search {
        source: String,
        term: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Mark a chapter (label or chapter URL) as read
    Read { url: String, chapter: String },
    /// Set the reading status (1 Reading, 2 Completed, 3 On Hold, 4 Dropped, 5 Plan to Read)
    Status { url: String, status: i16 },
    /// Fetch the last upload chapter of every tracked manga
    Refresh,
    /// Stop tracking the manga at URL
    Remove { url: String },
    /// Pin a custom cover image so refreshes keep it, or release the pin
    Cover {
        url: String,
        /// Image to download and pin; omit to release the pinned cover
        image_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging.level, cli.verbose);

    let db = Database::new(&config.database.url, config.database.max_connections).await?;

    match cli.command {
        Commands::Init { write_config } => {
            info!("Initializing manga tracker...");
            db.init().await?;
            if let Some(path) = write_config {
                Config::write_default(&path)?;
                info!("Wrote default configuration to {:?}", path);
            }
            info!("Database initialized successfully");
        }
        Commands::Add { url, ignore_last_chapter_error } => {
            let registry = SourceRegistry::with_default_sources(&config).await?;
            let mut manga = registry.get_manga_metadata(&url, ignore_last_chapter_error).await?;
            db.insert_manga(&mut manga).await?;
            println!("Added '{}' ({})", manga.name, manga.source);
        }
        Commands::List { unread } => {
            let mut mangas = db.get_mangas_by_type(MangaType::Standalone).await?;
            if unread {
                mangas = filter_unread_chapter_mangas(mangas);
            }
            sort_mangas_by_last_upload(&mut mangas);
            print_mangas(&mangas);

            for multimanga in db.get_multimangas().await? {
                print_multimanga(&multimanga);
            }
        }
        Commands::Show { url } => {
            let manga = db.get_manga_by_url(&url).await?;
            print_manga(&manga);
        }
        Commands::Chapters { url } => {
            let registry = SourceRegistry::with_default_sources(&config).await?;
            let internal_id = db.get_manga_by_url(&url).await.ok().map(|m| m.internal_id);
            let chapters = registry
                .get_chapters_metadata(&url, internal_id.as_deref())
                .await?;
            println!("{:<10} {:<40} {:<20}", "Chapter", "Name", "Updated");
            println!("{}", "-".repeat(72));
            for chapter in &chapters {
                println!(
                    "{:<10} {:<40} {:<20}",
                    chapter.chapter,
                    truncate(&chapter.name, 40),
                    chapter.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("{} chapters", chapters.len());
        }
        Commands::Search { source, term, limit } => {
            let registry = SourceRegistry::with_default_sources(&config).await?;
            let results = registry.search(&source, &term, limit).await?;
            for result in results {
                println!("{:<40} {:<8} {}", truncate(&result.name, 40), result.last_chapter, result.url);
            }
        }
        Commands::Read { url, chapter } => {
            let registry = SourceRegistry::with_default_sources(&config).await?;
            mark_read(&db, &registry, &url, &chapter).await?;
        }
        Commands::Status { url, status } => {
            let mut manga = db.get_manga_by_url(&url).await?;
            match find_multimanga(&db, &manga).await? {
                Some(mut multimanga) => db.update_multimanga_status(&mut multimanga, status).await?,
                None => db.update_manga_status(&mut manga, status).await?,
            }
            info!("Status of '{}' set to {}", url, status);
        }
        Commands::Refresh => {
            let registry = SourceRegistry::with_default_sources(&config).await?;
            refresh(&db, &registry).await?;
        }
        Commands::Remove { url } => {
            let manga = db.get_manga_by_url(&url).await?;
            match find_multimanga(&db, &manga).await? {
                Some(multimanga) if multimanga.mangas.len() == 1 => db.delete_multimanga(&multimanga).await?,
                Some(mut multimanga) => db.remove_manga_from_multimanga(&mut multimanga, &url).await?,
                None => db.delete_manga(&manga).await?,
            }
            println!("Removed '{}'", manga.name);
        }
        Commands::Cover { url, image_url } => {
            let images = ImageFetcher::new(HttpClient::new(&config.http)?, config.images.clone());
            set_cover(&db, &images, &url, image_url.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("mangatrack={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

async fn find_multimanga(db: &Database, manga: &Manga) -> Result<Option<MultiManga>> {
    if manga.manga_type != MangaType::Member {
        return Ok(None);
    }
    let multimanga = db
        .get_multimangas()
        .await?
        .into_iter()
        .find(|mm| mm.find_manga(&manga.url).is_some());
    Ok(multimanga)
}

async fn mark_read(db: &Database, registry: &SourceRegistry, url: &str, chapter: &str) -> Result<()> {
    let mut manga = db.get_manga_by_url(url).await?;
    let query = if chapter.starts_with("http://") || chapter.starts_with("https://") {
        ChapterQuery::by_url(chapter)
    } else {
        ChapterQuery::by_chapter(chapter)
    };

    let mut read = registry
        .get_chapter_metadata(&manga.url, Some(&manga.internal_id), &query)
        .await?;
    read.chapter_type = ChapterType::Read;

    match find_multimanga(db, &manga).await? {
        Some(mut multimanga) => db.upsert_multimanga_chapter(&mut multimanga, &read).await?,
        None => db.upsert_manga_chapter(&mut manga, &read).await?,
    }
    println!("Marked chapter {} of '{}' as read", read.chapter, manga.name);
    Ok(())
}

/// A multimanga member's cover is pinned on the multimanga itself.
async fn set_cover(db: &Database, images: &ImageFetcher, url: &str, image_url: Option<&str>) -> Result<()> {
    let mut manga = db.get_manga_by_url(url).await?;
    let pinned = match image_url {
        Some(image_url) => Some((images.get_image_from_url(image_url).await?, image_url)),
        None => None,
    };

    match (find_multimanga(db, &manga).await?, pinned) {
        (Some(mut multimanga), Some(((img, resized), image_url))) => {
            db.update_multimanga_cover_img(&mut multimanga, img, resized, image_url, true)
                .await?
        }
        (Some(mut multimanga), None) => {
            let (img, resized, image_url) = (
                multimanga.cover_img.clone(),
                multimanga.cover_img_resized,
                multimanga.cover_img_url.clone(),
            );
            db.update_multimanga_cover_img(&mut multimanga, img, resized, &image_url, false)
                .await?
        }
        (None, Some(((img, resized), image_url))) => {
            db.update_manga_cover_img(&mut manga, img, resized, image_url, true).await?
        }
        (None, None) => {
            let (img, resized, image_url) = (manga.cover_img.clone(), manga.cover_img_resized, manga.cover_img_url.clone());
            db.update_manga_cover_img(&mut manga, img, resized, &image_url, false).await?
        }
    }

    match image_url {
        Some(_) => println!("Pinned cover of '{}'", manga.name),
        None => println!("Cover of '{}' follows the source again", manga.name),
    }
    Ok(())
}

async fn refresh(db: &Database, registry: &SourceRegistry) -> Result<()> {
    let mangas = db.get_mangas().await?;
    info!("Refreshing {} mangas", mangas.len());

    let fetched: Vec<_> = stream::iter(mangas)
        .map(|manga| async move {
            let fetched = registry.get_manga_metadata(&manga.url, true).await;
            (manga, fetched)
        })
        .buffer_unordered(REFRESH_CONCURRENCY)
        .collect()
        .await;

    let mut updated = 0;
    let mut failed = 0;
    for (mut manga, fetched) in fetched {
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                error!("{}", err);
                failed += 1;
                continue;
            }
        };
        let before = manga.last_upload_chapter.as_ref().map(|c| c.chapter.clone());
        if let Err(err) = db.update_manga_metadata(&mut manga, &fetched).await {
            error!("{}", err);
            failed += 1;
            continue;
        }
        let after = manga.last_upload_chapter.as_ref().map(|c| c.chapter.clone());
        if before != after {
            println!("{}: new chapter {}", manga.name, after.unwrap_or_default());
            updated += 1;
        }
    }

    for mut multimanga in db.get_multimangas().await? {
        if let Err(err) = db.refresh_multimanga_current_manga(&mut multimanga).await {
            warn!("{}", err);
        }
    }

    println!("{updated} mangas with new chapters, {failed} failed");
    if failed > 0 && updated == 0 {
        bail!("every refreshed manga failed");
    }
    Ok(())
}

fn print_mangas(mangas: &[Manga]) {
    println!("{:<40} {:<14} {:<10} {:<10}", "Manga", "Status", "Last", "Read");
    println!("{}", "-".repeat(76));
    for manga in mangas {
        println!(
            "{:<40} {:<14} {:<10} {:<10}",
            truncate(&manga.name, 40),
            manga.status.to_string(),
            chapter_label(manga, ChapterType::Upload),
            chapter_label(manga, ChapterType::Read),
        );
    }
}

fn print_multimanga(multimanga: &MultiManga) {
    let current = multimanga.current_manga();
    println!(
        "{:<40} {:<14} {:<10} {:<10}",
        truncate(current.map(|m| m.name.as_str()).unwrap_or("?"), 40),
        multimanga.status.to_string(),
        current.map(|m| chapter_label(m, ChapterType::Upload)).unwrap_or_default(),
        multimanga.last_read_chapter.as_ref().map(|c| c.chapter.as_str()).unwrap_or("-"),
    );
    for member in &multimanga.mangas {
        println!("    {} ({})", member.url, member.source);
    }
}

fn print_manga(manga: &Manga) {
    println!("Name:    {}", manga.name);
    println!("Source:  {}", manga.source);
    println!("URL:     {}", manga.url);
    println!("Status:  {}", manga.status);
    if let Some(group) = &manga.preferred_group {
        println!("Group:   {}", group);
    }
    if !manga.cover_img_url.is_empty() {
        let pinned = if manga.cover_img_fixed { " (pinned)" } else { "" };
        println!("Cover:   {}{}", manga.cover_img_url, pinned);
    }
    for (label, chapter) in [("Last", &manga.last_upload_chapter), ("Read", &manga.last_read_chapter)] {
        if let Some(chapter) = chapter {
            println!("{label}:    {} - {} ({})", chapter.chapter, chapter.name, chapter.url);
        }
    }
}

fn chapter_label(manga: &Manga, chapter_type: ChapterType) -> String {
    manga
        .chapter(chapter_type)
        .map(|c| c.chapter.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
