//! Manga tracker: follows series across sources and records upload/read progress.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod sources;
pub mod traits;
pub mod utils;

pub use error::{MangaTrackError, Result};
