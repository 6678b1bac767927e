use crate::config::{HttpConfig, ImageConfig};
use crate::error::{MangaTrackError, Result};
use backoff::ExponentialBackoffBuilder;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use image::{imageops::FilterType, ImageFormat, ImageOutputFormat};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::io::Cursor;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client, limiter: None })
    }

    /// Returns a client sharing the same connection pool but throttled to `per_second` requests.
    pub fn with_rate_limit(&self, per_second: Option<u32>) -> Self {
        let limiter = per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Self {
            client: self.client.clone(),
            limiter,
        }
    }

    /// Sends a GET without looking at the status code.
    pub async fn get_raw(&self, url: &str) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        Ok(response)
    }

    /// Sends a GET and turns a non-2xx response into [`MangaTrackError::HttpStatus`].
    pub async fn get(&self, url: &str) -> Result<Response> {
        let response = self.get_raw(url).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MangaTrackError::HttpStatus {
                status,
                url: url.to_string(),
                body,
            });
        }

        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let text = self.get(url).await?.text().await?;
        Ok(text)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get(url).await?.bytes().await?;
        let value = serde_json::from_slice(&body)?;
        Ok(value)
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self.get(url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Downloads cover images and shrinks them to the configured size.
#[derive(Clone)]
pub struct ImageFetcher {
    http_client: HttpClient,
    config: ImageConfig,
}

impl ImageFetcher {
    pub fn new(http_client: HttpClient, config: ImageConfig) -> Self {
        Self { http_client, config }
    }

    /// Returns the image bytes and whether they were resized.
    ///
    /// Server errors and network failures are retried with exponential backoff;
    /// a 4xx response fails immediately. An image that can't be decoded is
    /// returned as downloaded.
    pub async fn get_image_from_url(&self, url: &str) -> Result<(Vec<u8>, bool)> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_initial_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.retry_max_elapsed_ms)))
            .build();

        let bytes = backoff::future::retry(policy, || async move {
            self.http_client.get_bytes(url).await.map_err(|err| {
                let client_error = matches!(
                    &err,
                    MangaTrackError::HttpStatus { status, .. } if (400..500).contains(status)
                );
                if client_error {
                    backoff::Error::permanent(err)
                } else {
                    debug!("retrying image download '{}': {}", url, err);
                    backoff::Error::transient(err)
                }
            })
        })
        .await
        .map_err(|e| e.context(format!("error downloading image '{url}'")))?;

        match resize_image(&bytes, self.config.width, self.config.height) {
            Ok(resized) => Ok((resized, true)),
            Err(err) => {
                warn!("keeping image '{}' at original size: {}", url, err);
                Ok((bytes, false))
            }
        }
    }
}

/// Resizes a PNG or JPEG image to exactly `width`x`height`, keeping its format.
pub fn resize_image(bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let format = image::guess_format(bytes)?;
    let output = match format {
        ImageFormat::Png => ImageOutputFormat::Png,
        ImageFormat::Jpeg => ImageOutputFormat::Jpeg(90),
        other => {
            return Err(MangaTrackError::UnsupportedImageFormat(format!("{other:?}")));
        }
    };

    let img = image::load_from_memory_with_format(bytes, format)?;
    let resized = img.resize_exact(width, height, FilterType::Lanczos3);

    let mut buf = Cursor::new(Vec::new());
    resized.write_to(&mut buf, output)?;
    Ok(buf.into_inner())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn resize_png_to_configured_size() {
        let resized = resize_image(&png_bytes(40, 60), 10, 15).unwrap();
        let img = image::load_from_memory(&resized).unwrap();
        assert_eq!((img.width(), img.height()), (10, 15));
        assert_eq!(image::guess_format(&resized).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn resize_rejects_garbage() {
        assert!(resize_image(b"not an image", 10, 10).is_err());
    }

    #[tokio::test]
    async fn get_maps_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("nope")
            .create_async()
            .await;

        let err = http_client()
            .get_text(&format!("{}/missing", server.url()))
            .await
            .unwrap_err();
        match err {
            MangaTrackError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn image_fetcher_resizes_downloaded_cover() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/cover.png")
            .with_status(200)
            .with_body(png_bytes(500, 710))
            .create_async()
            .await;

        let (bytes, resized) = image_fetcher()
            .get_image_from_url(&format!("{}/cover.png", server.url()))
            .await
            .unwrap();
        assert!(resized);
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (250, 355));
    }

    #[tokio::test]
    async fn image_fetcher_keeps_undecodable_bytes() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/cover.bin")
            .with_status(200)
            .with_body("plain bytes")
            .create_async()
            .await;

        let (bytes, resized) = image_fetcher()
            .get_image_from_url(&format!("{}/cover.bin", server.url()))
            .await
            .unwrap();
        assert!(!resized);
        assert_eq!(bytes, b"plain bytes");
    }

    #[tokio::test]
    async fn image_fetcher_does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/gone.png")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = image_fetcher()
            .get_image_from_url(&format!("{}/gone.png", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        m.assert_async().await;
    }
}
