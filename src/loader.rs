//! Stand-in for the browser's image loader.
//!
//! Runs the page's lazy-load step (moving a parked URL into `src`), then
//! probes the image over HTTP to learn its natural size and fires the
//! element's load event. Probes are rate limited per page.

use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use image::io::Reader as ImageReader;
use std::io::Cursor;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

use crate::dom::ImageElement;
use crate::error::Result;
use crate::sites::{is_placeholder, SiteHandler};
use crate::utils::HttpClient;

const MAX_CONCURRENT_PROBES: usize = 4;

pub struct ImageLoader {
    http: HttpClient,
    limiter: Arc<DefaultDirectRateLimiter>,
    referer: Option<String>,
}

impl ImageLoader {
    pub fn new(http: HttpClient, probes_per_second: u32, referer: Option<String>) -> Self {
        let rate = NonZeroU32::new(probes_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            http,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
            referer,
        }
    }

    /// What the page's lazy-loader script does when an image scrolls into view.
    pub fn reveal(&self, site: &SiteHandler, element: &ImageElement) {
        if !is_placeholder(&element.src()) && !element.src().trim().is_empty() {
            return;
        }
        if let Some(url) = site.get_image_url(element) {
            debug!("[LOADER] revealing lazy image {}", url);
            element.set_attribute("src", &url);
        }
    }

    /// Loads the current `src` and marks the element loaded (or broken).
    pub async fn load(&self, element: &ImageElement) {
        let src = element.src();
        let url = match element.resolve_url(&src) {
            Some(url) if url.starts_with("http") => url,
            _ => return,
        };

        self.limiter.until_ready().await;
        match self.probe(&url).await {
            Ok((width, height)) => {
                debug!("[LOADER] {} is {}x{}", url, width, height);
                // The page may have swapped sources while we were fetching.
                if element.src() == src {
                    element.mark_loaded(width, height);
                }
            }
            Err(e) => {
                debug!("[LOADER] could not load {}: {}", url, e);
                if element.src() == src {
                    element.mark_broken();
                }
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<(u32, u32)> {
        let data = self.http.get_bytes(url, self.referer.as_deref()).await?;
        let dimensions = ImageReader::new(Cursor::new(&data[..]))
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(dimensions)
    }

    /// Reveals and loads every element, a few at a time.
    pub async fn load_all(&self, site: &SiteHandler, elements: Vec<ImageElement>) {
        stream::iter(elements)
            .for_each_concurrent(MAX_CONCURRENT_PROBES, |element| async move {
                self.reveal(site, &element);
                self.load(&element).await;
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractConfig;
    use image::{ImageOutputFormat, RgbImage};
    use std::time::Duration;
    use url::Url;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::new(width, height).write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    fn loader() -> ImageLoader {
        let http = HttpClient::new(&ExtractConfig::default(), Duration::from_secs(5)).unwrap();
        ImageLoader::new(http, 100, None)
    }

    #[tokio::test]
    async fn reveals_lazy_url_and_reports_natural_size() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/p1.png")
            .with_header("content-type", "image/png")
            .with_body(png(320, 480))
            .create_async()
            .await;

        let page = Url::parse(&format!("{}/manga/x/chapter-1", server.url())).unwrap();
        let site = SiteHandler::for_url(&page);
        let img = ImageElement::detached(&page, 0.0, &[("src", "data:image/gif;base64,R0lG"), ("data-src", "/p1.png")]);
        let mut events = img.subscribe();

        loader().load_all(&site, vec![img.clone()]).await;

        assert_eq!(img.src(), format!("{}/p1.png", server.url()));
        assert_eq!(img.natural_size(), (320, 480));
        assert!(img.is_complete());
        assert_eq!(events.recv().await.unwrap(), crate::dom::ElementEvent::AttributeChanged("src".into()));
        assert_eq!(events.recv().await.unwrap(), crate::dom::ElementEvent::Loaded);
    }

    #[tokio::test]
    async fn failed_load_is_broken_not_loaded() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("GET", "/missing.jpg").with_status(404).create_async().await;

        let page = Url::parse(&server.url()).unwrap();
        let img = ImageElement::detached(&page, 0.0, &[("src", "/missing.jpg")]);
        loader().load(&img).await;
        assert!(img.is_complete());
        assert_eq!(img.natural_size(), (0, 0));
    }
}
