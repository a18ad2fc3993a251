//! Byte extraction with a tiered fallback chain.
//!
//! 1. local redraw: a CORS-clean load decoded and re-encoded locally
//! 2. direct fetch: plain cross-origin request, no credentials
//! 3. privileged fetch: delegated to the host process
//!
//! Each failure falls through to the next tier. Sites whose CDN is known to
//! refuse cross-origin access go straight to tier 3.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageOutputFormat};
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use reqwest::Client;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExtractConfig;
use crate::error::{LiftError, Result};
use crate::host::HostHandle;
use crate::utils::{check_status, map_timeout};

#[async_trait]
pub trait ByteSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Tier 1. Loads the image the way an `<img crossorigin="anonymous">` would
/// and redraws it onto an offscreen surface.
pub struct RedrawSource {
    client: Client,
    origin: String,
    jpeg_quality: u8,
}

impl RedrawSource {
    pub fn new(client: Client, origin: impl Into<String>, jpeg_quality: u8) -> Self {
        Self {
            client,
            origin: origin.into(),
            jpeg_quality,
        }
    }
}

#[async_trait]
impl ByteSource for RedrawSource {
    fn name(&self) -> &'static str {
        "redraw"
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = check_status(self.client.get(url).header(ORIGIN, self.origin.as_str()).send().await?)?;

        let allowed = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "*" || v == self.origin)
            .unwrap_or(false);
        if !allowed {
            return Err(LiftError::tainted(format!("{} is not readable from {}", url, self.origin)));
        }

        let data = response.bytes().await?;
        let quality = self.jpeg_quality;
        let encoded = tokio::task::spawn_blocking(move || redraw(&data, quality))
            .await
            .map_err(|e| LiftError::tainted(format!("redraw task failed: {}", e)))??;
        Ok(encoded)
    }
}

/// Decodes `data` and serializes the raster: lossy first, lossless when the
/// lossy encoder refuses the pixel format.
pub fn redraw(data: &[u8], jpeg_quality: u8) -> Result<Bytes> {
    let surface = image::load_from_memory(data)?;
    match encode_lossy(&surface, jpeg_quality) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            debug!("[EXTRACT] lossy encode refused ({}), using PNG", e);
            encode_lossless(&surface)
        }
    }
}

fn encode_lossy(surface: &DynamicImage, quality: u8) -> Result<Bytes> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder.encode(surface.as_bytes(), surface.width(), surface.height(), surface.color())?;
    Ok(Bytes::from(buffer))
}

fn encode_lossless(surface: &DynamicImage) -> Result<Bytes> {
    let mut buffer = Cursor::new(Vec::new());
    surface.write_to(&mut buffer, ImageOutputFormat::Png)?;
    Ok(Bytes::from(buffer.into_inner()))
}

/// Tier 2. `credentials: "omit"`: no cookies, no referer.
pub struct DirectSource {
    client: Client,
}

impl DirectSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteSource for DirectSource {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = check_status(self.client.get(url).send().await?)?;
        Ok(response.bytes().await?)
    }
}

/// Tier 3. Round-trip through the privileged host.
pub struct PrivilegedSource {
    host: HostHandle,
    timeout: Duration,
}

impl PrivilegedSource {
    pub fn new(host: HostHandle, timeout: Duration) -> Self {
        Self { host, timeout }
    }
}

#[async_trait]
impl ByteSource for PrivilegedSource {
    fn name(&self) -> &'static str {
        "privileged"
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.host.fetch_image(url, self.timeout).await
    }
}

pub struct ByteExtractor {
    redraw: Box<dyn ByteSource>,
    direct: Box<dyn ByteSource>,
    privileged: Box<dyn ByteSource>,
}

impl ByteExtractor {
    pub fn new(redraw: Box<dyn ByteSource>, direct: Box<dyn ByteSource>, privileged: Box<dyn ByteSource>) -> Self {
        Self { redraw, direct, privileged }
    }

    /// The standard chain for a page at `origin`.
    pub fn standard(config: &ExtractConfig, timeout: Duration, origin: &str, host: HostHandle) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.as_str())
            .referer(false)
            .build()?;
        Ok(Self::new(
            Box::new(RedrawSource::new(client.clone(), origin, config.jpeg_quality)),
            Box::new(DirectSource::new(client)),
            Box::new(PrivilegedSource::new(host, Duration::from_secs(config.privileged_timeout_secs))),
        ))
    }

    pub async fn extract(&self, url: &str, needs_privileged: bool) -> Result<Bytes> {
        let tiers: Vec<&dyn ByteSource> = if needs_privileged {
            vec![self.privileged.as_ref()]
        } else {
            vec![self.redraw.as_ref(), self.direct.as_ref(), self.privileged.as_ref()]
        };

        let mut causes = Vec::new();
        for tier in tiers {
            match tier.fetch(url).await {
                Ok(bytes) => {
                    info!("[EXTRACT] {} bytes from {} tier for {}", bytes.len(), tier.name(), url);
                    return Ok(bytes);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let e = map_timeout(e, tier.name());
                    debug!("[EXTRACT] {} tier failed for {}: {}", tier.name(), url, e);
                    causes.push(format!("{}: {}", tier.name(), e));
                }
            }
        }

        warn!("[EXTRACT] all tiers exhausted for {}", url);
        Err(LiftError::ExtractionFailed(causes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    struct StubSource {
        name: &'static str,
        result: fn() -> Result<Bytes>,
        log: CallLog,
    }

    #[async_trait]
    impl ByteSource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _url: &str) -> Result<Bytes> {
            self.log.lock().unwrap().push(self.name);
            (self.result)()
        }
    }

    fn stub(name: &'static str, result: fn() -> Result<Bytes>, log: &CallLog) -> Box<dyn ByteSource> {
        Box::new(StubSource { name, result, log: log.clone() })
    }

    fn tainted() -> Result<Bytes> {
        Err(LiftError::tainted("canvas"))
    }

    fn forbidden() -> Result<Bytes> {
        Err(LiftError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "HTTP 403")))
    }

    fn host_bytes() -> Result<Bytes> {
        Ok(Bytes::from_static(b"from-host"))
    }

    #[tokio::test]
    async fn falls_through_to_privileged_tier() {
        let log = CallLog::default();
        let extractor = ByteExtractor::new(
            stub("redraw", tainted, &log),
            stub("direct", forbidden, &log),
            stub("privileged", host_bytes, &log),
        );
        let bytes = extractor.extract("https://cdn.example/1.jpg", false).await.unwrap();
        assert_eq!(&bytes[..], b"from-host");
        assert_eq!(*log.lock().unwrap(), vec!["redraw", "direct", "privileged"]);
    }

    #[tokio::test]
    async fn privileged_sites_skip_the_first_tiers() {
        let log = CallLog::default();
        let extractor = ByteExtractor::new(
            stub("redraw", host_bytes, &log),
            stub("direct", host_bytes, &log),
            stub("privileged", host_bytes, &log),
        );
        extractor.extract("https://cdn.example/1.jpg", true).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["privileged"]);
    }

    #[tokio::test]
    async fn exhausting_every_tier_aggregates_causes() {
        let log = CallLog::default();
        let extractor = ByteExtractor::new(
            stub("redraw", tainted, &log),
            stub("direct", forbidden, &log),
            stub("privileged", || Err(LiftError::HostUnavailable), &log),
        );
        match extractor.extract("https://cdn.example/1.jpg", false).await {
            Err(LiftError::ExtractionFailed(causes)) => {
                assert_eq!(causes.len(), 3);
                assert!(causes[2].starts_with("privileged:"));
            }
            other => panic!("unexpected {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn invalidated_host_is_not_aggregated() {
        let log = CallLog::default();
        let extractor = ByteExtractor::new(
            stub("redraw", tainted, &log),
            stub("direct", forbidden, &log),
            stub("privileged", || Err(LiftError::HostInvalidated), &log),
        );
        let err = extractor.extract("https://cdn.example/1.jpg", false).await.unwrap_err();
        assert!(matches!(err, LiftError::HostInvalidated));
    }

    fn tiny_png() -> Vec<u8> {
        let img = DynamicImage::new_rgb8(4, 3);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn redraw_prefers_lossy_and_falls_back_to_png() {
        let jpeg = redraw(&tiny_png(), 92).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);

        // 16-bit surfaces are refused by the JPEG encoder.
        let deep = DynamicImage::new_rgb16(4, 3);
        let mut src = Cursor::new(Vec::new());
        deep.write_to(&mut src, ImageOutputFormat::Png).unwrap();
        let png = redraw(&src.into_inner(), 92).unwrap();
        assert_eq!(image::guess_format(&png).unwrap(), image::ImageFormat::Png);
    }

    #[tokio::test]
    async fn redraw_refuses_tainted_responses() {
        let mut server = mockito::Server::new_async().await;
        let _open = server
            .mock("GET", "/open.png")
            .with_header("access-control-allow-origin", "*")
            .with_body(tiny_png())
            .create_async()
            .await;
        let _closed = server.mock("GET", "/closed.png").with_body(tiny_png()).create_async().await;

        let source = RedrawSource::new(Client::new(), "https://reader.example", 90);
        let ok = source.fetch(&format!("{}/open.png", server.url())).await.unwrap();
        assert_eq!(image::guess_format(&ok).unwrap(), image::ImageFormat::Jpeg);

        let err = source.fetch(&format!("{}/closed.png", server.url())).await.unwrap_err();
        assert!(matches!(err, LiftError::Tainted(_)));
    }

    #[tokio::test]
    async fn taint_then_403_then_host() {
        let mut server = mockito::Server::new_async().await;
        let _page = server.mock("GET", "/page.jpg").with_status(403).create_async().await;

        let (host, mut rx) = HostHandle::channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let _ = message.reply.send(crate::host::FetchImageResponse::ok(b"host-copy"));
            }
        });

        let extractor = ByteExtractor::standard(
            &ExtractConfig::default(),
            Duration::from_secs(5),
            "https://reader.example",
            host,
        )
        .unwrap();
        let bytes = extractor.extract(&format!("{}/page.jpg", server.url()), false).await.unwrap();
        assert_eq!(&bytes[..], b"host-copy");
    }
}
