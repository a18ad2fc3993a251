use crate::config::ExtractConfig;
use crate::error::{LiftError, Result};
use bytes::Bytes;
use reqwest::{Client, Response};
use std::time::Duration;
use url::Url;

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &ExtractConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client })
    }

    /// Fetches a page and returns its final (post-redirect) location and body.
    pub async fn get_page(&self, url: &str) -> Result<(Url, String)> {
        let response = check_status(self.client.get(url).send().await?)?;
        let location = response.url().clone();
        let text = response.text().await?;
        Ok((location, text))
    }

    pub async fn get_bytes(&self, url: &str, referer: Option<&str>) -> Result<Bytes> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(reqwest::header::REFERER, referer);
        }
        let response = check_status(request.send().await?)?;
        Ok(response.bytes().await?)
    }
}

pub fn check_status(response: Response) -> Result<Response> {
    Ok(response.error_for_status()?)
}

/// Origin string (`scheme://host[:port]`) of a page URL.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// File extension the upscale service accepts for these bytes.
pub fn upload_extension(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Jpeg) => "jpg",
        Ok(image::ImageFormat::WebP) => "webp",
        _ => "png",
    }
}

pub fn map_timeout(err: LiftError, what: &str) -> LiftError {
    match err {
        LiftError::Http(e) if e.is_timeout() => LiftError::timeout(what),
        other => other,
    }
}
