//! Privileged fetch host.
//!
//! Stands in for the higher-trust process that is not bound by the page's
//! cross-origin rules. Pages talk to it only through [`HostHandle`] messages
//! of the shape `{type: "FETCH_IMAGE", imageUrl}` and get back
//! `{success, base64Data}` or `{success: false, error}`.

use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LiftError, Result};
use crate::utils::HttpClient;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRequest {
    FetchImage {
        #[serde(rename = "imageUrl")]
        image_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchImageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchImageResponse {
    pub fn ok(data: &[u8]) -> Self {
        Self {
            success: true,
            base64_data: Some(general_purpose::STANDARD.encode(data)),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            base64_data: None,
            error: Some(error.into()),
        }
    }

    /// Decodes a reply into bytes, keeping "the fetch failed upstream"
    /// separate from transport problems.
    pub fn into_bytes(self) -> Result<Bytes> {
        if !self.success {
            return Err(LiftError::privileged_fetch_failed(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let data = self
            .base64_data
            .ok_or_else(|| LiftError::privileged_fetch_failed("reply carried no data"))?;
        let decoded = general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| LiftError::privileged_fetch_failed(format!("bad base64 payload: {}", e)))?;
        Ok(Bytes::from(decoded))
    }
}

pub struct HostMessage {
    pub request: HostRequest,
    pub reply: oneshot::Sender<FetchImageResponse>,
}

/// Page-side end of the privileged channel.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostMessage>,
}

impl HostHandle {
    /// A handle plus the receiving end, for custom host implementations.
    pub fn channel() -> (Self, mpsc::Receiver<HostMessage>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn fetch_image(&self, image_url: &str, timeout: Duration) -> Result<Bytes> {
        let (reply, response) = oneshot::channel();
        let message = HostMessage {
            request: HostRequest::FetchImage { image_url: image_url.to_string() },
            reply,
        };
        self.tx.send(message).await.map_err(|_| LiftError::HostInvalidated)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => reply.into_bytes(),
            // Reply dropped without an answer.
            Ok(Err(_)) => Err(LiftError::HostUnavailable),
            Err(_) => Err(LiftError::timeout("privileged fetch")),
        }
    }
}

/// The privileged side: fetches with its own client, sending the page as
/// referer the way the reader itself would.
pub struct PrivilegedHost {
    http: HttpClient,
    referer: Option<String>,
}

impl PrivilegedHost {
    pub fn new(http: HttpClient, referer: Option<String>) -> Self {
        Self { http, referer }
    }

    pub fn spawn(self) -> (HostHandle, JoinHandle<()>) {
        let (handle, rx) = HostHandle::channel();
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<HostMessage>) {
        info!("[HOST] privileged fetch host started");
        while let Some(message) = rx.recv().await {
            let http = self.http.clone();
            let referer = self.referer.clone();
            tokio::spawn(async move {
                let HostRequest::FetchImage { image_url } = message.request;
                debug!("[HOST] FETCH_IMAGE {}", image_url);
                let response = match http.get_bytes(&image_url, referer.as_deref()).await {
                    Ok(data) => FetchImageResponse::ok(&data),
                    Err(e) => {
                        warn!("[HOST] fetch failed for {}: {}", image_url, e);
                        FetchImageResponse::failed(e.to_string())
                    }
                };
                // The page may have given up waiting; nothing to do then.
                let _ = message.reply.send(response);
            });
        }
        info!("[HOST] privileged fetch host stopped");
    }
}
