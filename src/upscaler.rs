use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{LiftError, Result};
use crate::traits::UpscaleService;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub gpu_available: bool,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_loading: bool,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
    pub current: String,
    #[serde(default)]
    pub loading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
    pub cache_count: u64,
    pub cache_size_mb: f64,
    #[serde(default)]
    pub gpu_available: bool,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageReply {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct UpscaleClient {
    client: Client,
    base_url: String,
    config: ServerConfig,
}

impl UpscaleClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("mangalift/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Non-success responses become `Upscale` errors carrying the service's
    /// `{"error": ...}` message when it sent one.
    async fn ensure_success(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let detail = response
            .json::<MessageReply>()
            .await
            .ok()
            .and_then(|r| r.error)
            .unwrap_or_else(|| status.to_string());
        Err(LiftError::upscale(format!("{} returned {}: {}", what, status.as_u16(), detail)))
    }

    pub async fn models(&self) -> Result<ModelList> {
        let response = self
            .client
            .get(self.endpoint("/models"))
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "models"))?;
        Ok(Self::ensure_success(response, "models").await?.json().await?)
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        let response = self
            .client
            .get(self.endpoint("/stats"))
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "stats"))?;
        Ok(Self::ensure_success(response, "stats").await?.json().await?)
    }

    pub async fn switch_model(&self, model: &str) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("/switch-model"))
            .timeout(self.config.request_timeout())
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "switch-model"))?;
        let reply: MessageReply = Self::ensure_success(response, "switch-model").await?.json().await?;
        Ok(reply.message.unwrap_or_else(|| format!("Switched to {}", model)))
    }

    pub async fn clear_cache(&self) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("/clear-cache"))
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "clear-cache"))?;
        let reply: MessageReply = Self::ensure_success(response, "clear-cache").await?.json().await?;
        Ok(reply.message.unwrap_or_default())
    }
}

#[async_trait]
impl UpscaleService for UpscaleClient {
    async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .timeout(self.config.health_timeout())
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "health check"))?;
        Ok(Self::ensure_success(response, "health").await?.json().await?)
    }

    async fn upscale(&self, image: Bytes, file_name: &str) -> Result<Bytes> {
        let part = Part::bytes(image.to_vec()).file_name(file_name.to_string());
        let form = Form::new().part("image", part);
        let response = self
            .client
            .post(self.endpoint("/upscale"))
            .timeout(self.config.upscale_timeout())
            .multipart(form)
            .send()
            .await
            .map_err(|e| LiftError::from_service(e, "upscale"))?;
        let response = Self::ensure_success(response, "upscale").await?;
        response.bytes().await.map_err(|e| LiftError::from_service(e, "upscale"))
    }
}

/// Cached view of whether the service is up.
pub struct ServiceMonitor {
    service: Arc<dyn UpscaleService>,
    available: AtomicBool,
    last: Mutex<Option<HealthStatus>>,
}

impl ServiceMonitor {
    pub fn new(service: Arc<dyn UpscaleService>) -> Self {
        Self {
            service,
            available: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn mark_unavailable(&self) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!("[HEALTH] upscale service marked unavailable");
        }
    }

    pub fn last_health(&self) -> Option<HealthStatus> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn check(&self) -> bool {
        let healthy = match self.service.health().await {
            Ok(status) => {
                let healthy = status.is_healthy();
                debug!("[HEALTH] status={} model_loaded={}", status.status, status.model_loaded);
                *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
                healthy
            }
            Err(e) => {
                debug!("[HEALTH] check failed: {}", e);
                false
            }
        };
        let was = self.available.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            info!("[HEALTH] upscale service is now {}", if healthy { "available" } else { "unavailable" });
        }
        healthy
    }

    /// Passes when the cached flag is set, otherwise checks once.
    pub async fn ensure_available(&self) -> Result<()> {
        if self.is_available() || self.check().await {
            Ok(())
        } else {
            Err(LiftError::service_unavailable("health check failed"))
        }
    }

    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.check().await;
            }
        })
    }
}
