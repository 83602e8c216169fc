use crate::core::config::{Config, ImageConfig, ImageMode};
use crate::core::history::ImageReference;
use crate::services::retry::{run_with_retry, AttemptOutcome, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Illustration {
    pub reference: ImageReference,
    pub attempts: u32,
}

#[async_trait]
pub trait Illustrator: Send + Sync {
    async fn illustrate(&self, prompt: &str) -> Result<Illustration>;
}

/// Returns `None` when illustrations are disabled.
pub fn create_illustrator(config: &Config) -> Result<Option<Box<dyn Illustrator>>> {
    info!("Initializing image generation in {:?} mode", config.image.mode);
    match config.image.mode {
        ImageMode::Disabled => Ok(None),
        ImageMode::Pull => Ok(Some(Box::new(PullIllustrator::new(config.image.clone())?))),
        ImageMode::Push => {
            let token = config
                .image_api_key()
                .context("Image API token missing (HF_TOKEN)")?;
            let transport = HttpImageTransport::new(
                &config.image.push.url,
                &token,
                Duration::from_secs(config.image.timeout_seconds),
            )?;
            Ok(Some(Box::new(PushIllustrator::new(config.image.clone(), transport))))
        }
    }
}

// --- Pull ---

/// Builds an image URL the renderer resolves on its own.
pub struct PullIllustrator {
    config: ImageConfig,
    base: Url,
}

impl PullIllustrator {
    pub fn new(config: ImageConfig) -> Result<Self> {
        let base = Url::parse(&config.pull.base_url)
            .with_context(|| format!("Invalid image base url: {}", config.pull.base_url))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("Image base url cannot take a path: {}", base));
        }
        Ok(Self { config, base })
    }

    pub fn build_url(&self, prompt: &str, seed: u32) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Image base url cannot take a path: {}", self.base))?
            .pop_if_empty()
            .push(&self.config.styled_prompt(prompt));
        url.query_pairs_mut()
            .append_pair("width", &self.config.width.to_string())
            .append_pair("height", &self.config.height.to_string())
            .append_pair("seed", &seed.to_string())
            .append_pair("nologo", "true");
        Ok(url)
    }
}

#[async_trait]
impl Illustrator for PullIllustrator {
    async fn illustrate(&self, prompt: &str) -> Result<Illustration> {
        // Fresh seed per request so identical prompts don't hit a cached image.
        let url = self.build_url(prompt, rand::random::<u32>())?;
        debug!("Image url: {}", url);
        Ok(Illustration {
            reference: ImageReference::Remote {
                prompt: prompt.to_string(),
                url: url.to_string(),
            },
            attempts: 1,
        })
    }
}

// --- Push ---

#[derive(Debug)]
pub struct TransportReply {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ImageTransport: Send + Sync {
    async fn send(&self, payload: &Value) -> Result<TransportReply>;
}

pub struct HttpImageTransport {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpImageTransport {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build image HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            token: token.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ImageTransport for HttpImageTransport {
    async fn send(&self, payload: &Value) -> Result<TransportReply> {
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(payload)
            .send()
            .await
            .context("Failed to send image request")?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("Failed to read image response")?;
        Ok(TransportReply {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify(reply: TransportReply) -> AttemptOutcome<Vec<u8>> {
    match reply.status {
        200 => AttemptOutcome::Ready(reply.body),
        503 => AttemptOutcome::Loading,
        429 => AttemptOutcome::RateLimited,
        status => AttemptOutcome::Failed(anyhow!(
            "Image API error {}: {}",
            status,
            String::from_utf8_lossy(&reply.body)
        )),
    }
}

/// Sends the description to a hosted model and waits for image bytes,
/// backing off while the model warms up or throttles.
pub struct PushIllustrator<T: ImageTransport> {
    config: ImageConfig,
    policy: RetryPolicy,
    transport: T,
}

impl<T: ImageTransport> PushIllustrator<T> {
    pub fn new(config: ImageConfig, transport: T) -> Self {
        let policy = RetryPolicy::from_backoff(config.retry_attempts, config.retry_backoff_seconds);
        Self {
            config,
            policy,
            transport,
        }
    }

    fn payload(&self, prompt: &str) -> Value {
        json!({
            "inputs": self.config.styled_prompt(prompt),
            "parameters": {
                "width": self.config.width,
                "height": self.config.height,
            }
        })
    }
}

#[async_trait]
impl<T: ImageTransport> Illustrator for PushIllustrator<T> {
    async fn illustrate(&self, prompt: &str) -> Result<Illustration> {
        let payload = self.payload(prompt);
        let payload = &payload;
        let transport = &self.transport;
        let report = run_with_retry(&self.policy, "Image generator", move |_| async move {
            match transport.send(payload).await {
                Ok(reply) => classify(reply),
                Err(e) => AttemptOutcome::Failed(e),
            }
        })
        .await;

        let bytes = report.result?;
        debug!("Image received ({} bytes, {} attempts)", bytes.len(), report.attempts);
        Ok(Illustration {
            reference: ImageReference::Bytes(bytes),
            attempts: report.attempts,
        })
    }
}
