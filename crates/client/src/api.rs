//! Talking to the backend: one-shot requests and the resource stream.

use ferry_api::registry::{RegistryError, ResourceRegistry};
use ferry_api::stream::{RawDiff, FRAME_DELIMITER};
use ferry_core::{Resource, ResourceDiff, ResourceRequest};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// The first delay after losing the connection to the backend.
pub const DEFAULT_TIME_BEFORE_RETRY: Duration = Duration::from_secs(1);
/// The ceiling for reconnection delays.
pub const MAX_TIME_BEFORE_RETRY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend returned HTTP status {status}: {body}")]
    Api { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// An exponentially increasing retry delay: starts at one second, doubles
/// per failure, caps at one hour, and resets on success.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: DEFAULT_TIME_BEFORE_RETRY,
        }
    }

    /// The delay to sleep before the next attempt.
    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_TIME_BEFORE_RETRY);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = DEFAULT_TIME_BEFORE_RETRY;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits complete frames off the front of the receive buffer.  Bytes after
/// the last delimiter stay buffered for the next chunk.
fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == FRAME_DELIMITER) {
        let mut frame: Vec<u8> = buffer.drain(..=pos).collect();
        frame.pop();
        frames.push(frame);
    }
    frames
}

/// A client for one backend instance.
pub struct Client {
    resources_url: Url,
    stream_url: Url,
    bearer_token: String,
    client: reqwest::Client,
    registry: Arc<ResourceRegistry>,
}

impl Client {
    pub fn new(
        resources_url: &str,
        stream_url: &str,
        bearer_token: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            resources_url: Url::parse(resources_url)?,
            stream_url: Url::parse(stream_url)?,
            bearer_token: bearer_token.into(),
            client: reqwest::Client::new(),
            registry: Arc::new(ResourceRegistry::new()),
        })
    }

    /// Fetches the resources the given request is entitled to.
    pub async fn get_resources(
        &self,
        request: &ResourceRequest,
    ) -> Result<Vec<Box<dyn Resource>>, ClientError> {
        tracing::debug!(url = %self.resources_url, "requesting resources");
        let response = self
            .client
            .get(self.resources_url.clone())
            .bearer_auth(&self.bearer_token)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let values = response.json::<Vec<Value>>().await?;
        let mut resources = Vec::with_capacity(values.len());
        for value in values {
            resources.push(self.registry.decode(value)?);
        }
        Ok(resources)
    }

    /// Follows the backend's resource stream, relaying each decoded diff to
    /// the given channel.  Lost connections are re-established with
    /// exponential backoff, transparently to the receiver.  The task returns
    /// when the token is cancelled or the receiver goes away.
    pub fn start_stream(
        &self,
        request: ResourceRequest,
        diffs: UnboundedSender<ResourceDiff>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = self.stream_url.clone();
        let token = self.bearer_token.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            loop {
                if shutdown.is_cancelled() {
                    tracing::info!("stopping resource stream");
                    return;
                }

                tracing::info!(%url, "connecting to resource stream");
                let response = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = client
                        .get(url.clone())
                        .bearer_auth(&token)
                        .json(&request)
                        .send() => result,
                };

                let response = match response {
                    Ok(response) if response.status().is_success() => response,
                    Ok(response) => {
                        tracing::warn!(status = %response.status(), "resource stream rejected");
                        if !sleep_or_cancel(backoff.next(), &shutdown).await {
                            return;
                        }
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "cannot connect to resource stream");
                        if !sleep_or_cancel(backoff.next(), &shutdown).await {
                            return;
                        }
                        continue;
                    }
                };
                backoff.reset();

                if !relay_frames(response, &registry, &diffs, &shutdown).await {
                    return;
                }
                tracing::warn!("lost connection to backend; reconnecting");
            }
        })
    }
}

/// Relays frames from an established stream.  Returns false if the caller
/// should stop for good (shutdown or closed receiver) and true to reconnect.
async fn relay_frames(
    response: reqwest::Response,
    registry: &ResourceRegistry,
    diffs: &UnboundedSender<ResourceDiff>,
    shutdown: &CancellationToken,
) -> bool {
    let mut body = response.bytes_stream();
    let mut buffer = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return false,
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::warn!(%err, "error reading resource stream");
                return true;
            }
            None => return true,
        };

        buffer.extend_from_slice(&chunk);
        for frame in extract_frames(&mut buffer) {
            let raw: RawDiff = match serde_json::from_slice(&frame) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(%err, "cannot parse frame from backend");
                    continue;
                }
            };
            let diff = match raw.decode(registry) {
                Ok(diff) => diff,
                Err(err) => {
                    tracing::warn!(%err, "cannot decode resources in frame");
                    continue;
                }
            };
            if diffs.send(diff).is_err() {
                tracing::info!("diff receiver went away; stopping stream");
                return false;
            }
        }
    }
}

/// Sleeps for the given duration; false if the token fired first.
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tracing::info!(?delay, "trying again after delay");
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            backoff.next();
        }
        assert_eq!(backoff.next(), MAX_TIME_BEFORE_RETRY);
    }

    #[test]
    fn frames_survive_chunk_boundaries() {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(b"{\"a\":");
        assert!(extract_frames(&mut buffer).is_empty());

        buffer.extend_from_slice(b"1}\r{\"b\":2}\r{\"c\"");
        let frames = extract_frames(&mut buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"{\"a\":1}");
        assert_eq!(frames[1], b"{\"b\":2}");
        assert_eq!(buffer, b"{\"c\"");

        buffer.extend_from_slice(b":3}\r");
        let frames = extract_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"{\"c\":3}");
        assert!(buffer.is_empty());
    }
}
