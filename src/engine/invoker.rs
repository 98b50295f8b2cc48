// Capability invocation boundary
// The only place the orchestrator talks to the things it orchestrates

//! # Capability Invokers
//!
//! [`CapabilityInvoker`] is the seam between the orchestrator and the
//! capabilities it runs. The pipeline only ever calls `invoke` or
//! `invoke_stream`; what sits behind them (an HTTP service, an in-process
//! function table, a test double) is up to the implementation.
//!
//! ## Streaming
//!
//! `invoke_stream` yields zero or more [`StreamChunk::Partial`] values followed by
//! exactly one [`StreamChunk::Final`] or an error. Implementations that cannot
//! stream get a default that wraps `invoke` in a one-chunk stream.
//!
//! ## HTTP Wire Format
//!
//! [`HttpCapabilityInvoker`] posts `{"args": ..., "context": ...}` to
//! `{endpoint}/capabilities/{key}` and expects `{"result": ..., "usage": ...}` or
//! `{"error": "..."}`. The streaming variant posts to `.../{key}/stream` and
//! reads newline-delimited JSON objects of the same shape, plus
//! `{"partial": ...}` lines.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::models::{CapabilityKey, TokenUsage};
use crate::{OrchestratorError, Result};

/// What a successful invocation returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutput {
    pub result: Value,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Downstream target (provider/model) that actually served the call
    #[serde(default)]
    pub target: Option<String>,
}

impl InvocationOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn served_by(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Partial(Value),
    Final(InvocationOutput),
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(
        &self,
        capability: &CapabilityKey,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<InvocationOutput>;

    async fn invoke_stream(
        &self,
        capability: &CapabilityKey,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<ChunkStream> {
        let output = self.invoke(capability, args, context).await?;
        Ok(stream::once(async move { Ok(StreamChunk::Final(output)) }).boxed())
    }

    fn supports_streaming(&self, _capability: &CapabilityKey) -> bool {
        false
    }
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    args: &'a Map<String, Value>,
    context: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    partial: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl InvokeResponse {
    fn into_chunk(self, capability: &CapabilityKey) -> Result<StreamChunk> {
        if let Some(error) = self.error {
            return Err(step_error(capability, error));
        }
        if let Some(partial) = self.partial {
            return Ok(StreamChunk::Partial(partial));
        }
        Ok(StreamChunk::Final(InvocationOutput {
            result: self.result.unwrap_or(Value::Null),
            usage: self.usage.unwrap_or_default(),
            target: self.target,
        }))
    }
}

fn step_error(capability: &CapabilityKey, message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::StepFailed {
        capability: capability.to_string(),
        message: message.into(),
    }
}

/// Invokes capabilities hosted behind an HTTP endpoint
pub struct HttpCapabilityInvoker {
    client: Client,
    endpoint: String,
    streaming: HashSet<CapabilityKey>,
}

impl HttpCapabilityInvoker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            streaming: HashSet::new(),
        }
    }

    /// Capabilities whose endpoint implements the streaming route
    pub fn with_streaming<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = CapabilityKey>,
    {
        self.streaming.extend(capabilities);
        self
    }

    fn url(&self, capability: &CapabilityKey, suffix: &str) -> String {
        format!("{}/capabilities/{}{}", self.endpoint, capability, suffix)
    }

    async fn post(
        &self,
        url: &str,
        capability: &CapabilityKey,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(&InvokeRequest { args, context })
            .send()
            .await
            .map_err(|e| step_error(capability, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(step_error(capability, format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl CapabilityInvoker for HttpCapabilityInvoker {
    async fn invoke(
        &self,
        capability: &CapabilityKey,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<InvocationOutput> {
        let url = self.url(capability, "");
        debug!(capability = %capability, %url, "Invoking capability");

        let response = self.post(&url, capability, args, context).await?;
        let body: InvokeResponse = response
            .json()
            .await
            .map_err(|e| step_error(capability, format!("invalid response body: {}", e)))?;

        match body.into_chunk(capability)? {
            StreamChunk::Final(output) => Ok(output),
            StreamChunk::Partial(_) => Err(step_error(capability, "partial result from a non-streaming call")),
        }
    }

    async fn invoke_stream(
        &self,
        capability: &CapabilityKey,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<ChunkStream> {
        let url = self.url(capability, "/stream");
        debug!(capability = %capability, %url, "Invoking streaming capability");

        let response = self.post(&url, capability, args, context).await?;
        let (tx, rx) = mpsc::channel(32);
        let capability = capability.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(step_error(&capability, format!("stream interrupted: {}", e)))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str::<InvokeResponse>(line)
                        .map_err(|e| step_error(&capability, format!("invalid stream line: {}", e)))
                        .and_then(|response| response.into_chunk(&capability));
                    let stop = parsed.is_err();
                    if tx.send(parsed).await.is_err() || stop {
                        return;
                    }
                }
            }

            let rest = buffer.trim();
            if !rest.is_empty() {
                let parsed = serde_json::from_str::<InvokeResponse>(rest)
                    .map_err(|e| step_error(&capability, format!("invalid stream line: {}", e)))
                    .and_then(|response| response.into_chunk(&capability));
                let _ = tx.send(parsed).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn supports_streaming(&self, capability: &CapabilityKey) -> bool {
        self.streaming.contains(capability)
    }
}
