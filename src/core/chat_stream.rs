use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ChatRequest;
use crate::core::chat::ChatId;
use crate::core::decoder::{decode_line, format_api_error, StreamEvent};
use crate::core::sse::{SseLine, SseLineBuffer};

pub const CHAT_ENDPOINT: &str = "chat/completions";
pub const MCP_CHAT_ENDPOINT: &str = "mcp/chat/completions";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-success status.
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    /// Connecting or reading the body failed.
    Network { endpoint: String, message: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Status {
                endpoint,
                status,
                body,
            } => {
                write!(f, "Error: POST {endpoint} {status}")?;
                if !body.trim().is_empty() {
                    write!(f, "\n\n{}", format_api_error(body))?;
                }
                Ok(())
            }
            TransportError::Network { endpoint, message } => {
                write!(f, "Error: POST {endpoint} failed: {message}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// A fully built request: the absolute endpoint URL and the JSON body.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub endpoint: String,
    pub body: ChatRequest,
}

/// Opens a streaming completion. Implementations return the raw response
/// body as a stream of byte chunks.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        let endpoint = request.endpoint.clone();
        let mut http_request = self
            .client
            .post(&request.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .json(&request.body)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                endpoint,
                status,
                body,
            });
        }

        let stream = response.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| TransportError::Network {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                })
        });
        Ok(Box::pin(stream))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessageKind {
    /// The server accepted the request and the body is being read.
    Connected,
    /// Everything decoded from one network read, in order. Possibly empty.
    Events(Vec<StreamEvent>),
    Finished,
    Failed(String),
    TimedOut,
}

/// A message from a stream task to the controller, tagged with the chat and
/// request it belongs to so late deliveries can be recognized.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamMessage {
    pub chat_id: ChatId,
    pub request_id: u64,
    pub kind: StreamMessageKind,
}

pub struct StreamParams {
    pub transport: Arc<dyn CompletionTransport>,
    pub request: CompletionRequest,
    pub chat_id: ChatId,
    pub request_id: u64,
    pub cancel_token: CancellationToken,
    pub timeout: Duration,
    pub tx: mpsc::UnboundedSender<StreamMessage>,
}

/// Run one request on its own task. Cancellation ends the task silently;
/// every other ending is reported with exactly one terminal message.
///
/// `timeout` is an idle limit: it bounds the wait for the response headers
/// and then the gap between reads, so a reply that keeps streaming is never
/// cut off.
pub fn spawn_stream(params: StreamParams) -> JoinHandle<()> {
    tokio::spawn(async move {
        let StreamParams {
            transport,
            request,
            chat_id,
            request_id,
            cancel_token,
            timeout,
            tx,
        } = params;

        let send = |kind: StreamMessageKind| {
            let _ = tx.send(StreamMessage {
                chat_id: chat_id.clone(),
                request_id,
                kind,
            });
        };

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!(chat = %chat_id, request_id, "stream cancelled");
            }
            end = read_stream(&*transport, &request, timeout, &send) => {
                match end {
                    ReadEnd::Done => send(StreamMessageKind::Finished),
                    ReadEnd::Failed(e) => {
                        warn!(chat = %chat_id, request_id, error = %e, "stream failed");
                        send(StreamMessageKind::Failed(e.to_string()));
                    }
                    ReadEnd::Idle => {
                        warn!(chat = %chat_id, request_id, ?timeout, "stream timed out");
                        send(StreamMessageKind::TimedOut);
                    }
                }
            }
        }
    })
}

enum ReadEnd {
    Done,
    Failed(TransportError),
    Idle,
}

async fn read_stream(
    transport: &dyn CompletionTransport,
    request: &CompletionRequest,
    idle: Duration,
    send: &(impl Fn(StreamMessageKind) + Sync),
) -> ReadEnd {
    let mut stream = match time::timeout(idle, transport.open(request)).await {
        Err(_) => return ReadEnd::Idle,
        Ok(Err(e)) => return ReadEnd::Failed(e),
        Ok(Ok(stream)) => stream,
    };
    send(StreamMessageKind::Connected);

    let mut buffer = SseLineBuffer::new();
    loop {
        match time::timeout(idle, stream.next()).await {
            Err(_) => return ReadEnd::Idle,
            Ok(None) => break,
            Ok(Some(Err(e))) => return ReadEnd::Failed(e),
            // Sent even when empty: every read counts as activity.
            Ok(Some(Ok(chunk))) => send(StreamMessageKind::Events(decode_lines(
                buffer.push(&chunk),
            ))),
        }
    }
    buffer.finish();
    ReadEnd::Done
}

/// Decode the complete lines of one read. Lines that fail to decode are
/// logged and skipped.
pub fn decode_lines(lines: Vec<SseLine>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for line in lines {
        match line {
            SseLine::Data(payload) => match decode_line(&payload) {
                Ok(decoded) => events.extend(decoded),
                Err(e) => warn!("{e}"),
            },
            SseLine::Done => debug!("received [DONE]"),
            SseLine::Field(_) => {}
        }
    }
    events
}
