use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;

use crate::core::chat_stream::{ByteStream, CompletionRequest, CompletionTransport, TransportError};

enum Script {
    Chunks(Vec<Vec<u8>>),
    Error(TransportError),
    /// Connects, then never yields a byte.
    Pending,
    /// Chunks with a fixed pause before each one.
    Paced(Vec<Vec<u8>>, Duration),
    /// Chunks are fed by the test through the paired sender.
    Channel(mpsc::UnboundedReceiver<Vec<u8>>),
}

/// In-memory transport that replays scripted responses in order.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn push_chunks<S: AsRef<str>>(&self, chunks: Vec<S>) {
        self.push(Script::Chunks(
            chunks
                .into_iter()
                .map(|chunk| chunk.as_ref().as_bytes().to_vec())
                .collect(),
        ));
    }

    pub fn push_paced<S: AsRef<str>>(&self, chunks: Vec<S>, gap: Duration) {
        self.push(Script::Paced(
            chunks
                .into_iter()
                .map(|chunk| chunk.as_ref().as_bytes().to_vec())
                .collect(),
            gap,
        ));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push(Script::Error(error));
    }

    pub fn push_pending(&self) {
        self.push(Script::Pending);
    }

    pub fn push_channel(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Channel(rx));
        tx
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Chunks(Vec::new()));
        match script {
            Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            Script::Paced(chunks, gap) => Ok(Box::pin(stream::iter(chunks).then(
                move |chunk| async move {
                    tokio::time::sleep(gap).await;
                    Ok::<_, TransportError>(chunk)
                },
            ))),
            Script::Error(error) => Err(error),
            Script::Pending => Ok(Box::pin(stream::pending())),
            Script::Channel(rx) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok(chunk), rx))
            }))),
        }
    }
}

/// One plain-completion SSE frame carrying `content`.
pub fn delta_frame(content: &str) -> String {
    let payload = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    format!("data: {payload}\n\n")
}

/// One tool-augmented SSE frame.
pub fn typed_frame(event: serde_json::Value) -> String {
    format!("data: {event}\n\n")
}
