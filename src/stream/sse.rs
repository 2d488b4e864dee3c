//! Server-sent events transport over reqwest streaming bodies

use futures::StreamExt;
use log::{debug, warn};
use reqwest::Client as HttpClient;
use reqwest::header::ACCEPT;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use url::Url;

use super::{ConnectionState, ConnectionStatus, StreamConnection, StreamEvent, StreamHandler, StreamTransport};
use crate::error::{RequestError, Result};

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            // retry and unknown fields are ignored: connections never auto-retry
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(StreamEvent {
            event,
            data,
            id: self.last_id.clone(),
        })
    }
}

/// [`StreamTransport`] reading server-sent events on a tokio runtime
pub struct SseTransport {
    http: HttpClient,
    runtime: Handle,
}

impl SseTransport {
    /// Create a transport bound to the current tokio runtime
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RequestError::Network(format!("No async runtime available: {}", e)))?;
        let http = HttpClient::builder().build().map_err(RequestError::from)?;
        Ok(Self { http, runtime })
    }
}

struct SseConnection {
    task: JoinHandle<()>,
    status: ConnectionStatus,
}

impl StreamConnection for SseConnection {
    fn close(&mut self) {
        self.task.abort();
        self.status.set(ConnectionState::Closed);
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl StreamTransport for SseTransport {
    fn open(
        &self,
        url: Url,
        handler: StreamHandler,
        status: ConnectionStatus,
    ) -> Box<dyn StreamConnection> {
        let http = self.http.clone();
        let task_status = status.clone();

        let task = self.runtime.spawn(async move {
            // The query string carries the token; keep it out of logs
            let path = url.path().to_string();
            match read_events(http, url, &handler, &task_status).await {
                Ok(()) => debug!("Stream {} ended", path),
                Err(e) => warn!("Stream {} failed: {}", path, e),
            }
            task_status.set(ConnectionState::Closed);
        });

        Box::new(SseConnection { task, status })
    }
}

async fn read_events(
    http: HttpClient,
    url: Url,
    handler: &StreamHandler,
    status: &ConnectionStatus,
) -> std::result::Result<(), RequestError> {
    let response = http
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(RequestError::Status {
            status: response.status().as_u16(),
            message: format!("Stream rejected with status {}", response.status().as_u16()),
        });
    }

    status.set(ConnectionState::Open);

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        for event in parser.push(&chunk?) {
            handler(event);
        }
    }
    Ok(())
}
