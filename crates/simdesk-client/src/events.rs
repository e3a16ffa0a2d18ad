use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use simdesk_protocol::error::ProtocolResult;
use simdesk_protocol::event::JobEvent;
use simdesk_protocol::source::{JobEventSource, JobFeedItem};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Splits an incoming byte stream into newline-delimited frames, tolerating
/// frames that arrive across chunk boundaries. Trailing CR is stripped.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub(crate) fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline_index = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line = self.buffer.drain(..=newline_index).collect::<Vec<_>>();
        if matches!(line.last(), Some(b'\n')) {
            line.pop();
        }
        if matches!(line.last(), Some(b'\r')) {
            line.pop();
        }
        Some(line)
    }

    /// Remaining bytes with no trailing newline, drained on stream end.
    pub(crate) fn take_tail(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parses one wire line into a typed event. Blank keep-alive lines, unknown
/// event names, and contractually-silent malformed message payloads all
/// yield `None`; other defects are logged at warn and also skipped so one
/// bad frame never tears down the subscription.
fn parse_event_line(line: &[u8]) -> Option<JobEvent> {
    if line.iter().all(|byte| byte.is_ascii_whitespace()) {
        return None;
    }

    let frame: EventFrame = match serde_json::from_slice(line) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(error = %error, "discarding undecodable job event frame");
            return None;
        }
    };

    match JobEvent::from_wire(frame.event.as_str(), frame.data) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(error = %error, event = %frame.event, "discarding malformed job event");
            None
        }
    }
}

/// Job event subscription over the server's line-delimited JSON stream.
///
/// The stream reconnects on a fixed delay after any drop; every
/// (re)establishment is surfaced as `JobFeedItem::Connected` so the
/// consumer can resynchronize from the job-list endpoint.
pub struct HttpJobEventStream {
    http: reqwest::Client,
    events_url: String,
    retry_delay: Duration,
    splitter: LineSplitter,
    stream: Option<ByteStream>,
}

impl HttpJobEventStream {
    pub(crate) fn new(http: reqwest::Client, events_url: String) -> Self {
        Self {
            http,
            events_url,
            retry_delay: DEFAULT_RETRY_DELAY,
            splitter: LineSplitter::default(),
            stream: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn establish(&mut self) -> bool {
        let response = match self.http.get(self.events_url.as_str()).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(error = %error, url = %self.events_url, "job event stream connect failed");
                return false;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, url = %self.events_url, "job event stream rejected");
            return false;
        }

        self.splitter.clear();
        self.stream = Some(Box::pin(response.bytes_stream()));
        true
    }

    fn next_buffered_event(&mut self) -> Option<JobEvent> {
        while let Some(line) = self.splitter.next_line() {
            if let Some(event) = parse_event_line(&line) {
                return Some(event);
            }
        }
        None
    }
}

#[async_trait]
impl JobEventSource for HttpJobEventStream {
    async fn next(&mut self) -> ProtocolResult<Option<JobFeedItem>> {
        loop {
            if let Some(event) = self.next_buffered_event() {
                return Ok(Some(JobFeedItem::Event(event)));
            }

            let Some(stream) = self.stream.as_mut() else {
                if self.establish().await {
                    return Ok(Some(JobFeedItem::Connected));
                }
                tokio::time::sleep(self.retry_delay).await;
                continue;
            };

            match stream.next().await {
                Some(Ok(chunk)) => {
                    self.splitter.push(&chunk);
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "job event stream read failed; reconnecting");
                    self.stream = None;
                    tokio::time::sleep(self.retry_delay).await;
                }
                None => {
                    tracing::info!("job event stream ended; reconnecting");
                    let tail = self.splitter.take_tail();
                    self.stream = None;
                    if let Some(event) = tail.as_deref().and_then(parse_event_line) {
                        return Ok(Some(JobFeedItem::Event(event)));
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
