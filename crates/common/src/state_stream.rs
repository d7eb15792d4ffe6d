//! Live CVM state over server-sent events.
//!
//! The cloud API exposes `GET /cvms/{id}/state?target=<status>` which streams
//! `state` events until the CVM reaches the target (`complete`) or gives up
//! (`timeout`, `error`). [`StateWatcher`] keeps a subscription alive by
//! reconnecting after a fixed delay, flipping the target between `running` and
//! `stopped` based on the latest status seen.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cvm::CvmStatus;
use crate::{Error, Result};

/// Delay before reopening a closed stream
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub const TIMEOUT_NOTICE: &str = "State stream timed out. Reconnecting...";
pub const CONNECTION_LOST_NOTICE: &str = "Connection lost. Reconnecting...";

/// Bytes an unfinished event may occupy before it is dropped
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser. An event larger than
/// [`MAX_PENDING_BYTES`] is skipped up to the next blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    discarding: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..pos])) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            debug!(pending = self.buffer.len(), "Dropping oversized SSE event");
            // A trailing newline may be the first half of the boundary
            let boundary_started = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if boundary_started {
                self.buffer.push(b'\n');
            }
            self.discarding = true;
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
    })
}

/// State stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    State { status: String },
    Complete { status: Option<String> },
    Timeout,
    /// `message` is `None` when the payload carried no usable `error`; the
    /// previous notice then stands. An empty payload reads as a lost
    /// connection.
    Error { message: Option<String> },
}

#[derive(Deserialize)]
struct StatusPayload {
    status: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Option<String>,
}

impl StateEvent {
    /// Interpret an SSE event. Unknown names and unusable `state` payloads
    /// yield `None`.
    pub fn from_sse(event: &SseEvent) -> Option<Self> {
        let status = || {
            serde_json::from_str::<StatusPayload>(&event.data)
                .ok()
                .and_then(|p| p.status)
                .filter(|s| !s.is_empty())
        };
        match event.event.as_str() {
            "state" => status().map(|status| StateEvent::State { status }),
            "complete" => Some(StateEvent::Complete { status: status() }),
            "timeout" => Some(StateEvent::Timeout),
            "error" if event.data.is_empty() => Some(StateEvent::Error {
                message: Some(CONNECTION_LOST_NOTICE.to_string()),
            }),
            "error" => Some(StateEvent::Error {
                message: serde_json::from_str::<ErrorPayload>(&event.data)
                    .ok()
                    .and_then(|p| p.error)
                    .filter(|s| !s.is_empty()),
            }),
            _ => None,
        }
    }
}

fn decode(events: impl IntoIterator<Item = SseEvent>) -> Vec<Result<StateEvent>> {
    events
        .into_iter()
        .filter_map(|event| StateEvent::from_sse(&event))
        .map(Ok)
        .collect()
}

/// Turn a byte stream into state events. An event left unterminated when the
/// stream ends is still delivered.
pub fn state_events<S, E>(bytes: S) -> BoxStream<'static, Result<StateEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error>,
{
    let chunks = bytes.map(|chunk| chunk.map_err(Into::<Error>::into)).boxed();
    stream::unfold(Some((chunks, SseParser::new())), |state| async move {
        let (mut chunks, mut parser) = state?;
        let batch = match chunks.next().await {
            Some(Ok(chunk)) => decode(parser.feed(&chunk)),
            Some(Err(e)) => vec![Err(e)],
            None => return Some((decode(parser.finish()), None)),
        };
        Some((batch, Some((chunks, parser))))
    })
    .flat_map(stream::iter)
    .boxed()
}

/// Something that can open a state stream for a CVM
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn open(&self, app_id: &str, target: CvmStatus) -> Result<BoxStream<'static, Result<StateEvent>>>;
}

/// What a watcher reports to its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUpdate {
    Status(String),
    Notice(String),
}

/// Reconnecting state subscription for one CVM
pub struct StateWatcher<S> {
    source: S,
    app_id: String,
    status: String,
    reconnect_delay: Duration,
}

impl<S: StateSource> StateWatcher<S> {
    pub fn new(source: S, app_id: impl Into<String>, initial_status: impl Into<String>) -> Self {
        Self {
            source,
            app_id: app_id.into(),
            status: initial_status.into(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Latest status seen (or the initial one).
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Target for the next subscription.
    pub fn target(&self) -> CvmStatus {
        CvmStatus::parse(&self.status).toggle_target()
    }

    fn record(&mut self, status: String, on_update: &mut impl FnMut(WatchUpdate)) {
        self.status = status.clone();
        on_update(WatchUpdate::Status(status));
    }

    /// Watch until `cancel` fires. Returns the latest status.
    pub async fn run(mut self, cancel: CancellationToken, mut on_update: impl FnMut(WatchUpdate)) -> String {
        loop {
            let target = self.target();
            debug!(app_id = %self.app_id, %target, "Opening state stream");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.source.open(&self.app_id, target) => opened,
            };

            match opened {
                Err(e) => {
                    debug!(app_id = %self.app_id, error = %e, "State stream failed to open");
                    on_update(WatchUpdate::Notice(CONNECTION_LOST_NOTICE.to_string()));
                }
                Ok(mut events) => loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return self.status,
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(StateEvent::State { status })) => self.record(status, &mut on_update),
                        Some(Ok(StateEvent::Complete { status })) => {
                            if let Some(status) = status {
                                self.record(status, &mut on_update);
                            }
                            info!(app_id = %self.app_id, status = %self.status, "State transition complete");
                            break;
                        }
                        Some(Ok(StateEvent::Timeout)) => {
                            on_update(WatchUpdate::Notice(TIMEOUT_NOTICE.to_string()));
                            break;
                        }
                        Some(Ok(StateEvent::Error { message })) => {
                            if let Some(message) = message {
                                on_update(WatchUpdate::Notice(message));
                            }
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(app_id = %self.app_id, error = %e, "State stream broke");
                            on_update(WatchUpdate::Notice(CONNECTION_LOST_NOTICE.to_string()));
                            break;
                        }
                        None => {
                            on_update(WatchUpdate::Notice(CONNECTION_LOST_NOTICE.to_string()));
                            break;
                        }
                    }
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[test]
    fn test_parser_handles_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: state\r\nda").is_empty());
        let events = parser.feed(b"ta: {\"status\":\"running\"}\r\n\r\n: keepalive\n\nevent: timeout\ndata:\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "state");
        assert_eq!(events[0].data, "{\"status\":\"running\"}");
        assert_eq!(events[1].event, "timeout");
    }

    #[test]
    fn test_parser_multiline_data_and_default_name() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: 7\ndata: a\ndata: b\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".to_string(),
                data: "a\nb".to_string(),
                id: Some("7".to_string()),
            }]
        );
        assert!(parser.feed(b"event: complete").is_empty());
        assert_eq!(parser.finish().unwrap().event, "complete");
    }

    #[test]
    fn test_parser_drops_oversized_event() {
        let mut parser = SseParser::new();
        let mut huge = b"event: state\ndata: ".to_vec();
        huge.resize(MAX_PENDING_BYTES + 10, b'x');
        huge.push(b'\n');
        assert!(parser.feed(&huge).is_empty());
        assert!(parser.buffer.len() <= 1);

        // The rest of the oversized event is skipped, the next one survives
        let events = parser.feed(b"xxxx\n\nevent: timeout\ndata:\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "timeout");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_parser_oversized_tail_is_not_flushed() {
        let mut parser = SseParser::new();
        assert!(parser.feed(&vec![b'x'; MAX_PENDING_BYTES + 1]).is_empty());
        assert!(parser.feed(b"event: complete").is_empty());
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_state_event_mapping() {
        let ev = |event: &str, data: &str| SseEvent {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
        };
        assert_eq!(
            StateEvent::from_sse(&ev("state", r#"{"status":"stopped"}"#)),
            Some(StateEvent::State { status: "stopped".into() })
        );
        assert_eq!(StateEvent::from_sse(&ev("state", "not json")), None);
        assert_eq!(
            StateEvent::from_sse(&ev("complete", "")),
            Some(StateEvent::Complete { status: None })
        );
        assert_eq!(
            StateEvent::from_sse(&ev("error", r#"{"error":"CVM not found"}"#)),
            Some(StateEvent::Error { message: Some("CVM not found".into()) })
        );
        assert_eq!(
            StateEvent::from_sse(&ev("error", r#"{"detail":"x"}"#)),
            Some(StateEvent::Error { message: None })
        );
        assert_eq!(
            StateEvent::from_sse(&ev("error", "")),
            Some(StateEvent::Error { message: Some(CONNECTION_LOST_NOTICE.into()) })
        );
        assert_eq!(StateEvent::from_sse(&ev("ping", "")), None);
    }

    #[tokio::test]
    async fn test_state_events_from_bytes() {
        let chunks: Vec<std::result::Result<Bytes, Error>> = vec![
            Ok(Bytes::from_static(b"event: state\ndata: {\"status\":\"running\"}\n\nevent: comp")),
            Ok(Bytes::from_static(b"lete\ndata: {\"status\":\"running\"}\n\n")),
        ];
        let events: Vec<_> = state_events(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Ok(StateEvent::Complete { status: Some(s) }) if s == "running"));
    }

    #[tokio::test]
    async fn test_state_events_flushes_unterminated_final_event() {
        let chunks: Vec<std::result::Result<Bytes, Error>> = vec![
            Ok(Bytes::from_static(b"event: state\ndata: {\"status\":\"stopping\"}\n\n")),
            Ok(Bytes::from_static(b"event: complete\ndata: {\"status\":\"stopped\"}")),
        ];
        let events: Vec<_> = state_events(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Ok(StateEvent::Complete { status: Some(s) }) if s == "stopped"));
    }

    /// Scripted source recording the targets it was opened with
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Result<Vec<StateEvent>>>>,
        targets: Arc<Mutex<Vec<CvmStatus>>>,
    }

    #[async_trait]
    impl StateSource for ScriptedSource {
        async fn open(&self, _app_id: &str, target: CvmStatus) -> Result<BoxStream<'static, Result<StateEvent>>> {
            self.targets.lock().push(target);
            match self.scripts.lock().pop_front() {
                Some(Ok(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
                Some(Err(e)) => Err(e),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    #[tokio::test]
    async fn test_watcher_flips_target_and_reports() {
        let targets = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            scripts: Mutex::new(VecDeque::from(vec![
                Ok(vec![
                    StateEvent::State { status: "starting".into() },
                    StateEvent::Complete { status: Some("running".into()) },
                ]),
                Ok(vec![StateEvent::Timeout]),
                Err(Error::Internal("refused".into())),
                Ok(vec![StateEvent::Error { message: None }]),
                Ok(vec![StateEvent::Error { message: Some("CVM not found".into()) }]),
            ])),
            targets: targets.clone(),
        };

        let cancel = CancellationToken::new();
        let watcher = StateWatcher::new(source, "app_1", "stopped")
            .with_reconnect_delay(Duration::from_millis(5));
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let stopper = cancel.clone();
        let handle = tokio::spawn(watcher.run(cancel, move |u| {
            sink.lock().push(u);
        }));

        // Sixth open blocks on a pending stream
        for _ in 0..200 {
            if targets.lock().len() >= 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stopper.cancel();
        let final_status = handle.await.unwrap();

        assert_eq!(final_status, "running");
        assert_eq!(
            *targets.lock(),
            vec![
                CvmStatus::Running,
                CvmStatus::Stopped,
                CvmStatus::Stopped,
                CvmStatus::Stopped,
                CvmStatus::Stopped,
                CvmStatus::Stopped,
            ]
        );
        assert_eq!(
            *updates.lock(),
            vec![
                WatchUpdate::Status("starting".into()),
                WatchUpdate::Status("running".into()),
                WatchUpdate::Notice(TIMEOUT_NOTICE.into()),
                WatchUpdate::Notice(CONNECTION_LOST_NOTICE.into()),
                // An error without a message leaves the previous notice alone
                WatchUpdate::Notice("CVM not found".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_watcher_stops_on_cancel_during_backoff() {
        let source = ScriptedSource {
            scripts: Mutex::new(VecDeque::from(vec![Ok(vec![StateEvent::Timeout])])),
            targets: Arc::new(Mutex::new(Vec::new())),
        };
        let cancel = CancellationToken::new();
        let watcher = StateWatcher::new(source, "app_1", "running")
            .with_reconnect_delay(Duration::from_secs(3600));
        let stopper = cancel.clone();
        let handle = tokio::spawn(watcher.run(cancel, |_| {}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
        let status = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, "running");
    }
}
