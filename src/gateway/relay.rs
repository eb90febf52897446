use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

/// Client frames queued while the upstream socket is still dialing.
/// Overflow is dropped with a diagnostic event, never grown.
pub const PENDING_BUFFER_LIMIT: usize = 100;

/// Only text frames smaller than this are shallow-parsed for diagnostics.
pub const DIAGNOSTIC_FRAME_MAX_BYTES: usize = 2048;

/// Deterministic close reason shown to the browser when the upstream
/// goes away, so it never observes an ambiguous no-status close.
pub const UPSTREAM_CLOSED_REASON: &str = "upstream closed";

/// Bounded queue for pre-open client frames.
pub(crate) struct PendingBuffer {
    queue: VecDeque<Message>,
    limit: usize,
    dropped: u64,
}

impl PendingBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Queues a frame; returns false (and counts the drop) when full.
    pub(crate) fn push(&mut self, message: Message) -> bool {
        if self.queue.len() >= self.limit {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(message);
        true
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.queue.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Shallow-parses a small text frame for non-sensitive diagnostics:
/// message type and room, nothing else. Returns `None` for frames that
/// are too large or not JSON objects; those are forwarded untouched
/// either way.
pub(crate) fn frame_diagnostics(text: &str) -> Option<(Option<String>, Option<String>)> {
    if text.len() >= DIAGNOSTIC_FRAME_MAX_BYTES {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let message_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let room = value
        .get("room")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some((message_type, room))
}

fn upstream_closed_frame(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: UPSTREAM_CLOSED_REASON.into(),
    }))
}

/// Relays frames between an accepted client socket and the fixed
/// upstream. Client frames sent before the upstream reports open are
/// buffered (bounded); payloads are never interpreted beyond the
/// diagnostic shallow-parse.
pub async fn run_relay<S>(client: WebSocketStream<S>, upstream_url: &str, peer: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_sink, mut client_stream) = client.split();
    let mut pending = PendingBuffer::new(PENDING_BUFFER_LIMIT);

    let connect = connect_async(upstream_url);
    tokio::pin!(connect);

    // Dial the upstream while buffering whatever the client already sends.
    let upstream = loop {
        tokio::select! {
            connected = &mut connect => {
                match connected {
                    Ok((upstream, _)) => break upstream,
                    Err(e) => {
                        warn!("upstream dial failed for {}: {}", peer, e);
                        let _ = client_sink
                            .send(upstream_closed_frame(CloseCode::Error))
                            .await;
                        return;
                    }
                }
            }
            frame = client_stream.next() => {
                match frame {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        if !pending.push(message) {
                            warn!(
                                "relay buffer full for {}; dropped frame ({} total)",
                                peer,
                                pending.dropped()
                            );
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client {} left before upstream opened", peer);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("client {} socket error before upstream opened: {}", peer, e);
                        return;
                    }
                }
            }
        }
    };

    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    // Flush the queue in arrival order.
    let queued = pending.len();
    for message in pending.drain() {
        if let Err(e) = upstream_sink.send(message).await {
            warn!("flush to upstream failed for {}: {}", peer, e);
            let _ = client_sink
                .send(upstream_closed_frame(CloseCode::Error))
                .await;
            return;
        }
    }
    if queued > 0 {
        debug!("flushed {} buffered frames for {}", queued, peer);
    }

    loop {
        tokio::select! {
            frame = client_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some((message_type, room)) = frame_diagnostics(&text) {
                            debug!(
                                "relay {}: client frame type={:?} room={:?}",
                                peer, message_type, room
                            );
                        }
                        if upstream_sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = upstream_sink.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(Ok(message)) => {
                        // Forwarded byte-for-byte.
                        if upstream_sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("client {} socket error: {}", peer, e);
                        let _ = upstream_sink.close().await;
                        break;
                    }
                    None => {
                        let _ = upstream_sink.close().await;
                        break;
                    }
                }
            }
            frame = upstream_stream.next() => {
                match frame {
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| f.code).unwrap_or(CloseCode::Error);
                        let _ = client_sink.send(upstream_closed_frame(code)).await;
                        break;
                    }
                    Some(Ok(message)) => {
                        if client_sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("upstream socket error for {}: {}", peer, e);
                        let _ = client_sink
                            .send(upstream_closed_frame(CloseCode::Error))
                            .await;
                        break;
                    }
                    None => {
                        let _ = client_sink
                            .send(upstream_closed_frame(CloseCode::Error))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    debug!("relay for {} finished", peer);
}
