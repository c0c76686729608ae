//! # Session Infrastructure
//!
//! The collaborator seams the protocol state machines depend on: a minimal
//! WebSocket send surface, cancellable timers, and a monotonic clock. Both
//! are injectable so the session logic is testable without sockets or real
//! time.

pub mod client;
pub mod events;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use client::{ClientSession, ClientSessionOptions, ClientSessionState, MediaSource};
pub use server::{ServerSession, ServerSessionOptions, ServerSessionState};

/// Outbound surface of a WebSocket connection as seen by a session.
///
/// Implementations must queue or deliver without blocking the session's
/// driver task; delivery failures surface through the transport's own close
/// or error events, never through these calls.
pub trait SessionWebSocket: Send {
    fn send_text(&self, data: String);
    fn send_binary(&self, data: Vec<u8>);
    fn close(&self);
}

/// Handle to a running timer. Cancellation is idempotent: multiple code
/// paths race to clean up on state transitions, so cancelling twice is safe.
pub struct TimerSubscription {
    cancelled: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TimerSubscription {
    pub fn new(cancelled: Arc<AtomicBool>, handle: Option<tokio::task::JoinHandle<()>>) -> Self {
        Self { cancelled, handle }
    }

    pub fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.handle.take() {
                handle.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Injectable clock: one-shot timeouts, repeating intervals, and a
/// high-resolution monotonic timestamp in nanoseconds.
pub trait TimeProvider: Send + Sync {
    fn start_timeout(
        &self,
        handler: Box<dyn FnOnce() + Send>,
        timeout: Duration,
    ) -> TimerSubscription;

    fn start_interval(
        &self,
        handler: Box<dyn FnMut() + Send>,
        interval: Duration,
    ) -> TimerSubscription;

    fn highres_timestamp(&self) -> u64;
}

/// Production clock backed by tokio timers.
pub struct TokioTimeProvider {
    origin: Instant,
}

impl TokioTimeProvider {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for TokioTimeProvider {
    fn start_timeout(
        &self,
        handler: Box<dyn FnOnce() + Send>,
        timeout: Duration,
    ) -> TimerSubscription {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !flag.load(Ordering::SeqCst) {
                handler();
            }
        });
        TimerSubscription::new(cancelled, Some(handle))
    }

    fn start_interval(
        &self,
        mut handler: Box<dyn FnMut() + Send>,
        interval: Duration,
    ) -> TimerSubscription {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                handler();
            }
        });
        TimerSubscription::new(cancelled, Some(handle))
    }

    fn highres_timestamp(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod loopback_tests {
    //! Full client/server exchange with both state machines wired back to
    //! back through in-memory queues.

    use super::client::{
        ClientSession, ClientSessionOptions, ClientSessionState, ClientTimerEvent,
    };
    use super::server::{ServerSession, ServerSessionOptions, ServerSessionState};
    use super::SessionWebSocket;
    use crate::media::ToneMediaSource;
    use crate::protocol::media::MediaParameter;
    use crate::protocol::StreamDuration;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Debug)]
    enum Frame {
        Text(String),
        Binary(Vec<u8>),
        Close,
    }

    #[derive(Clone, Default)]
    struct QueueSocket {
        queue: Arc<Mutex<VecDeque<Frame>>>,
    }

    impl SessionWebSocket for QueueSocket {
        fn send_text(&self, data: String) {
            self.queue.lock().unwrap().push_back(Frame::Text(data));
        }
        fn send_binary(&self, data: Vec<u8>) {
            self.queue.lock().unwrap().push_back(Frame::Binary(data));
        }
        fn close(&self) {
            self.queue.lock().unwrap().push_back(Frame::Close);
        }
    }

    impl QueueSocket {
        fn pop(&self) -> Option<Frame> {
            self.queue.lock().unwrap().pop_front()
        }
    }

    /// Deliver queued frames in both directions until both queues drain.
    async fn pump(
        client: &mut ClientSession,
        server: &mut ServerSession,
        client_out: &QueueSocket,
        server_out: &QueueSocket,
    ) {
        loop {
            let mut progressed = false;
            while let Some(frame) = client_out.pop() {
                progressed = true;
                match frame {
                    Frame::Text(data) => server.on_text_message(data).await,
                    Frame::Binary(data) => server.on_binary_message(data).await,
                    Frame::Close => {
                        server.on_ws_close(1000).await;
                        client.on_ws_close(1000);
                    }
                }
            }
            while let Some(frame) = server_out.pop() {
                progressed = true;
                match frame {
                    Frame::Text(data) => client.on_text_message(data),
                    Frame::Binary(_) | Frame::Close => {}
                }
            }
            if !progressed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_full_session_exchange() {
        let session_id = Uuid::new_v4();
        let client_out = QueueSocket::default();
        let server_out = QueueSocket::default();

        let mut server = ServerSession::new(ServerSessionOptions {
            ws: Box::new(server_out.clone()),
            id: session_id,
            time_provider: None,
            supported_languages: Some(vec!["en-us".into()]),
        });

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let (media_tx, mut media_rx) = mpsc::unbounded_channel();
        let media_source = ToneMediaSource::new(
            media_tx,
            vec![MediaParameter::pcmu_stereo_8k()],
            440.0,
            StreamDuration::from_millis(40),
        );
        let mut client = ClientSession::new(ClientSessionOptions {
            ws: Box::new(client_out.clone()),
            media_source: Box::new(media_source),
            organization_id: Uuid::new_v4(),
            session_id: Some(session_id),
            conversation_id: None,
            participant: None,
            language: Some("en-us".into()),
            supported_languages: None,
            custom_config: None,
            open_parameter_provider: None,
            time_provider: None,
            timer_events: timer_tx,
            open_timeout: None,
            close_timeout: None,
            ping_interval: None,
            initial_ping_delay: None,
        });

        // Open transaction: client offers stereo PCMU, server takes the
        // first offer.
        client.on_ws_open().await;
        pump(&mut client, &mut server, &client_out, &server_out).await;
        assert_eq!(client.state(), ClientSessionState::Open);
        assert_eq!(server.state(), ServerSessionState::Active);
        assert_eq!(
            server.selected_media(),
            Some(&MediaParameter::pcmu_stereo_8k())
        );

        // Ping/pong round trip.
        client.on_timer_event(ClientTimerEvent::InitialPing);
        pump(&mut client, &mut server, &client_out, &server_out).await;
        assert_eq!(client.state(), ClientSessionState::Open);

        // Stream the whole tone (two 20 ms frames plus end-of-stream).
        let mut stream_ended = false;
        while let Some(event) = media_rx.recv().await {
            let is_end = matches!(
                event,
                crate::session::client::MediaSourceEvent::End { .. }
            );
            client.on_media_event(event);
            pump(&mut client, &mut server, &client_out, &server_out).await;
            if is_end {
                stream_ended = true;
                break;
            }
        }
        assert!(stream_ended);
        assert_eq!(server.position(), StreamDuration::from_millis(40));

        // End of stream triggered the close transaction and, through the
        // socket teardown, finalization on both sides.
        pump(&mut client, &mut server, &client_out, &server_out).await;
        assert_eq!(server.state(), ServerSessionState::Disconnected);
        assert_eq!(client.state(), ClientSessionState::Disconnected);

        // Nothing left in flight anywhere.
        assert!(client_out.pop().is_none());
        assert!(server_out.pop().is_none());
        while timer_rx.try_recv().is_ok() {}
    }
}
