//! # AudioHook Client
//!
//! Command-line client that connects to an AudioHook server, streams a
//! generated tone, and reports round-trip-time statistics. Useful for
//! exercising a server end to end without a telephony platform.
//!
//! ```text
//! audiohook-client --uri ws://127.0.0.1:8080/api/v1/audiohook/ws \
//!     --api-key dev-key --organization-id <uuid> --duration 10
//! ```

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use audiohook_backend::media::ToneMediaSource;
use audiohook_backend::protocol::media::MediaParameter;
use audiohook_backend::protocol::StreamDuration;
use audiohook_backend::session::client::{ClientSession, ClientSessionOptions, ClientSessionState};
use audiohook_backend::session::SessionWebSocket;

struct ClientArgs {
    uri: String,
    api_key: String,
    organization_id: Uuid,
    duration_secs: u64,
    frequency: f64,
}

impl ClientArgs {
    fn parse() -> Result<Self> {
        let mut args = ClientArgs {
            uri: "ws://127.0.0.1:8080/api/v1/audiohook/ws".to_string(),
            api_key: "dev-key".to_string(),
            organization_id: Uuid::new_v4(),
            duration_secs: 10,
            frequency: 440.0,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || {
                iter.next()
                    .with_context(|| format!("missing value for {flag}"))
            };
            match flag.as_str() {
                "--uri" => args.uri = value()?,
                "--api-key" => args.api_key = value()?,
                "--organization-id" => args.organization_id = value()?.parse()?,
                "--duration" => args.duration_secs = value()?.parse()?,
                "--frequency" => args.frequency = value()?.parse()?,
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(args)
    }
}

/// Outbound commands from the session to the socket writer task.
enum WsCommand {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

struct TungsteniteSocket {
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl SessionWebSocket for TungsteniteSocket {
    fn send_text(&self, data: String) {
        let _ = self.tx.send(WsCommand::Text(data));
    }

    fn send_binary(&self, data: Vec<u8>) {
        let _ = self.tx.send(WsCommand::Binary(data));
    }

    fn close(&self) {
        let _ = self.tx.send(WsCommand::Close);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiohook_backend=info,audiohook_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = ClientArgs::parse()?;
    let session_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();

    let mut request = args.uri.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "audiohook-organization-id",
        HeaderValue::from_str(&args.organization_id.to_string())?,
    );
    headers.insert(
        "audiohook-session-id",
        HeaderValue::from_str(&session_id.to_string())?,
    );
    headers.insert(
        "audiohook-correlation-id",
        HeaderValue::from_str(&correlation_id.to_string())?,
    );
    headers.insert("x-api-key", HeaderValue::from_str(&args.api_key)?);

    info!("Connecting to {} (session: {session_id})", args.uri);
    let (ws_stream, _response) = connect_async(request)
        .await
        .context("WebSocket connection failed")?;
    let (mut sink, mut stream) = ws_stream.split();

    // Writer task: the session's outbound surface.
    let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<WsCommand>();
    let writer = tokio::spawn(async move {
        while let Some(command) = ws_rx.recv().await {
            let result = match command {
                WsCommand::Text(data) => sink.send(WsMessage::Text(data)).await,
                WsCommand::Binary(data) => sink.send(WsMessage::Binary(data)).await,
                WsCommand::Close => sink.send(WsMessage::Close(None)).await,
            };
            if let Err(err) = result {
                warn!("WebSocket send failed: {err}");
                break;
            }
        }
    });

    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let (media_tx, mut media_rx) = mpsc::unbounded_channel();
    let media_source = ToneMediaSource::new(
        media_tx,
        vec![MediaParameter::pcmu_stereo_8k()],
        args.frequency,
        StreamDuration::from_seconds(args.duration_secs),
    );

    // The session is owned here, in main, and driven by this loop: no
    // ambient globals, no shared registries.
    let mut session = ClientSession::new(ClientSessionOptions {
        ws: Box::new(TungsteniteSocket { tx: ws_tx }),
        media_source: Box::new(media_source),
        organization_id: args.organization_id,
        session_id: Some(session_id),
        conversation_id: Some(Uuid::new_v4()),
        participant: None,
        language: Some("en-us".to_string()),
        supported_languages: Some(true),
        custom_config: None,
        open_parameter_provider: None,
        time_provider: None,
        timer_events: timer_tx,
        open_timeout: None,
        close_timeout: None,
        ping_interval: None,
        initial_ping_delay: None,
    });

    let rtt_samples: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let rtt_sink = rtt_samples.clone();
    session.events.rtt_info.on(move |rtt: &StreamDuration| {
        rtt_sink.lock().unwrap().push(rtt.seconds_f64());
    });

    session.on_ws_open().await;

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => session.on_text_message(text),
                Some(Ok(WsMessage::Binary(data))) => session.on_binary_message(data.to_vec()),
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    session.on_ws_close(code);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    session.on_ws_error(&err.to_string());
                    session.on_ws_close(1006);
                }
                None => {
                    session.on_ws_close(1006);
                }
            },
            Some(event) = timer_rx.recv() => session.on_timer_event(event),
            Some(event) = media_rx.recv() => session.on_media_event(event),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session...");
                session.close();
            }
        }
        if session.state() == ClientSessionState::Disconnected {
            break;
        }
    }

    writer.abort();
    print_rtt_summary(&rtt_samples.lock().unwrap());
    Ok(())
}

fn print_rtt_summary(samples: &[f64]) {
    if samples.is_empty() {
        info!("No round-trip samples collected");
        return;
    }
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(0.0f64, f64::max);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    info!(
        "RTT over {} samples: min={:.3}ms mean={:.3}ms max={:.3}ms",
        samples.len(),
        min * 1000.0,
        mean * 1000.0,
        max * 1000.0
    );
}
