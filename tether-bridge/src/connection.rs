//! The persistent-connection supervisor.
//!
//! One call to [`maintain_websocket`] owns one connection for its whole
//! life: credential acquisition, dial, a read pump, a write+ping pump, a
//! proactive refresh timer and jittered reconnection. The loop only ends
//! on cancellation (`Ok`) or a permanent error (`Err`).

use crate::auth::AuthStrategy;
use crate::backoff::BackoffPolicy;
use crate::broker::{BrokerClient, TokenInfo};
use crate::error::{is_permanent_close_code, BridgeError};
use crate::handler::{ConnectionHandler, DisconnectReason, MessageSender};
use crate::metrics;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Broker connection whose credentials authenticate the dial.
    pub connection_id: String,
    /// ws:// or wss:// endpoint to keep alive.
    pub endpoint_url: String,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    /// Refresh fires at `expires_at - refresh_buffer`.
    pub refresh_buffer: Duration,
    pub outbound_queue_size: usize,
    pub backoff: BackoffPolicy,
    /// Overrides the default bearer mapping of the broker token.
    pub strategy: Option<AuthStrategy>,
}

impl WebSocketConfig {
    pub fn new(connection_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            endpoint_url: endpoint_url.into(),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            refresh_buffer: Duration::from_secs(30),
            outbound_queue_size: 32,
            backoff: BackoffPolicy::default(),
            strategy: None,
        }
    }
}

/// Maintain one authenticated WebSocket until cancellation or a
/// permanent failure.
///
/// Returns `Ok(())` when `cancel` fires, `Err` with the permanent cause
/// otherwise. Transient failures (dial errors, read/write errors, ping
/// timeouts, non-terminal close codes) reconnect after a jittered
/// backoff with freshly fetched credentials.
pub async fn maintain_websocket(
    config: WebSocketConfig,
    broker: Arc<BrokerClient>,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let mut first_attempt = true;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let token = match broker.get_token(&config.connection_id).await {
            Ok(token) => token,
            Err(e) if first_attempt => {
                // No credentials on the very first try means the
                // connection id is wrong or the broker is gone; retrying
                // cannot fix either.
                metrics::record_permanent_failure();
                return Err(BridgeError::InitialAuth(e.to_string()));
            }
            Err(e) => {
                warn!("Credential fetch failed, backing off: {}", e);
                if backoff_or_cancel(&config.backoff, &cancel).await {
                    return Ok(());
                }
                continue;
            }
        };
        first_attempt = false;

        let request = match dial_request(&config, &token) {
            Ok(request) => request,
            Err(e) => {
                metrics::record_permanent_failure();
                return Err(e);
            }
        };

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                debug!("Dial failed: {}", e);
                if backoff_or_cancel(&config.backoff, &cancel).await {
                    return Ok(());
                }
                continue;
            }
        };
        info!(
            "Connected to {} for connection {}",
            config.endpoint_url, config.connection_id
        );

        let (reason, permanent) =
            run_connection(&config, &broker, handler.clone(), &cancel, stream, token).await;
        handler.on_disconnect(&reason);
        debug!("Connection ended: {}", reason);

        if let Some(error) = permanent {
            metrics::record_permanent_failure();
            return Err(error);
        }
        if reason == DisconnectReason::Cancelled {
            return Ok(());
        }
        if handler.is_fatal(&reason) {
            metrics::record_permanent_failure();
            return Err(BridgeError::HandlerFatal(reason.to_string()));
        }

        metrics::record_reconnect();
        if backoff_or_cancel(&config.backoff, &cancel).await {
            return Ok(());
        }
    }
}

/// Credentials go into headers or the URL at dial time, never the body.
fn dial_request(
    config: &WebSocketConfig,
    token: &TokenInfo,
) -> Result<http::Request<()>, BridgeError> {
    let mut request = config
        .endpoint_url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::Strategy(format!("invalid endpoint url: {}", e)))?;

    let strategy = config
        .strategy
        .clone()
        .unwrap_or_else(|| AuthStrategy::bearer(token));
    strategy
        .apply(&mut request)
        .map_err(|e| BridgeError::Strategy(e.to_string()))?;

    Ok(request)
}

/// Sleep the backoff delay; true means cancellation interrupted it.
async fn backoff_or_cancel(policy: &BackoffPolicy, cancel: &CancellationToken) -> bool {
    let delay = policy.delay();
    debug!("Reconnecting in {:?}", delay);
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

enum ReadOutcome {
    Closed(Option<u16>),
    Error(String),
    PingTimeout,
    Cancelled,
}

enum PumpEvent {
    Read(ReadOutcome),
    Write(Result<(), BridgeError>),
}

/// Drive one established connection to its end. Returns the disconnect
/// reason and, when the cause precludes reconnecting, the permanent
/// error to surface.
async fn run_connection(
    config: &WebSocketConfig,
    broker: &BrokerClient,
    handler: Arc<dyn ConnectionHandler>,
    cancel: &CancellationToken,
    stream: WsStream,
    mut token: TokenInfo,
) -> (DisconnectReason, Option<BridgeError>) {
    let (sink, read_half) = stream.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size);
    handler.on_connect(MessageSender::new(outbound_tx.clone()));

    // Pumps watch a child token: a pump error cancels the sibling, the
    // caller's token cancels everything.
    let conn_cancel = cancel.child_token();
    let (event_tx, mut event_rx) = mpsc::channel::<PumpEvent>(2);

    let read_deadline = config.ping_interval + config.write_timeout;
    let read_handle = tokio::spawn({
        let handler = handler.clone();
        let pump_cancel = conn_cancel.clone();
        let event_tx = event_tx.clone();
        async move {
            let outcome = read_pump(read_half, handler, pump_cancel, read_deadline).await;
            let _ = event_tx.send(PumpEvent::Read(outcome)).await;
        }
    });
    let write_handle = tokio::spawn({
        let pump_cancel = conn_cancel.clone();
        let ping_interval = config.ping_interval;
        let write_timeout = config.write_timeout;
        async move {
            let result = write_pump(sink, outbound_rx, ping_interval, write_timeout, pump_cancel).await;
            let _ = event_tx.send(PumpEvent::Write(result)).await;
        }
    });

    let mut refresh_at = refresh_instant(&token, config.refresh_buffer);

    let (reason, permanent) = loop {
        tokio::select! {
            _ = cancel.cancelled() => break (DisconnectReason::Cancelled, None),
            event = event_rx.recv() => match event {
                Some(PumpEvent::Read(outcome)) => break classify_read(outcome),
                Some(PumpEvent::Write(result)) => break classify_write(result),
                // Both pumps report before exiting, so the channel
                // cannot drain while they are alive
                None => break (DisconnectReason::WriteError("pumps exited silently".to_string()), None),
            },
            _ = sleep_until_opt(refresh_at), if refresh_at.is_some() => {
                match broker.refresh_token(&config.connection_id).await {
                    Ok(new_token) => {
                        metrics::record_token_refresh("success");
                        debug!(
                            "Refreshed credentials for connection {} in place",
                            config.connection_id
                        );
                        // Atomic swap inside the select loop; the open
                        // connection is not disturbed. The floor keeps a
                        // stale-expiry answer from spinning the timer.
                        token = new_token;
                        refresh_at = refresh_instant(&token, config.refresh_buffer)
                            .map(|at| at.max(Instant::now() + Duration::from_secs(1)));
                    }
                    Err(e) => {
                        metrics::record_token_refresh("failure");
                        warn!("Credential refresh failed, will retry: {}", e);
                        refresh_at = Some(Instant::now() + config.backoff.min);
                    }
                }
            }
        }
    };

    // Orderly shutdown: stop both pumps, join them, only then let the
    // caller observe the disconnect
    conn_cancel.cancel();
    let _ = read_handle.await;
    let _ = write_handle.await;
    drop(outbound_tx);

    (reason, permanent)
}

fn classify_read(outcome: ReadOutcome) -> (DisconnectReason, Option<BridgeError>) {
    match outcome {
        ReadOutcome::Cancelled => (DisconnectReason::Cancelled, None),
        ReadOutcome::PingTimeout => (DisconnectReason::PingTimeout, None),
        ReadOutcome::Error(e) => (DisconnectReason::ReadError(e), None),
        ReadOutcome::Closed(Some(code)) if is_permanent_close_code(code) => (
            DisconnectReason::ServerClose(Some(code)),
            Some(BridgeError::PermanentClose(code)),
        ),
        ReadOutcome::Closed(code) => (DisconnectReason::ServerClose(code), None),
    }
}

fn classify_write(result: Result<(), BridgeError>) -> (DisconnectReason, Option<BridgeError>) {
    match result {
        // The write pump returns Ok only when told to stop
        Ok(()) => (DisconnectReason::Cancelled, None),
        Err(e) => (DisconnectReason::WriteError(e.to_string()), None),
    }
}

/// When to refresh: `expires_at - refresh_buffer`, clamped to now.
fn refresh_instant(token: &TokenInfo, buffer: Duration) -> Option<Instant> {
    token
        .expires_in()
        .map(|until_expiry| Instant::now() + until_expiry.saturating_sub(buffer))
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Delivers inbound frames to the handler. Pongs extend the read
/// deadline; the deadline lapsing is a transient ping timeout.
async fn read_pump(
    mut read: SplitStream<WsStream>,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
    deadline_window: Duration,
) -> ReadOutcome {
    let mut deadline = Instant::now() + deadline_window;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            next = timeout_at(deadline, read.next()) => match next {
                Err(_) => return ReadOutcome::PingTimeout,
                Ok(None) => return ReadOutcome::Closed(None),
                Ok(Some(Err(e))) => return ReadOutcome::Error(e.to_string()),
                Ok(Some(Ok(message))) => match message {
                    Message::Pong(_) => {
                        deadline = Instant::now() + deadline_window;
                    }
                    // tungstenite answers pings on the next write
                    Message::Ping(_) => {}
                    Message::Close(frame) => {
                        return ReadOutcome::Closed(frame.map(|f| f.code.into()));
                    }
                    Message::Frame(_) => {}
                    message => {
                        metrics::record_message_received();
                        handler.on_message(message);
                    }
                }
            }
        }
    }
}

/// Serializes outbound sends and periodic pings onto the sink.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    ping_interval: Duration,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Best-effort close frame; the peer may already be gone
                let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                return Ok(());
            }
            _ = ping.tick() => {
                write_frame(&mut sink, Message::Ping(Vec::new().into()), write_timeout).await?;
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(message) => {
                    write_frame(&mut sink, message, write_timeout).await?;
                    metrics::record_message_sent();
                }
                None => return Ok(()),
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WsStream, Message>,
    message: Message,
    write_timeout: Duration,
) -> Result<(), BridgeError> {
    match timeout(write_timeout, sink.send(message)).await {
        Err(_) => Err(BridgeError::Write("write timed out".to_string())),
        Ok(Err(e)) => Err(BridgeError::Write(e.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}
