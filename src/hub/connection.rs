//! One driver connection: auth handshake, then an inbound loop on the
//! connection's task and an outbound loop on its own task.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::AuthError;
use crate::hub::DriverConnectionHub;
use crate::hub::messages::{InboundFrame, LocationUpdate, OutboundFrame, RideResponse};
use crate::hub::session::ConnectionState;
use crate::ports::auth::{Identity, Role, TokenVerifier, bearer_token};

/// Receives decoded driver frames. Called on the connection's own task,
/// so frames from one driver arrive strictly in order.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_connect(&self, _driver_id: Uuid, _session_id: Uuid) {}

    async fn on_ride_response(&self, driver_id: Uuid, response: RideResponse);

    async fn on_location_update(&self, driver_id: Uuid, update: LocationUpdate);

    async fn on_disconnect(&self, _driver_id: Uuid, _session_id: Uuid) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Auth(AuthError),
    PeerClosed,
    ReadError(String),
    WriteFailed(String),
    Malformed(String),
    /// Closed from the hub side: replaced, evicted or shut down.
    Shutdown,
}

struct Connection {
    state: ConnectionState,
    driver_id: Option<Uuid>,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            driver_id: None,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(driver_id = ?self.driver_id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

/// Drives one connection to completion and reports why it closed.
pub async fn serve_connection<S, R, E>(
    hub: Arc<DriverConnectionHub>,
    verifier: Arc<dyn TokenVerifier>,
    handler: Arc<dyn InboundHandler>,
    mut sink: S,
    mut stream: R,
) -> CloseReason
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let config = hub.config().clone();
    let mut conn = Connection::new();
    conn.transition(ConnectionState::AuthPending);

    let identity = match timeout(config.auth_timeout, read_auth(&mut stream, verifier.as_ref())).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(err)) => return reject(&mut sink, &mut conn, err, &config).await,
        Err(_) => return reject(&mut sink, &mut conn, AuthError::Timeout, &config).await,
    };

    let driver_id = identity.user_id;
    conn.driver_id = Some(driver_id);

    let hello = OutboundFrame::AuthSuccess { driver_id };
    if let Err(reason) = write_frame(&mut sink, &hello, config.write_timeout).await {
        conn.transition(ConnectionState::Closed);
        return reason;
    }

    let lease = hub.register(driver_id);
    conn.transition(ConnectionState::Authenticated);
    handler.on_connect(driver_id, lease.session_id).await;

    let writer = tokio::spawn(outbound_loop(
        sink,
        lease.outbound_rx,
        lease.shutdown.clone(),
        config.clone(),
    ));

    let inbound_reason = inbound_loop(
        &mut stream,
        driver_id,
        handler.as_ref(),
        &lease.shutdown,
        &lease.activity,
    )
    .await;

    hub.unregister(driver_id, lease.session_id);
    lease.shutdown.cancel();

    let writer_reason = match writer.await {
        Ok(reason) => reason,
        Err(err) => Some(CloseReason::WriteFailed(err.to_string())),
    };
    handler.on_disconnect(driver_id, lease.session_id).await;
    conn.transition(ConnectionState::Closed);

    // a write failure cancels the token, which surfaces inbound as Shutdown
    let reason = match (inbound_reason, writer_reason) {
        (CloseReason::Shutdown, Some(write_reason)) => write_reason,
        (inbound, _) => inbound,
    };
    info!(driver_id = %driver_id, reason = ?reason, "driver connection finished");
    reason
}

async fn read_auth<R, E>(stream: &mut R, verifier: &dyn TokenVerifier) -> Result<Identity, AuthError>
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let token = match InboundFrame::decode(&text) {
                    Ok(InboundFrame::Auth { token }) => token,
                    Ok(_) => return Err(AuthError::Invalid("first frame must be auth".to_string())),
                    Err(_) => return Err(AuthError::Malformed),
                };
                let identity = verifier.verify(bearer_token(&token)?).await?;
                return identity.require(Role::Driver);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => return Err(AuthError::Malformed),
            Some(Ok(Message::Close(_))) | None => {
                return Err(AuthError::Invalid("closed before auth".to_string()));
            }
            Some(Err(err)) => return Err(AuthError::Invalid(err.to_string())),
        }
    }
}

async fn reject<S>(sink: &mut S, conn: &mut Connection, err: AuthError, config: &HubConfig) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    warn!(error = %err, "driver authentication failed");
    let code = match err {
        AuthError::Timeout => "auth_timeout",
        _ => "auth_failed",
    };
    let _ = write_frame(sink, &OutboundFrame::error(code, err.to_string()), config.write_timeout).await;
    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    conn.transition(ConnectionState::Closed);
    CloseReason::Auth(err)
}

async fn inbound_loop<R, E>(
    stream: &mut R,
    driver_id: Uuid,
    handler: &dyn InboundHandler,
    shutdown: &CancellationToken,
    activity: &crate::hub::session::Activity,
) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return CloseReason::Shutdown,
            next = stream.next() => next,
        };

        let message = match next {
            None | Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
            Some(Err(err)) => return CloseReason::ReadError(err.to_string()),
            Some(Ok(message)) => message,
        };
        activity.touch();

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => return CloseReason::Malformed("binary frames are not supported".to_string()),
            Message::Close(_) => return CloseReason::PeerClosed,
        };

        match InboundFrame::decode(&text) {
            Ok(InboundFrame::RideResponse(response)) => {
                handler.on_ride_response(driver_id, response).await;
            }
            Ok(InboundFrame::LocationUpdate(update)) => {
                handler.on_location_update(driver_id, update).await;
            }
            Ok(InboundFrame::Auth { .. }) => {
                debug!(driver_id = %driver_id, "ignoring repeated auth frame");
            }
            Ok(InboundFrame::Unknown(tag)) => {
                debug!(driver_id = %driver_id, tag = %tag, "dropping frame of unknown type");
            }
            Err(err) => {
                warn!(driver_id = %driver_id, error = %err, "malformed frame; closing connection");
                return CloseReason::Malformed(err.to_string());
            }
        }
    }
}

async fn outbound_loop<S>(
    mut sink: S,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    shutdown: CancellationToken,
    config: HubConfig,
) -> Option<CloseReason>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let mut keepalive = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    let failure = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break None,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(reason) = write_frame(&mut sink, &frame, config.write_timeout).await {
                        break Some(reason);
                    }
                }
                None => break None,
            },
            _ = keepalive.tick() => {
                if let Err(reason) = write_message(&mut sink, Message::Ping(Vec::new()), config.write_timeout).await {
                    break Some(reason);
                }
            }
        }
    };

    if failure.is_some() {
        shutdown.cancel();
    } else {
        let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    }
    failure
}

async fn write_frame<S>(sink: &mut S, frame: &OutboundFrame, deadline: Duration) -> Result<(), CloseReason>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize outbound frame");
            return Ok(());
        }
    };
    write_message(sink, Message::Text(json), deadline).await
}

async fn write_message<S>(sink: &mut S, message: Message, deadline: Duration) -> Result<(), CloseReason>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(CloseReason::WriteFailed(err.to_string())),
        Err(_) => Err(CloseReason::WriteFailed("write deadline exceeded".to_string())),
    }
}
