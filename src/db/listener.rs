//! Notification listener
//!
//! A dedicated connection subscribed to the notification channel. The
//! connection's driver task forwards server notifications into an unbounded
//! channel; the mapper's listen loop multiplexes that channel against an
//! idle timeout and a connection-loss signal.

use crate::config::{ConnectionConfig, SslMode};
use crate::db::mapper::make_tls_config;
use crate::error::DbError;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Notification};
use tracing::{debug, warn};

/// The notification channel every mapper subscribes to
pub(crate) const CHANNEL: &str = "finery";

/// Delay before the first reconnect attempt after a lost listener connection
pub(crate) const RECONNECT_MIN: Duration = Duration::from_secs(10);

/// Ceiling for the reconnect delay (doubles per failed attempt)
pub(crate) const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// A decoded notification handed to the mapper's handler callback
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Channel the notification arrived on
    pub channel: String,
    /// Process ID of the notifying backend
    pub process_id: i32,
    /// The JSON payload
    pub payload: serde_json::Value,
}

/// Handler callback invoked synchronously for each decoded notification
pub type Handler = Box<dyn FnMut(ChangeEvent) + Send>;

/// What the listen loop observed while waiting
#[derive(Debug)]
pub(crate) enum ListenEvent<T> {
    /// A notification arrived
    Notify(T),
    /// The idle timeout elapsed without any notification
    Idle,
    /// The listener connection is gone; the event channel closed
    Lost,
}

/// A dedicated subscription connection
pub(crate) struct Listener {
    client: Arc<Client>,
    events: mpsc::UnboundedReceiver<Notification>,
}

impl Listener {
    /// Open a listener connection and subscribe to [`CHANNEL`].
    ///
    /// A failed connection maps to `DbError::ConnectionFailed`; a failed
    /// `LISTEN` maps to `DbError::SubscribeFailed`. Both are recoverable by
    /// the caller.
    pub(crate) async fn connect(config: &ConnectionConfig) -> Result<Self, DbError> {
        let url = config.connection_url();
        let (tx, rx) = mpsc::unbounded_channel();

        let client = match config.ssl_mode {
            SslMode::Disable => {
                let (client, connection) = tokio_postgres::connect(&url, NoTls)
                    .await
                    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
                spawn_notification_driver(connection, tx);
                client
            }
            SslMode::Prefer | SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
                let (client, connection) = tokio_postgres::connect(&url, tls)
                    .await
                    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
                spawn_notification_driver(connection, tx);
                client
            }
        };

        client
            .batch_execute(&format!("LISTEN {}", CHANNEL))
            .await
            .map_err(|e| DbError::SubscribeFailed(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            events: rx,
        })
    }

    /// Wait for the next notification, idle expiry, or connection loss.
    pub(crate) async fn next_event(&mut self, idle_timeout: Duration) -> ListenEvent<Notification> {
        next_event(&mut self.events, idle_timeout).await
    }

    /// Fire-and-forget liveness check on the listener connection.
    ///
    /// The result is discarded; a failure only shows up as a debug log and,
    /// eventually, as a closed event channel.
    pub(crate) fn ping(&self) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.batch_execute("SELECT 1").await {
                debug!("listener liveness check failed: {}", e);
            }
        });
    }
}

async fn next_event<T>(
    events: &mut mpsc::UnboundedReceiver<T>,
    idle_timeout: Duration,
) -> ListenEvent<T> {
    tokio::select! {
        event = events.recv() => match event {
            Some(notification) => ListenEvent::Notify(notification),
            None => ListenEvent::Lost,
        },
        _ = tokio::time::sleep(idle_timeout) => ListenEvent::Idle,
    }
}

/// Drive the connection, forwarding notifications until it dies or the
/// receiver is dropped.
fn spawn_notification_driver<S, T>(
    connection: Connection<S, T>,
    tx: mpsc::UnboundedSender<Notification>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut connection = connection;
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if tx.send(notification).is_err() {
                        break;
                    }
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    debug!("server notice: {}", notice.message());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("listener connection error: {}", e);
                    break;
                }
            }
        }
        // tx drops here; the receiver observes Lost
    });
}

/// Decode a notification payload as JSON.
pub(crate) fn decode_payload(raw: &str) -> serde_json::Result<serde_json::Value> {
    serde_json::from_str(raw)
}
