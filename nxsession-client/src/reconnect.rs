//! Connection loss handling and automatic reconnection.
//!
//! When the reader stops without a user-initiated disconnect, everything
//! bound to the old connection is failed with the terminating cause. If
//! reconnection is enabled and a reusable token is available, the
//! controller then retries with a fixed delay; otherwise, or once the
//! attempts are exhausted, the session is torn down and a single
//! `ConnectionBroken` notification is raised.

use crate::auth::{self, Credentials};
use crate::error::SessionError;
use crate::notification::{self as notify, Notification};
use crate::session::{self, SessionInner};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Called on a fresh task after the reader for `generation` stopped.
pub(crate) async fn connection_lost(
    inner: Arc<SessionInner>,
    cause: SessionError,
    generation: u64,
) {
    if inner.is_closed() || inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    let cause = Arc::new(cause);
    if inner.defer_loss(generation) {
        // The controller owns this loss; fail the attempt's calls so it
        // notices right away.
        tracing::debug!("reader {} stopped during reconnect: {}", generation, cause);
        inner.waits.release_all(&cause);
        return;
    }

    tracing::warn!("connection lost: {}", cause);
    release_connection(&inner, &cause).await;

    let token = inner.auth_token.lock().clone();
    let peer_closed = matches!(cause.as_ref(), SessionError::SessionClosed);
    match token {
        Some(token) if inner.config.reconnect_enabled && !peer_closed => {
            reconnect(inner, token, cause).await
        }
        _ => inner.teardown(cause, true).await,
    }
}

/// Fails everything bound to the connection that just went away.
async fn release_connection(inner: &SessionInner, cause: &Arc<SessionError>) {
    inner.proxy.abort_all(cause.clone());
    let released = inner.waits.release_all(cause);
    inner.messages.fail_all(cause);
    inner.files.fail_all("connection lost");
    inner.transport.close().await;
    if released > 0 {
        tracing::debug!("released {} pending request(s)", released);
    }
}

async fn reconnect(inner: Arc<SessionInner>, token: String, cause: Arc<SessionError>) {
    inner.set_state(session::ConnectionState::Reconnecting);
    inner.publish_lifecycle(Notification::new(notify::RECONNECTING));
    let max_attempts = inner.config.reconnect_max_attempts.max(1);

    for attempt in 1..=max_attempts {
        tokio::time::sleep(inner.config.reconnect_delay).await;
        if inner.is_closed() {
            return;
        }
        tracing::info!("reconnect attempt {}/{}", attempt, max_attempts);

        let result = attempt_reconnect(&inner, &token).await;
        if inner.is_closed() {
            return;
        }
        // The new reader may already have stopped; that attempt failed too.
        let result = result.and_then(|()| {
            if inner.finish_reconnect() {
                Ok(())
            } else {
                Err(SessionError::NotConnected)
            }
        });
        match result {
            Ok(()) => {
                inner.publish_lifecycle(Notification::new(notify::RECONNECT_COMPLETED));
                tracing::info!("reconnected after {} attempt(s)", attempt);
                return;
            }
            Err(e) => {
                tracing::warn!("reconnect attempt {} failed: {}", attempt, e);
                if let Some(reader) = inner.reader.lock().take() {
                    reader.abort();
                }
                release_connection(&inner, &Arc::new(e)).await;
            }
        }
    }

    tracing::error!("giving up after {} reconnect attempt(s)", max_attempts);
    inner.teardown(cause, true).await;
}

/// One attempt: connect, repeat the handshake, log in with the token and
/// re-announce active topics.
async fn attempt_reconnect(inner: &Arc<SessionInner>, token: &str) -> Result<(), SessionError> {
    session::open_connection(inner).await?;
    let info = auth::login(inner, &Credentials::Token(token.to_string()), None).await?;
    *inner.login.write() = Some(info);
    let replayed = inner
        .topics
        .replay(move |topic, on| inner.change_subscription(topic, on))
        .await?;
    if replayed > 0 {
        tracing::debug!("restored {} topic subscription(s)", replayed);
    }
    Ok(())
}
