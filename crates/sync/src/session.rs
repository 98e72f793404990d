//! Plumbing shared by both ends of a session.

use crate::codec::FramedStream;
use crate::{ReconnectError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

/// Run storage or map work off the async threads.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ReconnectError::Io(io::Error::other(e)))?
}

/// Receive the next message or fail with [`ReconnectError::Timeout`].
pub(crate) async fn recv_within<S, M>(
    framed: &mut FramedStream<S>,
    limit: Duration,
    waiting_for: &'static str,
) -> Result<M>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match timeout(limit, framed.recv::<M>()).await {
        Ok(message) => Ok(message?),
        Err(_) => Err(ReconnectError::Timeout { waiting_for }),
    }
}

/// Tell the peer the session is over. Delivery is best effort.
pub(crate) async fn send_abort<S, M>(framed: &mut FramedStream<S>, abort: &M, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    match timeout(limit, framed.send(abort)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Failed to deliver abort"),
        Err(_) => debug!("Timed out delivering abort"),
    }
}
