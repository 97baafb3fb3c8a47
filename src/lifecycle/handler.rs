//! Handler types registered on a [`Server`](super::Server).

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::BoxError;
use crate::net::{DatagramEndpoint, StreamListener};

/// Outcome of a handler run. Returning an error caused by the listener
/// being closed counts as a graceful stop.
pub type HandlerResult = Result<(), BoxError>;

/// Invoked once per run with the bound stream listener.
pub type StreamHandler = Arc<dyn Fn(StreamListener) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Invoked once per run with the bound datagram endpoint.
pub type DatagramHandler = Arc<dyn Fn(DatagramEndpoint) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub(crate) fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(StreamListener) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |listener: StreamListener| -> BoxFuture<'static, HandlerResult> { Box::pin(f(listener)) })
}

pub(crate) fn datagram_handler<F, Fut>(f: F) -> DatagramHandler
where
    F: Fn(DatagramEndpoint) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |endpoint: DatagramEndpoint| -> BoxFuture<'static, HandlerResult> { Box::pin(f(endpoint)) })
}
