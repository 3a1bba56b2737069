//! Completion handlers for connect attempts.
//!
//! Every connect, pooled or direct, reports through a [`CompletionHandler`].
//! [`CompletionBridge`] turns "a connection was just connected" into "this
//! request now owns that connection"; [`ConnectPromise`] lets a caller await
//! the outcome of a handler-driven connect.

use crate::base::neterror::NetError;
use crate::manager::provider::ConnectionProvider;
use crate::socket::client::Connection;
use crate::urlrequest::{Request, RequestFuture};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Receives the outcome of a connect attempt.
///
/// Exactly one of `completed`, `failed` or `cancelled` is invoked per attempt.
/// Implementations may be called from any runtime worker.
pub trait CompletionHandler: Send + Sync {
    fn completed(&self, connection: Connection);

    fn failed(&self, error: NetError);

    fn cancelled(&self);

    /// Progress notification; most handlers ignore it.
    fn updated(&self, _connection: &Connection) {}
}

/// Route a connect result to the matching handler callback.
/// `NetError::Aborted` is the cancellation outcome.
pub fn deliver(handler: &dyn CompletionHandler, result: Result<Connection, NetError>) {
    match result {
        Ok(connection) => handler.completed(connection),
        Err(e) if e.is_aborted() => handler.cancelled(),
        Err(e) => handler.failed(e),
    }
}

/// Bridges a raw connect to the request it was made for.
///
/// With a wrapped handler, failures and cancellation go to that handler only.
/// Without one, they go to the request future. A successful connect is always
/// attached to the future and reported to the provider before being
/// forwarded. Only the first terminal outcome has any effect.
pub struct CompletionBridge {
    request: Request,
    future: RequestFuture,
    provider: Arc<dyn ConnectionProvider>,
    wrapped: Option<Arc<dyn CompletionHandler>>,
    settled: AtomicBool,
}

impl CompletionBridge {
    pub fn new(
        request: Request,
        future: RequestFuture,
        provider: Arc<dyn ConnectionProvider>,
        wrapped: Option<Arc<dyn CompletionHandler>>,
    ) -> Self {
        Self { request, future, provider, wrapped, settled: AtomicBool::new(false) }
    }

    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }
}

impl CompletionHandler for CompletionBridge {
    fn completed(&self, connection: Connection) {
        if !self.settle() {
            tracing::warn!(id = %connection.id(), "connect completed after it was settled");
            return;
        }
        self.future.set_connection(connection.clone());
        self.provider.touch_connection(&connection, &self.request);
        if let Some(wrapped) = &self.wrapped {
            wrapped.completed(connection);
        }
    }

    fn failed(&self, error: NetError) {
        if !self.settle() {
            return;
        }
        tracing::debug!(url = %self.request.url(), error = %error, "connect failed");
        match &self.wrapped {
            Some(wrapped) => wrapped.failed(error),
            None => {
                self.future.abort(error);
            }
        }
    }

    fn cancelled(&self) {
        if !self.settle() {
            return;
        }
        match &self.wrapped {
            Some(wrapped) => wrapped.cancelled(),
            None => {
                self.future.cancel();
            }
        }
    }

    fn updated(&self, connection: &Connection) {
        if let Some(wrapped) = &self.wrapped {
            wrapped.updated(connection);
        }
    }
}

type Outcome = Result<Connection, NetError>;

/// A completion handler that resolves an awaitable [`PendingConnect`].
///
/// The inner handler, if any, is notified before the promise resolves.
pub struct ConnectPromise {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    inner: Option<Arc<dyn CompletionHandler>>,
}

impl ConnectPromise {
    pub fn new(inner: Option<Arc<dyn CompletionHandler>>) -> (Arc<Self>, PendingConnect) {
        let (tx, rx) = oneshot::channel();
        let promise = Arc::new(Self { tx: Mutex::new(Some(tx)), inner });
        (promise, PendingConnect { rx })
    }

    /// The sender, if no outcome was delivered yet and the waiter is still there.
    fn take_sender(&self) -> Option<oneshot::Sender<Outcome>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|tx| !tx.is_closed())
    }
}

impl CompletionHandler for ConnectPromise {
    fn completed(&self, connection: Connection) {
        let Some(tx) = self.take_sender() else {
            tracing::debug!(id = %connection.id(), "closing connection nobody is waiting for");
            connection.close();
            return;
        };
        if let Some(inner) = &self.inner {
            inner.completed(connection.clone());
        }
        if let Err(Ok(orphan)) = tx.send(Ok(connection)) {
            orphan.close();
        }
    }

    fn failed(&self, error: NetError) {
        let Some(tx) = self.take_sender() else {
            return;
        };
        if let Some(inner) = &self.inner {
            inner.failed(error.clone());
        }
        let _ = tx.send(Err(error));
    }

    fn cancelled(&self) {
        let Some(tx) = self.take_sender() else {
            return;
        };
        if let Some(inner) = &self.inner {
            inner.cancelled();
        }
        let _ = tx.send(Err(NetError::Aborted));
    }

    fn updated(&self, connection: &Connection) {
        if let Some(inner) = &self.inner {
            inner.updated(connection);
        }
    }
}

/// Awaitable side of a [`ConnectPromise`].
///
/// Resolves to `ConnectionAborted` if the promise is dropped unresolved.
pub struct PendingConnect {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingConnect {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(NetError::ConnectionAborted)))
    }
}
