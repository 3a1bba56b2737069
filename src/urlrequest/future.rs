//! Request-level completion object.
//!
//! A [`RequestFuture`] is shared between the caller driving a request and the
//! connect machinery. The connection manager attaches the connection to it,
//! cancels it or aborts it with an error; the caller awaits
//! [`RequestFuture::connected`].

use crate::base::neterror::NetError;
use crate::socket::client::Connection;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum RequestState {
    Pending,
    Connected(Connection),
    Cancelled,
    Aborted(NetError),
}

impl RequestState {
    /// Cancelled and Aborted are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Cancelled | RequestState::Aborted(_))
    }
}

#[derive(Clone)]
pub struct RequestFuture {
    state: Arc<watch::Sender<RequestState>>,
}

impl Default for RequestFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestFuture {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RequestState::Pending);
        Self { state: Arc::new(tx) }
    }

    /// Attach the connection this request will use. Only a pending request
    /// accepts one.
    pub fn set_connection(&self, connection: Connection) -> bool {
        self.state.send_if_modified(|state| match state {
            RequestState::Pending => {
                *state = RequestState::Connected(connection);
                true
            }
            _ => false,
        })
    }

    /// Returns false if the request already finished.
    pub fn cancel(&self) -> bool {
        self.finish(RequestState::Cancelled)
    }

    /// Fail the request with `error`. Returns false if it already finished.
    pub fn abort(&self, error: NetError) -> bool {
        self.finish(RequestState::Aborted(error))
    }

    fn finish(&self, terminal: RequestState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = terminal;
            true
        })
    }

    pub fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    pub fn connection(&self) -> Option<Connection> {
        match &*self.state.borrow() {
            RequestState::Connected(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), RequestState::Cancelled)
    }

    /// Wait until the request has a connection or has finished.
    pub async fn connected(&self) -> Result<Connection, NetError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, RequestState::Pending))
            .await
            .map_err(|_| NetError::ConnectionAborted)?
            .clone();

        match state {
            RequestState::Connected(c) => Ok(c),
            RequestState::Cancelled => Err(NetError::Aborted),
            RequestState::Aborted(e) => Err(e),
            RequestState::Pending => Err(NetError::ConnectionAborted),
        }
    }
}

impl fmt::Debug for RequestFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFuture").field("state", &*self.state.borrow()).finish()
    }
}
