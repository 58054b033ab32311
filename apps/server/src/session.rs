//! Per-connection session state and the transport write seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::ConnectionError;
use parlor_common::id;

/// Stable session handle. Registries and the client-to-room index key on
/// this rather than on pointers.
pub type SessionId = String;

/// Every transport write happens under this deadline. A timeout or error
/// is treated as "session gone".
pub const WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// Close codes the Hub uses when tearing down a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Clean teardown (disconnect, shutdown).
    Normal,
    /// Teardown after a failed write.
    Internal,
}

/// Write half of a client transport.
///
/// Implemented by the WebSocket gateway in production and by a recording
/// stub in tests.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), ConnectionError>;
    async fn close(&self, code: CloseCode, reason: &str);
}

/// One-shot latch. Opens at most once; `wait` returns immediately once
/// open.
pub struct Latch {
    open: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Open the latch. Returns `true` on the first call, `false` on every
    /// subsequent one.
    pub fn open(&self) -> bool {
        let first = self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_open() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Enable before re-checking so an open between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// One live client connection.
pub struct Session {
    pub id: SessionId,
    /// Display name shown in chat frames.
    pub name: String,
    /// Authenticated user id, when the transport authenticated the client.
    pub user_id: Option<String>,
    pub authenticated: bool,
    conn: Option<Arc<dyn Connection>>,
    registered: Latch,
}

impl Session {
    pub fn new(name: impl Into<String>, conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            id: id::prefixed_ulid(id::prefix::SESSION),
            name: name.into(),
            user_id: None,
            authenticated: false,
            conn: Some(conn),
            registered: Latch::new(),
        })
    }

    pub fn authenticated(
        name: impl Into<String>,
        user_id: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id::prefixed_ulid(id::prefix::SESSION),
            name: name.into(),
            user_id: Some(user_id.into()),
            authenticated: true,
            conn: Some(conn),
            registered: Latch::new(),
        })
    }

    /// A session with no transport attached. Fan-out skips such sessions.
    pub fn detached(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id::prefixed_ulid(id::prefix::SESSION),
            name: name.into(),
            user_id: None,
            authenticated: false,
            conn: None,
            registered: Latch::new(),
        })
    }

    pub fn has_transport(&self) -> bool {
        self.conn.is_some()
    }

    pub fn registered(&self) -> &Latch {
        &self.registered
    }

    /// Write a text frame under [`WRITE_DEADLINE`].
    pub async fn send(&self, text: &str) -> Result<(), ConnectionError> {
        let conn = self.conn.as_ref().ok_or(ConnectionError::Closed)?;
        match tokio::time::timeout(WRITE_DEADLINE, conn.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    pub async fn close(&self, code: CloseCode, reason: &str) {
        if let Some(conn) = &self.conn {
            conn.close(code, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_opens_exactly_once() {
        let latch = Latch::new();
        assert!(!latch.is_open());
        assert!(latch.open());
        assert!(!latch.open());
        assert!(!latch.open());
        assert!(latch.is_open());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_open() {
        let latch = Latch::new();
        latch.open();
        latch.wait().await;
    }

    #[tokio::test]
    async fn wait_wakes_on_open() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn detached_session_has_no_transport() {
        let session = Session::detached("ghost");
        assert!(!session.has_transport());
        assert!(session.id.starts_with("ses_"));
    }
}
