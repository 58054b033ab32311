//! Shared fixtures: a recording stub transport and Hub harness helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parlor_server::bus::Bus;
use parlor_server::config::Config;
use parlor_server::error::ConnectionError;
use parlor_server::hub::Hub;
use parlor_server::repository::Repository;
use parlor_server::session::{CloseCode, Connection, Session};
use parlor_server::AppState;

/// Transport stub that records every frame and close, and can be flipped
/// into a failing state to exercise write-failure paths.
pub struct StubConnection {
    frames: Mutex<Vec<String>>,
    closed: Mutex<Option<(CloseCode, String)>>,
    failing: AtomicBool,
}

impl StubConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            failing: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn closed_with(&self) -> Option<(CloseCode, String)> {
        self.closed.lock().clone()
    }

    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.frames.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        *self.closed.lock() = Some((code, reason.to_string()));
    }
}

pub fn test_config(server_id: &str) -> Config {
    Config {
        port: 0,
        bus_enabled: true,
        server_id: server_id.to_string(),
        max_message_size: 4096,
        default_room_capacity: 100,
    }
}

/// Hub with a running event loop. The guard cancels the loop on drop.
pub struct HubHarness {
    pub hub: Arc<Hub>,
    pub shutdown: CancellationToken,
}

impl Drop for HubHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_hub(
    server_id: &str,
    repo: Option<Arc<dyn Repository>>,
    bus: Option<Arc<dyn Bus>>,
) -> HubHarness {
    let shutdown = CancellationToken::new();
    let hub = Hub::new(&test_config(server_id), repo, bus, shutdown.clone());
    tokio::spawn(hub.clone().run());
    // Let the loop bootstrap (load rooms, install bridge subscriptions).
    settle().await;
    HubHarness { hub, shutdown }
}

pub fn app_state(hub: &Arc<Hub>, server_id: &str) -> AppState {
    AppState {
        hub: hub.clone(),
        config: Arc::new(test_config(server_id)),
    }
}

/// Register a session and wait for its Registered latch.
pub async fn connect(hub: &Arc<Hub>, name: &str) -> (Arc<Session>, Arc<StubConnection>) {
    let conn = StubConnection::new();
    let session = Session::new(name, conn.clone() as Arc<dyn Connection>);
    hub.register(session.clone()).await.expect("register");
    tokio::time::timeout(Duration::from_secs(5), session.registered().wait())
        .await
        .expect("registration should complete");
    (session, conn)
}

/// Register an authenticated session (user id attached) and wait for its
/// Registered latch.
pub async fn connect_auth(
    hub: &Arc<Hub>,
    name: &str,
    user_id: &str,
) -> (Arc<Session>, Arc<StubConnection>) {
    let conn = StubConnection::new();
    let session = Session::authenticated(name, user_id, conn.clone() as Arc<dyn Connection>);
    hub.register(session.clone()).await.expect("register");
    tokio::time::timeout(Duration::from_secs(5), session.registered().wait())
        .await
        .expect("registration should complete");
    (session, conn)
}

/// Give channel-mediated work (event loop, unregister queue) a chance to
/// drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
