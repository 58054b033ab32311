pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod repository;
pub mod room;
pub mod session;

use std::sync::Arc;

use config::Config;
use hub::Hub;

/// Shared application state available to the transport layer.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
}
