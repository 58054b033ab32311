use parlor_common::id;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Whether the bus bridge is enabled.
    pub bus_enabled: bool,
    /// Origin id stamped on every bus publish. Generated when unset.
    pub server_id: String,
    /// Egress message size bound in bytes.
    pub max_message_size: usize,
    /// Max occupancy for rooms created through `create_room`.
    pub default_room_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables, with defaults that
    /// let a single node run without any external infrastructure.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 8080),
            bus_enabled: std::env::var("BUS_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            server_id: std::env::var("SERVER_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| id::prefixed_ulid(id::prefix::SERVER)),
            max_message_size: parsed_var("MAX_MESSAGE_SIZE", 4096),
            default_room_capacity: parsed_var("DEFAULT_ROOM_CAPACITY", 100),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
