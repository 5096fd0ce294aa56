use std::time::Duration;

use crate::net::{MAX_CONNECTION, REQUEST_BUFFER_SIZE, REQUEST_COUNT, SERVER_PORT};

pub const MAX_NET_PLAYER: usize = 8;
pub const DEFAULT_MAX_ENTITIES: usize = 512;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_connections: usize,
    pub request_slots: usize,
    pub request_buffer_size: usize,
    pub dispatch_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub peer_timeout_ms: u64,
    pub resend_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub disconnect_linger_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTION,
            request_slots: REQUEST_COUNT,
            request_buffer_size: REQUEST_BUFFER_SIZE,
            dispatch_interval_ms: 20,
            connect_timeout_ms: 5000,
            peer_timeout_ms: 10_000,
            resend_interval_ms: 100,
            keepalive_interval_ms: 1000,
            disconnect_linger_ms: 1000,
        }
    }
}

impl HostConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub display_name: String,
    pub server_port: u16,
    /// Hosts queried during module discovery, at most [`MAX_NET_PLAYER`].
    pub candidate_hosts: Vec<String>,
    pub connect_attempts: u32,
    pub connect_poll_ms: u64,
    pub join_timeout_ms: u64,
    pub module_info_timeout_ms: u64,
    pub max_entities: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: String::from("player"),
            server_port: SERVER_PORT,
            candidate_hosts: Vec::new(),
            connect_attempts: 500,
            connect_poll_ms: 10,
            join_timeout_ms: 5000,
            module_info_timeout_ms: 5000,
            max_entities: DEFAULT_MAX_ENTITIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_entities: usize,
    pub tick_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: SERVER_PORT,
            max_entities: DEFAULT_MAX_ENTITIES,
            tick_rate: 50,
        }
    }
}
