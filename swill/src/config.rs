//! Typed server configuration: mounted paths, subprotocol, send-queue
//! bound, and message size limits, assembled through a layered builder.
//!
//! File and environment loading stay out of scope; this is the typed
//! surface such loading would feed.

/// The WebSocket subprotocol Swill requires clients to offer.
pub const SUBPROTOCOL: &str = "swill/1";

/// Default bound on a connection's outbound send queue.
///
/// The reference implementation's queue is unbounded; this implementation
/// bounds it so a slow client applies backpressure to its own handlers
/// instead of growing memory without limit.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Server-wide configuration, built once and shared across connections.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    mounts: Vec<String>,
    subprotocol: String,
    send_queue_capacity: usize,
    max_message_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mounts: vec!["/ws".to_string()],
            subprotocol: SUBPROTOCOL.to_string(),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_message_bytes: None,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounts.iter().any(|m| m == path)
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    pub fn send_queue_capacity(&self) -> usize {
        self.send_queue_capacity
    }

    pub fn max_message_bytes(&self) -> Option<usize> {
        self.max_message_bytes
    }
}

/// Builder for [`ServerConfig`].
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
    mount_called: bool,
}

impl ServerConfigBuilder {
    /// Mount the server at `path` (in addition to any previously mounted paths).
    pub fn mount(mut self, path: impl Into<String>) -> Self {
        if !self.mount_called {
            self.config.mounts.clear();
            self.mount_called = true;
        }
        self.config.mounts.push(path.into());
        self
    }

    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.config.subprotocol = subprotocol.into();
        self
    }

    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.config.max_message_bytes = Some(bytes);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_mounts_ws_with_default_queue() {
        let config = ServerConfig::default();
        assert!(config.is_mounted("/ws"));
        assert_eq!(config.send_queue_capacity(), DEFAULT_SEND_QUEUE_CAPACITY);
        assert_eq!(config.subprotocol(), SUBPROTOCOL);
    }

    #[test]
    fn builder_replaces_default_mount_on_first_custom_mount() {
        let config = ServerConfig::builder().mount("/rpc").build();
        assert!(config.is_mounted("/rpc"));
        assert!(!config.is_mounted("/ws"));
    }

    #[test]
    fn builder_accumulates_additional_mounts() {
        let config = ServerConfig::builder().mount("/rpc").mount("/rpc2").build();
        assert!(config.is_mounted("/rpc"));
        assert!(config.is_mounted("/rpc2"));
    }

    #[test]
    fn explicitly_remounting_default_path_does_not_swallow_later_mounts() {
        let config = ServerConfig::builder().mount("/ws").mount("/rpc2").build();
        assert!(config.is_mounted("/ws"));
        assert!(config.is_mounted("/rpc2"));
    }
}
