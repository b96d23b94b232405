//! Spawner strategies and their shared result types.

pub mod pipe_watcher;
pub mod smart;

use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::config::AppOptions;
use crate::error::SpawnException;

/// One socket the spawned process listens on, as reported through
/// `response/properties.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socket {
    pub address: String,
    pub protocol: String,
    #[serde(default)]
    pub concurrency: i32,
    #[serde(default)]
    pub accept_http_requests: bool,
}

impl Socket {
    /// The preloader reports its command channel as a socket with this
    /// protocol; it is not an app socket.
    pub const PRELOADER_PROTOCOL: &'static str = "preloader";

    pub fn is_preloader_command_socket(&self) -> bool {
        self.protocol == Self::PRELOADER_PROTOCOL
    }
}

/// What a successful spawn hands back to the pool: enough to route
/// traffic to the new process and to adopt its stdio channels.
#[derive(Debug, Default)]
pub struct SpawnResult {
    pub pid: i32,
    pub sockets: Vec<Socket>,
    pub stdin_fd: Option<File>,
    pub stdout_and_err_fd: Option<File>,
}

/// A spawn strategy. Implementations are thread-safe; concurrent
/// `spawn` calls on one instance are serialized internally.
pub trait Spawner: Send + Sync {
    fn spawn(&self, options: &AppOptions) -> Result<SpawnResult, Box<SpawnException>>;

    /// Releases idle resources (for the smart spawner: stops the
    /// preloader). Calling it twice is a no-op.
    fn cleanup(&self);

    /// Wall-clock microsecond timestamp of the last `spawn` or
    /// `cleanup`; the pool uses this to evict idle spawners.
    fn last_used_usec(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preloader_socket_is_recognized_by_protocol() {
        let socket = Socket {
            address: "unix:/tmp/cmd.sock".into(),
            protocol: "preloader".into(),
            concurrency: 1,
            accept_http_requests: false,
        };
        assert!(socket.is_preloader_command_socket());

        let socket = Socket {
            address: "unix:/tmp/app.sock".into(),
            protocol: "http".into(),
            concurrency: 0,
            accept_http_requests: true,
        };
        assert!(!socket.is_preloader_command_socket());
    }

    #[test]
    fn socket_json_defaults() {
        let socket: Socket =
            serde_json::from_str(r#"{"address":"unix:/s","protocol":"http"}"#).unwrap();
        assert_eq!(socket.concurrency, 0);
        assert!(!socket.accept_http_requests);
    }
}
