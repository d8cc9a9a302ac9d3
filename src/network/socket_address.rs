use serde::{Deserialize, Serialize};
use std::fmt;

/// Default port external observers listen on for notifications.
pub const NOTIFY_PORT: u16 = 19999;

/// Where an external observer listens for notifications, and optionally the local port the
/// toolchain should bind to talk to it.
///
/// Equality and hashing use exactly these three fields, so registering the same observer twice
/// collapses to one entry in a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketAddress {
    pub notify_host: String,
    pub notify_port: u16,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

impl SocketAddress {
    pub fn new(notify_host: impl Into<String>, notify_port: u16, listen_port: Option<u16>) -> Self {
        Self {
            notify_host: notify_host.into(),
            notify_port,
            listen_port,
        }
    }

    /// Observer on `host` using the default notify port.
    pub fn with_default_port(notify_host: impl Into<String>) -> Self {
        Self::new(notify_host, NOTIFY_PORT, None)
    }

    /// `host:port` string of the observer's end.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.notify_host, self.notify_port)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.listen_port {
            Some(port) => write!(f, "{} (local port {})", self.remote(), port),
            None => f.write_str(&self.remote()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identical_addresses_collapse_in_a_set() {
        let mut set = HashSet::new();
        set.insert(SocketAddress::new("localhost", 19999, None));
        set.insert(SocketAddress::new("localhost", 19999, None));
        set.insert(SocketAddress::new("localhost", 19999, Some(20000)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_includes_listen_port_when_set() {
        let addr = SocketAddress::new("10.0.0.1", 17895, Some(19000));
        assert_eq!(addr.to_string(), "10.0.0.1:17895 (local port 19000)");
        assert_eq!(SocketAddress::with_default_port("host").remote(), "host:19999");
    }
}
