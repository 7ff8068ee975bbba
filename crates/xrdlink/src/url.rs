//! Server endpoint identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the server endpoint a stream talks to. The display form
/// (`user@host:port`) is the tag used in every log line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerUrl {
    /// Host name or address of the server.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User tag, used for session identity only.
    pub user: String,
}

impl ServerUrl {
    /// Creates an endpoint identity with an empty user tag.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, user: String::new() }
    }

    /// Sets the user tag.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// `host:port`, the form handed to the resolver.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}
