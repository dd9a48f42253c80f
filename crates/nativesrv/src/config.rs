use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Authenticator, PasswordlessAuthenticator};
use crate::protocol::ChunkedMode;
use crate::settings::Settings;

pub const DEFAULT_DATABASE: &str = "default";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ProtocolHandlerConfig {
    pub authenticator: Arc<dyn Authenticator>,
    /// Name shown to clients in the hello.
    pub display_name: String,
    /// Host name attached to log and profile event rows.
    pub host_name: String,
    pub timezone: String,
    pub default_database: String,
    /// Expect a PROXY protocol header before the hello.
    pub parse_proxy_protocol: bool,
    pub proto_send_chunked: ChunkedMode,
    pub proto_recv_chunked: ChunkedMode,
    /// Settings every session starts from.
    pub default_settings: Settings,
    /// Cluster name to shared secret, for inter-server connections.
    pub interserver_secrets: HashMap<String, String>,
    pub handshake_timeout: Duration,
    /// Rules sent to clients in the hello, pairs of pattern and message.
    pub password_complexity_rules: Vec<(String, String)>,
}

impl ProtocolHandlerConfig {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        ProtocolHandlerConfig {
            authenticator,
            display_name: "localhost".to_string(),
            host_name: "localhost".to_string(),
            timezone: "UTC".to_string(),
            default_database: DEFAULT_DATABASE.to_string(),
            parse_proxy_protocol: false,
            proto_send_chunked: ChunkedMode::NotChunked,
            proto_recv_chunked: ChunkedMode::NotChunked,
            default_settings: Settings::default(),
            interserver_secrets: HashMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            password_complexity_rules: Vec::new(),
        }
    }

    pub fn with_interserver_secret(
        mut self,
        cluster: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.interserver_secrets.insert(cluster.into(), secret.into());
        self
    }
}

impl Default for ProtocolHandlerConfig {
    fn default() -> Self {
        Self::new(Arc::new(PasswordlessAuthenticator))
    }
}
