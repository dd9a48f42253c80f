use std::fmt;
use std::io;
use std::time::Duration;

pub type Result<T, E = NativeSrvError> = std::result::Result<T, E>;

/// Numeric error codes sent to clients in exception packets.
pub mod codes {
    pub const CHECKSUM_DOESNT_MATCH: i32 = 40;
    pub const LOGICAL_ERROR: i32 = 49;
    pub const TYPE_MISMATCH: i32 = 53;
    pub const TABLE_ALREADY_EXISTS: i32 = 57;
    pub const UNKNOWN_TABLE: i32 = 60;
    pub const SYNTAX_ERROR: i32 = 62;
    pub const UNKNOWN_DATABASE: i32 = 81;
    pub const DATABASE_ALREADY_EXISTS: i32 = 82;
    pub const UNKNOWN_COMPRESSION_METHOD: i32 = 89;
    pub const UNKNOWN_PACKET_FROM_CLIENT: i32 = 100;
    pub const UNEXPECTED_PACKET_FROM_CLIENT: i32 = 101;
    pub const UNKNOWN_SETTING: i32 = 115;
    pub const CANNOT_PARSE_INPUT: i32 = 117;
    pub const TIMEOUT_EXCEEDED: i32 = 159;
    pub const SOCKET_TIMEOUT: i32 = 209;
    pub const NETWORK_ERROR: i32 = 210;
    pub const CLIENT_HAS_CONNECTED_TO_WRONG_PORT: i32 = 217;
    pub const TOO_MANY_PARTS: i32 = 252;
    pub const UNKNOWN_USER: i32 = 192;
    pub const QUERY_WAS_CANCELLED: i32 = 394;
    pub const AUTHENTICATION_FAILED: i32 = 516;
    pub const UNSUPPORTED_METHOD: i32 = 1;

    /// Symbolic name for a code, used as the exception name on the wire.
    pub fn name(code: i32) -> &'static str {
        match code {
            CHECKSUM_DOESNT_MATCH => "CHECKSUM_DOESNT_MATCH",
            LOGICAL_ERROR => "LOGICAL_ERROR",
            TYPE_MISMATCH => "TYPE_MISMATCH",
            TABLE_ALREADY_EXISTS => "TABLE_ALREADY_EXISTS",
            UNKNOWN_TABLE => "UNKNOWN_TABLE",
            SYNTAX_ERROR => "SYNTAX_ERROR",
            UNKNOWN_DATABASE => "UNKNOWN_DATABASE",
            DATABASE_ALREADY_EXISTS => "DATABASE_ALREADY_EXISTS",
            UNKNOWN_COMPRESSION_METHOD => "UNKNOWN_COMPRESSION_METHOD",
            UNKNOWN_PACKET_FROM_CLIENT => "UNKNOWN_PACKET_FROM_CLIENT",
            UNEXPECTED_PACKET_FROM_CLIENT => "UNEXPECTED_PACKET_FROM_CLIENT",
            UNKNOWN_SETTING => "UNKNOWN_SETTING",
            CANNOT_PARSE_INPUT => "CANNOT_PARSE_INPUT",
            TIMEOUT_EXCEEDED => "TIMEOUT_EXCEEDED",
            SOCKET_TIMEOUT => "SOCKET_TIMEOUT",
            NETWORK_ERROR => "NETWORK_ERROR",
            CLIENT_HAS_CONNECTED_TO_WRONG_PORT => "CLIENT_HAS_CONNECTED_TO_WRONG_PORT",
            TOO_MANY_PARTS => "TOO_MANY_PARTS",
            UNKNOWN_USER => "UNKNOWN_USER",
            QUERY_WAS_CANCELLED => "QUERY_WAS_CANCELLED",
            AUTHENTICATION_FAILED => "AUTHENTICATION_FAILED",
            UNSUPPORTED_METHOD => "UNSUPPORTED_METHOD",
            _ => "UNKNOWN_EXCEPTION",
        }
    }
}

/// An error raised by the query engine while executing a query.
///
/// Engine errors are never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub code: i32,
    pub message: String,
    /// Optional text stack trace. Only sent if the connection allows it.
    pub stack_trace: Option<String>,
}

impl ExecError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ExecError {
            code,
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn logical(message: impl Into<String>) -> Self {
        Self::new(codes::LOGICAL_ERROR, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(codes::SYNTAX_ERROR, message)
    }

    pub fn unknown_table(table: &str) -> Self {
        Self::new(codes::UNKNOWN_TABLE, format!("Table {table} doesn't exist"))
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(codes::TYPE_MISMATCH, message)
    }

    pub fn too_many_parts(parts: usize, limit: usize) -> Self {
        Self::new(
            codes::TOO_MANY_PARTS,
            format!("Too many parts ({parts}). Maximum allowed parts per table is {limit}"),
        )
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code: {}. {} ({})", self.code, self.message, codes::name(self.code))
    }
}

impl std::error::Error for ExecError {}

impl From<NativeSrvError> for ExecError {
    fn from(e: NativeSrvError) -> Self {
        match e {
            NativeSrvError::Exec(e) => e,
            other => ExecError::new(other.code(), other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NativeSrvError {
    #[error("Unexpected packet {packet} received from client while {state}")]
    UnexpectedPacket {
        packet: &'static str,
        state: &'static str,
    },

    #[error("Unknown packet {0} from client")]
    UnknownPacket(u64),

    #[error("Client has connected to wrong port")]
    WrongPort,

    #[error("Client revision {revision} is too old, minimum supported revision is {minimum}")]
    UnsupportedRevision { revision: u64, minimum: u64 },

    #[error("Invalid PROXY protocol header: {0}")]
    InvalidProxyHeader(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Database {0} doesn't exist")]
    UnknownDatabase(String),

    #[error("Unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("Cannot parse value '{value}' for setting '{name}'")]
    InvalidSettingValue { name: String, value: String },

    #[error("Incompatible protocol: {0}")]
    IncompatibleProtocol(String),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Checksum doesn't match: corrupted data. Reference: {expected:#x}, actual: {actual:#x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Unknown compression method: {0:#04x}")]
    UnknownCompressionMethod(u8),

    #[error("Timeout exceeded while {op} ({timeout:?})")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Wait for async insert timeout ({0:?}) exceeded")]
    AsyncInsertTimeout(Duration),

    #[error("Connection reset by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NativeSrvError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        NativeSrvError::Malformed(msg.into())
    }

    /// The machine readable code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::UnexpectedPacket { .. } => codes::UNEXPECTED_PACKET_FROM_CLIENT,
            Self::UnknownPacket(_) => codes::UNKNOWN_PACKET_FROM_CLIENT,
            Self::WrongPort => codes::CLIENT_HAS_CONNECTED_TO_WRONG_PORT,
            Self::UnsupportedRevision { .. } => codes::UNEXPECTED_PACKET_FROM_CLIENT,
            Self::InvalidProxyHeader(_) => codes::NETWORK_ERROR,
            Self::AuthenticationFailed(_) => codes::AUTHENTICATION_FAILED,
            Self::UnknownDatabase(_) => codes::UNKNOWN_DATABASE,
            Self::UnknownSetting(_) => codes::UNKNOWN_SETTING,
            Self::InvalidSettingValue { .. } => codes::CANNOT_PARSE_INPUT,
            Self::IncompatibleProtocol(_) => codes::NETWORK_ERROR,
            Self::Malformed(_) => codes::UNKNOWN_PACKET_FROM_CLIENT,
            Self::ChecksumMismatch { .. } => codes::CHECKSUM_DOESNT_MATCH,
            Self::UnknownCompressionMethod(_) => codes::UNKNOWN_COMPRESSION_METHOD,
            Self::Timeout { .. } => codes::SOCKET_TIMEOUT,
            Self::AsyncInsertTimeout(_) => codes::TIMEOUT_EXCEEDED,
            Self::ConnectionClosed => codes::NETWORK_ERROR,
            Self::Exec(e) => e.code,
            Self::Io(_) => codes::NETWORK_ERROR,
        }
    }

    /// Whether the connection must be closed after this error.
    ///
    /// Framing errors leave the input stream in an unknown position, and
    /// transport errors leave nothing to talk to.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownPacket(_)
                | Self::WrongPort
                | Self::UnsupportedRevision { .. }
                | Self::InvalidProxyHeader(_)
                | Self::AuthenticationFailed(_)
                | Self::IncompatibleProtocol(_)
                | Self::Malformed(_)
                | Self::ChecksumMismatch { .. }
                | Self::UnknownCompressionMethod(_)
                | Self::Timeout { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
        )
    }

    /// Whether the connection can still be written to after this error.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Timeout { .. } | Self::ConnectionClosed | Self::Io(_))
    }

    /// Optional stack trace attached to this error.
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Self::Exec(e) => e.stack_trace.as_deref(),
            _ => None,
        }
    }

    /// Message to send to the client. Engine errors carry their own message,
    /// everything else uses the display impl.
    pub fn client_message(&self) -> String {
        match self {
            Self::Exec(e) => e.message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_errors_are_not_fatal() {
        let err: NativeSrvError = ExecError::too_many_parts(3, 3).into();
        assert_eq!(codes::TOO_MANY_PARTS, err.code());
        assert!(!err.is_fatal());
        assert!(err.is_writable());
    }

    #[test]
    fn transport_errors_are_fatal_and_unwritable() {
        let err = NativeSrvError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_fatal());
        assert!(!err.is_writable());
    }

    #[test]
    fn unexpected_packet_is_recoverable() {
        let err = NativeSrvError::UnexpectedPacket {
            packet: "Data",
            state: "waiting for a query",
        };
        assert_eq!(codes::UNEXPECTED_PACKET_FROM_CLIENT, err.code());
        assert!(!err.is_fatal());
    }
}
