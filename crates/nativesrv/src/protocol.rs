//! Protocol constants shared by the server and client sides.

use std::fmt;
use std::str::FromStr;

use crate::errors::{NativeSrvError, Result};

pub const SERVER_NAME: &str = "NativeSrv";
pub const VERSION_MAJOR: u64 = 25;
pub const VERSION_MINOR: u64 = 6;
pub const VERSION_PATCH: u64 = 3;

/// Protocol revisions at which features were introduced.
///
/// A feature is used on a connection only if the negotiated revision is at
/// least the listed value.
pub mod revision {
    pub const CLIENT_INFO: u64 = 54032;
    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const TABLES_STATUS: u64 = 54226;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const SERVER_LOGS: u64 = 54406;
    pub const COLUMN_DEFAULTS_METADATA: u64 = 54410;
    pub const CLIENT_WRITE_INFO: u64 = 54420;
    pub const SETTINGS_AS_STRINGS: u64 = 54429;
    pub const INTERSERVER_SECRET: u64 = 54441;
    pub const OPENTELEMETRY: u64 = 54442;
    pub const DISTRIBUTED_DEPTH: u64 = 54448;
    pub const INITIAL_QUERY_START_TIME: u64 = 54449;
    pub const INCREMENTAL_PROFILE_EVENTS: u64 = 54451;
    pub const PARALLEL_REPLICAS: u64 = 54453;
    pub const CUSTOM_SERIALIZATION: u64 = 54454;
    pub const PROFILE_EVENTS_IN_INSERT: u64 = 54456;
    pub const ADDENDUM: u64 = 54458;
    pub const PARAMETERS: u64 = 54459;
    pub const SERVER_QUERY_TIME_IN_PROGRESS: u64 = 54460;
    pub const PASSWORD_COMPLEXITY_RULES: u64 = 54461;
    pub const INTERSERVER_SECRET_V2: u64 = 54462;
    pub const TOTAL_BYTES_IN_PROGRESS: u64 = 54463;
    pub const TIMEZONE_UPDATES: u64 = 54464;
    pub const SSH_AUTHENTICATION: u64 = 54466;
    pub const TABLE_READ_ONLY_CHECK: u64 = 54467;
    pub const ROWS_BEFORE_AGGREGATION: u64 = 54469;
    pub const CHUNKED_PACKETS: u64 = 54470;
    pub const VERSIONED_PARALLEL_REPLICAS: u64 = 54471;

    /// Oldest client revision accepted by the server.
    pub const MIN_SUPPORTED: u64 = SETTINGS_AS_STRINGS;

    /// Revision implemented by this crate.
    pub const SERVER: u64 = 54471;
}

/// Version of the parallel replicas read-task sub-protocol.
pub const PARALLEL_REPLICAS_PROTOCOL_VERSION: u64 = 4;
/// Oldest parallel replicas sub-protocol version we understand.
pub const MIN_PARALLEL_REPLICAS_PROTOCOL_VERSION: u64 = 3;

/// Version of the string based read-task protocol.
pub const CLUSTER_PROCESSING_PROTOCOL_VERSION: u64 = 1;

/// User name sent by a replica authenticating with a shared cluster secret.
pub const INTERSERVER_SECRET_USER: &str = " INTERSERVER SECRET ";
/// User name prefix sent by a client authenticating with a signed challenge.
pub const SSH_KEY_AUTHENTICATION_MARKER: &str = " SSH KEY AUTHENTICATION ";

macro_rules! packet_ids {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $val:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $val,)*
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)*
                }
            }
        }

        impl TryFrom<u64> for $name {
            type Error = u64;

            fn try_from(value: u64) -> std::result::Result<Self, u64> {
                match value {
                    $($val => Ok(Self::$variant),)*
                    other => Err(other),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

packet_ids! {
    /// Leading tag of packets sent by a client.
    ClientPacketId {
        Hello = 0,
        Query = 1,
        Data = 2,
        Cancel = 3,
        Ping = 4,
        TablesStatusRequest = 5,
        KeepAlive = 6,
        Scalar = 7,
        IgnoredPartUuids = 8,
        ReadTaskResponse = 9,
        MergeTreeReadTaskResponse = 10,
        SshChallengeRequest = 11,
        SshChallengeResponse = 12,
    }
}

packet_ids! {
    /// Leading tag of packets sent by the server.
    ServerPacketId {
        Hello = 0,
        Data = 1,
        Exception = 2,
        Progress = 3,
        Pong = 4,
        EndOfStream = 5,
        ProfileInfo = 6,
        Totals = 7,
        Extremes = 8,
        TablesStatusResponse = 9,
        Log = 10,
        TableColumns = 11,
        PartUuids = 12,
        ReadTaskRequest = 13,
        ProfileEvents = 14,
        MergeTreeAllRangesAnnouncement = 15,
        MergeTreeReadTaskRequest = 16,
        TimezoneUpdate = 17,
        SshChallenge = 18,
    }
}

/// Whether the blocks of a query are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Disabled,
    Enabled,
}

impl Compression {
    pub fn from_wire(v: u64) -> Result<Self> {
        match v {
            0 => Ok(Compression::Disabled),
            1 => Ok(Compression::Enabled),
            other => Err(NativeSrvError::malformed(format!(
                "invalid compression flag {other}"
            ))),
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            Compression::Disabled => 0,
            Compression::Enabled => 1,
        }
    }
}

/// How far a query should be processed before results are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryProcessingStage {
    FetchColumns = 0,
    WithMergeableState = 1,
    #[default]
    Complete = 2,
    WithMergeableStateAfterAggregation = 3,
    WithMergeableStateAfterAggregationAndLimit = 4,
}

impl QueryProcessingStage {
    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            0 => Self::FetchColumns,
            1 => Self::WithMergeableState,
            2 => Self::Complete,
            3 => Self::WithMergeableStateAfterAggregation,
            4 => Self::WithMergeableStateAfterAggregationAndLimit,
            other => {
                return Err(NativeSrvError::malformed(format!(
                    "unknown query processing stage {other}"
                )));
            }
        })
    }
}

/// Whether a query was issued by a user or by another server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    #[default]
    NoQuery = 0,
    InitialQuery = 1,
    SecondaryQuery = 2,
}

impl QueryKind {
    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::NoQuery,
            1 => Self::InitialQuery,
            2 => Self::SecondaryQuery,
            other => {
                return Err(NativeSrvError::malformed(format!("unknown query kind {other}")));
            }
        })
    }
}

/// Interface the client used to connect. Only TCP carries client details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interface {
    #[default]
    Tcp = 1,
    Http = 2,
    Grpc = 3,
    Local = 4,
}

impl Interface {
    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Tcp,
            2 => Self::Http,
            3 => Self::Grpc,
            4 => Self::Local,
            other => {
                return Err(NativeSrvError::malformed(format!("unknown interface {other}")));
            }
        })
    }
}

/// Chunked framing preference for one direction of the connection.
///
/// The `_optional` variants defer to the peer's preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkedMode {
    Chunked,
    #[default]
    NotChunked,
    ChunkedOptional,
    NotChunkedOptional,
}

impl ChunkedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunked => "chunked",
            Self::NotChunked => "notchunked",
            Self::ChunkedOptional => "chunked_optional",
            Self::NotChunkedOptional => "notchunked_optional",
        }
    }

    fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked | Self::ChunkedOptional)
    }

    fn is_optional(&self) -> bool {
        matches!(self, Self::ChunkedOptional | Self::NotChunkedOptional)
    }

    /// Resolve whether a direction is chunked given the server's and the
    /// client's preferences. Two mandatory but different preferences are
    /// incompatible.
    pub fn negotiate(server: ChunkedMode, client: ChunkedMode, direction: &str) -> Result<bool> {
        if server.is_optional() {
            return Ok(client.is_chunked());
        }
        if client.is_optional() {
            return Ok(server.is_chunked());
        }
        if server.is_chunked() != client.is_chunked() {
            return Err(NativeSrvError::IncompatibleProtocol(format!(
                "client's {direction} is set to {}, server's is set to {}",
                client.as_str(),
                server.as_str(),
            )));
        }
        Ok(server.is_chunked())
    }
}

impl FromStr for ChunkedMode {
    type Err = NativeSrvError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "chunked" => Self::Chunked,
            "notchunked" => Self::NotChunked,
            "chunked_optional" => Self::ChunkedOptional,
            "notchunked_optional" => Self::NotChunkedOptional,
            other => {
                return Err(NativeSrvError::malformed(format!(
                    "invalid chunked mode '{other}'"
                )));
            }
        })
    }
}

impl fmt::Display for ChunkedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_roundtrip_through_u64() {
        assert_eq!(
            ClientPacketId::MergeTreeReadTaskResponse,
            ClientPacketId::try_from(10).unwrap()
        );
        assert_eq!(ServerPacketId::SshChallenge, ServerPacketId::try_from(18).unwrap());
        assert_eq!(Err(19), ServerPacketId::try_from(19));
        assert_eq!("TablesStatusRequest", ClientPacketId::TablesStatusRequest.as_str());
    }

    #[test]
    fn negotiate_chunked() {
        use ChunkedMode::*;

        assert!(ChunkedMode::negotiate(Chunked, Chunked, "send").unwrap());
        assert!(!ChunkedMode::negotiate(NotChunked, NotChunked, "send").unwrap());
        assert!(ChunkedMode::negotiate(ChunkedOptional, Chunked, "send").unwrap());
        assert!(!ChunkedMode::negotiate(ChunkedOptional, NotChunked, "send").unwrap());
        assert!(ChunkedMode::negotiate(Chunked, NotChunkedOptional, "send").unwrap());
        assert!(!ChunkedMode::negotiate(NotChunkedOptional, NotChunkedOptional, "recv").unwrap());
        ChunkedMode::negotiate(Chunked, NotChunked, "send").unwrap_err();
        ChunkedMode::negotiate(NotChunked, Chunked, "recv").unwrap_err();
    }

    #[test]
    fn parse_chunked_mode() {
        assert_eq!(
            ChunkedMode::ChunkedOptional,
            "chunked_optional".parse::<ChunkedMode>().unwrap()
        );
        "chunky".parse::<ChunkedMode>().unwrap_err();
    }
}
