use clap::{Parser, ValueEnum};
use nativesrv::protocol::ChunkedMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Human,
    Json,
}

impl From<LogFormatArg> for logutil::LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Human => logutil::LogFormat::HumanReadable,
            LogFormatArg::Json => logutil::LogFormat::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "nativeserver", version)]
pub struct ServerArgs {
    /// TCP address to listen on for native protocol connections.
    #[arg(
        short = 'b',
        long = "bind",
        env = "NATIVESRV_BIND",
        default_value = "127.0.0.1:9000"
    )]
    pub bind: String,

    /// User clients authenticate as.
    ///
    /// Only checked if a password is also provided. Without a password every
    /// user is accepted.
    #[arg(short, long, default_value_t = String::from("default"), requires = "password")]
    pub user: String,

    /// Password for `user`.
    #[arg(short, long, env = "NATIVESRV_PASSWORD")]
    pub password: Option<String>,

    /// Expect a PROXY protocol header at the start of every connection.
    #[arg(long)]
    pub proxy_protocol: bool,

    /// Chunking the server wants for packets it sends.
    #[arg(long, default_value = "notchunked_optional")]
    pub send_chunked: ChunkedMode,

    /// Chunking the server wants for packets it receives.
    #[arg(long, default_value = "notchunked_optional")]
    pub recv_chunked: ChunkedMode,

    /// Seconds to wait on a client socket before giving up on a send.
    #[arg(long, default_value_t = 300)]
    pub send_timeout: u64,

    /// Seconds to wait on a client socket before giving up on a receive.
    #[arg(long, default_value_t = 300)]
    pub receive_timeout: u64,

    /// Shared secret for servers of a cluster, as `cluster=secret`.
    ///
    /// May be given more than once.
    #[arg(long = "interserver-secret", value_parser = parse_cluster_secret)]
    pub interserver_secrets: Vec<(String, String)>,

    /// Batch inserts sent with `async_insert` enabled.
    #[arg(long)]
    pub async_insert: bool,

    /// Server time zone, sent to clients in the hello.
    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    /// Name shown to clients.
    #[arg(long, default_value = "nativeserver")]
    pub display_name: String,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Human)]
    pub log_format: LogFormatArg,

    /// Log level used unless overridden by the NATIVESRV_LOG environment
    /// variable.
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

fn parse_cluster_secret(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((cluster, secret)) if !cluster.is_empty() && !secret.is_empty() => {
            Ok((cluster.to_string(), secret.to_string()))
        }
        _ => Err(format!("expected 'cluster=secret', got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = ServerArgs::try_parse_from(["nativeserver"]).unwrap();
        assert_eq!("127.0.0.1:9000", args.bind);
        assert_eq!(ChunkedMode::NotChunkedOptional, args.send_chunked);
        assert!(args.interserver_secrets.is_empty());
        assert_eq!(tracing::Level::INFO, args.log_level);
    }

    #[test]
    fn cluster_secrets() {
        let args = ServerArgs::try_parse_from([
            "nativeserver",
            "--interserver-secret",
            "main=s3cret",
            "--interserver-secret",
            "backup=other=one",
        ])
        .unwrap();
        assert_eq!(
            vec![
                ("main".to_string(), "s3cret".to_string()),
                ("backup".to_string(), "other=one".to_string())
            ],
            args.interserver_secrets
        );

        ServerArgs::try_parse_from(["nativeserver", "--interserver-secret", "nosecret"])
            .unwrap_err();
    }

    #[test]
    fn chunked_modes() {
        let args =
            ServerArgs::try_parse_from(["nativeserver", "--send-chunked", "chunked"]).unwrap();
        assert_eq!(ChunkedMode::Chunked, args.send_chunked);
        ServerArgs::try_parse_from(["nativeserver", "--recv-chunked", "sometimes"]).unwrap_err();
    }
}
