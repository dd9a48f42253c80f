//! Connection setup: PROXY header, hellos, authentication and addendum.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::auth::{self, AuthenticatedUser};
use crate::codec::handshake::{HandshakeCodec, HandshakeMessage, HandshakeStep};
use crate::config::ProtocolHandlerConfig;
use crate::engine::QueryEngine;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{Addendum, ClientHello, ServerHello, ServerPacket};
use crate::protocol::{
    self, ChunkedMode, INTERSERVER_SECRET_USER, PARALLEL_REPLICAS_PROTOCOL_VERSION,
    SSH_KEY_AUTHENTICATION_MARKER, revision,
};
use crate::reader::BoxedRead;
use crate::settings::Settings;
use crate::writer::SharedWriter;

/// Answer to a client speaking HTTP to the native port.
pub const WRONG_PORT_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n\
This port speaks the native protocol, use the HTTP port for HTTP requests.\r\n";

/// How the connection's queries are authorized.
#[derive(Debug, Clone)]
pub enum SessionAuth {
    /// Authenticated once during the handshake.
    User(AuthenticatedUser),
    /// Another server sharing a cluster secret. Each query carries a hash
    /// proving it, and runs as the query's initial user.
    Interserver {
        cluster: String,
        salt: String,
        secret: String,
    },
}

/// Per connection settings taken from the session settings once the user
/// is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub interactive_delay: Duration,
    pub poll_interval: Duration,
    pub idle_connection_timeout: Duration,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    pub calculate_text_stack_trace: bool,
}

impl From<&Settings> for ConnectionSettings {
    fn from(settings: &Settings) -> Self {
        ConnectionSettings {
            interactive_delay: settings.interactive_delay,
            poll_interval: settings.poll_interval,
            idle_connection_timeout: settings.idle_connection_timeout,
            send_timeout: settings.send_timeout,
            receive_timeout: settings.receive_timeout,
            calculate_text_stack_trace: settings.calculate_text_stack_trace,
        }
    }
}

/// Everything negotiated during the handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: Option<SocketAddr>,
    /// Client address according to a PROXY header.
    pub forwarded_for: Option<SocketAddr>,
    pub hello: ClientHello,
    /// Lower of the client's and the server's revisions.
    pub revision: u64,
    pub auth: SessionAuth,
    pub database: String,
    /// Settings every query of this connection starts from.
    pub settings: Settings,
    pub connection_settings: ConnectionSettings,
    /// Sent in the server hello, mixed into inter-server hashes.
    pub nonce: Option<u64>,
    pub addendum: Addendum,
    pub send_chunked: bool,
    pub recv_chunked: bool,
}

impl Session {
    /// Name of the user queries run as. Inter-server connections take it
    /// from each query.
    pub fn user_name(&self) -> &str {
        match &self.auth {
            SessionAuth::User(user) => &user.name,
            SessionAuth::Interserver { .. } => "",
        }
    }

    pub fn is_interserver(&self) -> bool {
        matches!(self.auth, SessionAuth::Interserver { .. })
    }

    /// Address the client connects from, preferring the one forwarded by a
    /// proxy.
    pub fn client_address(&self) -> Option<SocketAddr> {
        self.forwarded_for.or(self.peer)
    }
}

/// Drives the handshake on the read half of a connection, answering
/// through `writer`.
pub(crate) struct Handshake<'a> {
    config: &'a ProtocolHandlerConfig,
    engine: &'a dyn QueryEngine,
    writer: &'a SharedWriter,
    framed: &'a mut FramedRead<BoxedRead, HandshakeCodec>,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(
        config: &'a ProtocolHandlerConfig,
        engine: &'a dyn QueryEngine,
        writer: &'a SharedWriter,
        framed: &'a mut FramedRead<BoxedRead, HandshakeCodec>,
    ) -> Self {
        Handshake {
            config,
            engine,
            writer,
            framed,
        }
    }

    pub(crate) async fn run(mut self, peer: Option<SocketAddr>) -> Result<Session> {
        let forwarded_for = if self.config.parse_proxy_protocol {
            self.receive_proxy_header().await?
        } else {
            None
        };

        let hello = self.receive_hello().await?;
        let rev = hello.revision.min(revision::SERVER);
        self.framed.decoder_mut().set_revision(rev);
        self.writer.configure(|codec| codec.set_revision(rev)).await;

        let address = forwarded_for.or(peer);
        let auth = if hello.user == INTERSERVER_SECRET_USER {
            self.receive_cluster_name_and_salt().await?
        } else if let Some(user) = hello.user.strip_prefix(SSH_KEY_AUTHENTICATION_MARKER) {
            if rev < revision::SSH_AUTHENTICATION {
                return Err(NativeSrvError::AuthenticationFailed(format!(
                    "{user}: key authentication requires revision {}",
                    revision::SSH_AUTHENTICATION
                )));
            }
            SessionAuth::User(self.receive_ssh_signature(user).await?)
        } else {
            SessionAuth::User(
                self.config
                    .authenticator
                    .authenticate(&hello.user, &hello.password, address)
                    .await?,
            )
        };
        debug!(
            client = %hello.client_name,
            user = %hello.user,
            revision = rev,
            interserver = matches!(auth, SessionAuth::Interserver { .. }),
            "authenticated"
        );

        let nonce = if rev >= revision::INTERSERVER_SECRET_V2 {
            Some(rand::random::<u64>())
        } else {
            None
        };
        self.send_hello(nonce).await?;

        let mut addendum = Addendum::default();
        let (mut send_chunked, mut recv_chunked) = (false, false);
        if rev >= revision::ADDENDUM {
            addendum = self.receive_addendum(rev).await?;
            if let Some((client_send, client_recv)) = addendum.chunked {
                // What the client sends is what the server receives.
                send_chunked =
                    ChunkedMode::negotiate(self.config.proto_send_chunked, client_recv, "recv")?;
                recv_chunked =
                    ChunkedMode::negotiate(self.config.proto_recv_chunked, client_send, "send")?;
            }
        }

        let mut settings = self.config.default_settings.clone();
        let mut database = self.config.default_database.clone();
        if let SessionAuth::User(user) = &auth {
            for (name, value) in &user.settings {
                settings.set(name, value)?;
            }
            if let Some(db) = &user.default_database {
                database = db.clone();
            }
        }
        if !hello.database.is_empty() {
            database = hello.database.clone();
            if !self.engine.database_exists(&database).await {
                return Err(NativeSrvError::UnknownDatabase(database));
            }
        }

        Ok(Session {
            peer,
            forwarded_for,
            revision: rev,
            auth,
            database,
            connection_settings: ConnectionSettings::from(&settings),
            settings,
            nonce,
            addendum,
            send_chunked,
            recv_chunked,
            hello,
        })
    }

    async fn next_message(&mut self, step: HandshakeStep) -> Result<HandshakeMessage> {
        self.framed.decoder_mut().set_step(step);
        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(msg)) => {
                let msg = msg?;
                trace!(?step, "received handshake message");
                Ok(msg)
            }
            Ok(None) => Err(NativeSrvError::ConnectionClosed),
            Err(_) => Err(NativeSrvError::Timeout {
                op: "waiting for handshake",
                timeout,
            }),
        }
    }

    async fn receive_proxy_header(&mut self) -> Result<Option<SocketAddr>> {
        match self.next_message(HandshakeStep::ProxyHeader).await? {
            HandshakeMessage::ProxyHeader(header) => Ok(header.source),
            _ => Err(NativeSrvError::malformed("expected PROXY header")),
        }
    }

    async fn receive_hello(&mut self) -> Result<ClientHello> {
        let HandshakeMessage::Hello(hello) = self.next_message(HandshakeStep::Hello).await? else {
            return Err(NativeSrvError::malformed("expected client hello"));
        };
        if hello.revision < revision::MIN_SUPPORTED {
            return Err(NativeSrvError::UnsupportedRevision {
                revision: hello.revision,
                minimum: revision::MIN_SUPPORTED,
            });
        }
        Ok(hello)
    }

    async fn receive_cluster_name_and_salt(&mut self) -> Result<SessionAuth> {
        let HandshakeMessage::ClusterNameAndSalt(cs) =
            self.next_message(HandshakeStep::ClusterNameAndSalt).await?
        else {
            return Err(NativeSrvError::malformed("expected cluster name and salt"));
        };
        let Some(secret) = self.config.interserver_secrets.get(&cs.cluster) else {
            return Err(NativeSrvError::AuthenticationFailed(format!(
                "cluster '{}' has no secret configured",
                cs.cluster
            )));
        };
        Ok(SessionAuth::Interserver {
            cluster: cs.cluster,
            salt: cs.salt,
            secret: secret.clone(),
        })
    }

    async fn receive_ssh_signature(&mut self, user: &str) -> Result<AuthenticatedUser> {
        let HandshakeMessage::SshChallengeRequest =
            self.next_message(HandshakeStep::SshChallengeRequest).await?
        else {
            return Err(NativeSrvError::malformed("expected SSH challenge request"));
        };
        let challenge = auth::generate_challenge();
        self.writer
            .send(ServerPacket::SshChallenge(challenge.clone()))
            .await?;

        let HandshakeMessage::SshChallengeResponse(signature) =
            self.next_message(HandshakeStep::SshChallengeResponse).await?
        else {
            return Err(NativeSrvError::malformed("expected SSH challenge response"));
        };
        self.config
            .authenticator
            .verify_signature(user, &challenge, &signature)
            .await
    }

    async fn send_hello(&self, nonce: Option<u64>) -> Result<()> {
        let hello = ServerHello {
            name: protocol::SERVER_NAME.to_string(),
            version_major: protocol::VERSION_MAJOR,
            version_minor: protocol::VERSION_MINOR,
            revision: revision::SERVER,
            parallel_replicas_protocol_version: PARALLEL_REPLICAS_PROTOCOL_VERSION,
            timezone: self.config.timezone.clone(),
            display_name: self.config.display_name.clone(),
            version_patch: protocol::VERSION_PATCH,
            proto_send_chunked: self.config.proto_send_chunked,
            proto_recv_chunked: self.config.proto_recv_chunked,
            password_complexity_rules: self.config.password_complexity_rules.clone(),
            nonce,
        };
        self.writer.send(ServerPacket::Hello(hello)).await
    }

    async fn receive_addendum(&mut self, revision: u64) -> Result<Addendum> {
        self.framed.decoder_mut().set_revision(revision);
        let HandshakeMessage::Addendum(addendum) = self.next_message(HandshakeStep::Addendum).await?
        else {
            return Err(NativeSrvError::malformed("expected addendum"));
        };
        Ok(addendum)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::codec::client::ClientCodec;
    use crate::codec::server::ServerCodec;
    use crate::engine::{QueryContext, QueryPipeline};
    use crate::errors::ExecError;
    use crate::messages::{QualifiedTableName, TableStatus};
    use crate::timeouts::ConnectionTimeouts;

    #[derive(Debug)]
    struct Databases(Vec<&'static str>);

    #[async_trait]
    impl QueryEngine for Databases {
        async fn execute(&self, _ctx: Arc<QueryContext>) -> Result<QueryPipeline, ExecError> {
            Ok(QueryPipeline::Completed)
        }

        async fn database_exists(&self, database: &str) -> bool {
            self.0.contains(&database)
        }

        async fn table_status(
            &self,
            _table: &QualifiedTableName,
        ) -> Result<Option<TableStatus>, ExecError> {
            Ok(None)
        }
    }

    fn hello(user: &str, password: &str, database: &str) -> ClientHello {
        ClientHello {
            client_name: "test".to_string(),
            version_major: 1,
            version_minor: 0,
            revision: revision::SERVER,
            database: database.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Run a handshake against bytes the client sends up front, returning
    /// the outcome and what the server wrote back.
    async fn handshake(
        config: ProtocolHandlerConfig,
        client_bytes: BytesMut,
    ) -> (Result<Session>, Vec<ServerPacket>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (server_read, server_write) = tokio::io::split(server);
        let timeouts = Arc::new(ConnectionTimeouts::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let writer = SharedWriter::new(server_write, ServerCodec::new(revision::SERVER), timeouts);
        let mut framed = FramedRead::new(
            Box::new(server_read) as BoxedRead,
            HandshakeCodec::new(config.parse_proxy_protocol),
        );

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&client_bytes).await.unwrap();

        let engine = Databases(vec!["default", "analytics"]);
        let res = Handshake::new(&config, &engine, &writer, &mut framed)
            .run(None)
            .await;
        drop(writer);
        drop(framed);

        let mut raw = Vec::new();
        client_read.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        let mut codec = ClientCodec::new(revision::SERVER);
        let mut packets = Vec::new();
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            packets.push(packet);
        }
        (res, packets)
    }

    fn addendum(chunked: Option<(ChunkedMode, ChunkedMode)>) -> Addendum {
        Addendum {
            quota_key: String::new(),
            chunked,
            parallel_replicas_protocol_version: Some(PARALLEL_REPLICAS_PROTOCOL_VERSION),
        }
    }

    #[tokio::test]
    async fn password_handshake() {
        let config = ProtocolHandlerConfig::new(Arc::new(
            StaticAuthenticator::new()
                .with_user("alice", "secret")
                .with_default_database("alice", "analytics"),
        ));
        let mut bytes = BytesMut::from(&b"PROXY TCP4 10.0.0.1 10.0.0.2 4000 9000\r\n"[..]);
        hello("alice", "secret", "").encode(&mut bytes);
        addendum(None).encode(&mut bytes, revision::SERVER);

        let mut config = config;
        config.parse_proxy_protocol = true;
        let (session, packets) = handshake(config, bytes).await;
        let session = session.unwrap();

        assert_eq!("alice", session.user_name());
        assert_eq!("analytics", session.database);
        assert_eq!(
            Some("10.0.0.1:4000".parse().unwrap()),
            session.client_address()
        );
        assert!(session.nonce.is_some());
        assert!(!session.send_chunked && !session.recv_chunked);

        let [ServerPacket::Hello(hello)] = &packets[..] else {
            panic!("expected a single hello, got {packets:?}");
        };
        assert_eq!(revision::SERVER, hello.revision);
        assert_eq!(session.nonce, hello.nonce);
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let config = ProtocolHandlerConfig::new(Arc::new(
            StaticAuthenticator::new().with_user("alice", "secret"),
        ));
        let mut bytes = BytesMut::new();
        hello("alice", "nope", "").encode(&mut bytes);
        let (session, packets) = handshake(config, bytes).await;
        assert!(matches!(
            session,
            Err(NativeSrvError::AuthenticationFailed(_))
        ));
        assert!(packets.is_empty());
    }

    #[tokio::test]
    async fn old_revision_is_rejected() {
        let mut old = hello("default", "", "");
        old.revision = revision::MIN_SUPPORTED - 1;
        let mut bytes = BytesMut::new();
        old.encode(&mut bytes);
        let (session, _) = handshake(ProtocolHandlerConfig::default(), bytes).await;
        assert!(matches!(
            session,
            Err(NativeSrvError::UnsupportedRevision { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_database_is_rejected() {
        let mut bytes = BytesMut::new();
        hello("default", "", "nope").encode(&mut bytes);
        addendum(None).encode(&mut bytes, revision::SERVER);
        let (session, _) = handshake(ProtocolHandlerConfig::default(), bytes).await;
        assert!(matches!(session, Err(NativeSrvError::UnknownDatabase(db)) if db == "nope"));
    }

    #[tokio::test]
    async fn chunking_is_negotiated_per_direction() {
        let mut config = ProtocolHandlerConfig::default();
        config.proto_send_chunked = ChunkedMode::ChunkedOptional;
        config.proto_recv_chunked = ChunkedMode::NotChunkedOptional;

        let mut bytes = BytesMut::new();
        hello("default", "", "").encode(&mut bytes);
        addendum(Some((ChunkedMode::NotChunked, ChunkedMode::Chunked)))
            .encode(&mut bytes, revision::SERVER);
        let (session, _) = handshake(config, bytes).await;
        let session = session.unwrap();
        assert!(session.send_chunked);
        assert!(!session.recv_chunked);
    }

    #[tokio::test]
    async fn incompatible_chunking_fails() {
        let mut config = ProtocolHandlerConfig::default();
        config.proto_send_chunked = ChunkedMode::Chunked;

        let mut bytes = BytesMut::new();
        hello("default", "", "").encode(&mut bytes);
        addendum(Some((ChunkedMode::NotChunked, ChunkedMode::NotChunked)))
            .encode(&mut bytes, revision::SERVER);
        let (session, _) = handshake(config, bytes).await;
        assert!(matches!(
            session,
            Err(NativeSrvError::IncompatibleProtocol(_))
        ));
    }

    #[tokio::test]
    async fn interserver_requires_known_cluster() {
        let mut bytes = BytesMut::new();
        hello(INTERSERVER_SECRET_USER, "", "").encode(&mut bytes);
        crate::messages::ClusterNameAndSalt {
            cluster: "other".to_string(),
            salt: "salt".to_string(),
        }
        .encode(&mut bytes);

        let config = ProtocolHandlerConfig::default().with_interserver_secret("main", "s3cret");
        let (session, _) = handshake(config.clone(), bytes.clone()).await;
        assert!(matches!(
            session,
            Err(NativeSrvError::AuthenticationFailed(_))
        ));

        let mut bytes = BytesMut::new();
        hello(INTERSERVER_SECRET_USER, "", "").encode(&mut bytes);
        crate::messages::ClusterNameAndSalt {
            cluster: "main".to_string(),
            salt: "salt".to_string(),
        }
        .encode(&mut bytes);
        addendum(None).encode(&mut bytes, revision::SERVER);
        let (session, _) = handshake(config, bytes).await;
        let session = session.unwrap();
        assert!(session.is_interserver());
        assert!(matches!(
            &session.auth,
            SessionAuth::Interserver { secret, .. } if secret == "s3cret"
        ));
    }

    #[test]
    fn connection_settings_follow_session_settings() {
        let mut settings = Settings::default();
        settings.set("interactive_delay", "5000").unwrap();
        settings.set("send_timeout", "7").unwrap();
        let cs = ConnectionSettings::from(&settings);
        assert_eq!(Duration::from_micros(5000), cs.interactive_delay);
        assert_eq!(Duration::from_secs(7), cs.send_timeout);
    }
}
