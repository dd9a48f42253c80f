use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::decode_packet;
use super::wire::DecodeResult;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{Addendum, ClientHello, ClusterNameAndSalt};
use crate::protocol::ClientPacketId;
use crate::proxy_protocol::{self, ProxyHeader};

/// What the server expects next during connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    ProxyHeader,
    Hello,
    ClusterNameAndSalt,
    SshChallengeRequest,
    SshChallengeResponse,
    Addendum,
}

impl HandshakeStep {
    fn describe(&self) -> &'static str {
        match self {
            Self::ProxyHeader => "waiting for PROXY header",
            Self::Hello => "waiting for Hello",
            Self::ClusterNameAndSalt => "waiting for cluster name and salt",
            Self::SshChallengeRequest => "waiting for SSH challenge request",
            Self::SshChallengeResponse => "waiting for SSH challenge response",
            Self::Addendum => "waiting for addendum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ProxyHeader(ProxyHeader),
    Hello(ClientHello),
    ClusterNameAndSalt(ClusterNameAndSalt),
    SshChallengeRequest,
    SshChallengeResponse(String),
    Addendum(Addendum),
}

/// Decoder for the client's side of connection setup.
///
/// The session drives the step explicitly since what comes next depends on
/// what was received so far.
#[derive(Debug)]
pub struct HandshakeCodec {
    step: HandshakeStep,
    revision: u64,
}

impl HandshakeCodec {
    pub fn new(expect_proxy_header: bool) -> Self {
        HandshakeCodec {
            step: if expect_proxy_header {
                HandshakeStep::ProxyHeader
            } else {
                HandshakeStep::Hello
            },
            revision: 0,
        }
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn set_step(&mut self, step: HandshakeStep) {
        self.step = step;
    }

    /// Negotiated revision, needed to decode the addendum.
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

fn expect_packet(
    r: &mut super::wire::WireReader<'_>,
    expected: ClientPacketId,
    step: HandshakeStep,
) -> DecodeResult<()> {
    let id = r.read_varint()?;
    match ClientPacketId::try_from(id) {
        Ok(got) if got == expected => Ok(()),
        Ok(got) => Err(NativeSrvError::UnexpectedPacket {
            packet: got.as_str(),
            state: step.describe(),
        }
        .into()),
        Err(id) => Err(NativeSrvError::UnknownPacket(id).into()),
    }
}

impl Decoder for HandshakeCodec {
    type Item = HandshakeMessage;
    type Error = NativeSrvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let step = self.step;
        match step {
            HandshakeStep::ProxyHeader => match proxy_protocol::parse_header(src)? {
                Some((header, len)) => {
                    src.advance(len);
                    Ok(Some(HandshakeMessage::ProxyHeader(header)))
                }
                None => Ok(None),
            },
            HandshakeStep::Hello => {
                // Someone talking HTTP to the native port.
                if let Some(b'G' | b'P' | b'H') = src.first() {
                    return Err(NativeSrvError::WrongPort);
                }
                decode_packet(src, false, |r| {
                    expect_packet(r, ClientPacketId::Hello, step)?;
                    Ok(HandshakeMessage::Hello(ClientHello::decode(r)?))
                })
            }
            HandshakeStep::ClusterNameAndSalt => decode_packet(src, false, |r| {
                Ok(HandshakeMessage::ClusterNameAndSalt(
                    ClusterNameAndSalt::decode(r)?,
                ))
            }),
            HandshakeStep::SshChallengeRequest => decode_packet(src, false, |r| {
                expect_packet(r, ClientPacketId::SshChallengeRequest, step)?;
                Ok(HandshakeMessage::SshChallengeRequest)
            }),
            HandshakeStep::SshChallengeResponse => decode_packet(src, false, |r| {
                expect_packet(r, ClientPacketId::SshChallengeResponse, step)?;
                Ok(HandshakeMessage::SshChallengeResponse(r.read_string()?))
            }),
            HandshakeStep::Addendum => {
                let rev = self.revision;
                decode_packet(src, false, |r| {
                    Ok(HandshakeMessage::Addendum(Addendum::decode(r, rev)?))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ClientPacket;
    use crate::protocol::revision;

    fn hello() -> ClientHello {
        ClientHello {
            client_name: "test".to_string(),
            version_major: 1,
            version_minor: 2,
            revision: revision::SERVER,
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
        }
    }

    #[test]
    fn proxy_header_then_hello() {
        let mut src = BytesMut::from(&b"PROXY TCP4 1.1.1.1 2.2.2.2 1 2\r\n"[..]);
        hello().encode(&mut src);

        let mut codec = HandshakeCodec::new(true);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert!(matches!(msg, HandshakeMessage::ProxyHeader(h) if h.source.is_some()));

        codec.set_step(HandshakeStep::Hello);
        assert_eq!(
            Some(HandshakeMessage::Hello(hello())),
            codec.decode(&mut src).unwrap()
        );
        assert!(src.is_empty());
    }

    #[test]
    fn http_request_is_wrong_port() {
        let mut src = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        let mut codec = HandshakeCodec::new(false);
        assert!(matches!(codec.decode(&mut src), Err(NativeSrvError::WrongPort)));
    }

    #[test]
    fn query_before_hello_is_unexpected() {
        let mut src = BytesMut::new();
        ClientPacket::Ping.encode(&mut src, revision::SERVER, None);
        let mut codec = HandshakeCodec::new(false);
        assert!(matches!(
            codec.decode(&mut src),
            Err(NativeSrvError::UnexpectedPacket { packet: "Ping", .. })
        ));
    }

    #[test]
    fn addendum_uses_negotiated_revision() {
        let addendum = Addendum {
            quota_key: "qk".to_string(),
            chunked: None,
            parallel_replicas_protocol_version: None,
        };
        let mut src = BytesMut::new();
        addendum.encode(&mut src, revision::ADDENDUM);

        let mut codec = HandshakeCodec::new(false);
        codec.set_step(HandshakeStep::Addendum);
        codec.set_revision(revision::ADDENDUM);
        assert_eq!(
            Some(HandshakeMessage::Addendum(addendum)),
            codec.decode(&mut src).unwrap()
        );
    }
}
