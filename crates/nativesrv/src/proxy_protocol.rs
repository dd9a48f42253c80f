//! Text PROXY protocol (v1) header sent by load balancers in front of the
//! server.

use std::net::{IpAddr, SocketAddr};

use crate::errors::{NativeSrvError, Result};

const PREFIX: &[u8] = b"PROXY ";
/// Longest possible v1 header, including the trailing CRLF.
pub const MAX_HEADER_LEN: usize = 107;

/// Addresses carried by a PROXY header. Both are `None` for `UNKNOWN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyHeader {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Parse a header from the front of `buf`.
///
/// Returns the header and the number of bytes it occupied, or `None` if the
/// terminating CRLF hasn't been received yet.
pub fn parse_header(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>> {
    let prefix_len = buf.len().min(PREFIX.len());
    if buf[..prefix_len] != PREFIX[..prefix_len] {
        return Err(NativeSrvError::InvalidProxyHeader(
            "connection doesn't start with PROXY".to_string(),
        ));
    }

    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= MAX_HEADER_LEN {
            return Err(NativeSrvError::InvalidProxyHeader(format!(
                "header is longer than {MAX_HEADER_LEN} bytes"
            )));
        }
        return Ok(None);
    };
    if end + 2 > MAX_HEADER_LEN {
        return Err(NativeSrvError::InvalidProxyHeader(format!(
            "header is longer than {MAX_HEADER_LEN} bytes"
        )));
    }

    let line = std::str::from_utf8(&buf[PREFIX.len()..end])
        .map_err(|_| NativeSrvError::InvalidProxyHeader("header is not ascii".to_string()))?;
    let header = parse_line(line)?;
    Ok(Some((header, end + 2)))
}

fn parse_line(line: &str) -> Result<ProxyHeader> {
    let invalid = |msg: &str| NativeSrvError::InvalidProxyHeader(format!("{msg}: '{line}'"));

    let mut parts = line.split(' ');
    let proto = parts.next().unwrap_or_default();
    match proto {
        // Everything after UNKNOWN is ignored.
        "UNKNOWN" => return Ok(ProxyHeader::default()),
        "TCP4" | "TCP6" => (),
        _ => return Err(invalid("unsupported protocol")),
    }

    let fields: Vec<&str> = parts.collect();
    let [src, dst, src_port, dst_port] = fields[..] else {
        return Err(invalid("expected 4 address fields"));
    };

    let src: IpAddr = src.parse().map_err(|_| invalid("invalid source address"))?;
    let dst: IpAddr = dst.parse().map_err(|_| invalid("invalid destination address"))?;
    let src_port: u16 = src_port.parse().map_err(|_| invalid("invalid source port"))?;
    let dst_port: u16 = dst_port.parse().map_err(|_| invalid("invalid destination port"))?;

    let family_ok = match proto {
        "TCP4" => src.is_ipv4() && dst.is_ipv4(),
        _ => src.is_ipv6() && dst.is_ipv6(),
    };
    if !family_ok {
        return Err(invalid("address family doesn't match protocol"));
    }

    Ok(ProxyHeader {
        source: Some(SocketAddr::new(src, src_port)),
        destination: Some(SocketAddr::new(dst, dst_port)),
    })
}
