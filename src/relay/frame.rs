//! Wire framing for the encrypted-tunnel collaborator
//!
//! The remote-forwarding variant of the emulator ships opaque IPv4 frames
//! to a relay server over one datagram socket. Control frames are
//! distinguished by a leading zero byte (no valid IPv4 frame starts with
//! 0x00): a lone `00` is the keepalive, `00 FF` is the disconnect sent
//! best-effort before closing. The client opens with a null-terminated
//! shared secret; the server answers with a space-separated parameter
//! string like `(m,1400) (a,10.0.0.2,32) (r,0.0.0.0,0) (d,1.1.1.1)
//! (s,lan)`.
//!
//! Only the codec lives here; the forwarding loop itself is the remote
//! collaborator's concern.

use std::net::Ipv4Addr;

use crate::error::PacketError;

/// Leading byte that marks a control frame
pub const CONTROL_PREFIX: u8 = 0x00;

/// Second byte of the disconnect frame
pub const DISCONNECT_MARKER: u8 = 0xFF;

/// A classified relay frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFrame<'a> {
    /// Single `00` byte
    Keepalive,
    /// `00 FF`
    Disconnect,
    /// Other zero-prefixed control data (handshake parameter string)
    Control(&'a [u8]),
    /// A raw IPv4 frame carried as-is
    Packet(&'a [u8]),
}

/// Classify an incoming relay frame
#[must_use]
pub fn classify(buf: &[u8]) -> RelayFrame<'_> {
    match buf {
        [CONTROL_PREFIX] => RelayFrame::Keepalive,
        [CONTROL_PREFIX, DISCONNECT_MARKER] => RelayFrame::Disconnect,
        [CONTROL_PREFIX, rest @ ..] => RelayFrame::Control(rest),
        other => RelayFrame::Packet(other),
    }
}

/// The single-byte keepalive frame
#[must_use]
pub const fn keepalive() -> [u8; 1] {
    [CONTROL_PREFIX]
}

/// The two-byte disconnect frame
#[must_use]
pub const fn disconnect() -> [u8; 2] {
    [CONTROL_PREFIX, DISCONNECT_MARKER]
}

/// Frame the client's shared secret for the handshake
///
/// The secret is sent null-terminated as the first datagram.
#[must_use]
pub fn encode_handshake(secret: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(secret.len() + 1);
    buf.extend_from_slice(secret.as_bytes());
    buf.push(0);
    buf
}

/// Session parameters the server returns after the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelParameters {
    /// `(m,mtu)`: link MTU
    pub mtu: Option<u16>,
    /// `(a,addr,prefix)`: address to assign the tun interface
    pub address: Option<(Ipv4Addr, u8)>,
    /// `(r,net,prefix)`: routes to install
    pub routes: Vec<(Ipv4Addr, u8)>,
    /// `(d,dns)`: DNS servers
    pub dns: Vec<Ipv4Addr>,
    /// `(s,domain)`: search domains
    pub search_domains: Vec<String>,
}

/// Parse the server's parameter string
///
/// Unknown option letters are skipped; malformed ones fail the parse.
///
/// # Errors
///
/// Returns [`PacketError::Malformed`] on unbalanced parentheses, missing
/// fields or unparseable numbers.
pub fn parse_parameters(input: &str) -> Result<TunnelParameters, PacketError> {
    let mut params = TunnelParameters::default();

    for group in input.split_whitespace() {
        let inner = group
            .strip_prefix('(')
            .and_then(|g| g.strip_suffix(')'))
            .ok_or_else(|| PacketError::malformed(format!("bad parameter group {group:?}")))?;

        let mut fields = inner.split(',');
        let letter = fields
            .next()
            .ok_or_else(|| PacketError::malformed("empty parameter group"))?;

        match letter {
            "m" => {
                let mtu = next_field(&mut fields, "mtu")?;
                params.mtu = Some(parse_num(mtu, "mtu")?);
            }
            "a" => {
                let addr = parse_addr(next_field(&mut fields, "address")?)?;
                let prefix = parse_num(next_field(&mut fields, "prefix")?, "prefix")?;
                params.address = Some((addr, prefix));
            }
            "r" => {
                let net = parse_addr(next_field(&mut fields, "route")?)?;
                let prefix = parse_num(next_field(&mut fields, "prefix")?, "prefix")?;
                params.routes.push((net, prefix));
            }
            "d" => {
                params.dns.push(parse_addr(next_field(&mut fields, "dns")?)?);
            }
            "s" => {
                params
                    .search_domains
                    .push(next_field(&mut fields, "domain")?.to_string());
            }
            _ => {} // forward compatible
        }
    }

    Ok(params)
}

fn next_field<'a>(
    fields: &mut std::str::Split<'a, char>,
    what: &str,
) -> Result<&'a str, PacketError> {
    fields
        .next()
        .ok_or_else(|| PacketError::malformed(format!("missing {what} field")))
}

fn parse_addr(s: &str) -> Result<Ipv4Addr, PacketError> {
    s.parse()
        .map_err(|_| PacketError::malformed(format!("bad address {s:?}")))
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, PacketError> {
    s.parse()
        .map_err(|_| PacketError::malformed(format!("bad {what} {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_control_frames() {
        assert_eq!(classify(&keepalive()), RelayFrame::Keepalive);
        assert_eq!(classify(&disconnect()), RelayFrame::Disconnect);
        assert_eq!(classify(&[0x00, b'h', b'i']), RelayFrame::Control(b"hi"));
    }

    #[test]
    fn test_classify_ipv4_passthrough() {
        let frame = [0x45u8, 0x00, 0x00, 0x14];
        assert_eq!(classify(&frame), RelayFrame::Packet(&frame[..]));
    }

    #[test]
    fn test_handshake_is_null_terminated() {
        let framed = encode_handshake("sesame");
        assert_eq!(framed, b"sesame\0");
    }

    #[test]
    fn test_parse_full_parameter_string() {
        let params = parse_parameters(
            "(m,1400) (a,10.0.0.2,32) (r,0.0.0.0,0) (d,1.1.1.1) (d,8.8.8.8) (s,lan)",
        )
        .unwrap();
        assert_eq!(params.mtu, Some(1400));
        assert_eq!(params.address, Some(("10.0.0.2".parse().unwrap(), 32)));
        assert_eq!(params.routes, vec![("0.0.0.0".parse().unwrap(), 0)]);
        assert_eq!(
            params.dns,
            vec![
                "1.1.1.1".parse::<Ipv4Addr>().unwrap(),
                "8.8.8.8".parse().unwrap()
            ]
        );
        assert_eq!(params.search_domains, vec!["lan".to_string()]);
    }

    #[test]
    fn test_parse_skips_unknown_options() {
        let params = parse_parameters("(m,1500) (z,whatever)").unwrap();
        assert_eq!(params.mtu, Some(1500));
    }

    #[test]
    fn test_parse_rejects_malformed_groups() {
        assert!(parse_parameters("m,1400").is_err());
        assert!(parse_parameters("(a,10.0.0.2)").is_err());
        assert!(parse_parameters("(m,not-a-number)").is_err());
    }
}
