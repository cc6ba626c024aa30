use crate::error::ProtocolError;
use crate::protocol::{AddressType, RSV, ReplyCode, Version};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of every reply this server sends: the bind address is always IPv4
pub const REPLY_LEN: usize = 10;

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// Address implementation block
impl Address {
    /// address_type returns the ATYP value this address was decoded from
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(ip) => write!(f, "{ip}"),
            Address::DomainName(domain) => write!(f, "{domain}"),
            Address::IPv6(ip) => write!(f, "[{ip}]"),
        }
    }
}

/// decode_request_address reads DST.ADDR for the given ATYP from the reader.
/// An unknown ATYP fails before any further byte is consumed
pub async fn decode_request_address<R>(atyp: u8, reader: &mut R) -> Result<Address, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let addr_type =
        AddressType::from_byte(atyp).ok_or(ProtocolError::UnsupportedAddressType(atyp))?;

    // Match type and extract address or domain name
    let address = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            reader.read_exact(&mut addr).await?;
            Address::IPv4(Ipv4Addr::from(addr))
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = reader.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            reader.read_exact(&mut domain).await?;

            // Invalid UTF-8 is replaced rather than failing the session;
            // resolution of the mangled name fails later instead
            Address::DomainName(String::from_utf8_lossy(&domain).into_owned())
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            reader.read_exact(&mut addr).await?;
            Address::IPv6(Ipv6Addr::from(addr))
        }
    };

    Ok(address)
}

/// read_port reads DST.PORT in network byte order
pub async fn read_port<R>(reader: &mut R) -> Result<u16, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u16().await?)
}

/// encode_bind_reply builds the SOCKS5 reply for the given status.
/// `None` zero-fills BND.ADDR and BND.PORT
pub fn encode_bind_reply(reply_code: ReplyCode, bound_addr: Option<SocketAddr>) -> [u8; REPLY_LEN] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   |    4     |    2     |
    // +----+-----+-------+------+----------+----------+

    let (ip, port) = match bound_addr {
        Some(SocketAddr::V4(addr)) => (*addr.ip(), addr.port()),
        // BND.ADDR is always written as IPv4
        Some(SocketAddr::V6(addr)) => (
            addr.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
            addr.port(),
        ),
        None => (Ipv4Addr::UNSPECIFIED, 0),
    };

    let mut reply = [0u8; REPLY_LEN];
    reply[0] = Version::SOCKS5 as u8;
    reply[1] = reply_code as u8;
    reply[2] = RSV;
    reply[3] = AddressType::IPv4 as u8;
    reply[4..8].copy_from_slice(&ip.octets());
    reply[8..10].copy_from_slice(&port.to_be_bytes());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_ipv4() {
        let mut input: &[u8] = &[10, 0, 0, 7, 0x1F, 0x90];
        let addr = decode_request_address(0x01, &mut input).await.unwrap();
        assert_eq!(addr, Address::IPv4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(read_port(&mut input).await.unwrap(), 8080);
        assert!(input.is_empty());
    }

    #[tokio::test]
    async fn decodes_domain() {
        let mut input: &[u8] = b"\x0bexample.com\x00\x50";
        let addr = decode_request_address(0x03, &mut input).await.unwrap();
        assert_eq!(addr, Address::DomainName("example.com".to_string()));
        assert_eq!(read_port(&mut input).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn decodes_domain_with_invalid_utf8() {
        let mut input: &[u8] = &[3, b'a', 0xFF, b'b'];
        let addr = decode_request_address(0x03, &mut input).await.unwrap();
        assert_eq!(addr, Address::DomainName("a\u{FFFD}b".to_string()));
    }

    #[tokio::test]
    async fn decodes_ipv6() {
        let mut bytes = Ipv6Addr::LOCALHOST.octets().to_vec();
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let mut input: &[u8] = &bytes;
        let addr = decode_request_address(0x04, &mut input).await.unwrap();
        assert_eq!(addr, Address::IPv6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.address_type(), AddressType::IPv6);
        assert_eq!(read_port(&mut input).await.unwrap(), 443);
    }

    #[tokio::test]
    async fn unknown_type_consumes_nothing() {
        let mut input: &[u8] = &[1, 2, 3, 4, 5, 6];
        let err = decode_request_address(0x05, &mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedAddressType(0x05)));
        assert_eq!(input.len(), 6);
    }

    #[tokio::test]
    async fn truncated_address_is_io_error() {
        let mut input: &[u8] = &[127, 0];
        let err = decode_request_address(0x01, &mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn error_reply_is_zero_filled() {
        let reply = encode_bind_reply(ReplyCode::CommandNotSupported, None);
        assert_eq!(reply, [5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn success_reply_carries_bound_address() {
        let bound: SocketAddr = "192.168.1.20:50000".parse().unwrap();
        let reply = encode_bind_reply(ReplyCode::Success, Some(bound));
        assert_eq!(reply, [5, 0, 0, 1, 192, 168, 1, 20, 0xC3, 0x50]);
    }

    #[test]
    fn ipv6_bound_address_is_encoded_as_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.1.2.3]:1234".parse().unwrap();
        let reply = encode_bind_reply(ReplyCode::Success, Some(mapped));
        assert_eq!(reply[3], AddressType::IPv4 as u8);
        assert_eq!(&reply[4..8], &[10, 1, 2, 3]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 1234);

        let native: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        let reply = encode_bind_reply(ReplyCode::Success, Some(native));
        assert_eq!(&reply[4..10], &[0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Address::IPv4(Ipv4Addr::LOCALHOST).to_string(), "127.0.0.1");
        assert_eq!(Address::IPv6(Ipv6Addr::LOCALHOST).to_string(), "[::1]");
        assert_eq!(
            Address::DomainName("example.org".into()).to_string(),
            "example.org"
        );
    }
}
