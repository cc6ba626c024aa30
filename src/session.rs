//! Per-client SOCKS5 session.
//!
//! A session walks `Greeting → Authenticating → RequestParsing → Connecting →
//! Relaying → Closed`, never reusing a connection for a second request.

use crate::{
    address::{Address, decode_request_address, encode_bind_reply, read_port},
    admission::AdmissionPermit,
    auth::{negotiate_method, perform_password_auth},
    config::ServerConfig,
    error::{AuthError, ConnectError, ProtocolError, SessionError},
    protocol::{AuthMethod, Command, ReplyCode, Version},
    relay::{RelayStats, relay},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    time::timeout,
};
use tracing::{debug, info, warn};

/// SessionState is the lifecycle position of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    Authenticating,
    RequestParsing,
    Connecting,
    Relaying,
    Closed,
}

/// SessionOutcome is the terminal result of a session
#[derive(Debug)]
pub enum SessionOutcome {
    /// CONNECT succeeded and the relay ran to completion
    Relayed(RelayStats),
    /// The server refused the client on protocol or auth grounds
    Rejected(SessionError),
    /// Timeouts, connect failures and I/O errors
    Failed(SessionError),
}

/// ConnectRequest is a parsed SOCKS5 CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: Address,
    pub port: u16,
}

/// ConnectionSession owns one client socket and, once connected, the
/// outbound socket for that client
pub struct ConnectionSession {
    client: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    _permit: AdmissionPermit,
    state: SessionState,
    auth_method: Option<AuthMethod>,
    request: Option<ConnectRequest>,
    bytes_sent: u64,
    bytes_received: u64,
}

/// ConnectionSession implementation block
impl ConnectionSession {
    /// new is a constructor for the ConnectionSession type. The permit is held
    /// until the session closes
    pub fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        permit: AdmissionPermit,
    ) -> Self {
        Self {
            client,
            peer_addr,
            config,
            _permit: permit,
            state: SessionState::Greeting,
            auth_method: None,
            request: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// state returns where the session currently is
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// run drives the session to `Closed` and reports how it ended
    pub async fn run(mut self) -> SessionOutcome {
        info!("client connected: {}", self.peer_addr);

        let outcome = match self.drive().await {
            Ok(stats) => SessionOutcome::Relayed(stats),
            Err(e) if e.is_rejection() => SessionOutcome::Rejected(e),
            Err(e) => SessionOutcome::Failed(e),
        };

        self.close(&outcome).await;
        outcome
    }

    /// drive runs every stage in order; the first error ends the session
    async fn drive(&mut self) -> Result<RelayStats, SessionError> {
        let method = self.greeting().await?;

        if method == AuthMethod::UserPass {
            self.transition(SessionState::Authenticating);
            self.authenticate().await?;
        }

        self.transition(SessionState::RequestParsing);
        let request = self.parse_request().await?;
        self.request = Some(request.clone());

        self.transition(SessionState::Connecting);
        let mut outbound = self.connect(&request).await?;

        self.transition(SessionState::Relaying);
        let stats = relay(
            &mut self.client,
            &mut outbound,
            self.config.buffer_size,
            self.config.timeout,
        )
        .await;
        self.bytes_sent = stats.client_to_target;
        self.bytes_received = stats.target_to_client;

        // Best effort, the peer may already be gone
        let _ = outbound.shutdown().await;

        Ok(stats)
    }

    /// greeting reads the client hello and answers with the selected method
    async fn greeting(&mut self) -> Result<AuthMethod, SessionError> {
        let methods = within(
            "greeting",
            self.config.timeout,
            read_greeting(&mut self.client),
        )
        .await?;

        let method = match negotiate_method(&methods, self.config.credentials.as_ref()) {
            Ok(method) => method,
            Err(e) => {
                warn!(
                    "client {} offered no acceptable auth method ({:?})",
                    self.peer_addr, methods
                );
                let _ = self
                    .client
                    .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
                    .await;
                return Err(e.into());
            }
        };

        // ServerChoice method selection reply format
        // +----+--------+
        // |VER | METHOD |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        self.client
            .write_all(&[Version::SOCKS5 as u8, method as u8])
            .await?;
        self.auth_method = Some(method);
        debug!("client {} selected {:?}", self.peer_addr, method);

        Ok(method)
    }

    /// authenticate runs the username/password sub-negotiation
    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let Some(expected) = self.config.credentials.as_ref() else {
            return Err(AuthError::NoAcceptableMethod.into());
        };

        let accepted = within(
            "authentication",
            self.config.timeout,
            perform_password_auth(&mut self.client, expected),
        )
        .await?;

        if accepted {
            info!("auth successful for {}", self.peer_addr);
            Ok(())
        } else {
            warn!("auth failed for {}", self.peer_addr);
            Err(AuthError::BadCredentials.into())
        }
    }

    /// parse_request reads a SOCKS5 request and rejects anything but CONNECT
    async fn parse_request(&mut self) -> Result<ConnectRequest, SessionError> {
        let parsed = within(
            "request",
            self.config.timeout,
            read_request(&mut self.client),
        )
        .await;

        let (command, request) = match parsed {
            Ok(parsed) => parsed,
            Err(SessionError::Protocol(ProtocolError::UnsupportedAddressType(atyp))) => {
                warn!(
                    "unsupported address type {:#04x} from {}",
                    atyp, self.peer_addr
                );
                let _ = self.reply(ReplyCode::AddressTypeNotSupported, None).await;
                return Err(ProtocolError::UnsupportedAddressType(atyp).into());
            }
            Err(e) => return Err(e),
        };

        if Command::from_byte(command) != Some(Command::Connect) {
            warn!(
                "unsupported command {:#04x} from {} for {}:{}",
                command, self.peer_addr, request.address, request.port
            );
            let _ = self.reply(ReplyCode::CommandNotSupported, None).await;
            return Err(ProtocolError::UnsupportedCommand(command).into());
        }

        info!(
            "CONNECT request from {} to {}:{}",
            self.peer_addr, request.address, request.port
        );
        Ok(request)
    }

    /// connect opens the outbound connection and sends the final reply
    async fn connect(&mut self, request: &ConnectRequest) -> Result<TcpStream, SessionError> {
        match connect_target(request, self.config.timeout).await {
            Ok(outbound) => {
                let bound = outbound.local_addr()?;
                self.reply(ReplyCode::Success, Some(bound)).await?;
                info!(
                    "connected to {}:{} for {} (bound {})",
                    request.address, request.port, self.peer_addr, bound
                );
                Ok(outbound)
            }
            Err(e) => {
                warn!(
                    "connect to {}:{} for {} failed: {}",
                    request.address, request.port, self.peer_addr, e
                );
                // The client socket may already be dead
                let _ = self.reply(e.reply_code(), None).await;
                Err(e.into())
            }
        }
    }

    /// reply writes a SOCKS5 reply to the client
    async fn reply(
        &mut self,
        reply_code: ReplyCode,
        bound_addr: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        let reply = encode_bind_reply(reply_code, bound_addr);
        self.client.write_all(&reply).await?;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {}: {:?} -> {:?}", self.peer_addr, self.state, next);
        self.state = next;
    }

    /// close tears the session down and releases its admission slot
    async fn close(mut self, outcome: &SessionOutcome) {
        self.transition(SessionState::Closed);
        let _ = self.client.shutdown().await;

        let destination = self
            .request
            .as_ref()
            .map(|r| format!("{}:{}", r.address, r.port))
            .unwrap_or_else(|| "-".to_string());

        match outcome {
            SessionOutcome::Relayed(stats) => info!(
                "connection closed: {} -> {} ({:?}, auth: {:?}, sent: {} bytes, received: {} bytes)",
                self.peer_addr,
                destination,
                stats.end,
                self.auth_method,
                self.bytes_sent,
                self.bytes_received
            ),
            SessionOutcome::Rejected(e) => {
                info!("client {} rejected: {}", self.peer_addr, e)
            }
            SessionOutcome::Failed(e) => {
                warn!("client {} failed: {}", self.peer_addr, e)
            }
        }

        // Fields drop in declaration order: client socket, then the permit
        drop(self);
    }
}

/// read_greeting reads the client hello and returns the offered methods.
/// A version other than SOCKS5 is refused before anything else is read
async fn read_greeting<R>(reader: &mut R) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let [version, n_methods] = header;
    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    let mut methods = vec![0u8; n_methods as usize];
    reader.read_exact(&mut methods).await?;
    Ok(methods)
}

/// read_request reads a SOCKS5 request and returns its raw command byte with
/// the destination. An unknown ATYP leaves the rest of the request unread
async fn read_request<R>(reader: &mut R) -> Result<(u8, ConnectRequest), SessionError>
where
    R: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    // Not retrieving RSV (RESERVED) -> 0x00
    let [version, command, _, atyp] = header;
    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    let address = decode_request_address(atyp, reader).await?;
    let port = read_port(reader).await?;

    Ok((command, ConnectRequest { address, port }))
}

/// within bounds a handshake stage by the configured socket timeout
async fn within<T, E, F>(stage: &'static str, limit: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SessionError>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SessionError::StageTimeout {
            stage,
            after: limit,
        }),
    }
}

/// connect_target resolves the destination and connects within `limit`
pub async fn connect_target(
    request: &ConnectRequest,
    limit: Duration,
) -> Result<TcpStream, ConnectError> {
    let attempt = async {
        let addrs: Vec<SocketAddr> = match &request.address {
            Address::IPv4(ip) => vec![SocketAddr::from((*ip, request.port))],
            Address::IPv6(ip) => vec![SocketAddr::from((*ip, request.port))],
            Address::DomainName(domain) => lookup_host((domain.as_str(), request.port))
                .await
                .map_err(|e| ConnectError::Resolve {
                    host: domain.clone(),
                    reason: e.to_string(),
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(ConnectError::Resolve {
                host: request.address.to_string(),
                reason: "no addresses found".to_string(),
            });
        }

        TcpStream::connect(&addrs[..])
            .await
            .map_err(ConnectError::from_io)
    };

    match timeout(limit, attempt).await {
        Ok(Err(ConnectError::Timeout(_))) | Err(_) => Err(ConnectError::Timeout(limit)),
        Ok(result) => result,
    }
}
