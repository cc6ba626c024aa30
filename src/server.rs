use crate::{
    admission::Admission,
    config::ServerConfig,
    error::BindError,
    session::{ConnectionSession, SessionOutcome},
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpSocket, lookup_host},
    select,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    config: Arc<ServerConfig>,
    admission: Arc<Admission>,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: ServerConfig) -> Self {
        let admission = Admission::new(config.max_connections);
        Self {
            config: Arc::new(config),
            admission,
            listener: None,
        }
    }

    /// config returns the configuration shared with every session
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// admission returns the session counter, e.g. for observing load
    pub fn admission(&self) -> Arc<Admission> {
        Arc::clone(&self.admission)
    }

    /// local_addr returns the bound address once `bind` has succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// bind acquires the listening socket, retrying with exponential backoff
    /// while the address is in use. Calling it again returns the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr, BindError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listen_addr = self.config.listen_addr();
        let addr = lookup_host(&listen_addr)
            .await
            .map_err(|e| BindError::Resolve {
                addr: listen_addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BindError::Resolve {
                addr: listen_addr.clone(),
                reason: "no addresses found".to_string(),
            })?;

        let listener = bind_with_retry(
            addr,
            self.config.bind_retries,
            self.config.bind_retry_delay,
            self.config.backlog,
        )
        .await?;

        let bound = listener.local_addr().map_err(|source| BindError::Io { addr, source })?;
        info!("SOCKS5 proxy listening on {}", bound);
        info!(
            "max connections: {}, socket timeout: {:?}, authentication: {}",
            self.config.max_connections,
            self.config.timeout,
            match &self.config.credentials {
                Some(creds) => format!("enabled ({})", creds.username),
                None => "disabled".to_string(),
            }
        );

        self.listener = Some(listener);
        Ok(bound)
    }

    /// run accepts connections until the process ends
    pub async fn run(&mut self) -> Result<(), BindError> {
        self.run_until(std::future::pending()).await
    }

    /// run_until accepts connections until `shutdown` completes, then closes
    /// the listening socket. Sessions already running are left to finish
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), BindError>
    where
        F: Future<Output = ()>,
    {
        self.bind().await?;
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };
        tokio::pin!(shutdown);

        // Listen for connections to proxy
        loop {
            let (inbound, peer_addr) = select! {
                _ = &mut shutdown => {
                    info!("shutting down SOCKS5 proxy");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            // Over capacity: close before any handshake byte is read
            let Some(permit) = self.admission.try_admit() else {
                warn!(
                    "max connections ({}) reached, rejecting {}",
                    self.admission.max(),
                    peer_addr
                );
                drop(inbound);
                continue;
            };

            let config = Arc::clone(&self.config);
            let admission = Arc::clone(&self.admission);

            // Spawn async task
            tokio::spawn(async move {
                let session = ConnectionSession::new(inbound, peer_addr, config, permit);
                if let SessionOutcome::Failed(e) = session.run().await {
                    debug!("session for {} ended with error: {}", peer_addr, e);
                }
                info!(
                    "client disconnected: {} (active: {})",
                    peer_addr,
                    admission.active()
                );
            });
        }

        drop(listener);
        Ok(())
    }
}

/// bind_with_retry binds `addr`, retrying up to `attempts` times while the
/// address is in use. Any other error is returned immediately
pub async fn bind_with_retry(
    addr: SocketAddr,
    attempts: u32,
    base_delay: Duration,
    backlog: u32,
) -> Result<TcpListener, BindError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match try_bind(addr, backlog) {
            Ok(listener) => {
                debug!("bound {} on attempt {}", addr, attempt);
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if attempt >= attempts {
                    error!("failed to bind {} after {} attempts", addr, attempts);
                    return Err(BindError::Exhausted {
                        addr,
                        attempts,
                        source: e,
                    });
                }

                let wait = backoff_delay(base_delay, attempt);
                warn!(
                    "bind failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt, attempts, e, wait
                );
                sleep(wait).await;
                attempt += 1;
            }
            Err(source) => return Err(BindError::Io { addr, source }),
        }
    }
}

/// backoff_delay is the wait after failed attempt `attempt` (1-based):
/// `base * 2^(attempt - 1)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

fn try_bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_secs(3);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(6));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(12));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(24));
    }

    #[test]
    fn backoff_saturates() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[tokio::test]
    async fn bind_gives_up_when_address_stays_in_use() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        let err = bind_with_retry(addr, 3, Duration::from_millis(10), 16)
            .await
            .unwrap_err();
        match err {
            BindError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bind_succeeds_once_address_is_released() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            drop(holder);
        });

        let listener = bind_with_retry(addr, 6, Duration::from_millis(25), 16)
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn bind_is_idempotent() {
        let mut server = Socks5Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });
        let first = server.bind().await.unwrap();
        let second = server.bind().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.local_addr(), Some(first));
    }
}
