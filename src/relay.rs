use std::io;
use std::time::Duration;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    select,
    time::timeout,
};
use tracing::debug;

/// RelayEnd records why a relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Client sent EOF or its side could no longer be written
    ClientClosed,
    /// Target sent EOF or its side could no longer be written
    TargetClosed,
    /// Neither side was readable within the idle timeout
    IdleTimeout,
    /// Read failure on either side
    Io(io::Error),
}

/// RelayStats holds the byte counts of a finished relay
#[derive(Debug)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub end: RelayEnd,
}

/// Pump is the result of serving one direction for one round
enum Pump {
    Moved(usize),
    NotReady,
    SourceClosed,
    SinkClosed,
    Failed(io::Error),
}

/// relay pumps bytes between the client and target streams until one side
/// closes, an I/O error occurs, or nothing arrives for `idle_timeout`.
/// Both directions are served in every round; ending either ends both
pub async fn relay(
    client: &mut TcpStream,
    target: &mut TcpStream,
    buffer_size: usize,
    idle_timeout: Duration,
) -> RelayStats {
    let mut buf = vec![0u8; buffer_size];
    let mut client_to_target = 0u64;
    let mut target_to_client = 0u64;

    let end = loop {
        // Wait until at least one side has something for us
        let ready = timeout(idle_timeout, async {
            select! {
                r = client.readable() => r,
                r = target.readable() => r,
            }
        })
        .await;

        match ready {
            Err(_) => break RelayEnd::IdleTimeout,
            Ok(Err(e)) => break RelayEnd::Io(e),
            Ok(Ok(())) => {}
        }

        // Client -> target
        match pump(client, target, &mut buf, idle_timeout).await {
            Pump::Moved(n) => client_to_target += n as u64,
            Pump::NotReady => {}
            Pump::SourceClosed => break RelayEnd::ClientClosed,
            Pump::SinkClosed => break RelayEnd::TargetClosed,
            Pump::Failed(e) => break RelayEnd::Io(e),
        }

        // Target -> client
        match pump(target, client, &mut buf, idle_timeout).await {
            Pump::Moved(n) => target_to_client += n as u64,
            Pump::NotReady => {}
            Pump::SourceClosed => break RelayEnd::TargetClosed,
            Pump::SinkClosed => break RelayEnd::ClientClosed,
            Pump::Failed(e) => break RelayEnd::Io(e),
        }
    };

    debug!(
        "relay finished ({:?}): {} bytes from client, {} bytes from target",
        end, client_to_target, target_to_client
    );

    RelayStats {
        client_to_target,
        target_to_client,
        end,
    }
}

/// pump moves whatever is immediately readable on `from` into `to`
async fn pump(
    from: &TcpStream,
    to: &mut TcpStream,
    buf: &mut [u8],
    write_timeout: Duration,
) -> Pump {
    let n = match from.try_read(buf) {
        Ok(0) => return Pump::SourceClosed,
        Ok(n) => n,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Pump::NotReady,
        Err(e) => return Pump::Failed(e),
    };

    // A stalled or broken sink ends the relay just like EOF
    match timeout(write_timeout, to.write_all(&buf[..n])).await {
        Ok(Ok(())) => Pump::Moved(n),
        Ok(Err(_)) | Err(_) => Pump::SinkClosed,
    }
}
