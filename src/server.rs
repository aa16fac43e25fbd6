//! Passive observer: accepts connections, decodes what clients send and
//! never writes a byte back.

use crate::config::Config;
use crate::error::Result;
use crate::framer::StreamDecoder;
use crate::protocol::Message;
use crate::sink::TracingSink;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 16 * 1024;

/// A message decoded from one connection.
#[derive(Debug, Clone)]
pub struct Observed {
    pub peer: SocketAddr,
    pub message: Message,
}

pub async fn run(cfg: Config) -> Result<()> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(listen_addr = %cfg.listen_addr, "mongowire listening");

    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::debug!(%addr, "accepted connection");
        let max_message_size = cfg.max_message_size;
        tokio::spawn(async move {
            if let Err(e) = observe_connection(socket, addr, max_message_size, None).await {
                tracing::debug!(error = %format!("{e:?}"), "connection closed with error");
            }
        });
    }
}

/// Spawn the observer on the configured address and run until `shutdown` is signaled.
/// Returns the bound local address, a receiver of decoded messages, a shutdown
/// sender, and the task handle.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(
    SocketAddr,
    mpsc::UnboundedReceiver<Observed>,
    watch::Sender<bool>,
    tokio::task::JoinHandle<()>,
)> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(listen_addr = %local_addr, "mongowire listening");

    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let max_message_size = cfg.max_message_size;

    // Accept loop with shutdown
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                res = listener.accept() => {
                    let (socket, addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::debug!(error = %format!("{e:?}"), "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%addr, "accepted connection");
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = observe_connection(socket, addr, max_message_size, Some(tx)).await {
                            tracing::debug!(error = %format!("{e:?}"), "connection closed with error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
    });

    Ok((local_addr, rx, shutdown_tx, handle))
}

async fn observe_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    max_message_size: usize,
    tx: Option<mpsc::UnboundedSender<Observed>>,
) -> Result<()> {
    let mut decoder = StreamDecoder::new(max_message_size);
    let mut sink = TracingSink::new(peer.to_string());
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        decoder.push(&chunk[..n]);
        for message in decoder.drain(&mut sink) {
            tracing::info!(
                %peer,
                offset = message.offset,
                request_id = message.header.request_id,
                op_code = message.header.op_code,
                anomalies = message.anomalies.len(),
                "{}",
                message.summary()
            );
            if let Some(tx) = &tx {
                // The receiver going away only stops forwarding.
                let _ = tx.send(Observed { peer, message });
            }
        }
    }

    let leftover = decoder.framer().buffered();
    if leftover > 0 {
        tracing::debug!(%peer, leftover, "connection closed mid-message");
    }
    Ok(())
}
