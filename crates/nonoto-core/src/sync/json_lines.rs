//! Line-delimited JSON transport for the sync protocol.
//!
//! Every frame is one JSON object on its own line. The inbound side closes
//! on EOF or on an I/O error, which the client treats as a disconnect.
//! Lines that do not parse are logged and skipped.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use super::messages::{InboundFrame, OutboundFrame, SyncChannel};

/// Connect to an authority listening on `addr`.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<SyncChannel> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    if let Ok(peer) = stream.peer_addr() {
        log::info!("[SYNC] Connected to tempo authority at {}", peer);
    }
    let (reader, writer) = stream.into_split();
    Ok(attach(reader, writer))
}

/// Run the protocol over an arbitrary byte stream pair.
///
/// Spawns one reader and one writer task; must be called inside a tokio
/// runtime.
pub fn attach<R, W>(reader: R, writer: W) -> SyncChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    tokio::spawn(read_frames(reader, inbound_tx));
    tokio::spawn(write_frames(writer, outbound_rx));
    SyncChannel { outbound, inbound }
}

async fn read_frames<R>(reader: R, inbound: mpsc::UnboundedSender<InboundFrame>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundFrame>(line) {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("[SYNC] Skipping malformed frame: {} ({})", line, e),
                }
            }
            Ok(None) => {
                log::info!("[SYNC] Tempo authority closed the connection");
                return;
            }
            Err(e) => {
                log::warn!("[SYNC] Read error: {}", e);
                return;
            }
        }
    }
}

async fn write_frames<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<OutboundFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let mut line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                log::error!("[SYNC] Could not encode frame #{}: {}", frame.id, e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("[SYNC] Write error: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            log::warn!("[SYNC] Flush error: {}", e);
            return;
        }
    }
}
