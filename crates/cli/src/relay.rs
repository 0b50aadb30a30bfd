//! Relay between a link and the process's stdin/stdout
//!
//! Link calls that only take the lock (`read`, `write`, `size`) are made
//! directly from async code. Calls that wait on the device (`flush`,
//! `close`) go through `spawn_blocking`.

use anyhow::{Context, Result, bail};
use async_channel::Receiver;
use link::{LinkEvent, Notification, UsbDataLink, UsbDriver};
use protocol::{CONNECT_TOKEN, HandshakeToken};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdout};
use tokio::signal;
use tracing::{debug, info, warn};

/// Chunk size for stdin reads and stdout writes
const CHUNK_SIZE: usize = 16 * 1024;

/// Why the relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The link disconnected
    Disconnected,
    /// Ctrl+C
    Interrupted,
}

/// Wait for the peer's connect token on a bound link and accept it
pub async fn answer_handshake<D: UsbDriver>(
    link: &UsbDataLink<D>,
    events: &Receiver<Notification>,
) -> Result<()> {
    info!("Waiting for the peer to connect...");

    while link.size() < CONNECT_TOKEN.len() {
        tokio::select! {
            notification = events.recv() => {
                let notification = notification.context("Link event channel closed")?;
                match notification.event {
                    LinkEvent::InputShutdown | LinkEvent::Disconnected => {
                        bail!("Link closed before the peer connected")
                    }
                    event => debug!("{}: {:?}", notification.link, event),
                }
            }
            _ = signal::ctrl_c() => bail!("Interrupted while waiting for the peer"),
        }
    }

    let mut token = vec![0u8; CONNECT_TOKEN.len()];
    link.read(&mut token);

    let accept = HandshakeToken::parse(&token) == Some(HandshakeToken::Connect);
    link.reply_handshake(accept);
    if !accept {
        bail!("Peer opened with an unexpected handshake");
    }

    info!("Peer connected");
    Ok(())
}

/// Pump stdin into the link and link input to stdout until the link
/// disconnects or the user interrupts
pub async fn run<D: UsbDriver>(
    link: Arc<UsbDataLink<D>>,
    events: Receiver<Notification>,
) -> Result<RelayEnd> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut stdin_open = true;

    // Input may have landed before the loop started listening
    drain(&link, &mut stdout).await?;

    loop {
        tokio::select! {
            notification = events.recv() => {
                let Ok(notification) = notification else {
                    return Ok(RelayEnd::Disconnected);
                };
                match notification.event {
                    LinkEvent::InputReady => drain(&link, &mut stdout).await?,
                    LinkEvent::InputShutdown => {
                        drain(&link, &mut stdout).await?;
                        info!("Peer closed its side of the link");
                    }
                    LinkEvent::Disconnected => {
                        drain(&link, &mut stdout).await?;
                        info!("Link disconnected");
                        return Ok(RelayEnd::Disconnected);
                    }
                    LinkEvent::OutputError => warn!("Output to the device failed; data dropped"),
                    event => debug!("{}: {:?}", notification.link, event),
                }
            }
            read = stdin.read(&mut buf), if stdin_open => {
                match read.context("Failed to read stdin")? {
                    0 => {
                        stdin_open = false;
                        // Output stays open so that close() still sends the disconnect frame
                        debug!("stdin closed, flushing output");
                        let flusher = link.clone();
                        let flush = tokio::task::spawn_blocking(move || flusher.flush());
                        tokio::select! {
                            joined = flush => joined.context("Flush task panicked")?,
                            // close() wakes the abandoned flush
                            _ = signal::ctrl_c() => return Ok(RelayEnd::Interrupted),
                        }
                    }
                    n => link.write(&buf[..n]),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, closing link...");
                return Ok(RelayEnd::Interrupted);
            }
        }
    }
}

/// Copy everything buffered on the link to stdout
async fn drain<D: UsbDriver>(link: &UsbDataLink<D>, stdout: &mut Stdout) -> Result<()> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = link.read(&mut chunk);
        if n == 0 {
            break;
        }
        stdout
            .write_all(&chunk[..n])
            .await
            .context("Failed to write stdout")?;
    }
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(())
}
