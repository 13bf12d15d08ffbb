// SPDX-License-Identifier: MIT
// Secure channel adapter (C2): bridges a byte-stream transport's read loop to the FSM,
// and serializes outbound writes. Generic over the transport so production TLS streams
// and in-memory test duplexes are driven by the identical path.

use crate::codec::{read_frame, IdscpMessage};
use crate::error::Idscp2Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, instrument, warn};

/// Capability the secure channel holds back into the FSM. The FSM owns the channel
/// (via [`SecureChannel::send`]); the channel only ever calls back through this trait,
/// never reaches back into FSM internals directly.
#[async_trait]
pub trait FsmListener: Send + Sync {
    async fn on_message(&self, msg: IdscpMessage);
    async fn on_error(&self, err: Idscp2Error);
    async fn on_close(&self);
}

/// Contract consumed by the FSM from the transport layer (spec §4.2).
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn send(&self, bytes: Bytes) -> bool;
    async fn close(&self);
    fn is_connected(&self) -> bool;
    fn remote_peer(&self) -> &str;
}

/// Length-prefixed framing over an arbitrary duplex byte stream, with a gate that
/// queues inbound delivery until `bind_fsm` has been called. Works for a
/// `tokio_rustls::TlsStream` in production and a `tokio::io::duplex` half in tests.
pub struct FramedChannel {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    connected: AtomicBool,
    remote_peer: String,
    listener_tx: watch::Sender<Option<Arc<dyn FsmListener>>>,
}

impl FramedChannel {
    /// Spawns the read loop and returns the channel handle. `reader`/`writer` are the
    /// split halves of the underlying stream.
    pub fn spawn<R, W>(reader: R, writer: W, remote_peer: String) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (listener_tx, listener_rx) = watch::channel(None);
        let channel = Arc::new(FramedChannel {
            writer: Mutex::new(Box::new(writer)),
            connected: AtomicBool::new(true),
            remote_peer,
            listener_tx,
        });
        tokio::spawn(read_loop(reader, listener_rx, channel.clone()));
        channel
    }

    /// Binds the FSM listener; inbound callbacks delivered before this point are held
    /// back by the gate in `read_loop` (spec §4.2: the TLS worker may start reading
    /// before the owning Connection has finished wiring).
    pub fn bind_fsm(&self, listener: Arc<dyn FsmListener>) {
        let _ = self.listener_tx.send(Some(listener));
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut listener_rx: watch::Receiver<Option<Arc<dyn FsmListener>>>,
    channel: Arc<FramedChannel>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let listener = wait_for_listener(&mut listener_rx).await;
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(body)) => match IdscpMessage::decode(&body) {
                Ok(msg) => listener.on_message(msg).await,
                Err(e) => {
                    warn!(error = %e, "malformed frame, closing channel");
                    channel.connected.store(false, Ordering::SeqCst);
                    listener.on_error(e).await;
                    listener.on_close().await;
                    return;
                }
            },
            Ok(None) => {
                debug!("peer closed connection cleanly");
                channel.connected.store(false, Ordering::SeqCst);
                listener.on_close().await;
                return;
            }
            Err(e) => {
                error!(error = %e, "io error reading from channel");
                channel.connected.store(false, Ordering::SeqCst);
                listener.on_error(e).await;
                listener.on_close().await;
                return;
            }
        }
    }
}

async fn wait_for_listener(
    rx: &mut watch::Receiver<Option<Arc<dyn FsmListener>>>,
) -> Arc<dyn FsmListener> {
    loop {
        if let Some(listener) = rx.borrow().clone() {
            return listener;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without ever binding; this should not happen in practice
            // since the Connection factory always binds before the read loop can
            // observe a dropped sender, but we must not spin.
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl SecureChannel for FramedChannel {
    #[instrument(level = "trace", skip(self, bytes))]
    async fn send(&self, bytes: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "send failed, marking channel disconnected");
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "flush failed, marking channel disconnected");
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn remote_peer(&self) -> &str {
        &self.remote_peer
    }
}
