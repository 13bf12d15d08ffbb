// SPDX-License-Identifier: MIT
// Connection facade (C7): the application-facing handle. Wraps an `Arc<Fsm>` and
// fulfills its `FsmCallbacks` contract, buffering inbound application messages until
// `unlock_messaging` so a connection cannot race ahead of listener registration.

use crate::error::{Idscp2Error, Idscp2Result, TransitionCode};
use crate::fsm::{Fsm, FsmCallbacks, FsmState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tracing::instrument;

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, payload: Vec<u8>);
}

#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_error(&self, err: Idscp2Error);
    async fn on_close(&self);
}

/// Implements [`FsmCallbacks`] on the Connection's behalf, and holds the listener
/// lists a running FSM has no business knowing about.
pub(crate) struct ConnectionCallbacks {
    message_listeners: StdMutex<Vec<Arc<dyn MessageListener>>>,
    connection_listeners: StdMutex<Vec<Arc<dyn ConnectionListener>>>,
    unlocked: AtomicBool,
    pending_messages: TokioMutex<Vec<Vec<u8>>>,
    /// Resolved exactly once: `Ok(())` on first `Established`, `Err` if the FSM closes
    /// before ever reaching it (spec §4.8 "safe to unlock_messaging").
    ready_tx: TokioMutex<Option<oneshot::Sender<Idscp2Result<()>>>>,
}

impl ConnectionCallbacks {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Idscp2Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let callbacks = Arc::new(ConnectionCallbacks {
            message_listeners: StdMutex::new(Vec::new()),
            connection_listeners: StdMutex::new(Vec::new()),
            unlocked: AtomicBool::new(false),
            pending_messages: TokioMutex::new(Vec::new()),
            ready_tx: TokioMutex::new(Some(tx)),
        });
        (callbacks, rx)
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.lock().unwrap().push(listener);
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.lock().unwrap().push(listener);
    }

    /// Releases any application messages received before the caller had finished
    /// registering listeners, then switches to immediate delivery.
    async fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
        let backlog = std::mem::take(&mut *self.pending_messages.lock().await);
        for payload in backlog {
            self.deliver(payload).await;
        }
    }

    async fn deliver(&self, payload: Vec<u8>) {
        let listeners = self.message_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_message(payload.clone()).await;
        }
    }
}

#[async_trait]
impl FsmCallbacks for ConnectionCallbacks {
    async fn on_app_message(&self, payload: Vec<u8>) {
        if self.unlocked.load(Ordering::SeqCst) {
            self.deliver(payload).await;
        } else {
            self.pending_messages.lock().await.push(payload);
        }
    }

    async fn on_error(&self, err: Idscp2Error) {
        let listeners = self.connection_listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener.on_error(err_clone(&err)).await;
        }
    }

    async fn on_close(&self) {
        if let Some(tx) = self.ready_tx.lock().await.take() {
            let _ = tx.send(Err(Idscp2Error::NotConnected));
        }
        let listeners = self.connection_listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener.on_close().await;
        }
    }

    async fn on_established(&self) {
        if let Some(tx) = self.ready_tx.lock().await.take() {
            let _ = tx.send(Ok(()));
        }
    }
}

/// `Idscp2Error` does not implement `Clone` (it wraps non-`Clone` upstream error
/// types); each connection listener instead gets its own rendering of the cause.
fn err_clone(err: &Idscp2Error) -> Idscp2Error {
    Idscp2Error::HandshakeFailed(err.to_string())
}

/// The application-facing handle to one IDSCP2 session (spec §4.7).
pub struct Connection {
    fsm: Arc<Fsm>,
    callbacks: Arc<ConnectionCallbacks>,
    remote_peer: String,
}

impl Connection {
    pub(crate) fn new(fsm: Arc<Fsm>, callbacks: Arc<ConnectionCallbacks>, remote_peer: String) -> Self {
        Connection {
            fsm,
            callbacks,
            remote_peer,
        }
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub async fn state(&self) -> FsmState {
        self.fsm.current_state().await
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.callbacks.add_message_listener(listener);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.callbacks.add_connection_listener(listener);
    }

    /// Releases any application messages buffered before listener registration. The
    /// embedding application must call this once its listeners are in place.
    pub async fn unlock_messaging(&self) {
        self.callbacks.unlock().await;
    }

    /// Submits `payload` and waits until the FSM has accepted it (reached
    /// `Established`/`WaitForAck` and dispatched the send), per I4. Returns
    /// [`Idscp2Error::Timeout`] if `timeout` elapses first (spec §4.7
    /// `blocking_send(payload, timeout)` — renamed to avoid the `blocking_` naming
    /// collision with sync-context APIs; semantics unchanged).
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn send_blocking(&self, payload: Vec<u8>, timeout: std::time::Duration) -> Idscp2Result<()> {
        tokio::time::timeout(timeout, self.send_blocking_unbounded(payload))
            .await
            .unwrap_or(Err(Idscp2Error::Timeout("send")))
    }

    async fn send_blocking_unbounded(&self, payload: Vec<u8>) -> Idscp2Result<()> {
        let mut state_rx = self.fsm.subscribe_state();
        loop {
            match *state_rx.borrow() {
                FsmState::Established | FsmState::WaitForAck => break,
                FsmState::Closed => return Err(Idscp2Error::NotConnected),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(Idscp2Error::NotConnected);
            }
        }
        match self.fsm.send_data(payload).await {
            TransitionCode::Ok => Ok(()),
            TransitionCode::NotConnected => Err(Idscp2Error::NotConnected),
            other => Err(Idscp2Error::UnknownTransition {
                state: "send".into(),
                event: format!("{other:?}"),
            }),
        }
    }

    /// Submits `payload` without waiting; the send proceeds on a background task and
    /// any failure surfaces only through the connection listener.
    pub fn non_blocking_send(&self, payload: Vec<u8>) {
        let fsm = self.fsm.clone();
        tokio::spawn(async move {
            fsm.send_data(payload).await;
        });
    }

    /// Requests an out-of-cycle re-attestation (spec §4.6 `REPEAT_RA`).
    pub async fn repeat_ra(&self) -> Idscp2Result<()> {
        match self.fsm.repeat_ra().await {
            TransitionCode::Ok => Ok(()),
            TransitionCode::NotConnected => Err(Idscp2Error::NotConnected),
            other => Err(Idscp2Error::UnknownTransition {
                state: "repeat_ra".into(),
                event: format!("{other:?}"),
            }),
        }
    }

    pub async fn close(&self) {
        self.fsm.stop().await;
    }
}
