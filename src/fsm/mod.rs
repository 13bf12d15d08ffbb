// SPDX-License-Identifier: MIT
// FSM core (C6): states, events, dispatch, lock discipline, listener callbacks.

pub mod transitions;
#[cfg(test)]
mod scenario_tests;

use crate::channel::{FsmListener, SecureChannel};
use crate::codec::IdscpMessage;
use crate::config::Idscp2Configuration;
use crate::dat::DatProvider;
use crate::error::{Idscp2Error, Idscp2Result, TransitionCode};
use crate::ra::{RaDriver, RaDriverListener, RaDriverRegistry};
use crate::timer::{DynamicTimer, StaticTimer};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::instrument;

/// The fixed, finite state set (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Closed,
    WaitForHello,
    WaitForRa,
    WaitForRaProver,
    WaitForRaVerifier,
    WaitForDatAndRa,
    WaitForDatAndRaVerifier,
    WaitForAck,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `Hello` as soon as `Start` fires.
    Client,
    /// Waits for the peer's `Hello` before sending its own (spec §4.8).
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Handshake,
    VerifierHandshake,
    Ra,
    Dat,
    Ack,
}

/// Tagged union of everything that can drive a transition (spec §3 "Event").
#[derive(Debug, Clone)]
pub enum FsmEvent {
    Message(IdscpMessage),
    Start,
    Stop,
    /// The channel reported an I/O error; no `Close` frame can be sent.
    ChannelError(String),
    /// The channel observed a clean peer close.
    ChannelClosed,
    Timeout,
    DatTimerExpired,
    RepeatRa,
    SendData(Vec<u8>),
    RaProverOk,
    RaProverFailed(String),
    RaProverMsg(Vec<u8>),
    RaVerifierOk,
    RaVerifierFailed(String),
    RaVerifierMsg(Vec<u8>),
    AckTimerExpired,
}

/// Upper-layer hooks the Connection facade fulfills (spec §4.7 listeners). The FSM
/// calls these, never the reverse.
#[async_trait]
pub trait FsmCallbacks: Send + Sync {
    async fn on_app_message(&self, payload: Vec<u8>);
    async fn on_error(&self, err: Idscp2Error);
    async fn on_close(&self);
    async fn on_established(&self);
}

#[derive(Clone)]
pub struct FsmContext {
    pub channel: Arc<dyn SecureChannel>,
    pub config: Arc<Idscp2Configuration>,
    pub dat_provider: Arc<DatProvider>,
    pub ra_registry: Arc<RaDriverRegistry>,
    pub callbacks: Arc<dyn FsmCallbacks>,
    pub peer_cert_der: Option<Vec<u8>>,
    pub role: Role,
}

pub struct FsmInner {
    pub state: FsmState,
    pub prover: Option<Arc<dyn RaDriver>>,
    pub verifier: Option<Arc<dyn RaDriver>>,
    /// Bumped every time a prover/verifier driver is (re)started. Each driver's
    /// listener is tagged with the generation live at its own construction, so a
    /// callback from a driver that has since been replaced (spec §5 "stale driver
    /// callbacks arriving after `stop()` are discarded by the FSM") is recognized and
    /// dropped under the FSM mutex — the same generation-counter discipline `timer.rs`
    /// uses for timer firings.
    pub prover_generation: u64,
    pub verifier_generation: u64,
    pub prover_ok: bool,
    pub verifier_ok: bool,
    pub sent_hello: bool,
    pub negotiated_prover_suite: Option<String>,
    pub negotiated_verifier_suite: Option<String>,
    pub handshake_timer: StaticTimer,
    pub verifier_handshake_timer: StaticTimer,
    pub ra_timer: DynamicTimer,
    pub dat_timer: DynamicTimer,
    pub ack_timer: StaticTimer,
    /// Holds a send attempted before `Established` (or a second send attempted while
    /// one ACK is outstanding); flushed on entry to `Established`/`WaitForAck`.
    pub send_buffer: Option<Vec<u8>>,
    pub local_alternating_bit: bool,
    pub peer_last_delivered_bit: Option<bool>,
    pub pending_ack_payload: Option<Vec<u8>>,
    pub ack_retransmits: u32,
    pub pending_close_error: Option<Idscp2Error>,
}

impl FsmInner {
    fn new(config: &Idscp2Configuration) -> Self {
        FsmInner {
            state: FsmState::Closed,
            prover: None,
            verifier: None,
            prover_generation: 0,
            verifier_generation: 0,
            prover_ok: false,
            verifier_ok: false,
            sent_hello: false,
            negotiated_prover_suite: None,
            negotiated_verifier_suite: None,
            handshake_timer: StaticTimer::new(config.handshake_timeout()),
            verifier_handshake_timer: StaticTimer::new(config.handshake_timeout()),
            ra_timer: DynamicTimer::new(),
            dat_timer: DynamicTimer::new(),
            ack_timer: StaticTimer::new(config.ack_timeout()),
            send_buffer: None,
            local_alternating_bit: false,
            peer_last_delivered_bit: None,
            pending_ack_payload: None,
            ack_retransmits: 0,
            pending_close_error: None,
        }
    }

    fn cancel_all_timers(&self) {
        self.handshake_timer.cancel();
        self.verifier_handshake_timer.cancel();
        self.ra_timer.cancel();
        self.dat_timer.cancel();
        self.ack_timer.cancel();
    }
}

pub struct Fsm {
    inner: Mutex<FsmInner>,
    ctx: FsmContext,
    state_tx: watch::Sender<FsmState>,
}

impl Fsm {
    pub fn new(ctx: FsmContext) -> Arc<Self> {
        let inner = FsmInner::new(&ctx.config);
        let (state_tx, _) = watch::channel(FsmState::Closed);
        Arc::new(Fsm {
            inner: Mutex::new(inner),
            ctx,
            state_tx,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FsmState> {
        self.state_tx.subscribe()
    }

    pub async fn current_state(&self) -> FsmState {
        self.inner.lock().await.state
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn dispatch(self: &Arc<Self>, event: FsmEvent) -> TransitionCode {
        let mut inner = self.inner.lock().await;
        self.dispatch_locked(&mut inner, event).await
    }

    /// Fires the internal `Start` event (spec §4.8, §4.6): sends the local `Hello`
    /// (client role) and begins the handshake-bounding timer.
    pub async fn start(self: &Arc<Self>) -> TransitionCode {
        self.dispatch(FsmEvent::Start).await
    }

    /// Submits application data. If the FSM is not yet ready to send (pre-Established,
    /// or mid-flight in ACK mode), the payload is buffered rather than rejected — see
    /// `send_buffer` on `FsmInner`.
    pub async fn send_data(self: &Arc<Self>, payload: Vec<u8>) -> TransitionCode {
        let mut inner = self.inner.lock().await;
        match inner.state {
            FsmState::Established => self.dispatch_locked(&mut inner, FsmEvent::SendData(payload)).await,
            FsmState::WaitForAck => self.dispatch_locked(&mut inner, FsmEvent::SendData(payload)).await,
            FsmState::Closed => TransitionCode::NotConnected,
            _ => {
                inner.send_buffer = Some(payload);
                TransitionCode::Ok
            }
        }
    }

    /// Requests a fresh attestation cycle (spec §4.6 `REPEAT_RA`).
    pub async fn repeat_ra(self: &Arc<Self>) -> TransitionCode {
        self.dispatch(FsmEvent::RepeatRa).await
    }

    pub async fn stop(self: &Arc<Self>) -> TransitionCode {
        self.dispatch(FsmEvent::Stop).await
    }

    async fn dispatch_locked(self: &Arc<Self>, inner: &mut FsmInner, event: FsmEvent) -> TransitionCode {
        let prev_state = inner.state;
        let (code, next) = transitions::handle(self, inner, event).await;
        if next != prev_state {
            inner.state = next;
            let _ = self.state_tx.send(next);
            match next {
                FsmState::Closed => {
                    inner.cancel_all_timers();
                    if let Some(driver) = inner.prover.take() {
                        tokio::spawn(async move { driver.stop().await });
                    }
                    if let Some(driver) = inner.verifier.take() {
                        tokio::spawn(async move { driver.stop().await });
                    }
                    if let Some(err) = inner.pending_close_error.take() {
                        self.ctx.callbacks.on_error(err).await;
                    }
                    self.ctx.callbacks.on_close().await;
                }
                FsmState::Established => {
                    self.ctx.callbacks.on_established().await;
                }
                _ => {}
            }
        }
        code
    }

    async fn fire_timer(self: Arc<Self>, kind: TimerKind, generation: u64) {
        let mut inner = self.inner.lock().await;
        let current = match kind {
            TimerKind::Handshake => inner.handshake_timer.current_generation(),
            TimerKind::VerifierHandshake => inner.verifier_handshake_timer.current_generation(),
            TimerKind::Ra => inner.ra_timer.current_generation(),
            TimerKind::Dat => inner.dat_timer.current_generation(),
            TimerKind::Ack => inner.ack_timer.current_generation(),
        };
        // I3: authoritative re-check, performed only now that we hold the FSM mutex.
        if current != generation {
            return;
        }
        let event = match kind {
            TimerKind::Handshake | TimerKind::VerifierHandshake => FsmEvent::Timeout,
            TimerKind::Ra => FsmEvent::RepeatRa,
            TimerKind::Dat => FsmEvent::DatTimerExpired,
            TimerKind::Ack => FsmEvent::AckTimerExpired,
        };
        self.dispatch_locked(&mut inner, event).await;
    }

    /// Converts an RA driver callback into an `FsmEvent`, but only after checking the
    /// driver's generation against the live one under the FSM mutex (spec §5: "stale
    /// driver callbacks arriving after `stop()` are discarded by the FSM"). Mirrors
    /// `fire_timer`'s re-check — a driver replaced by `restart_prover` or
    /// `resume_verifier_after_fresh_dat` keeps running until its fire-and-forgotten
    /// `stop()` completes, and any callback it delivers in that window must not be
    /// mistaken for the driver that replaced it.
    async fn dispatch_ra(self: &Arc<Self>, role: RaRole, generation: u64, callback: RaCallback) {
        let mut inner = self.inner.lock().await;
        let current = match role {
            RaRole::Prover => inner.prover_generation,
            RaRole::Verifier => inner.verifier_generation,
        };
        if current != generation {
            tracing::debug!(?role, generation, current, "dropping stale RA driver callback");
            return;
        }
        let event = match (role, callback) {
            (RaRole::Prover, RaCallback::Message(data)) => FsmEvent::RaProverMsg(data),
            (RaRole::Prover, RaCallback::Success) => FsmEvent::RaProverOk,
            (RaRole::Prover, RaCallback::Failed(reason)) => FsmEvent::RaProverFailed(reason),
            (RaRole::Verifier, RaCallback::Message(data)) => FsmEvent::RaVerifierMsg(data),
            (RaRole::Verifier, RaCallback::Success) => FsmEvent::RaVerifierOk,
            (RaRole::Verifier, RaCallback::Failed(reason)) => FsmEvent::RaVerifierFailed(reason),
        };
        self.dispatch_locked(&mut inner, event).await;
    }

    fn schedule_handshake_timer(self: &Arc<Self>, inner: &mut FsmInner) {
        let fsm = self.clone();
        inner.handshake_timer.reset(move |generation| async move {
            fsm.fire_timer(TimerKind::Handshake, generation).await;
        });
    }

    fn schedule_verifier_handshake_timer(self: &Arc<Self>, inner: &mut FsmInner) {
        let fsm = self.clone();
        inner.verifier_handshake_timer.reset(move |generation| async move {
            fsm.fire_timer(TimerKind::VerifierHandshake, generation).await;
        });
    }

    fn schedule_ra_timer(self: &Arc<Self>, inner: &mut FsmInner) {
        let fsm = self.clone();
        let delay = self.ctx.config.ra_timeout();
        inner.ra_timer.reset(delay, move |generation| async move {
            fsm.fire_timer(TimerKind::Ra, generation).await;
        });
    }

    fn schedule_dat_timer(self: &Arc<Self>, inner: &mut FsmInner, remaining: std::time::Duration) {
        let fsm = self.clone();
        let delay = remaining.mul_f64(self.ctx.config.daps_token_renewal_threshold);
        inner.dat_timer.reset(delay, move |generation| async move {
            fsm.fire_timer(TimerKind::Dat, generation).await;
        });
    }

    fn schedule_ack_timer(self: &Arc<Self>, inner: &mut FsmInner) {
        let fsm = self.clone();
        inner.ack_timer.reset(move |generation| async move {
            fsm.fire_timer(TimerKind::Ack, generation).await;
        });
    }
}

/// Bridges the secure channel's inbound callbacks to [`Fsm::dispatch`]. A thin
/// `Arc<Fsm>`-holding wrapper rather than `Fsm` implementing the trait directly, since
/// dispatch needs `&Arc<Fsm>` (timers capture it into their fired-later closures) and
/// a trait method only ever hands us `&self`.
pub struct FsmChannelListener(pub Arc<Fsm>);

#[async_trait]
impl FsmListener for FsmChannelListener {
    async fn on_message(&self, msg: IdscpMessage) {
        self.0.dispatch(FsmEvent::Message(msg)).await;
    }

    async fn on_error(&self, err: Idscp2Error) {
        self.0.dispatch(FsmEvent::ChannelError(err.to_string())).await;
    }

    async fn on_close(&self) {
        self.0.dispatch(FsmEvent::ChannelClosed).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RaRole {
    Prover,
    Verifier,
}

enum RaCallback {
    Message(Vec<u8>),
    Success,
    Failed(String),
}

/// Bridges an RA driver's callbacks to [`Fsm::dispatch_ra`] (spec §9 "cyclic driver↔FSM
/// reference": the driver holds this capability, never FSM ownership). `generation` is
/// the prover/verifier generation live in `FsmInner` at the moment this listener's
/// driver was started, so a callback from a driver already superseded by a restart is
/// recognized as stale and dropped (spec §5).
pub struct FsmRaListener {
    fsm: Arc<Fsm>,
    role: RaRole,
    generation: u64,
}

#[async_trait]
impl RaDriverListener for FsmRaListener {
    async fn on_message(&self, data: Vec<u8>) {
        self.fsm.dispatch_ra(self.role, self.generation, RaCallback::Message(data)).await;
    }

    async fn on_success(&self) {
        self.fsm.dispatch_ra(self.role, self.generation, RaCallback::Success).await;
    }

    async fn on_failed(&self, reason: String) {
        self.fsm.dispatch_ra(self.role, self.generation, RaCallback::Failed(reason)).await;
    }
}

pub fn prover_listener(fsm: Arc<Fsm>, generation: u64) -> Arc<dyn RaDriverListener> {
    Arc::new(FsmRaListener {
        fsm,
        role: RaRole::Prover,
        generation,
    })
}

pub fn verifier_listener(fsm: Arc<Fsm>, generation: u64) -> Arc<dyn RaDriverListener> {
    Arc::new(FsmRaListener {
        fsm,
        role: RaRole::Verifier,
        generation,
    })
}

/// Delegates a peer-originated RA frame to a local driver from a freshly spawned task,
/// so the call never re-enters the FSM mutex it was read under (spec §4.4, §9).
pub fn spawn_delegate(driver: Arc<dyn RaDriver>, data: Vec<u8>) {
    tokio::spawn(async move {
        driver.delegate(data).await;
    });
}

/// Negotiates both halves of the RA suite pair from one peer's `Hello` (spec §4.6):
/// the suite we'll prove with, and the suite we'll verify the peer with.
fn negotiate_suite_for_hello(
    local_supported: &[String],
    local_expected: &[String],
    peer_supported: &[String],
    peer_expected: &[String],
) -> Option<(String, String)> {
    let prover_suite = crate::ra::negotiate_suite(local_supported, peer_expected)?;
    let verifier_suite = crate::ra::negotiate_suite(local_expected, peer_supported)?;
    Some((prover_suite, verifier_suite))
}

#[cfg(test)]
pub(crate) use test_support::*;
