// SPDX-License-Identifier: MIT
// The transition table itself (spec §4.6). One function per state, dispatched by a
// single outer match; each arm performs whatever entry/exit side effect the move
// requires (sending a frame, starting a timer, starting/stopping a driver) inline,
// since those actions are small enough not to warrant a separate entry/exit table.

use super::{negotiate_suite_for_hello, prover_listener, spawn_delegate, verifier_listener};
use super::{Fsm, FsmEvent, FsmInner, FsmState, Role};
use crate::codec::{CauseCode, IdscpMessage};
use crate::error::{Idscp2Error, TransitionCode};
use std::sync::Arc;
use tracing::warn;

pub(super) async fn handle(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    // Global handling, independent of state: a live connection tears down the same way
    // regardless of where in the handshake/established cycle it was.
    if inner.state != FsmState::Closed {
        match &event {
            FsmEvent::Stop => {
                send_close(fsm, CauseCode::UserShutdown, "local shutdown").await;
                return (TransitionCode::Ok, FsmState::Closed);
            }
            FsmEvent::ChannelError(msg) => {
                inner.pending_close_error = Some(Idscp2Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    msg.clone(),
                )));
                return (TransitionCode::IoError, FsmState::Closed);
            }
            FsmEvent::ChannelClosed => {
                inner.pending_close_error = Some(Idscp2Error::NotConnected);
                return (TransitionCode::NotConnected, FsmState::Closed);
            }
            FsmEvent::Message(IdscpMessage::Close { reason, cause_code }) => {
                inner.pending_close_error = Some(Idscp2Error::HandshakeFailed(format!(
                    "peer closed ({cause_code:?}): {reason}"
                )));
                return (TransitionCode::Ok, FsmState::Closed);
            }
            _ => {}
        }
    }

    match inner.state {
        FsmState::Closed => closed(fsm, inner, event).await,
        FsmState::WaitForHello => wait_for_hello(fsm, inner, event).await,
        FsmState::WaitForRa => wait_for_ra(fsm, inner, event).await,
        FsmState::WaitForRaProver => wait_for_ra_prover(fsm, inner, event).await,
        FsmState::WaitForRaVerifier => wait_for_ra_verifier(fsm, inner, event).await,
        FsmState::WaitForDatAndRa => wait_for_dat_and_ra(fsm, inner, event).await,
        FsmState::WaitForDatAndRaVerifier => wait_for_dat_and_ra_verifier(fsm, inner, event).await,
        FsmState::WaitForAck => wait_for_ack(fsm, inner, event).await,
        FsmState::Established => established(fsm, inner, event).await,
    }
}

async fn send_close(fsm: &Arc<Fsm>, cause_code: CauseCode, reason: &str) {
    let msg = IdscpMessage::Close {
        reason: reason.to_string(),
        cause_code,
    };
    fsm_send(fsm, msg).await;
}

async fn fsm_send(fsm: &Arc<Fsm>, msg: IdscpMessage) -> bool {
    fsm.ctx.channel.send(msg.encode().freeze()).await
}

fn stray(state: FsmState, event: &FsmEvent) -> (TransitionCode, FsmState) {
    warn!(?event, ?state, "ignoring event not valid in this state");
    (TransitionCode::UnknownTransition, state)
}

async fn closed(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Start => {
            if fsm.ctx.role == Role::Client {
                match fsm.ctx.dat_provider.acquire().await {
                    Ok(local_dat) => {
                        let hello = IdscpMessage::Hello {
                            dat: local_dat,
                            supported_ra: fsm.ctx.config.supported_ra_suites.clone(),
                            expected_ra: fsm.ctx.config.expected_ra_suites.clone(),
                        };
                        fsm_send(fsm, hello).await;
                        inner.sent_hello = true;
                    }
                    Err(e) => {
                        fsm.ctx.callbacks.on_error(e).await;
                        return (TransitionCode::InvalidDat, FsmState::Closed);
                    }
                }
            }
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForHello)
        }
        _ => (TransitionCode::NotConnected, inner.state),
    }
}

async fn wait_for_hello(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Message(IdscpMessage::Hello {
            dat,
            supported_ra,
            expected_ra,
        }) => {
            let required_level = fsm.ctx.config.security_requirements.required_security_level;
            let remaining = match fsm
                .ctx
                .dat_provider
                .verify(&dat, fsm.ctx.peer_cert_der.as_deref(), required_level)
                .await
            {
                Ok(remaining) => remaining,
                Err(e) => {
                    send_close(fsm, CauseCode::DatInvalid, "invalid DAT").await;
                    inner.pending_close_error = Some(e);
                    return (TransitionCode::InvalidDat, FsmState::Closed);
                }
            };

            if fsm.ctx.role == Role::Server && !inner.sent_hello {
                if let Ok(local_dat) = fsm.ctx.dat_provider.acquire().await {
                    let hello = IdscpMessage::Hello {
                        dat: local_dat,
                        supported_ra: fsm.ctx.config.supported_ra_suites.clone(),
                        expected_ra: fsm.ctx.config.expected_ra_suites.clone(),
                    };
                    fsm_send(fsm, hello).await;
                    inner.sent_hello = true;
                }
            }

            let (prover_suite, verifier_suite) = match negotiate_suite_for_hello(
                &fsm.ctx.config.supported_ra_suites,
                &fsm.ctx.config.expected_ra_suites,
                &supported_ra,
                &expected_ra,
            ) {
                Some(pair) => pair,
                None => {
                    send_close(fsm, CauseCode::HandshakeFailed, "no common RA suite").await;
                    inner.pending_close_error = Some(Idscp2Error::HandshakeFailed(
                        "could not negotiate a common remote attestation suite".into(),
                    ));
                    return (TransitionCode::RaError, FsmState::Closed);
                }
            };

            inner.negotiated_prover_suite = Some(prover_suite.clone());
            inner.negotiated_verifier_suite = Some(verifier_suite.clone());

            match start_prover_and_verifier(fsm, inner, &prover_suite, &verifier_suite).await {
                Ok(()) => {}
                Err(e) => {
                    send_close(fsm, CauseCode::RaProverFailed, "could not start RA drivers").await;
                    inner.pending_close_error = Some(e);
                    return (TransitionCode::RaError, FsmState::Closed);
                }
            }

            fsm.schedule_dat_timer(inner, remaining);
            (TransitionCode::Ok, FsmState::WaitForRa)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("peer Hello"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForHello, &other),
    }
}

async fn start_prover_and_verifier(
    fsm: &Arc<Fsm>,
    inner: &mut FsmInner,
    prover_suite: &str,
    verifier_suite: &str,
) -> Result<(), Idscp2Error> {
    inner.prover_generation = inner.prover_generation.wrapping_add(1);
    inner.verifier_generation = inner.verifier_generation.wrapping_add(1);
    let prover = fsm
        .ctx
        .ra_registry
        .start_prover(prover_suite, prover_listener(fsm.clone(), inner.prover_generation))
        .await?;
    let verifier = fsm
        .ctx
        .ra_registry
        .start_verifier(verifier_suite, verifier_listener(fsm.clone(), inner.verifier_generation))
        .await?;
    inner.prover = Some(prover);
    inner.verifier = Some(verifier);
    inner.prover_ok = false;
    inner.verifier_ok = false;
    Ok(())
}

/// Shared by every state that can conclude the handshake: cancels the bounding timer
/// and, if a send was buffered while the connection was not yet ready, begins it.
async fn enter_established_or_ack(fsm: &Arc<Fsm>, inner: &mut FsmInner) -> FsmState {
    inner.handshake_timer.cancel();
    if let Some(payload) = inner.send_buffer.take() {
        begin_send(fsm, inner, payload).await
    } else {
        FsmState::Established
    }
}

async fn begin_send(fsm: &Arc<Fsm>, inner: &mut FsmInner, payload: Vec<u8>) -> FsmState {
    if fsm.ctx.config.ack_mode_enabled {
        let bit = inner.local_alternating_bit;
        let msg = IdscpMessage::Data {
            payload: payload.clone(),
            alternating_bit: bit,
        };
        fsm_send(fsm, msg).await;
        inner.pending_ack_payload = Some(payload);
        inner.ack_retransmits = 0;
        fsm.schedule_ack_timer(inner);
        FsmState::WaitForAck
    } else {
        let msg = IdscpMessage::Data {
            payload,
            alternating_bit: false,
        };
        fsm_send(fsm, msg).await;
        FsmState::Established
    }
}

async fn wait_for_ra(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        // Cross-wired by sender role: a peer's prover frame is consumed by our
        // verifier, and a peer's verifier frame is consumed by our prover.
        FsmEvent::Message(IdscpMessage::RaProver { data }) => {
            if let Some(v) = inner.verifier.clone() {
                spawn_delegate(v, data);
            }
            (TransitionCode::Ok, FsmState::WaitForRa)
        }
        FsmEvent::Message(IdscpMessage::RaVerifier { data }) => {
            if let Some(p) = inner.prover.clone() {
                spawn_delegate(p, data);
            }
            (TransitionCode::Ok, FsmState::WaitForRa)
        }
        FsmEvent::RaProverMsg(data) => {
            fsm_send(fsm, IdscpMessage::RaProver { data }).await;
            (TransitionCode::Ok, FsmState::WaitForRa)
        }
        FsmEvent::RaVerifierMsg(data) => {
            fsm_send(fsm, IdscpMessage::RaVerifier { data }).await;
            (TransitionCode::Ok, FsmState::WaitForRa)
        }
        FsmEvent::RaProverOk => {
            inner.prover_ok = true;
            if inner.verifier_ok {
                let next = enter_established_or_ack(fsm, inner).await;
                (TransitionCode::Ok, next)
            } else {
                fsm.schedule_verifier_handshake_timer(inner);
                (TransitionCode::Ok, FsmState::WaitForRaVerifier)
            }
        }
        FsmEvent::RaVerifierOk => {
            // The dat_timer is left running: it tracks the peer DAT's own wall-clock
            // validity, which does not stop counting down just because our verifier
            // has concluded, and must still protect an already-`Established` session.
            inner.verifier_ok = true;
            if inner.prover_ok {
                let next = enter_established_or_ack(fsm, inner).await;
                fsm.schedule_ra_timer(inner);
                (TransitionCode::Ok, next)
            } else {
                (TransitionCode::Ok, FsmState::WaitForRaProver)
            }
        }
        FsmEvent::RaProverFailed(reason) => {
            send_close(fsm, CauseCode::RaProverFailed, &reason).await;
            inner.pending_close_error = Some(Idscp2Error::Ra(reason));
            (TransitionCode::RaError, FsmState::Closed)
        }
        FsmEvent::RaVerifierFailed(reason) => {
            send_close(fsm, CauseCode::RaVerifierFailed, &reason).await;
            inner.pending_close_error = Some(Idscp2Error::Ra(reason));
            (TransitionCode::RaError, FsmState::Closed)
        }
        FsmEvent::DatTimerExpired => {
            if let Some(v) = inner.verifier.take() {
                tokio::spawn(async move { v.stop().await });
            }
            inner.verifier_ok = false;
            fsm_send(fsm, IdscpMessage::DatExpired).await;
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("remote attestation"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForRa, &other),
    }
}

async fn wait_for_ra_prover(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Message(IdscpMessage::RaVerifier { data }) => {
            if let Some(p) = inner.prover.clone() {
                spawn_delegate(p, data);
            }
            (TransitionCode::Ok, FsmState::WaitForRaProver)
        }
        FsmEvent::Message(IdscpMessage::RaProver { .. }) => {
            // Our verifier already concluded and was stopped; a straggler from the
            // peer's prover has nothing left to talk to.
            (TransitionCode::Ok, FsmState::WaitForRaProver)
        }
        FsmEvent::RaProverMsg(data) => {
            fsm_send(fsm, IdscpMessage::RaProver { data }).await;
            (TransitionCode::Ok, FsmState::WaitForRaProver)
        }
        FsmEvent::RaProverOk => {
            inner.prover_ok = true;
            let next = enter_established_or_ack(fsm, inner).await;
            fsm.schedule_ra_timer(inner);
            (TransitionCode::Ok, next)
        }
        FsmEvent::RaProverFailed(reason) => {
            send_close(fsm, CauseCode::RaProverFailed, &reason).await;
            inner.pending_close_error = Some(Idscp2Error::Ra(reason));
            (TransitionCode::RaError, FsmState::Closed)
        }
        // Mirrors `wait_for_ra_verifier`'s own `DatTimerExpired` arm: the dat_timer is
        // left running across `RaVerifierOk` specifically so it can still fire while
        // we sit here waiting on the local prover, and it must not be dropped silently
        // now that it has (spec §4.6; the prover side of the refresh cycle resumes via
        // `wait_for_dat_and_ra`, same as the pre-handshake `wait_for_ra` arm).
        FsmEvent::DatTimerExpired => {
            if let Some(v) = inner.verifier.take() {
                tokio::spawn(async move { v.stop().await });
            }
            inner.verifier_ok = false;
            fsm_send(fsm, IdscpMessage::DatExpired).await;
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("local remote attestation"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForRaProver, &other),
    }
}

async fn wait_for_ra_verifier(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Message(IdscpMessage::RaProver { data }) => {
            if let Some(v) = inner.verifier.clone() {
                spawn_delegate(v, data);
            }
            (TransitionCode::Ok, FsmState::WaitForRaVerifier)
        }
        FsmEvent::Message(IdscpMessage::RaVerifier { .. }) => {
            (TransitionCode::Ok, FsmState::WaitForRaVerifier)
        }
        FsmEvent::RaVerifierMsg(data) => {
            fsm_send(fsm, IdscpMessage::RaVerifier { data }).await;
            (TransitionCode::Ok, FsmState::WaitForRaVerifier)
        }
        FsmEvent::RaVerifierOk => {
            // The dat_timer is left running here too, for the same reason as
            // `wait_for_ra`'s `RaVerifierOk` arm: it tracks the peer DAT's own
            // wall-clock validity, which keeps counting down regardless of which RA
            // driver happens to finish last, and must still protect the session once
            // it reaches `Established`/`WaitForAck`.
            inner.verifier_handshake_timer.cancel();
            inner.verifier_ok = true;
            let next = enter_established_or_ack(fsm, inner).await;
            fsm.schedule_ra_timer(inner);
            (TransitionCode::Ok, next)
        }
        FsmEvent::RaVerifierFailed(reason) => {
            send_close(fsm, CauseCode::RaVerifierFailed, &reason).await;
            inner.pending_close_error = Some(Idscp2Error::Ra(reason));
            (TransitionCode::RaError, FsmState::Closed)
        }
        FsmEvent::DatTimerExpired => {
            if let Some(v) = inner.verifier.take() {
                tokio::spawn(async move { v.stop().await });
            }
            inner.verifier_ok = false;
            fsm_send(fsm, IdscpMessage::DatExpired).await;
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForDatAndRaVerifier)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("remote attestation"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForRaVerifier, &other),
    }
}

async fn resume_verifier_after_fresh_dat(
    fsm: &Arc<Fsm>,
    inner: &mut FsmInner,
    token: Vec<u8>,
) -> (TransitionCode, FsmState) {
    let required_level = fsm.ctx.config.security_requirements.required_security_level;
    let remaining = match fsm
        .ctx
        .dat_provider
        .verify(&token, fsm.ctx.peer_cert_der.as_deref(), required_level)
        .await
    {
        Ok(remaining) => remaining,
        Err(e) => {
            send_close(fsm, CauseCode::DatInvalid, "invalid DAT").await;
            inner.pending_close_error = Some(e);
            return (TransitionCode::InvalidDat, FsmState::Closed);
        }
    };

    let suite = match inner.negotiated_verifier_suite.clone() {
        Some(suite) => suite,
        None => {
            inner.pending_close_error = Some(Idscp2Error::HandshakeFailed(
                "no negotiated verifier suite to resume".into(),
            ));
            return (TransitionCode::RaError, FsmState::Closed);
        }
    };
    inner.verifier_generation = inner.verifier_generation.wrapping_add(1);
    let verifier = match fsm
        .ctx
        .ra_registry
        .start_verifier(&suite, verifier_listener(fsm.clone(), inner.verifier_generation))
        .await
    {
        Ok(v) => v,
        Err(e) => {
            send_close(fsm, CauseCode::RaVerifierFailed, "could not restart verifier").await;
            inner.pending_close_error = Some(e);
            return (TransitionCode::RaError, FsmState::Closed);
        }
    };
    inner.verifier = Some(verifier);
    inner.verifier_ok = false;
    fsm.schedule_dat_timer(inner, remaining);

    let next = if inner.prover_ok {
        FsmState::WaitForRaVerifier
    } else {
        FsmState::WaitForRa
    };
    (TransitionCode::Ok, next)
}

async fn wait_for_dat_and_ra(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Message(IdscpMessage::Dat { token }) => resume_verifier_after_fresh_dat(fsm, inner, token).await,
        FsmEvent::Message(IdscpMessage::RaVerifier { .. }) => (TransitionCode::Ok, FsmState::WaitForDatAndRa),
        FsmEvent::RaProverMsg(data) => {
            fsm_send(fsm, IdscpMessage::RaProver { data }).await;
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        FsmEvent::RaProverOk => {
            inner.prover_ok = true;
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        FsmEvent::RaProverFailed(reason) => {
            send_close(fsm, CauseCode::RaProverFailed, &reason).await;
            inner.pending_close_error = Some(Idscp2Error::Ra(reason));
            (TransitionCode::RaError, FsmState::Closed)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("fresh peer DAT"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForDatAndRa, &other),
    }
}

async fn wait_for_dat_and_ra_verifier(
    fsm: &Arc<Fsm>,
    inner: &mut FsmInner,
    event: FsmEvent,
) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::Message(IdscpMessage::Dat { token }) => resume_verifier_after_fresh_dat(fsm, inner, token).await,
        FsmEvent::Message(IdscpMessage::RaProver { .. }) => {
            (TransitionCode::Ok, FsmState::WaitForDatAndRaVerifier)
        }
        FsmEvent::Timeout => {
            send_close(fsm, CauseCode::Timeout, "handshake timeout").await;
            inner.pending_close_error = Some(Idscp2Error::Timeout("fresh peer DAT"));
            (TransitionCode::Timeout, FsmState::Closed)
        }
        other => stray(FsmState::WaitForDatAndRaVerifier, &other),
    }
}

/// Restarts the local prover, used by both `ReRa` (peer-requested) and a locally
/// expiring `ra_timer` (`RepeatRa`), and by an incoming `DatExpired` from the peer.
async fn restart_prover(fsm: &Arc<Fsm>, inner: &mut FsmInner) -> Result<(), Idscp2Error> {
    if let Some(p) = inner.prover.take() {
        tokio::spawn(async move { p.stop().await });
    }
    inner.prover_ok = false;
    let suite = inner
        .negotiated_prover_suite
        .clone()
        .ok_or_else(|| Idscp2Error::HandshakeFailed("no negotiated prover suite to restart".into()))?;
    inner.prover_generation = inner.prover_generation.wrapping_add(1);
    let prover = fsm
        .ctx
        .ra_registry
        .start_prover(&suite, prover_listener(fsm.clone(), inner.prover_generation))
        .await?;
    inner.prover = Some(prover);
    Ok(())
}

async fn established(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::SendData(payload) => {
            let next = begin_send(fsm, inner, payload).await;
            (TransitionCode::Ok, next)
        }
        FsmEvent::Message(IdscpMessage::Data {
            payload,
            alternating_bit,
        }) => {
            deliver_data(fsm, inner, payload, alternating_bit).await;
            (TransitionCode::Ok, FsmState::Established)
        }
        FsmEvent::Message(IdscpMessage::ReRa { .. }) | FsmEvent::RepeatRa => {
            inner.ra_timer.cancel();
            match restart_prover(fsm, inner).await {
                Ok(()) => (TransitionCode::Ok, FsmState::WaitForRa),
                Err(e) => {
                    send_close(fsm, CauseCode::RaProverFailed, "could not restart RA").await;
                    inner.pending_close_error = Some(e);
                    (TransitionCode::RaError, FsmState::Closed)
                }
            }
        }
        FsmEvent::Message(IdscpMessage::DatExpired) => {
            inner.ra_timer.cancel();
            if let Ok(local_dat) = fsm.ctx.dat_provider.acquire().await {
                fsm_send(fsm, IdscpMessage::Dat { token: local_dat }).await;
            }
            match restart_prover(fsm, inner).await {
                Ok(()) => (TransitionCode::Ok, FsmState::WaitForRa),
                Err(e) => {
                    send_close(fsm, CauseCode::RaProverFailed, "could not restart RA").await;
                    inner.pending_close_error = Some(e);
                    (TransitionCode::RaError, FsmState::Closed)
                }
            }
        }
        // The peer's DAT is about to expire from our verifier's point of view (spec
        // §8 scenario 2). Same shape as the pre-handshake arm in `wait_for_ra`: stop
        // the stale verifier, tell the peer, and wait for its fresh `Dat`. The local
        // prover is untouched; `restart_prover` only ever runs on our own DAT cycle.
        FsmEvent::DatTimerExpired => {
            if let Some(v) = inner.verifier.take() {
                tokio::spawn(async move { v.stop().await });
            }
            inner.verifier_ok = false;
            fsm_send(fsm, IdscpMessage::DatExpired).await;
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        other => stray(FsmState::Established, &other),
    }
}

async fn wait_for_ack(fsm: &Arc<Fsm>, inner: &mut FsmInner, event: FsmEvent) -> (TransitionCode, FsmState) {
    match event {
        FsmEvent::SendData(payload) => {
            // At most one outstanding message (spec §9): buffer and flush on Ack.
            inner.send_buffer = Some(payload);
            (TransitionCode::Ok, FsmState::WaitForAck)
        }
        FsmEvent::Message(IdscpMessage::Ack { alternating_bit }) => {
            if alternating_bit != inner.local_alternating_bit {
                // Stale ack for an earlier round; still outstanding.
                return (TransitionCode::Ok, FsmState::WaitForAck);
            }
            inner.ack_timer.cancel();
            inner.pending_ack_payload = None;
            inner.ack_retransmits = 0;
            inner.local_alternating_bit = !inner.local_alternating_bit;
            let next = enter_established_or_ack(fsm, inner).await;
            (TransitionCode::Ok, next)
        }
        FsmEvent::AckTimerExpired => {
            if inner.ack_retransmits >= fsm.ctx.config.ack_max_retransmits {
                send_close(fsm, CauseCode::Timeout, "ack retransmit limit exceeded").await;
                inner.pending_close_error = Some(Idscp2Error::Timeout("Ack"));
                return (TransitionCode::Timeout, FsmState::Closed);
            }
            if let Some(payload) = inner.pending_ack_payload.clone() {
                let msg = IdscpMessage::Data {
                    payload,
                    alternating_bit: inner.local_alternating_bit,
                };
                fsm_send(fsm, msg).await;
                inner.ack_retransmits += 1;
                fsm.schedule_ack_timer(inner);
            }
            (TransitionCode::Ok, FsmState::WaitForAck)
        }
        FsmEvent::Message(IdscpMessage::Data {
            payload,
            alternating_bit,
        }) => {
            // The peer may have a message in flight the other direction too.
            deliver_data(fsm, inner, payload, alternating_bit).await;
            (TransitionCode::Ok, FsmState::WaitForAck)
        }
        FsmEvent::Message(IdscpMessage::ReRa { .. }) | FsmEvent::RepeatRa => {
            inner.ack_timer.cancel();
            inner.ra_timer.cancel();
            match restart_prover(fsm, inner).await {
                Ok(()) => (TransitionCode::Ok, FsmState::WaitForRa),
                Err(e) => {
                    send_close(fsm, CauseCode::RaProverFailed, "could not restart RA").await;
                    inner.pending_close_error = Some(e);
                    (TransitionCode::RaError, FsmState::Closed)
                }
            }
        }
        FsmEvent::Message(IdscpMessage::DatExpired) => {
            inner.ack_timer.cancel();
            inner.ra_timer.cancel();
            if let Ok(local_dat) = fsm.ctx.dat_provider.acquire().await {
                fsm_send(fsm, IdscpMessage::Dat { token: local_dat }).await;
            }
            match restart_prover(fsm, inner).await {
                Ok(()) => (TransitionCode::Ok, FsmState::WaitForRa),
                Err(e) => {
                    send_close(fsm, CauseCode::RaProverFailed, "could not restart RA").await;
                    inner.pending_close_error = Some(e);
                    (TransitionCode::RaError, FsmState::Closed)
                }
            }
        }
        // Same DAT-refresh trigger as `established`. An outstanding un-acked Data is
        // not dropped: it is carried into `send_buffer` so `enter_established_or_ack`
        // resends it once the refresh cycle completes, rather than being abandoned
        // with the `ack_timer` it was waiting on.
        FsmEvent::DatTimerExpired => {
            inner.ack_timer.cancel();
            if inner.send_buffer.is_none() {
                inner.send_buffer = inner.pending_ack_payload.take();
            }
            inner.ack_retransmits = 0;
            if let Some(v) = inner.verifier.take() {
                tokio::spawn(async move { v.stop().await });
            }
            inner.verifier_ok = false;
            fsm_send(fsm, IdscpMessage::DatExpired).await;
            fsm.schedule_handshake_timer(inner);
            (TransitionCode::Ok, FsmState::WaitForDatAndRa)
        }
        other => stray(FsmState::WaitForAck, &other),
    }
}

/// Delivers an inbound `Data` frame exactly once to the application listener even
/// under retransmission, and (in ACK mode) always re-sends the matching `Ack`.
async fn deliver_data(fsm: &Arc<Fsm>, inner: &mut FsmInner, payload: Vec<u8>, bit: bool) {
    let is_duplicate = inner.peer_last_delivered_bit == Some(bit);
    if !is_duplicate {
        fsm.ctx.callbacks.on_app_message(payload).await;
        inner.peer_last_delivered_bit = Some(bit);
    }
    if fsm.ctx.config.ack_mode_enabled {
        fsm_send(fsm, IdscpMessage::Ack { alternating_bit: bit }).await;
    }
}
