// SPDX-License-Identifier: MIT
// Error taxonomy for the IDSCP2 core (protocol, DAT, transport, timers).

use thiserror::Error;

/// Result codes returned by FSM transitions (spec §3 "Transition result").
///
/// This is distinct from [`Idscp2Error`]: a transition always completes and
/// moves (or stays in) a state, but it reports one of these codes to the
/// caller and/or the connection's error listener. Only a subset of codes
/// imply the FSM actually moved to `Closed` — see the transition tables in
/// `fsm::transitions` for which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCode {
    Ok,
    NotConnected,
    IoError,
    RaError,
    InvalidDat,
    Timeout,
    UnknownTransition,
}

#[derive(Debug, Error)]
pub enum Idscp2Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid DAT: {0}")]
    InvalidDat(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("remote attestation error: {0}")]
    Ra(String),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("unknown transition for event {event:?} in state {state:?}")]
    UnknownTransition { state: String, event: String },

    #[error("not connected")]
    NotConnected,

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("daps request failed: {0}")]
    Daps(#[from] reqwest::Error),

    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("driver error: {0}")]
    Driver(String),
}

impl Idscp2Error {
    pub fn code(&self) -> TransitionCode {
        match self {
            Idscp2Error::Io(_) | Idscp2Error::Daps(_) => TransitionCode::IoError,
            Idscp2Error::InvalidDat(_) | Idscp2Error::Jwt(_) | Idscp2Error::Certificate(_) => {
                TransitionCode::InvalidDat
            }
            Idscp2Error::HandshakeFailed(_) => TransitionCode::IoError,
            Idscp2Error::Ra(_) | Idscp2Error::Driver(_) => TransitionCode::RaError,
            Idscp2Error::Timeout(_) => TransitionCode::Timeout,
            Idscp2Error::UnknownTransition { .. } => TransitionCode::UnknownTransition,
            Idscp2Error::NotConnected => TransitionCode::NotConnected,
            Idscp2Error::Codec(_) => TransitionCode::IoError,
        }
    }
}

pub type Idscp2Result<T> = Result<T, Idscp2Error>;
