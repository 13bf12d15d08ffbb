// SPDX-License-Identifier: MIT
//! IDSCP2 (International Data Spaces Communication Protocol v2) core: a
//! mutually-authenticated, continuously re-attesting session protocol layered over
//! TLS 1.3, with DAT-based identity and pluggable remote attestation.
//!
//! Module layout follows the protocol's own components: [`codec`] frames the wire
//! messages, [`channel`] adapts a transport stream to the FSM, [`dat`] handles DAPS
//! token acquisition/verification, [`ra`] hosts the remote attestation driver
//! registry, [`timer`] provides race-free one-shot timers, [`fsm`] is the protocol
//! state machine itself, and [`connection`]/[`factory`] are the application-facing
//! surface.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dat;
pub mod error;
pub mod factory;
pub mod fsm;
pub mod ra;
pub mod timer;

pub use config::{Idscp2Configuration, SecurityProfile, SecurityRequirements};
pub use connection::{Connection, ConnectionListener, MessageListener};
pub use error::{Idscp2Error, Idscp2Result, TransitionCode};
pub use factory::{connect, Idscp2Deps, Idscp2Server};
pub use fsm::FsmState;
