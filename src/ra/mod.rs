// SPDX-License-Identifier: MIT
// RA driver registry (C4): a named registry of prover/verifier driver factories.
//
// Kept as an explicit, constructor-injected registry (`Arc<RaDriverRegistry>`) rather
// than the process-wide singleton the Open Question in spec §9 flags — see DESIGN.md.

pub mod dummy;

use crate::error::{Idscp2Error, Idscp2Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Capability a running driver uses to report progress back into the FSM. The driver
/// holds this callback capability, never ownership of the FSM itself (spec §9).
#[async_trait]
pub trait RaDriverListener: Send + Sync {
    async fn on_message(&self, data: Vec<u8>);
    async fn on_success(&self);
    async fn on_failed(&self, reason: String);
}

/// A running prover or verifier worker (spec §3 "RA driver").
#[async_trait]
pub trait RaDriver: Send + Sync {
    async fn start(&self);
    /// Forwards a peer-originated RA frame into the driver. Called by the FSM from a
    /// freshly spawned task, never from inside a transition directly (spec §4.4, §9
    /// "Delegate re-entrancy").
    async fn delegate(&self, data: Vec<u8>);
    /// Must be idempotent and must not block (spec §4.4).
    async fn stop(&self);
}

pub trait RaProverDriverFactory: Send + Sync {
    fn build(&self, config: Option<Value>, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>>;
}

pub trait RaVerifierDriverFactory: Send + Sync {
    fn build(&self, config: Option<Value>, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>>;
}

struct ProverEntry {
    factory: Arc<dyn RaProverDriverFactory>,
    config: Option<Value>,
}

struct VerifierEntry {
    factory: Arc<dyn RaVerifierDriverFactory>,
    config: Option<Value>,
}

/// Process-wide by convention (one registry per embedding application), but passed in
/// via configuration rather than reached for as ambient global state.
pub struct RaDriverRegistry {
    provers: DashMap<String, ProverEntry>,
    verifiers: DashMap<String, VerifierEntry>,
}

impl RaDriverRegistry {
    pub fn new() -> Self {
        RaDriverRegistry {
            provers: DashMap::new(),
            verifiers: DashMap::new(),
        }
    }

    /// Registers a prover factory under `id`, replacing any prior entry.
    pub fn register_prover(&self, id: impl Into<String>, factory: Arc<dyn RaProverDriverFactory>, config: Option<Value>) {
        self.provers.insert(id.into(), ProverEntry { factory, config });
    }

    pub fn register_verifier(&self, id: impl Into<String>, factory: Arc<dyn RaVerifierDriverFactory>, config: Option<Value>) {
        self.verifiers.insert(id.into(), VerifierEntry { factory, config });
    }

    pub fn has_prover(&self, id: &str) -> bool {
        self.provers.contains_key(id)
    }

    pub fn has_verifier(&self, id: &str) -> bool {
        self.verifiers.contains_key(id)
    }

    pub async fn start_prover(&self, id: &str, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>> {
        let (factory, config) = {
            let entry = self
                .provers
                .get(id)
                .ok_or_else(|| Idscp2Error::Driver(format!("unknown prover driver '{id}'")))?;
            (entry.factory.clone(), entry.config.clone())
        };
        let driver = factory
            .build(config, listener)
            .map_err(|e| Idscp2Error::Driver(format!("failed to start prover driver '{id}': {e}")))?;
        spawn_start(driver.clone());
        Ok(driver)
    }

    pub async fn start_verifier(&self, id: &str, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>> {
        let (factory, config) = {
            let entry = self
                .verifiers
                .get(id)
                .ok_or_else(|| Idscp2Error::Driver(format!("unknown verifier driver '{id}'")))?;
            (entry.factory.clone(), entry.config.clone())
        };
        let driver = factory
            .build(config, listener)
            .map_err(|e| Idscp2Error::Driver(format!("failed to start verifier driver '{id}': {e}")))?;
        spawn_start(driver.clone());
        Ok(driver)
    }
}

impl Default for RaDriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered intersection of `local` (preference order) with `peer` (peer's own
/// preference order, which wins ties per spec §4.6 "peer preferences first").
pub fn negotiate_suite(local: &[String], peer: &[String]) -> Option<String> {
    peer.iter().find(|s| local.contains(s)).cloned()
}

/// Starts a driver from a freshly spawned task, exactly like `spawn_delegate` in
/// `fsm::mod` and for the same reason: `start()` may call `on_success`/`on_failed`
/// synchronously (the `Dummy` driver does), and that callback re-enters the FSM's
/// dispatch lock, which is still held by the transition that invoked us here.
fn spawn_start(driver: Arc<dyn RaDriver>) {
    tokio::spawn(async move {
        driver.start().await;
    });
}
