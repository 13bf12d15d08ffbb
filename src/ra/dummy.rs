// SPDX-License-Identifier: MIT
// A driver that succeeds immediately, for tests and as documentation of the driver
// contract (spec §8 scenario 1 uses the "Dummy" suite).

use super::{RaDriver, RaDriverListener, RaProverDriverFactory, RaVerifierDriverFactory};
use crate::error::Idscp2Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct DummyDriverFactory;

impl RaProverDriverFactory for DummyDriverFactory {
    fn build(&self, _config: Option<Value>, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>> {
        Ok(Arc::new(DummyDriver { listener }))
    }
}

impl RaVerifierDriverFactory for DummyDriverFactory {
    fn build(&self, _config: Option<Value>, listener: Arc<dyn RaDriverListener>) -> Idscp2Result<Arc<dyn RaDriver>> {
        Ok(Arc::new(DummyDriver { listener }))
    }
}

struct DummyDriver {
    listener: Arc<dyn RaDriverListener>,
}

#[async_trait]
impl RaDriver for DummyDriver {
    async fn start(&self) {
        self.listener.on_success().await;
    }

    async fn delegate(&self, _data: Vec<u8>) {
        // The dummy driver never needs a peer round-trip; anything delegated to it is
        // ignored rather than treated as an error, since a lagging peer may still send
        // a stray frame after we have already concluded.
    }

    async fn stop(&self) {}
}
