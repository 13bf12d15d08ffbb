// SPDX-License-Identifier: MIT
// Configuration surface (spec §6 configuration table).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum acceptable peer security profile, ordered `Base < Trusted < TrustedPlus`
/// (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProfile {
    Base,
    Trusted,
    TrustedPlus,
}

impl SecurityProfile {
    pub fn parse(claim: &str) -> Option<Self> {
        match claim {
            "BASE_SECURITY_PROFILE" | "BASE" => Some(SecurityProfile::Base),
            "TRUSTED_SECURITY_PROFILE" | "TRUSTED" => Some(SecurityProfile::Trusted),
            "TRUSTED_PLUS_SECURITY_PROFILE" | "TRUSTED_PLUS" => Some(SecurityProfile::TrustedPlus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRequirements {
    pub required_security_level: Option<SecurityProfile>,
}

impl Default for SecurityRequirements {
    fn default() -> Self {
        SecurityRequirements {
            required_security_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Idscp2Configuration {
    /// ACK-wait window per Data message (ACK mode only).
    pub ack_timeout_delay_ms: u64,
    /// Upper bound on the pre-Established phase.
    pub handshake_timeout_delay_ms: u64,
    /// Inter-attestation period once Established.
    pub ra_timeout_delay_ms: u64,
    /// Fraction of DAT validity at which renewal is triggered, in (0, 1].
    pub daps_token_renewal_threshold: f64,
    /// Local RA capabilities offered in `Hello`, most-preferred first.
    pub supported_ra_suites: Vec<String>,
    /// RA capabilities required of the peer, most-preferred first.
    pub expected_ra_suites: Vec<String>,
    pub security_requirements: SecurityRequirements,
    pub hostname_verification_enabled: bool,
    /// Select IDS-framed vs. generic application envelope (out of core scope; carried
    /// through so an embedding application can branch on it).
    pub use_ids_messages: bool,
    /// Enable ACK-gated flow control for `Data` messages (spec §4.6 "ACK mode").
    pub ack_mode_enabled: bool,
    /// Bound on Data retransmissions before giving up with `Close(TIMEOUT)`.
    pub ack_max_retransmits: u32,
}

impl Default for Idscp2Configuration {
    fn default() -> Self {
        Idscp2Configuration {
            ack_timeout_delay_ms: 5_000,
            handshake_timeout_delay_ms: 30_000,
            ra_timeout_delay_ms: 3_600_000,
            daps_token_renewal_threshold: 0.9,
            supported_ra_suites: vec!["Dummy".to_string()],
            expected_ra_suites: vec!["Dummy".to_string()],
            security_requirements: SecurityRequirements::default(),
            hostname_verification_enabled: true,
            use_ids_messages: true,
            ack_mode_enabled: false,
            ack_max_retransmits: 3,
        }
    }
}

impl Idscp2Configuration {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_delay_ms)
    }

    pub fn ra_timeout(&self) -> Duration {
        Duration::from_millis(self.ra_timeout_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_delay_ms)
    }
}
