// SPDX-License-Identifier: MIT
// DAT claim set and the issuer/audience acceptance set (spec §4.3, §9 "Open question —
// DAT issuer matching": the acceptance set below is preserved verbatim and must not be
// narrowed).

use serde::{Deserialize, Serialize};

/// Audience string accepted for `aud` and used as the value we request; peers issued by
/// older DAPS deployments may still send the plain `"IDS_Connector"` form.
pub const AUDIENCE_IDS_CONNECTORS_ALL: &str = "idsc:IDS_CONNECTORS_ALL";
pub const AUDIENCE_IDS_CONNECTOR_LEGACY: &str = "IDS_Connector";
pub const DAPS_SCOPE: &str = "idsc:IDS_CONNECTOR_ATTRIBUTES_ALL";

/// A claim value the source DAT may encode either as a bare string or as a JSON array of
/// strings. Both forms must decode identically (spec §8 boundary behavior).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn contains(&self, needle: &str) -> bool {
        match self {
            StringOrList::One(s) => s == needle,
            StringOrList::Many(items) => items.iter().any(|s| s == needle),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            StringOrList::One(s) => Box::new(std::iter::once(s.as_str())),
            StringOrList::Many(items) => Box::new(items.iter().map(|s| s.as_str())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatClaims {
    pub iss: String,
    pub sub: String,
    pub aud: StringOrList,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(rename = "transportCertsSha256", skip_serializing_if = "Option::is_none")]
    pub transport_certs_sha256: Option<StringOrList>,
    #[serde(rename = "securityProfile", skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<String>,
}

impl DatClaims {
    /// True if `aud` contains any audience value from the (fixed, non-narrowable)
    /// acceptance set.
    pub fn has_accepted_audience(&self) -> bool {
        self.aud.contains(AUDIENCE_IDS_CONNECTORS_ALL) || self.aud.contains(AUDIENCE_IDS_CONNECTOR_LEGACY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_or_list_deserializes_both_forms() {
        let as_string: StringOrList = serde_json::from_str("\"abc\"").unwrap();
        let as_list: StringOrList = serde_json::from_str("[\"abc\",\"def\"]").unwrap();
        assert!(as_string.contains("abc"));
        assert!(as_list.contains("abc"));
        assert!(as_list.contains("def"));
        assert!(!as_string.contains("def"));
    }

    #[test]
    fn accepted_audience_set_includes_both_legacy_and_current_form() {
        let legacy = DatClaims {
            iss: "daps".into(),
            sub: "sub".into(),
            aud: StringOrList::One(AUDIENCE_IDS_CONNECTOR_LEGACY.into()),
            iat: 0,
            nbf: 0,
            exp: 0,
            transport_certs_sha256: None,
            security_profile: None,
        };
        assert!(legacy.has_accepted_audience());

        let current = DatClaims {
            aud: StringOrList::Many(vec![AUDIENCE_IDS_CONNECTORS_ALL.into()]),
            ..legacy
        };
        assert!(current.has_accepted_audience());
    }
}
