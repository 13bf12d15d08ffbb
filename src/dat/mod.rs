// SPDX-License-Identifier: MIT
// DAT provider (C3): acquisition from DAPS, threshold-based caching, and verification
// of peer-presented DATs.

pub mod claims;
pub mod identity;

use crate::config::SecurityProfile;
use crate::error::{Idscp2Error, Idscp2Result};
use base64::Engine;
use claims::{DatClaims, StringOrList, AUDIENCE_IDS_CONNECTORS_ALL, DAPS_SCOPE};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;
use url::Url;

const DAT_VALIDITY: Duration = Duration::from_secs(24 * 3600);
const METADATA_FALLBACK_TTL: Duration = Duration::from_secs(24 * 3600);
const METADATA_DEFAULT_TTL: Duration = Duration::from_secs(300);
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
struct DapsMetadata {
    token_endpoint: String,
    jwks_uri: String,
    issuer: String,
}

struct CachedMetadata {
    metadata: DapsMetadata,
    expires_at: SystemTime,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: SystemTime,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    token: Vec<u8>,
    renewal_time: SystemTime,
}

/// Acquires, caches, and verifies DATs on behalf of one local identity (spec §4.3).
pub struct DatProvider {
    daps_url: String,
    connector_uuid: String,
    encoding_key: EncodingKey,
    renewal_threshold: f64,
    http: Client,
    metadata: RwLock<Option<CachedMetadata>>,
    jwks: RwLock<Option<CachedJwks>>,
    /// `Mutex` rather than a spinning compare-and-swap: spec §4.3 requires the cache
    /// lock be "fair to prevent starvation under burst", which `tokio::sync::Mutex`
    /// provides via FIFO waiter queueing.
    current: Mutex<Option<CachedToken>>,
}

impl DatProvider {
    pub fn new(
        daps_url: impl Into<String>,
        connector_uuid: impl Into<String>,
        encoding_key: EncodingKey,
        renewal_threshold: f64,
    ) -> Self {
        DatProvider {
            daps_url: daps_url.into(),
            connector_uuid: connector_uuid.into(),
            encoding_key,
            renewal_threshold,
            http: Client::new(),
            metadata: RwLock::new(None),
            jwks: RwLock::new(None),
            current: Mutex::new(None),
        }
    }

    #[instrument(skip(self))]
    async fn metadata(&self) -> Idscp2Result<DapsMetadata> {
        {
            let guard = self.metadata.read().await;
            if let Some(cached) = guard.as_ref() {
                if SystemTime::now() < cached.expires_at {
                    return Ok(cached.metadata.clone());
                }
            }
        }

        let base = daps_base_url(&self.daps_url)?;
        let discovery_url = base
            .join(".well-known/oauth-authorization-server")
            .map_err(|e| Idscp2Error::Certificate(format!("invalid DAPS url: {e}")))?;
        let resp = self.http.get(discovery_url).send().await?;

        let (metadata, ttl) = if resp.status() == reqwest::StatusCode::NOT_FOUND {
            (
                DapsMetadata {
                    token_endpoint: base
                        .join("token")
                        .map_err(|e| Idscp2Error::Certificate(format!("invalid DAPS url: {e}")))?
                        .to_string(),
                    jwks_uri: base
                        .join("jwks.json")
                        .map_err(|e| Idscp2Error::Certificate(format!("invalid DAPS url: {e}")))?
                        .to_string(),
                    issuer: self.daps_url.clone(),
                },
                METADATA_FALLBACK_TTL,
            )
        } else {
            let max_age = max_age_from_cache_control(resp.headers());
            let metadata: DapsMetadata = resp.error_for_status()?.json().await?;
            (metadata, max_age.unwrap_or(METADATA_DEFAULT_TTL))
        };

        let mut guard = self.metadata.write().await;
        *guard = Some(CachedMetadata {
            metadata: metadata.clone(),
            expires_at: SystemTime::now() + ttl,
        });
        Ok(metadata)
    }

    async fn jwks(&self, jwks_uri: &str) -> Idscp2Result<Vec<Jwk>> {
        {
            let guard = self.jwks.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed().unwrap_or(Duration::MAX) < JWKS_CACHE_TTL {
                    return Ok(cached.keys.clone());
                }
            }
        }
        let resp: JwksResponse = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut guard = self.jwks.write().await;
        *guard = Some(CachedJwks {
            keys: resp.keys.clone(),
            fetched_at: SystemTime::now(),
        });
        Ok(resp.keys)
    }

    /// Returns the cached DAT if `now < issued_at + validity * threshold` (I5), else
    /// fetches a fresh one from DAPS and replaces the cache.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Idscp2Result<Vec<u8>> {
        let mut guard = self.current.lock().await;
        if let Some(cached) = guard.as_ref() {
            if SystemTime::now() < cached.renewal_time {
                return Ok(cached.token.clone());
            }
        }

        let metadata = self.metadata().await?;
        let now = SystemTime::now();
        let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let claims = DatClaims {
            // The DAT is requested from DAPS and (in a real deployment) re-signed by it;
            // `iss` names the issuing DAPS authority, not the requesting connector.
            iss: metadata.issuer.clone(),
            sub: self.connector_uuid.clone(),
            aud: StringOrList::One(AUDIENCE_IDS_CONNECTORS_ALL.to_string()),
            iat: now_secs,
            nbf: now_secs,
            exp: now_secs + DAT_VALIDITY.as_secs() as i64,
            transport_certs_sha256: None,
            security_profile: None,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?;

        let params = [
            ("grant_type", "client_credentials"),
            ("client_assertion_type", "jwt-bearer"),
            ("client_assertion", assertion.as_str()),
            ("scope", DAPS_SCOPE),
        ];
        let resp: TokenResponse = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = resp.access_token.into_bytes();
        // DAPS is free to grant a different validity window than the one we asked for
        // in the client assertion above; trust what it actually issued by reading the
        // DAT's own `exp`, falling back to the requested window if it is unreadable.
        let validity = exp_from_token(&resp.access_token)
            .map(|exp| Duration::from_secs((exp - now_secs).max(0) as u64))
            .unwrap_or(DAT_VALIDITY);
        let renewal_delay_secs = (validity.as_secs() as f64 * self.renewal_threshold) as u64;
        *guard = Some(CachedToken {
            token: token.clone(),
            renewal_time: now + Duration::from_secs(renewal_delay_secs),
        });
        Ok(token)
    }

    /// Verifies a peer-presented DAT against JWKS, the accepted issuer/audience set,
    /// the peer's TLS certificate fingerprint (I6), and the configured minimum security
    /// level. Returns the token's remaining validity.
    #[instrument(skip(self, token, peer_cert_der))]
    pub async fn verify(
        &self,
        token: &[u8],
        peer_cert_der: Option<&[u8]>,
        required_level: Option<SecurityProfile>,
    ) -> Idscp2Result<Duration> {
        let token_str = std::str::from_utf8(token)
            .map_err(|_| Idscp2Error::InvalidDat("token is not valid utf-8".into()))?;

        let header = decode_header(token_str)?;
        if header.alg != Algorithm::RS256 {
            return Err(Idscp2Error::InvalidDat(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| Idscp2Error::InvalidDat("token has no kid".into()))?;

        let metadata = self.metadata().await?;
        let keys = self.jwks(&metadata.jwks_uri).await?;
        let jwk = keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| Idscp2Error::InvalidDat(format!("no JWKS key for kid {kid}")))?;
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 30;
        // Audience is an acceptance *set*, not a single expected value, so we disable
        // jsonwebtoken's built-in check and verify it ourselves below.
        validation.validate_aud = false;
        let data = decode::<DatClaims>(token_str, &decoding_key, &validation)?;
        let dat_claims = data.claims;

        if dat_claims.iss != metadata.issuer {
            return Err(Idscp2Error::InvalidDat(format!(
                "issuer {} does not match DAPS issuer {}",
                dat_claims.iss, metadata.issuer
            )));
        }
        if !dat_claims.has_accepted_audience() {
            return Err(Idscp2Error::InvalidDat("audience not in accepted set".into()));
        }
        if dat_claims.sub.is_empty() {
            return Err(Idscp2Error::InvalidDat("subject missing".into()));
        }

        if let Some(cert_der) = peer_cert_der {
            let fingerprint = hex::encode_upper(Sha256::digest(cert_der));
            let claim = dat_claims
                .transport_certs_sha256
                .as_ref()
                .ok_or_else(|| Idscp2Error::InvalidDat("transportCertsSha256 claim missing".into()))?;
            if !claim.iter().any(|c| c.eq_ignore_ascii_case(&fingerprint)) {
                return Err(Idscp2Error::InvalidDat(
                    "peer certificate fingerprint not bound by DAT".into(),
                ));
            }
        }

        if let Some(required) = required_level {
            let claim_level = dat_claims
                .security_profile
                .as_deref()
                .and_then(SecurityProfile::parse)
                .ok_or_else(|| Idscp2Error::InvalidDat("securityProfile claim missing or unrecognized".into()))?;
            if claim_level < required {
                return Err(Idscp2Error::InvalidDat(format!(
                    "peer security level {claim_level:?} below required {required:?}"
                )));
            }
        }

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let remaining = dat_claims.exp - now_secs;
        if remaining <= 0 {
            return Err(Idscp2Error::InvalidDat("token expired".into()));
        }
        Ok(Duration::from_secs(remaining as u64))
    }
}

/// Parses the configured DAPS base url, forcing a trailing slash so `Url::join` treats
/// it as a directory rather than replacing its last path segment.
fn daps_base_url(daps_url: &str) -> Idscp2Result<Url> {
    let normalized = if daps_url.ends_with('/') {
        daps_url.to_string()
    } else {
        format!("{daps_url}/")
    };
    Url::parse(&normalized).map_err(|e| Idscp2Error::Certificate(format!("invalid DAPS url: {e}")))
}

/// Reads the `exp` claim out of a JWT without verifying its signature. Only used on a
/// token this provider itself just received fresh from its own configured DAPS over an
/// authenticated connection; never used on peer-presented tokens, which go through the
/// full `verify()` path.
fn exp_from_token(token: &str) -> Option<i64> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    value.get("exp")?.as_i64()
}

fn max_age_from_cache_control(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
    value.split(',').find_map(|part| {
        part.trim()
            .strip_prefix("max-age=")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}
