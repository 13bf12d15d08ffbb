// SPDX-License-Identifier: MIT
// Connector UUID derivation from a local TLS certificate's SKI/AKI extensions
// (spec §4.3).

use crate::error::Idscp2Error;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::X509Certificate;
use x509_parser::traits::FromDer;

/// `upper(hex(SKI)) + "keyid:" + upper(hex(AKI))`, each half colon-beautified
/// (`AA:BB:CC`) with no trailing colon.
pub fn connector_uuid_from_cert(cert_der: &[u8]) -> Result<String, Idscp2Error> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Idscp2Error::Certificate(format!("failed to parse certificate: {e}")))?;

    let ski = subject_key_identifier(&cert)
        .ok_or_else(|| Idscp2Error::Certificate("certificate has no Subject Key Identifier".into()))?;
    let aki = authority_key_identifier(&cert)
        .ok_or_else(|| Idscp2Error::Certificate("certificate has no Authority Key Identifier".into()))?;

    Ok(format!("{}keyid:{}", hex_colon(ski), hex_colon(aki)))
}

fn subject_key_identifier<'a>(cert: &'a X509Certificate<'a>) -> Option<&'a [u8]> {
    cert.tbs_certificate.extensions().iter().find_map(|ext| {
        if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
            Some(ski.0)
        } else {
            None
        }
    })
}

fn authority_key_identifier<'a>(cert: &'a X509Certificate<'a>) -> Option<&'a [u8]> {
    cert.tbs_certificate.extensions().iter().find_map(|ext| {
        if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
            aki.key_identifier.as_ref().map(|id| id.0)
        } else {
            None
        }
    })
}

fn hex_colon(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
