//! Compact JWS assembly for challenge, pairing and authentication signatures
//!
//! The signer only ever sees the SHA-256 digest of the signing input; the
//! returned signature must be the raw `r || s` concatenation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Signature algorithm declared in the JWS header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JwsAlgorithm {
    /// ECDSA on brainpoolP256r1 with SHA-256 (health card key)
    #[serde(rename = "BP256R1")]
    Bp256r1,
    /// ECDSA on P-256 with SHA-256 (device key)
    #[serde(rename = "ES256")]
    Es256,
}

impl JwsAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            JwsAlgorithm::Bp256r1 => "BP256R1",
            JwsAlgorithm::Es256 => "ES256",
        }
    }
}

/// JOSE header of the signed payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: JwsAlgorithm,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

impl JwsHeader {
    /// Header for a signed challenge: a nested JWT carrying the card certificate
    pub fn nested_jwt(alg: JwsAlgorithm, certificate_x5c: String) -> Self {
        Self {
            alg,
            typ: "JWT".to_string(),
            cty: Some("NJWT".to_string()),
            x5c: Some(vec![certificate_x5c]),
        }
    }

    /// Plain JWT header without certificate
    pub fn jwt(alg: JwsAlgorithm) -> Self {
        Self {
            alg,
            typ: "JWT".to_string(),
            cty: None,
            x5c: None,
        }
    }
}

/// `header.payload` part of a compact JWS awaiting its signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwsSigningInput {
    input: String,
}

impl JwsSigningInput {
    pub fn new<P: Serialize>(header: &JwsHeader, payload: &P) -> Result<Self> {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
        Ok(Self {
            input: format!("{}.{}", header, payload),
        })
    }

    /// Signing input of a challenge signature (`{"njwt": challenge}`)
    pub fn for_challenge(header: &JwsHeader, challenge: &str) -> Result<Self> {
        Self::new(header, &serde_json::json!({ "njwt": challenge }))
    }

    pub fn as_str(&self) -> &str {
        &self.input
    }

    /// SHA-256 digest handed to the signer
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.input.as_bytes()).into()
    }

    /// Append the signature and return the compact serialization
    pub fn finish(self, signature: &[u8]) -> String {
        format!("{}.{}", self.input, URL_SAFE_NO_PAD.encode(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_part(part: &str) -> serde_json::Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn test_challenge_signing_input() {
        let header = JwsHeader::nested_jwt(JwsAlgorithm::Bp256r1, "MIIB".to_string());
        let input = JwsSigningInput::for_challenge(&header, "challenge.jwt.value").unwrap();

        let parts: Vec<&str> = input.as_str().split('.').collect();
        assert_eq!(parts.len(), 2);

        let header = decode_part(parts[0]);
        assert_eq!(header["alg"], "BP256R1");
        assert_eq!(header["typ"], "JWT");
        assert_eq!(header["cty"], "NJWT");
        assert_eq!(header["x5c"][0], "MIIB");

        let payload = decode_part(parts[1]);
        assert_eq!(payload["njwt"], "challenge.jwt.value");
    }

    #[test]
    fn test_plain_header_omits_optional_fields() {
        let json = serde_json::to_value(JwsHeader::jwt(JwsAlgorithm::Es256)).unwrap();
        assert_eq!(json["alg"], "ES256");
        assert!(json.get("cty").is_none());
        assert!(json.get("x5c").is_none());
    }

    #[test]
    fn test_finish_appends_signature() {
        let input = JwsSigningInput::new(&JwsHeader::jwt(JwsAlgorithm::Es256), &"x").unwrap();
        let digest = input.digest();
        let prefix = input.as_str().to_string();
        let compact = input.finish(&[0xAB; 64]);

        assert!(compact.starts_with(&prefix));
        assert_eq!(compact.split('.').count(), 3);
        assert_eq!(digest.to_vec(), Sha256::digest(prefix.as_bytes()).to_vec());
    }
}
