//! JSON Web Key interchange (RFC 7517 / 7518) for RSA-OAEP-256 keys.
//!
//! Public keys travel inside `chatHandshake` payloads as JWK objects, in
//! the exact shape `crypto.subtle.exportKey("jwk", …)` produces:
//!
//! ```json
//! { "kty": "RSA", "alg": "RSA-OAEP-256", "e": "AQAB", "n": "…",
//!   "ext": true, "key_ops": ["encrypt"] }
//! ```
//!
//! Big integers are big-endian, base64url without padding.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::{CryptoError, KeyPair, PublicKey};

/// The only algorithm this crate speaks.
pub const JWK_ALG: &str = "RSA-OAEP-256";

/// An RSA JSON Web Key. Private fields are present only on exported key
/// pairs, never in handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    pub n: String,
    pub e: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_ops: Vec<String>,
}

impl Jwk {
    /// Parses a JWK from the JSON object carried in a handshake.
    pub fn from_json_object(
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, CryptoError> {
        serde_json::from_value(serde_json::Value::Object(object.clone()))
            .map_err(|e| CryptoError::InvalidKey(format!("malformed JWK: {e}")))
    }

    /// Renders this JWK as a JSON object for a handshake payload.
    pub fn to_json_object(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            // A struct of strings always serializes to an object.
            _ => serde_json::Map::new(),
        }
    }

    /// Whether this JWK carries private material.
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    fn check_algorithm(&self) -> Result<(), CryptoError> {
        if self.kty != "RSA" {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type {:?}",
                self.kty
            )));
        }
        match self.alg.as_deref() {
            None | Some(JWK_ALG) => Ok(()),
            Some(other) => Err(CryptoError::InvalidKey(format!(
                "unsupported algorithm {other:?}"
            ))),
        }
    }
}

fn encode_uint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_uint(field: &str, value: &str) -> Result<BigUint, CryptoError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| CryptoError::InvalidKey(format!("field {field}: {e}")))?;
    if bytes.is_empty() {
        return Err(CryptoError::InvalidKey(format!("field {field} is empty")));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, CryptoError> {
    value
        .as_deref()
        .ok_or_else(|| CryptoError::InvalidKey(format!("missing field {field}")))
}

impl PublicKey {
    /// Exports this key as a public JWK.
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "RSA".into(),
            alg: Some(JWK_ALG.into()),
            n: encode_uint(self.0.n()),
            e: encode_uint(self.0.e()),
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            ext: Some(true),
            key_ops: vec!["encrypt".into()],
        }
    }

    /// Imports a public key. Private fields, if present, are ignored.
    ///
    /// # Errors
    /// [`CryptoError::InvalidKey`] for a non-RSA key, a foreign algorithm,
    /// bad base64, or a modulus/exponent the RSA library rejects.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        jwk.check_algorithm()?;
        let n = decode_uint("n", &jwk.n)?;
        let e = decode_uint("e", &jwk.e)?;
        let key = RsaPublicKey::new(n, e)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(key))
    }
}

impl KeyPair {
    /// Shorthand for `self.public_key().to_jwk()`.
    pub fn public_jwk(&self) -> Jwk {
        self.public_key().to_jwk()
    }

    /// Exports the full key pair, including CRT parameters.
    pub fn to_jwk(&self) -> Jwk {
        let private = &self.private;
        let primes = private.primes();
        let mut jwk = self.public_jwk();
        jwk.d = Some(encode_uint(private.d()));
        jwk.key_ops = vec!["decrypt".into()];

        if let [p, q] = primes {
            let one = BigUint::from(1u32);
            let dp = private.d() % &(p - &one);
            let dq = private.d() % &(q - &one);
            // p is prime, so q^(p-2) mod p is q's inverse (Fermat).
            let two = BigUint::from(2u32);
            let qi = q.modpow(&(p - &two), p);

            jwk.p = Some(encode_uint(p));
            jwk.q = Some(encode_uint(q));
            jwk.dp = Some(encode_uint(&dp));
            jwk.dq = Some(encode_uint(&dq));
            jwk.qi = Some(encode_uint(&qi));
        }
        jwk
    }

    /// Imports a key pair from a private JWK.
    ///
    /// CRT parameters in the JWK are not trusted; they are recomputed from
    /// `d`, `p` and `q`.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        jwk.check_algorithm()?;
        let n = decode_uint("n", &jwk.n)?;
        let e = decode_uint("e", &jwk.e)?;
        let d = decode_uint("d", required("d", &jwk.d)?)?;
        let p = decode_uint("p", required("p", &jwk.p)?)?;
        let q = decode_uint("q", required("q", &jwk.q)?)?;

        let mut private = RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        private
            .validate()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        private
            .precompute()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self::from_private(private))
    }
}
