//! HTTP Signature implementation for `ActivityPub`.
//!
//! Implements draft-cavage-http-signatures for signing outbound requests
//! and verifying inbound ones. Verification accepts `rsa-sha256`,
//! `rsa-sha512` and `ed25519`; `hs2019` tries them in that order.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pkcs8::{
    DecodePrivateKey, DecodePublicKey, ObjectIdentifier,
    der::{Decode, Document},
    spki::SubjectPublicKeyInfoRef,
};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
};
use sha2::{Digest, Sha256, Sha512};
use signature::{SignatureEncoding, Signer, Verifier};
use tracing::debug;
use url::Url;

const ED25519_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// HTTP Signature error.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("Missing header: {0}")]
    MissingHeader(String),
    #[error("Invalid signature header")]
    InvalidSignatureHeader,
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Digest does not match body")]
    DigestMismatch,
}

impl From<SignatureError> for outpost_common::AppError {
    fn from(err: SignatureError) -> Self {
        Self::Signature(err.to_string())
    }
}

/// Signature algorithms accepted on inbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha256,
    RsaSha512,
    Ed25519,
}

impl Algorithm {
    /// Preference order used when the header does not name one.
    pub const PREFERENCE: [Self; 3] = [Self::RsaSha256, Self::RsaSha512, Self::Ed25519];

    fn parse(name: &str) -> Result<Option<Self>, SignatureError> {
        match name.to_ascii_lowercase().as_str() {
            "rsa-sha256" => Ok(Some(Self::RsaSha256)),
            "rsa-sha512" => Ok(Some(Self::RsaSha512)),
            "ed25519" => Ok(Some(Self::Ed25519)),
            "hs2019" => Ok(None),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// HTTP Signature signer for outgoing requests.
pub struct HttpSigner {
    private_key: RsaPrivateKey,
    key_id: String,
}

impl std::fmt::Debug for HttpSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl HttpSigner {
    /// Create a new HTTP signer from a PEM-encoded private key.
    pub fn new(private_key_pem: &str, key_id: impl Into<String>) -> Result<Self, SignatureError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| SignatureError::InvalidPrivateKey(e.to_string()))?;

        Ok(Self {
            private_key,
            key_id: key_id.into(),
        })
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign a request and return the `Host`, `Date`, `Digest` and `Signature` headers.
    ///
    /// `date` is the preformatted `Date` header value.
    pub fn sign_request(
        &self,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
        date: &str,
    ) -> Result<HeaderMap, SignatureError> {
        let host = url
            .host_str()
            .ok_or_else(|| SignatureError::InvalidUrl("No host in URL".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let query = url.query().map_or(String::new(), |q| format!("?{q}"));
        let request_target = format!("{} {}{query}", method.to_lowercase(), url.path());
        let digest = body.map(calculate_digest);

        let mut signed_headers = vec!["(request-target)", "host", "date"];
        let mut signing_parts = vec![
            format!("(request-target): {request_target}"),
            format!("host: {host}"),
            format!("date: {date}"),
        ];
        if let Some(digest) = &digest {
            signed_headers.push("digest");
            signing_parts.push(format!("digest: {digest}"));
        }
        let signing_string = signing_parts.join("\n");

        debug!(signing_string = %signing_string, "Signing string");

        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature_bytes = signing_key
            .try_sign(signing_string.as_bytes())
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
        let signature = BASE64.encode(signature_bytes.to_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            signed_headers.join(" "),
            signature
        );

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "host", &host)?;
        insert_header(&mut headers, "date", date)?;
        if let Some(digest) = &digest {
            insert_header(&mut headers, "digest", digest)?;
        }
        insert_header(&mut headers, "signature", &signature_header)?;

        Ok(headers)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), SignatureError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| SignatureError::MissingHeader(name.to_string()))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Parsed signature header components.
#[derive(Debug, Clone)]
pub struct SignatureComponents {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: String,
}

impl SignatureComponents {
    /// The first header a `method` request must sign that this signature leaves out.
    ///
    /// POSTs must cover `(request-target)`, `host`, `date` and `digest`.
    /// Everything else must cover `(request-target)` and `date`.
    #[must_use]
    pub fn missing_required_header(&self, method: &str) -> Option<&'static str> {
        let required: &[&'static str] = if method.eq_ignore_ascii_case("POST") {
            &["(request-target)", "host", "date", "digest"]
        } else {
            &["(request-target)", "date"]
        };
        required
            .iter()
            .copied()
            .find(|header| !self.headers.iter().any(|signed| signed == header))
    }
}

/// HTTP Signature verifier for incoming requests.
pub struct HttpVerifier;

impl HttpVerifier {
    /// Parse the Signature header into components.
    pub fn parse_signature_header(header: &str) -> Result<SignatureComponents, SignatureError> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers_list = None;
        let mut signature = None;

        // Parse key="value" pairs
        for part in header.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim_matches('"');
                match key.trim() {
                    "keyId" => key_id = Some(value.to_string()),
                    "algorithm" => algorithm = Some(value.to_string()),
                    "headers" => headers_list = Some(value.to_string()),
                    "signature" => signature = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Ok(SignatureComponents {
            key_id: key_id.ok_or(SignatureError::InvalidSignatureHeader)?,
            algorithm,
            headers: headers_list
                .unwrap_or_else(|| "date".to_string())
                .split_whitespace()
                .map(str::to_lowercase)
                .collect(),
            signature: signature.ok_or(SignatureError::InvalidSignatureHeader)?,
        })
    }

    /// Rebuild the string the peer signed.
    pub fn signing_string(
        components: &SignatureComponents,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> Result<String, SignatureError> {
        let mut signing_parts = Vec::with_capacity(components.headers.len());
        for header in &components.headers {
            let value = match header.as_str() {
                "(request-target)" => format!("{} {path_and_query}", method.to_lowercase()),
                h => headers
                    .get(h)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| SignatureError::MissingHeader(h.to_string()))?
                    .to_string(),
            };
            signing_parts.push(format!("{header}: {value}"));
        }
        Ok(signing_parts.join("\n"))
    }

    /// Verify a request signature against a PEM public key.
    ///
    /// Returns the algorithm that matched.
    pub fn verify(
        public_key_pem: &str,
        components: &SignatureComponents,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> Result<Algorithm, SignatureError> {
        let signing_string =
            Self::signing_string(components, method, path_and_query, headers)?;
        debug!(signing_string = %signing_string, "Verifying signing string");

        let signature_bytes = BASE64
            .decode(&components.signature)
            .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

        let candidates = match components.algorithm.as_deref().map(Algorithm::parse) {
            Some(Err(e)) => return Err(e),
            Some(Ok(Some(algorithm))) => vec![algorithm],
            Some(Ok(None)) | None => Algorithm::PREFERENCE.to_vec(),
        };

        let key = PublicKey::from_pem(public_key_pem)?;
        for algorithm in candidates {
            if key.verify(algorithm, signing_string.as_bytes(), &signature_bytes) {
                return Ok(algorithm);
            }
        }
        Err(SignatureError::VerificationFailed(
            "no accepted algorithm matched".to_string(),
        ))
    }
}

enum PublicKey {
    Rsa(RsaPublicKey),
    Ed25519(Vec<u8>),
}

impl PublicKey {
    fn from_pem(pem: &str) -> Result<Self, SignatureError> {
        let (_, document) = Document::from_pem(pem)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        let spki = SubjectPublicKeyInfoRef::from_der(document.as_bytes())
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;

        if spki.algorithm.oid == ED25519_OID {
            let raw = spki
                .subject_public_key
                .as_bytes()
                .ok_or_else(|| SignatureError::InvalidPublicKey("unaligned key bits".into()))?;
            return Ok(Self::Ed25519(raw.to_vec()));
        }

        RsaPublicKey::from_public_key_pem(pem)
            .map(Self::Rsa)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))
    }

    fn verify(&self, algorithm: Algorithm, message: &[u8], signature: &[u8]) -> bool {
        match (self, algorithm) {
            (Self::Rsa(key), Algorithm::RsaSha256) => RsaSignature::try_from(signature)
                .is_ok_and(|sig| VerifyingKey::<Sha256>::new(key.clone()).verify(message, &sig).is_ok()),
            (Self::Rsa(key), Algorithm::RsaSha512) => RsaSignature::try_from(signature)
                .is_ok_and(|sig| VerifyingKey::<Sha512>::new(key.clone()).verify(message, &sig).is_ok()),
            (Self::Ed25519(raw), Algorithm::Ed25519) => {
                aws_lc_rs::signature::UnparsedPublicKey::new(&aws_lc_rs::signature::ED25519, raw)
                    .verify(message, signature)
                    .is_ok()
            }
            _ => false,
        }
    }
}

/// Calculate SHA-256 digest of a body.
#[must_use]
pub fn calculate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Verify that a `Digest` header matches the body. SHA-256 and SHA-512 are accepted.
#[must_use]
pub fn verify_digest(body: &[u8], digest_header: &str) -> bool {
    digest_header.split(',').any(|entry| {
        let Some((algorithm, value)) = entry.trim().split_once('=') else {
            return false;
        };
        match algorithm.to_ascii_uppercase().as_str() {
            "SHA-256" => BASE64.encode(Sha256::digest(body)) == value,
            "SHA-512" => BASE64.encode(Sha512::digest(body)) == value,
            _ => false,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn generate_test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();

        (private_pem.to_string(), public_pem)
    }

    const DATE: &str = "Mon, 02 Jan 2006 15:04:05 GMT";

    #[test]
    fn test_sign_and_verify() {
        let (private_pem, public_pem) = generate_test_keypair();
        let signer = HttpSigner::new(&private_pem, "https://example.com/users/test#main-key").unwrap();

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let body = b"{\"type\":\"Create\"}";
        let headers = signer.sign_request("POST", &url, Some(body), DATE).unwrap();

        let sig_header = headers.get("signature").unwrap().to_str().unwrap();
        let components = HttpVerifier::parse_signature_header(sig_header).unwrap();

        let algorithm =
            HttpVerifier::verify(&public_pem, &components, "POST", "/inbox", &headers).unwrap();
        assert_eq!(algorithm, Algorithm::RsaSha256);
        assert!(verify_digest(body, headers.get("digest").unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_verify_rejects_tampered_target() {
        let (private_pem, public_pem) = generate_test_keypair();
        let signer = HttpSigner::new(&private_pem, "https://example.com/users/test#main-key").unwrap();

        let url = Url::parse("https://remote.example/users/a/inbox").unwrap();
        let headers = signer.sign_request("POST", &url, Some(b"{}"), DATE).unwrap();
        let components = HttpVerifier::parse_signature_header(
            headers.get("signature").unwrap().to_str().unwrap(),
        )
        .unwrap();

        assert!(
            HttpVerifier::verify(&public_pem, &components, "POST", "/users/b/inbox", &headers)
                .is_err()
        );
    }

    #[test]
    fn test_hs2019_falls_back_to_sha512() {
        let (private_pem, public_pem) = generate_test_keypair();
        let private_key = RsaPrivateKey::from_pkcs8_pem(&private_pem).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_static(DATE));
        let signing_string = format!("(request-target): get /outbox\ndate: {DATE}");
        let sig = SigningKey::<Sha512>::new(private_key)
            .try_sign(signing_string.as_bytes())
            .unwrap();
        let components = SignatureComponents {
            key_id: "https://example.com/users/test#main-key".into(),
            algorithm: Some("hs2019".into()),
            headers: vec!["(request-target)".into(), "date".into()],
            signature: BASE64.encode(sig.to_bytes()),
        };

        let algorithm =
            HttpVerifier::verify(&public_pem, &components, "GET", "/outbox", &headers).unwrap();
        assert_eq!(algorithm, Algorithm::RsaSha512);
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let (_, public_pem) = generate_test_keypair();
        let components = SignatureComponents {
            key_id: "k".into(),
            algorithm: Some("hmac-sha1".into()),
            headers: vec!["date".into()],
            signature: "AAAA".into(),
        };
        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_static(DATE));

        assert!(matches!(
            HttpVerifier::verify(&public_pem, &components, "GET", "/", &headers),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_parse_signature_header() {
        let header = r#"keyId="https://example.com/users/test#main-key",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="abc123==""#;

        let components = HttpVerifier::parse_signature_header(header).unwrap();

        assert_eq!(components.key_id, "https://example.com/users/test#main-key");
        assert_eq!(components.algorithm.as_deref(), Some("rsa-sha256"));
        assert_eq!(
            components.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
        assert_eq!(components.signature, "abc123==");
    }

    #[test]
    fn test_required_headers_by_method() {
        let signed = |headers: &str| SignatureComponents {
            key_id: "k".into(),
            algorithm: None,
            headers: headers.split_whitespace().map(String::from).collect(),
            signature: "AAAA".into(),
        };

        let full = signed("(request-target) host date digest");
        assert_eq!(full.missing_required_header("POST"), None);
        assert_eq!(full.missing_required_header("GET"), None);

        assert_eq!(signed("date").missing_required_header("POST"), Some("(request-target)"));
        assert_eq!(
            signed("(request-target) host date").missing_required_header("post"),
            Some("digest")
        );
        assert_eq!(signed("").missing_required_header("GET"), Some("(request-target)"));
        assert_eq!(signed("(request-target) date").missing_required_header("GET"), None);
    }

    #[test]
    fn test_verify_digest() {
        let body = b"hello world";
        let digest = calculate_digest(body);
        assert!(verify_digest(body, &digest));
        assert!(!verify_digest(b"wrong body", &digest));
    }
}
