//! HTTP Signature wire codec
//!
//! Builds and parses the Signature and Digest headers and the canonical
//! signing string, per:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use http::HeaderMap;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::federation::signer::Signer;

/// Pseudo-header carrying the request method and path in the signing string
pub const REQUEST_TARGET: &str = "(request-target)";

/// Build the canonical signing string
///
/// Joins one `name: value` line per entry in `signed_header_names`,
/// newline-separated, substituting `(request-target): <method> <path>` for
/// the pseudo-header. Header lookup is case-insensitive; a named header
/// missing from the map is an error.
pub fn build_signing_string(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    signed_header_names: &[String],
) -> Result<String, AppError> {
    let mut signing_parts = Vec::with_capacity(signed_header_names.len());

    for header_name in signed_header_names {
        let name = header_name.to_ascii_lowercase();
        let value = if name == REQUEST_TARGET {
            format!("{} {}", method.to_ascii_lowercase(), path)
        } else {
            headers
                .get(&name)
                .ok_or_else(|| {
                    AppError::Authentication(format!("Missing signed header: {}", name))
                })?
                .to_str()
                .map_err(|_| {
                    AppError::Authentication(format!("Invalid signed header: {}", name))
                })?
                .to_string()
        };

        signing_parts.push(format!("{}: {}", name, value));
    }

    Ok(signing_parts.join("\n"))
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an outgoing HTTP request
///
/// Computes Date and Digest headers, builds the signing string over
/// `(request-target) host date [digest]`, hashes it and asks the
/// [`Signer`] for an RSA-SHA256 signature over the hash.
///
/// The digest covers `body` exactly as passed; callers must transmit the
/// same byte buffer without re-serializing.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `signer` - Signing capability holding the private key
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    signer: &dyn Signer,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path = parsed_url.path();
    let query = parsed_url.query();
    let path_and_query = if let Some(q) = query {
        format!("{}?{}", path, q)
    } else {
        path.to_string()
    };

    // 2. Generate Date header (RFC 2822 format)
    let date = chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    // 3. Generate Digest if body present
    let digest = body.map(build_digest);

    // 4. Build signing string
    let mut headers = HeaderMap::new();
    headers.insert(
        "host",
        host.parse()
            .map_err(|_| AppError::Validation("Invalid host in URL".to_string()))?,
    );
    headers.insert(
        "date",
        date.parse()
            .map_err(|_| AppError::Validation("Invalid Date header".to_string()))?,
    );

    let mut header_names = vec![
        REQUEST_TARGET.to_string(),
        "host".to_string(),
        "date".to_string(),
    ];

    if let Some(ref digest_value) = digest {
        headers.insert(
            "digest",
            digest_value
                .parse()
                .map_err(|_| AppError::Validation("Invalid Digest header".to_string()))?,
        );
        header_names.push("digest".to_string());
    }

    let signing_string = build_signing_string(method, &path_and_query, &headers, &header_names)?;

    // 5. Hash the signing string and sign the hash
    let hash = Sha256::digest(signing_string.as_bytes());
    let signature = signer.sign(&hash)?;
    let signature_b64 = BASE64.encode(signature);

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signer.key_id(),
        header_names.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Verify an RSA-SHA256 signature over a signing string
///
/// Inverse of the signing path: hashes the reconstructed signing string and
/// checks the signature bytes against the remote party's public key.
pub fn verify_signature_bytes(
    signing_string: &str,
    signature: &[u8],
    public_key_pem: &str,
) -> Result<(), AppError> {
    let public_key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Authentication(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let signature = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|e| AppError::Authentication(format!("Invalid signature format: {}", e)))?;

    let hash = Sha256::digest(signing_string.as_bytes());
    verifier
        .verify_prehash(&hash, &signature)
        .map_err(|_| AppError::Authentication("Signature verification failed".to_string()))?;

    Ok(())
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Authentication("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Authentication("Missing algorithm".to_string()))?,
        headers: headers
            .ok_or_else(|| AppError::Authentication("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Authentication("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest header value for a body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn build_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Verify a Digest header against the exact received body bytes
///
/// The digest algorithm is read from the header itself; anything other
/// than SHA-256 fails closed.
pub fn verify_digest(header_value: &str, body: &[u8]) -> Result<(), AppError> {
    let (algorithm, expected) = header_value
        .split_once('=')
        .ok_or_else(|| AppError::Authentication("Malformed Digest header".to_string()))?;

    if !algorithm.trim().eq_ignore_ascii_case("sha-256") {
        return Err(AppError::Authentication(format!(
            "Unsupported digest algorithm: {}",
            algorithm
        )));
    }

    let actual = BASE64.encode(Sha256::digest(body));
    if actual != expected {
        return Err(AppError::Authentication("Digest mismatch".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signer::LocalKeySigner;
    use http::HeaderValue;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    pub(crate) fn generate_test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem");

        (private_key_pem, public_key_pem)
    }

    fn test_signer(private_key_pem: &str) -> LocalKeySigner {
        LocalKeySigner::from_pem(
            private_key_pem,
            "https://blog.example.com/actor#main-key".to_string(),
        )
        .expect("signer")
    }

    #[test]
    fn build_signing_string_substitutes_request_target() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("remote.example"));
        headers.insert(
            "date",
            HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"),
        );

        let signing_string = build_signing_string(
            "POST",
            "/inbox",
            &headers,
            &[
                REQUEST_TARGET.to_string(),
                "host".to_string(),
                "date".to_string(),
            ],
        )
        .expect("signing string");

        assert_eq!(
            signing_string,
            "(request-target): post /inbox\nhost: remote.example\ndate: Mon, 01 Jan 2024 00:00:00 GMT"
        );
    }

    #[test]
    fn build_signing_string_looks_headers_up_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("digest", HeaderValue::from_static("SHA-256=abc"));

        let signing_string =
            build_signing_string("POST", "/inbox", &headers, &["Digest".to_string()])
                .expect("signing string");

        assert_eq!(signing_string, "digest: SHA-256=abc");
    }

    #[test]
    fn build_signing_string_fails_on_missing_header() {
        let headers = HeaderMap::new();
        let result = build_signing_string("POST", "/inbox", &headers, &["host".to_string()]);
        assert!(matches!(result, Err(AppError::Authentication(_))));
    }

    #[test]
    fn signature_round_trip_verifies() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = test_signer(&private_key_pem);

        let signed = sign_request(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(br#"{"type":"Follow"}"#),
            &signer,
        )
        .expect("signed");

        let parsed = parse_signature_header(&signed.signature).expect("parsed");
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(parsed.key_id, "https://blog.example.com/actor#main-key");
        assert_eq!(
            parsed.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("remote.example"));
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert(
            "digest",
            HeaderValue::from_str(signed.digest.as_ref().unwrap()).unwrap(),
        );

        let signing_string =
            build_signing_string("POST", "/inbox?foo=bar", &headers, &parsed.headers)
                .expect("signing string");

        let signature = BASE64.decode(parsed.signature).expect("signature bytes");
        assert!(verify_signature_bytes(&signing_string, &signature, &public_key_pem).is_ok());

        // Any single-byte mutation of the signing string must fail.
        let mut mutated = signing_string.into_bytes();
        mutated[0] ^= 0x01;
        let mutated = String::from_utf8(mutated).unwrap();
        assert!(verify_signature_bytes(&mutated, &signature, &public_key_pem).is_err());
    }

    #[test]
    fn sign_request_omits_digest_without_body() {
        let (private_key_pem, _) = generate_test_keypair();
        let signer = test_signer(&private_key_pem);

        let signed =
            sign_request("GET", "https://remote.example/actor", None, &signer).expect("signed");
        assert!(signed.digest.is_none());

        let parsed = parse_signature_header(&signed.signature).expect("parsed");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
    }

    #[test]
    fn digest_is_stable_and_tamper_evident() {
        let body = br#"{"type":"Create","id":"https://blog.example.com/notes/1"}"#;
        let digest = build_digest(body);
        assert_eq!(digest, build_digest(body));
        assert!(digest.starts_with("SHA-256="));

        assert!(verify_digest(&digest, body).is_ok());
        assert!(verify_digest(&digest, br#"{"type":"Create","id":"tampered"}"#).is_err());
    }

    #[test]
    fn verify_digest_rejects_unsupported_algorithm() {
        let body = b"body";
        let result = verify_digest("MD5=abc", body);
        match result {
            Err(AppError::Authentication(msg)) => {
                assert!(msg.contains("Unsupported digest algorithm"))
            }
            other => panic!("expected unsupported algorithm error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_digest_accepts_lowercase_algorithm_name() {
        let body = b"body";
        let digest = build_digest(body);
        let lowered = digest.replacen("SHA-256", "sha-256", 1);
        assert!(verify_digest(&lowered, body).is_ok());
    }

    #[test]
    fn parse_signature_header_requires_all_fields() {
        let result = parse_signature_header("keyId=\"https://x.example/actor#main-key\"");
        assert!(matches!(result, Err(AppError::Authentication(_))));
    }
}
