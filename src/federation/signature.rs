//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests sign `(request-target) date host digest` with
//! RSA-SHA256. Inbound verification reads the key through an injected
//! fetcher so callers decide where keys come from.

use std::future::Future;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Headers covered by outbound signatures, in signing order.
pub const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "date", "host", "digest"];

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body; empty for GETs
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Header values to attach: Signature, Date, Digest, Host
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     &body,
///     &private_key,
///     "https://my.server/api/collections/alice#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)?;

    let path = parsed_url.path();
    let path_and_query = if let Some(q) = parsed_url.query() {
        format!("{}?{}", path, q)
    } else {
        path.to_string()
    };

    // 2. Generate Date header (RFC 2616 format)
    let date = chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    // 3. Digest always covers the body, even when it is empty
    let digest = generate_digest(body);

    // 4. Build signing string
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);
    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("date: {}", date),
        format!("host: {}", host),
        format!("digest: {}", digest),
    ]
    .join("\n");

    // 5. Sign with RSA-SHA256
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNED_HEADERS.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
        host,
    })
}

fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host header value, including a non-default port
    pub host: String,
}

/// The parts of an inbound request that signatures cover.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path plus query string, as sent by the client
    pub path_and_query: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Verify an inbound request signature.
///
/// `fetch_key` receives the `keyId` and returns the signer's public key PEM.
/// Any failure, including an unresolvable key, is reported as
/// `AppError::SignatureInvalid`. Clock skew is not checked.
///
/// # Returns
/// The parsed Signature header, so callers can match `keyId` to the actor.
pub async fn verify_request<F, Fut>(
    request: &InboundRequest<'_>,
    fetch_key: F,
) -> Result<ParsedSignature, AppError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<String, AppError>>,
{
    let parsed = extract_signature(request.headers).map_err(reject)?;

    check_digest(request).map_err(reject)?;

    let public_key_pem = fetch_key(parsed.key_id.clone()).await.map_err(|error| {
        tracing::warn!(key_id = %parsed.key_id, %error, "Could not resolve signing key");
        AppError::SignatureInvalid
    })?;

    verify_signature(request, &parsed, &public_key_pem).map_err(reject)?;

    Ok(parsed)
}

fn reject(reason: String) -> AppError {
    tracing::debug!(%reason, "Rejecting request signature");
    AppError::SignatureInvalid
}

fn check_digest(request: &InboundRequest<'_>) -> Result<(), String> {
    let digest_header = request
        .headers
        .get("digest")
        .ok_or_else(|| "Missing Digest header".to_string())?
        .to_str()
        .map_err(|_| "Invalid Digest header".to_string())?;

    // Several digests may be listed; the SHA-256 one must match.
    let expected = generate_digest(request.body);
    let matches = digest_header.split(',').any(|candidate| {
        let candidate = candidate.trim();
        match candidate.split_once('=') {
            Some((algorithm, value)) => {
                algorithm.eq_ignore_ascii_case("sha-256")
                    && format!("SHA-256={}", value) == expected
            }
            None => false,
        }
    });

    if matches {
        Ok(())
    } else {
        Err("Digest mismatch".to_string())
    }
}

/// Check an RSA signature against a known public key.
///
/// Rebuilds the signing string from the header list named in the
/// Signature header and verifies it.
pub fn verify_signature(
    request: &InboundRequest<'_>,
    parsed: &ParsedSignature,
    public_key_pem: &str,
) -> Result<(), String> {
    // 1. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        ));
    }

    if !parsed.headers.iter().any(|h| h == "(request-target)") {
        return Err("Signed headers must include: (request-target)".to_string());
    }

    if !request.body.is_empty() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err("Signed headers must include: digest".to_string());
    }

    // 2. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());

    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!(
                "{} {}",
                request.method.to_lowercase(),
                request.path_and_query
            ),
            "(created)" | "(expires)" => {
                return Err(format!("Unsupported pseudo-header: {}", header_name));
            }
            name => {
                let values: Vec<&str> = request
                    .headers
                    .get_all(name)
                    .iter()
                    .map(|value| value.to_str().map(str::trim))
                    .collect::<Result<_, _>>()
                    .map_err(|_| format!("Invalid {} header", name))?;
                if values.is_empty() {
                    return Err(format!("Missing {} header", name));
                }
                values.join(", ")
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    // 3. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| "Invalid signature encoding".to_string())?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem.trim())
        .map_err(|e| format!("Invalid public key: {}", e))?;

    // Create verifier (use new_unprefixed for compatibility).
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| format!("Invalid signature format: {}", e))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| "Signature verification failed".to_string())
}

fn extract_signature(headers: &http::HeaderMap) -> Result<ParsedSignature, String> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| "Missing Signature header".to_string())?
        .to_str()
        .map_err(|_| "Invalid Signature header".to_string())?;

    parse_signature_header(signature_header)
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    extract_signature(headers)
        .map(|parsed| parsed.key_id)
        .map_err(reject)
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
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when omitted.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, String> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| "Missing keyId".to_string())?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| "Missing signature".to_string())?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
