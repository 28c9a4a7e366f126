//! Outbound federation HTTP
//!
//! Every request a blog or the instance makes to another server goes
//! through [`RemoteClient`]. The reqwest implementation signs requests,
//! refuses private destinations, and sorts failures into transient and
//! permanent ones.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::signature::sign_request;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Media type of ActivityPub payloads
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Key used to sign an outbound request
#[derive(Clone)]
pub struct SigningIdentity {
    /// `{actor}#main-key`
    pub key_id: String,
    /// PKCS#8 PEM
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Outbound federation transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// POST an activity to an inbox, signed by `signer`.
    async fn post_activity(
        &self,
        inbox: &str,
        activity: &Value,
        signer: &SigningIdentity,
    ) -> Result<(), AppError>;

    /// Signed GET of a JSON document (actor, WebFinger JRD).
    ///
    /// # Errors
    /// `MalformedActor` when the response body is not JSON.
    async fn fetch_json(&self, url: &str, signer: &SigningIdentity) -> Result<Value, AppError>;
}

/// [`RemoteClient`] backed by reqwest
pub struct HttpRemoteClient {
    http: reqwest::Client,
    allow_private_hosts: bool,
}

impl HttpRemoteClient {
    /// Build the client
    ///
    /// Uses `federation.http_timeout_seconds` as the total request timeout
    /// and identifies as `inkfed/{version} ({domain})`.
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(Duration::from_secs(config.federation.http_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            allow_private_hosts: config.federation.allow_private_hosts,
        })
    }

    async fn check_destination(&self, url: &str) -> Result<(), AppError> {
        let (host, port) = destination_host(url)?;
        if self.allow_private_hosts {
            return Ok(());
        }
        if is_disallowed_host(&host) {
            return Err(AppError::PermanentRemote(format!(
                "Refusing to contact private host {}",
                host
            )));
        }
        validate_resolved_host_ips(&host, port).await
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
        signer: &SigningIdentity,
    ) -> Result<reqwest::Response, AppError> {
        self.check_destination(url).await?;

        let sig_headers = sign_request(
            method.as_str(),
            url,
            &body,
            &signer.private_key_pem,
            &signer.key_id,
        )?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("Host", sig_headers.host)
            .header("Date", sig_headers.date)
            .header("Digest", sig_headers.digest)
            .header("Signature", sig_headers.signature);

        request = if method == reqwest::Method::POST {
            request.header("Content-Type", ACTIVITY_JSON).body(body)
        } else {
            request.header("Accept", accept_for(url))
        };

        let started = Instant::now();
        let result = request.send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            classify_transport_error(url, e)
        })?;

        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", response.status().as_str()])
            .inc();

        classify_status(url, response.status())?;
        Ok(response)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn post_activity(
        &self,
        inbox: &str,
        activity: &Value,
        signer: &SigningIdentity,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;

        self.send_signed(reqwest::Method::POST, inbox, body, signer)
            .await?;

        tracing::debug!(inbox, "Delivered activity");
        Ok(())
    }

    async fn fetch_json(&self, url: &str, signer: &SigningIdentity) -> Result<Value, AppError> {
        let response = self
            .send_signed(reqwest::Method::GET, url, Vec::new(), signer)
            .await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(url, e))?;

        serde_json::from_slice(&body)
            .map_err(|e| AppError::MalformedActor(format!("{} returned invalid JSON: {}", url, e)))
    }
}

const JRD_ACCEPT: &str = "application/jrd+json, application/json";

/// WebFinger answers in JRD; everything else is fetched as an activity.
fn accept_for(url: &str) -> &'static str {
    if url.contains("/.well-known/webfinger") {
        JRD_ACCEPT
    } else {
        ACTIVITY_JSON
    }
}

/// Map an HTTP status to the remote failure taxonomy.
pub fn classify_status(url: &str, status: StatusCode) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{} answered HTTP {}", url, status);
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => AppError::RemoteNotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            AppError::TransientRemote(message)
        }
        s if s.is_server_error() => AppError::TransientRemote(message),
        _ => AppError::PermanentRemote(message),
    })
}

fn classify_transport_error(url: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::TransientRemote(format!("Timed out contacting {}", url))
    } else if error.is_builder() {
        AppError::PermanentRemote(format!("Invalid request to {}: {}", url, error))
    } else {
        AppError::TransientRemote(format!("Failed to contact {}: {}", url, error))
    }
}

fn destination_host(url: &str) -> Result<(String, u16), AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::PermanentRemote(format!("Invalid URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::PermanentRemote(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::PermanentRemote(format!("Missing host in {}", url)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::PermanentRemote(format!("Missing port in {}", url)))?;

    Ok((host, port))
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Resolve DNS before connecting and reject hosts that point inward.
async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::TransientRemote(format!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::PermanentRemote(format!(
                "{} resolves to a private address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::TransientRemote(format!(
            "No DNS records for {}",
            host
        )));
    }

    Ok(())
}
