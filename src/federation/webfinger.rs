//! WebFinger protocol implementation
//!
//! Serves JRD documents for local blogs and reads them when resolving
//! remote `@user@host` handles.

use serde::{Deserialize, Serialize};

use super::actor::BlogActor;
use crate::error::AppError;

/// Link relation of an actor document
pub const REL_SELF: &str = "self";
/// Link relation of a human-facing profile page
pub const REL_PROFILE_PAGE: &str = "http://webfinger.net/rel/profile-page";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// Actor IRI advertised by this document
    ///
    /// The `self` link wins; otherwise the last alias is used.
    pub fn actor_iri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == REL_SELF)
            .and_then(|link| link.href.as_deref())
            .or_else(|| {
                self.aliases
                    .as_ref()
                    .and_then(|aliases| aliases.last())
                    .map(String::as_str)
            })
            .filter(|iri| !iri.is_empty())
    }
}

/// Generate the WebFinger response for a local blog.
///
/// # Arguments
/// * `actor` - Blog being described
/// * `domain` - Instance domain
pub fn generate_webfinger_response(actor: &BlogActor, domain: &str) -> WebFingerResponse {
    let canonical_url = actor.canonical_url().to_string();
    let actor_iri = actor.iri();

    WebFingerResponse {
        subject: format!("acct:{}@{}", actor.alias, domain),
        aliases: Some(vec![canonical_url.clone(), actor_iri.clone()]),
        links: vec![
            WebFingerLink {
                rel: REL_PROFILE_PAGE.to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(canonical_url),
                template: None,
            },
            WebFingerLink {
                rel: REL_SELF.to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_iri),
                template: None,
            },
        ],
    }
}

/// Extract the local alias from a `resource` query value.
///
/// Accepts `acct:alias@domain` and bare `alias@domain`.
///
/// # Errors
/// `NotFound` when the resource names another host or is not an account.
pub fn parse_resource(resource: &str, domain: &str) -> Result<String, AppError> {
    let account = resource.strip_prefix("acct:").unwrap_or(resource);
    let account = account.strip_prefix('@').unwrap_or(account);

    let (alias, host) = account.rsplit_once('@').ok_or(AppError::NotFound)?;
    if alias.is_empty() || !host.eq_ignore_ascii_case(domain) {
        return Err(AppError::NotFound);
    }

    Ok(alias.to_string())
}

/// WebFinger lookup URL for a remote account.
pub fn lookup_url(user: &str, host: &str) -> String {
    format!(
        "https://{}/.well-known/webfinger?resource={}",
        host,
        urlencoding::encode(&format!("acct:{}@{}", user, host))
    )
}

/// host-meta XRD document pointing at the WebFinger endpoint.
pub fn host_meta_xml(base_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/xrd+xml" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        html_escape::encode_double_quoted_attribute(base_url)
    )
}
