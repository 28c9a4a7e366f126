//! Actor documents
//!
//! Local blogs are published as `Person` actors. Remote actors are parsed
//! into the same type, tolerating the different shapes servers use for
//! `@context` and `url`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::data::{Collection, CollectionKeypair, NewRemoteUser, RemoteUser};
use crate::error::AppError;

/// ActivityStreams namespace
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
/// Security vocabulary (publicKey)
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
/// Public audience
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// A JSON-LD `@context`, which may be a string, an array or an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    Many(Vec<Value>),
    One(String),
    Object(serde_json::Map<String, Value>),
}

impl OneOrMany {
    /// Every representation flattened to an array.
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            OneOrMany::Many(values) => values,
            OneOrMany::One(value) => vec![Value::String(value)],
            OneOrMany::Object(map) => vec![Value::Object(map)],
        }
    }

    fn normalize(self) -> Self {
        OneOrMany::Many(self.into_vec())
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// Actor `url`: a plain string or a Link object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlField {
    Plain(String),
    Link { href: String },
}

impl UrlField {
    pub fn href(&self) -> &str {
        match self {
            UrlField::Plain(href) => href,
            UrlField::Link { href } => href,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub url: String,
}

/// ActivityPub actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(rename = "@context", default)]
    pub context: OneOrMany,
    #[serde(rename = "type", default = "default_actor_type")]
    pub kind: String,
    pub id: String,
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    pub public_key: PublicKey,
}

fn default_actor_type() -> String {
    "Person".to_string()
}

impl Person {
    /// Parse a remote actor document
    ///
    /// Unknown fields are ignored and `@context` is normalized to an array.
    ///
    /// # Errors
    /// `MalformedActor` when the body is not JSON or lacks `id`, `inbox`
    /// or `publicKey.publicKeyPem`.
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        let person: Person = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedActor(e.to_string()))?;
        person.validated()
    }

    /// Same as [`Person::from_slice`] for an already-decoded document.
    pub fn from_value(value: Value) -> Result<Self, AppError> {
        let person: Person =
            serde_json::from_value(value).map_err(|e| AppError::MalformedActor(e.to_string()))?;
        person.validated()
    }

    fn validated(mut self) -> Result<Self, AppError> {
        if self.id.is_empty() || self.inbox.is_empty() {
            return Err(AppError::MalformedActor(
                "actor is missing id or inbox".to_string(),
            ));
        }
        if self.public_key.public_key_pem.trim().is_empty() {
            return Err(AppError::MalformedActor(
                "actor is missing publicKey.publicKeyPem".to_string(),
            ));
        }
        self.context = self.context.normalize();
        Ok(self)
    }

    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.shared_inbox.as_deref())
            .filter(|inbox| !inbox.is_empty())
    }

    pub fn profile_url(&self) -> Option<&str> {
        self.url.as_ref().map(UrlField::href)
    }

    /// Row to cache for this actor.
    pub fn to_remote_user(&self, handle: Option<String>) -> NewRemoteUser {
        NewRemoteUser {
            actor_id: self.id.clone(),
            inbox: self.inbox.clone(),
            shared_inbox: self.shared_inbox().map(str::to_string),
            url: self.profile_url().map(str::to_string),
            handle,
        }
    }

    /// Rebuild an actor from a cached row and its key.
    ///
    /// Only the fields the cache keeps are populated.
    pub fn from_cached(user: &RemoteUser, key_id: String, public_key_pem: String) -> Self {
        Person {
            context: OneOrMany::Many(vec![Value::String(AS_CONTEXT.to_string())]),
            kind: default_actor_type(),
            id: user.actor_id.clone(),
            inbox: user.inbox.clone(),
            outbox: None,
            followers: None,
            following: None,
            preferred_username: None,
            name: None,
            summary: None,
            url: user.url.clone().map(UrlField::Plain),
            icon: None,
            endpoints: user.shared_inbox.clone().map(|shared_inbox| Endpoints {
                shared_inbox: Some(shared_inbox),
            }),
            public_key: PublicKey {
                id: key_id,
                owner: user.actor_id.clone(),
                public_key_pem,
            },
        }
    }
}

/// Identity and derived IRIs of a local actor
#[derive(Debug, Clone)]
pub struct BlogActor {
    /// URL-safe alias, used as preferredUsername
    pub alias: String,
    pub title: String,
    pub description: String,
    base_url: String,
    canonical_url: String,
    single_user: bool,
}

impl BlogActor {
    pub fn new(collection: &Collection, config: &AppConfig) -> Self {
        let base_url = config.server.base_url();
        let canonical_url = if config.instance.single_user {
            format!("{}/", base_url)
        } else {
            format!("{}/{}/", base_url, collection.alias)
        };

        Self {
            alias: collection.alias.clone(),
            title: collection.title.clone(),
            description: collection.description.clone(),
            base_url,
            canonical_url,
            single_user: config.instance.single_user,
        }
    }

    /// The instance actor, whose alias is the configured domain.
    pub fn instance(config: &AppConfig) -> Self {
        let base_url = config.server.base_url();
        Self {
            alias: config.server.domain.clone(),
            title: config.instance.site_name.clone(),
            description: config.instance.description.clone(),
            canonical_url: format!("{}/", base_url),
            base_url,
            single_user: config.instance.single_user,
        }
    }

    /// Actor IRI: `{base}/api/collections/{alias}`
    pub fn iri(&self) -> String {
        format!("{}/api/collections/{}", self.base_url, self.alias)
    }

    pub fn inbox(&self) -> String {
        format!("{}/inbox", self.iri())
    }

    pub fn outbox(&self) -> String {
        format!("{}/outbox", self.iri())
    }

    pub fn followers(&self) -> String {
        format!("{}/followers", self.iri())
    }

    pub fn following(&self) -> String {
        format!("{}/following", self.iri())
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.iri())
    }

    /// Human-facing blog URL, ending in `/`
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Canonical URL of a post: the slug when present, the id otherwise.
    pub fn post_url(&self, slug: Option<&str>, id: &str) -> String {
        let path = slug.filter(|s| !s.is_empty()).unwrap_or(id);
        format!("{}{}", self.canonical_url, path)
    }

    /// Listing of posts carrying a hashtag.
    pub fn tag_url(&self, tag: &str) -> String {
        if self.single_user {
            format!("{}tag:{}", self.canonical_url, tag)
        } else {
            format!("{}/{}/tag:{}", self.base_url, self.alias, tag)
        }
    }

    /// Generated letter avatar, when the title starts with one.
    fn avatar_url(&self) -> Option<String> {
        let first = self.title.chars().next()?.to_lowercase().next()?;
        first
            .is_ascii_alphanumeric()
            .then(|| format!("{}/img/avatars/{}.png", self.base_url, first))
    }

    /// Person document for this actor.
    pub fn person(&self, keypair: &CollectionKeypair) -> Person {
        let name = if self.title.is_empty() {
            self.alias.clone()
        } else {
            self.title.clone()
        };

        Person {
            context: OneOrMany::Many(vec![
                Value::String(AS_CONTEXT.to_string()),
                Value::String(SECURITY_CONTEXT.to_string()),
            ]),
            kind: default_actor_type(),
            id: self.iri(),
            inbox: self.inbox(),
            outbox: Some(self.outbox()),
            followers: Some(self.followers()),
            following: Some(self.following()),
            preferred_username: Some(self.alias.clone()),
            name: Some(name),
            summary: Some(self.description.clone()),
            url: Some(UrlField::Plain(self.canonical_url.clone())),
            icon: self.avatar_url().map(|url| Image {
                kind: "Image".to_string(),
                media_type: Some("image/png".to_string()),
                url,
            }),
            endpoints: None,
            public_key: PublicKey {
                id: self.key_id(),
                owner: self.iri(),
                public_key_pem: keypair.public_key_pem.clone(),
            },
        }
    }
}
