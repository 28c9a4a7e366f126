//! Data models
//!
//! Rust structs representing database rows.
//! Timestamps are chrono `DateTime<Utc>` stored as text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Blog surface (owned by the surrounding platform)
// =============================================================================

/// Local account that owns one or more blogs
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Silenced owners disappear from every federation endpoint
    pub silenced: bool,
    pub created: DateTime<Utc>,
}

/// Blog visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Protected,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Protected => "protected",
        }
    }

    /// Only public and unlisted blogs take part in federation.
    pub fn federates(&self) -> bool {
        matches!(self, Visibility::Public | Visibility::Unlisted)
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "unlisted" => Ok(Visibility::Unlisted),
            "private" => Ok(Visibility::Private),
            "protected" => Ok(Visibility::Protected),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

/// A blog ("collection")
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collection {
    pub id: i64,
    /// URL-safe, host-unique alias
    pub alias: String,
    pub title: String,
    pub description: String,
    pub owner_id: i64,
    pub visibility: String,
    pub created: DateTime<Utc>,
}

impl Collection {
    /// Parsed visibility; unknown values are treated as private.
    pub fn visibility(&self) -> Visibility {
        self.visibility.parse().unwrap_or(Visibility::Private)
    }
}

/// A blog together with the moderation state of its owner
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionWithOwner {
    #[sqlx(flatten)]
    pub collection: Collection,
    pub owner_silenced: bool,
}

/// Published post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub slug: Option<String>,
    pub collection_id: Option<i64>,
    pub title: String,
    /// Markdown source
    pub content: String,
    /// Rendered HTML
    pub html_content: String,
    pub language: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Federation state
// =============================================================================

/// Blog RSA keypair, PEM encoded
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionKeypair {
    pub collection_id: i64,
    /// SPKI PEM
    pub public_key_pem: String,
    /// PKCS#8 PEM
    pub private_key_pem: String,
}

/// Cached remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteUser {
    pub id: i64,
    pub actor_id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    /// Human-facing profile URL
    pub url: Option<String>,
    /// Canonical `@user@host`
    pub handle: Option<String>,
    pub created: DateTime<Utc>,
}

/// Data needed to cache a remote actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRemoteUser {
    pub actor_id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub url: Option<String>,
    pub handle: Option<String>,
}

/// Cached public key of a remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteUserKey {
    pub key_id: String,
    pub remote_user_id: i64,
    pub public_key_pem: String,
}

/// A remote follower of a blog
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub remote_user_id: i64,
    pub actor_id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    /// When the follow edge was created
    pub followed_at: DateTime<Utc>,
}

impl Follower {
    /// Shared inbox when advertised, personal inbox otherwise.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox
            .as_deref()
            .filter(|inbox| !inbox.is_empty())
            .unwrap_or(&self.inbox)
    }
}
