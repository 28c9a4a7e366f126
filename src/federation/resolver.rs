//! Remote actor resolution
//!
//! Turns actor IRIs and `@user@host` handles into actor documents and
//! profile URLs, caching what it learns in `remote_users`.

use std::sync::Arc;

use super::actor::{BlogActor, Person, PublicKey};
use super::client::{RemoteClient, SigningIdentity};
use super::keys::{INSTANCE_KEY_ID, KeyStore};
use super::webfinger::{WebFingerResponse, lookup_url};
use crate::config::AppConfig;
use crate::data::{Database, RemoteUserKey};
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const ACTOR_CACHE: &str = "remote_actor";
const HANDLE_CACHE: &str = "remote_handle";

/// Hosts that do not speak ActivityPub, mapped to their profile path prefix.
const SILOS: &[(&str, &str)] = &[("twitter.com", ""), ("medium.com", "@")];

/// Resolves remote actors over HTTP, backed by the local cache
pub struct Resolver {
    db: Arc<Database>,
    keys: Arc<KeyStore>,
    client: Arc<dyn RemoteClient>,
    /// Signs outbound GETs
    instance: BlogActor,
}

impl Resolver {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<KeyStore>,
        client: Arc<dyn RemoteClient>,
        config: &AppConfig,
    ) -> Self {
        Self {
            db,
            keys,
            client,
            instance: BlogActor::instance(config),
        }
    }

    async fn instance_signer(&self) -> Result<SigningIdentity, AppError> {
        self.keys.signer(INSTANCE_KEY_ID, &self.instance).await
    }

    /// Fetch an actor document from its origin, bypassing the cache.
    pub async fn fetch_remote(&self, iri: &str) -> Result<Person, AppError> {
        tracing::debug!(iri, "Fetching remote actor");
        let signer = self.instance_signer().await?;
        let document = self.client.fetch_json(iri, &signer).await?;
        Person::from_value(document)
    }

    /// Resolve an actor IRI
    ///
    /// A cached actor with a cached key is answered locally; anything else
    /// is fetched. Nothing is persisted here.
    pub async fn resolve_iri(&self, iri: &str) -> Result<Person, AppError> {
        if let Some(user) = self.db.get_remote_user_by_actor_id(iri).await? {
            if let Some(key) = self.db.get_remote_user_key_for_user(user.id).await? {
                CACHE_HITS_TOTAL.with_label_values(&[ACTOR_CACHE]).inc();
                return Ok(Person::from_cached(&user, key.key_id, key.public_key_pem));
            }
        }

        CACHE_MISSES_TOTAL.with_label_values(&[ACTOR_CACHE]).inc();
        self.fetch_remote(iri).await
    }

    /// Resolve the actor owning a signature `keyId`.
    ///
    /// The key id is dereferenced with any fragment removed. That yields
    /// either the owner itself, which must advertise the key, or a
    /// standalone key document whose `owner` is then fetched.
    pub async fn resolve_key_owner(&self, key_id: &str) -> Result<Person, AppError> {
        if let Some(key) = self.db.get_remote_user_key(key_id).await? {
            if let Some(user) = self.db.get_remote_user_by_id(key.remote_user_id).await? {
                CACHE_HITS_TOTAL.with_label_values(&[ACTOR_CACHE]).inc();
                return Ok(Person::from_cached(&user, key.key_id, key.public_key_pem));
            }
        }

        CACHE_MISSES_TOTAL.with_label_values(&[ACTOR_CACHE]).inc();
        let document_iri = key_id.split('#').next().unwrap_or(key_id);
        let signer = self.instance_signer().await?;
        let document = self.client.fetch_json(document_iri, &signer).await?;

        let person = if document.get("publicKeyPem").is_some() {
            let key: PublicKey = serde_json::from_value(document)
                .map_err(|e| AppError::MalformedActor(format!("invalid key document: {}", e)))?;
            if key.id != key_id || key.owner.is_empty() {
                return Err(AppError::MalformedActor(format!(
                    "key document does not describe {}",
                    key_id
                )));
            }
            let mut owner = self.fetch_remote(&key.owner).await?;
            if owner.id != key.owner {
                return Err(AppError::MalformedActor(format!(
                    "key {} names owner {} but resolved to {}",
                    key_id, key.owner, owner.id
                )));
            }
            owner.public_key = key;
            owner
        } else {
            let person = Person::from_value(document)?;
            if person.public_key.id != key_id && person.id != key_id {
                return Err(AppError::MalformedActor(format!(
                    "actor {} does not advertise key {}",
                    person.id, key_id
                )));
            }
            person
        };

        self.remember_key(&person).await?;
        Ok(person)
    }

    /// Public key PEM for a signature `keyId`.
    pub async fn fetch_public_key(&self, key_id: &str) -> Result<String, AppError> {
        self.resolve_key_owner(key_id)
            .await
            .map(|person| person.public_key.public_key_pem)
    }

    /// Store the key of an already cached actor.
    async fn remember_key(&self, person: &Person) -> Result<(), AppError> {
        if person.public_key.id.is_empty() {
            return Ok(());
        }
        if let Some(user) = self.db.get_remote_user_by_actor_id(&person.id).await? {
            self.db
                .insert_remote_user_key_if_absent(&RemoteUserKey {
                    key_id: person.public_key.id.clone(),
                    remote_user_id: user.id,
                    public_key_pem: person.public_key.public_key_pem.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Profile URL of a remote account
    ///
    /// # Arguments
    /// * `handle` - `@user@host` or `user@host`
    ///
    /// # Returns
    /// The actor's `url`, or its IRI when it has none.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String, AppError> {
        let (user, host) = normalize_handle(handle)?;

        if let Some(url) = silo_profile_url(&user, &host) {
            return Ok(url);
        }

        let handle = format!("@{}@{}", user, host);

        if let Some(cached) = self.db.get_remote_user_by_handle(&handle).await? {
            CACHE_HITS_TOTAL.with_label_values(&[HANDLE_CACHE]).inc();
            if let Some(url) = cached.url.filter(|url| !url.is_empty()) {
                return Ok(url);
            }

            // Cached before profile URLs were stored.
            let person = self.fetch_remote(&cached.actor_id).await?;
            let url = person.profile_url().unwrap_or(&cached.actor_id).to_string();
            self.db.set_remote_user_url(&cached.actor_id, &url).await?;
            return Ok(url);
        }

        CACHE_MISSES_TOTAL.with_label_values(&[HANDLE_CACHE]).inc();
        let actor_iri = self.webfinger(&user, &host).await?;

        if let Some(existing) = self.db.get_remote_user_by_actor_id(&actor_iri).await? {
            if existing.handle.is_none() {
                tracing::debug!(actor = %actor_iri, %handle, "Backfilling handle of cached actor");
                self.db.set_remote_user_handle(&actor_iri, &handle).await?;
            }
            if let Some(url) = existing.url.filter(|url| !url.is_empty()) {
                return Ok(url);
            }
        }

        let person = self.fetch_remote(&actor_iri).await?;
        let stored = self
            .db
            .upsert_remote_user(&person.to_remote_user(Some(handle)))
            .await?;
        self.remember_key(&person).await?;

        Ok(stored.url.unwrap_or(stored.actor_id))
    }

    /// Actor of a `Mention` tag: by handle when cached, by IRI otherwise.
    pub async fn resolve_mention(&self, name: &str, href: &str) -> Result<Person, AppError> {
        if let Ok((user, host)) = normalize_handle(name) {
            let handle = format!("@{}@{}", user, host);
            if let Some(cached) = self.db.get_remote_user_by_handle(&handle).await? {
                return self.resolve_iri(&cached.actor_id).await;
            }
        }
        self.resolve_iri(href).await
    }

    async fn webfinger(&self, user: &str, host: &str) -> Result<String, AppError> {
        let signer = self.instance_signer().await?;
        let document = self
            .client
            .fetch_json(&lookup_url(user, host), &signer)
            .await?;

        let jrd: WebFingerResponse = serde_json::from_value(document)
            .map_err(|e| AppError::MalformedActor(format!("invalid WebFinger response: {}", e)))?;

        jrd.actor_iri().map(str::to_string).ok_or_else(|| {
            AppError::MalformedActor(format!("no actor link for {}@{}", user, host))
        })
    }
}

/// Split a handle into lowercase-host `(user, host)`.
pub fn normalize_handle(handle: &str) -> Result<(String, String), AppError> {
    let trimmed = handle.trim();
    let trimmed = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);

    match trimmed.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok((user.to_string(), host.to_ascii_lowercase()))
        }
        _ => Err(AppError::Validation(format!("Invalid handle: {}", handle))),
    }
}

fn silo_profile_url(user: &str, host: &str) -> Option<String> {
    SILOS
        .iter()
        .find(|(silo, _)| *silo == host)
        .map(|(silo, prefix)| format!("https://{}/{}{}", silo, prefix, user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatabaseConfig, FederationConfig, InstanceConfig, LoggingConfig, ServerConfig,
    };
    use crate::data::NewRemoteUser;
    use crate::federation::client::MockRemoteClient;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "blogs.example".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: "/tmp/unused.db".into(),
            },
            instance: InstanceConfig {
                site_name: "Blogs".to_string(),
                description: String::new(),
                single_user: false,
                federation: true,
                private: false,
            },
            federation: FederationConfig {
                key_bits: 1024,
                ..FederationConfig::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    fn actor_document(name: &str, url: Option<&str>) -> Value {
        let id = format!("https://remote.example/users/{name}");
        let mut doc = json!({
            "@context": ["https://www.w3.org/ns/activitystreams"],
            "type": "Person",
            "id": id,
            "inbox": format!("{id}/inbox"),
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "publicKey": {
                "id": format!("{id}#main-key"),
                "owner": id,
                "publicKeyPem": format!("{name}-pem")
            }
        });
        if let Some(url) = url {
            doc["url"] = json!(url);
        }
        doc
    }

    async fn setup(client: MockRemoteClient) -> (Arc<Database>, Resolver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("resolver.db"))
                .await
                .unwrap(),
        );
        let keys = Arc::new(KeyStore::new(db.clone(), 1024));
        let resolver = Resolver::new(db.clone(), keys, Arc::new(client), &config());
        (db, resolver, temp_dir)
    }

    #[tokio::test]
    async fn silo_handles_resolve_without_network() {
        let (_db, resolver, _temp_dir) = setup(MockRemoteClient::new()).await;

        assert_eq!(
            resolver.resolve_handle("@jack@twitter.com").await.unwrap(),
            "https://twitter.com/jack"
        );
        assert_eq!(
            resolver.resolve_handle("ev@medium.com").await.unwrap(),
            "https://medium.com/@ev"
        );
    }

    #[tokio::test]
    async fn resolve_handle_uses_webfinger_then_caches() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .withf(|url, signer| {
                url.starts_with("https://remote.example/.well-known/webfinger")
                    && signer.key_id == "https://blogs.example/api/collections/blogs.example#main-key"
            })
            .times(1)
            .returning(|_, _| {
                Ok(json!({
                    "subject": "acct:bob@remote.example",
                    "links": [{ "rel": "self", "type": "application/activity+json",
                                "href": "https://remote.example/users/bob" }]
                }))
            });
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/users/bob")
            .times(1)
            .returning(|_, _| Ok(actor_document("bob", Some("https://remote.example/@bob"))));

        let (db, resolver, _temp_dir) = setup(client).await;

        let url = resolver.resolve_handle("@bob@Remote.Example").await.unwrap();
        assert_eq!(url, "https://remote.example/@bob");

        // Second lookup is served from the handle cache.
        let again = resolver.resolve_handle("bob@remote.example").await.unwrap();
        assert_eq!(again, url);

        let cached = db
            .get_remote_user_by_handle("@bob@remote.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.shared_inbox.as_deref(), Some("https://remote.example/inbox"));
        assert!(
            db.get_remote_user_key("https://remote.example/users/bob#main-key")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn resolve_handle_backfills_missing_url() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/users/carol")
            .times(1)
            .returning(|_, _| Ok(actor_document("carol", Some("https://remote.example/@carol"))));

        let (db, resolver, _temp_dir) = setup(client).await;
        db.upsert_remote_user(&NewRemoteUser {
            actor_id: "https://remote.example/users/carol".to_string(),
            inbox: "https://remote.example/users/carol/inbox".to_string(),
            shared_inbox: None,
            url: None,
            handle: Some("@carol@remote.example".to_string()),
        })
        .await
        .unwrap();

        let url = resolver.resolve_handle("@carol@remote.example").await.unwrap();
        assert_eq!(url, "https://remote.example/@carol");

        let stored = db
            .get_remote_user_by_actor_id("https://remote.example/users/carol")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.url.as_deref(), Some("https://remote.example/@carol"));
    }

    #[tokio::test]
    async fn resolve_handle_sets_handle_on_known_actor() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .times(1)
            .returning(|_, _| {
                Ok(json!({
                    "subject": "acct:dave@remote.example",
                    "aliases": ["https://remote.example/@dave", "https://remote.example/users/dave"]
                }))
            });

        let (db, resolver, _temp_dir) = setup(client).await;
        db.upsert_remote_user(&NewRemoteUser {
            actor_id: "https://remote.example/users/dave".to_string(),
            inbox: "https://remote.example/users/dave/inbox".to_string(),
            shared_inbox: None,
            url: Some("https://remote.example/@dave".to_string()),
            handle: None,
        })
        .await
        .unwrap();

        let url = resolver.resolve_handle("@dave@remote.example").await.unwrap();
        assert_eq!(url, "https://remote.example/@dave");

        let stored = db
            .get_remote_user_by_handle("@dave@remote.example")
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn resolve_handle_falls_back_to_actor_iri() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .withf(|url, _| url.contains("webfinger"))
            .returning(|_, _| {
                Ok(json!({
                    "subject": "acct:erin@remote.example",
                    "links": [{ "rel": "self", "href": "https://remote.example/users/erin" }]
                }))
            });
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/users/erin")
            .returning(|_, _| Ok(actor_document("erin", None)));

        let (_db, resolver, _temp_dir) = setup(client).await;
        assert_eq!(
            resolver.resolve_handle("@erin@remote.example").await.unwrap(),
            "https://remote.example/users/erin"
        );
    }

    #[tokio::test]
    async fn resolve_handle_propagates_remote_not_found() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .returning(|url, _| Err(AppError::RemoteNotFound(url.to_string())));

        let (_db, resolver, _temp_dir) = setup(client).await;
        assert!(matches!(
            resolver.resolve_handle("@ghost@remote.example").await,
            Err(AppError::RemoteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_handle_rejects_garbage() {
        let (_db, resolver, _temp_dir) = setup(MockRemoteClient::new()).await;
        assert!(matches!(
            resolver.resolve_handle("not-a-handle").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn resolve_iri_prefers_cached_actor_with_key() {
        let (db, resolver, _temp_dir) = setup(MockRemoteClient::new()).await;
        let actor_id = "https://remote.example/users/frank";
        let key_id = format!("{actor_id}#main-key");
        let user = db
            .upsert_remote_user(&NewRemoteUser {
                actor_id: actor_id.to_string(),
                inbox: format!("{actor_id}/inbox"),
                shared_inbox: None,
                url: None,
                handle: None,
            })
            .await
            .unwrap();
        db.insert_remote_user_key_if_absent(&RemoteUserKey {
            key_id: key_id.clone(),
            remote_user_id: user.id,
            public_key_pem: "frank-pem".to_string(),
        })
        .await
        .unwrap();

        let person = resolver.resolve_iri(actor_id).await.unwrap();
        assert_eq!(person.inbox, format!("{actor_id}/inbox"));
        assert_eq!(person.public_key.public_key_pem, "frank-pem");
        assert_eq!(person.public_key.id, key_id);
    }

    #[tokio::test]
    async fn resolve_key_owner_requires_matching_key_id() {
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .returning(|_, _| Ok(actor_document("gina", None)));

        let (_db, resolver, _temp_dir) = setup(client).await;

        let person = resolver
            .resolve_key_owner("https://remote.example/users/gina#main-key")
            .await
            .unwrap();
        assert_eq!(person.public_key.public_key_pem, "gina-pem");

        assert!(matches!(
            resolver
                .fetch_public_key("https://remote.example/users/gina#other-key")
                .await,
            Err(AppError::MalformedActor(_))
        ));
    }

    #[tokio::test]
    async fn resolve_key_owner_follows_standalone_key_document() {
        let key_id = "https://remote.example/users/hana/main-key";
        let mut client = MockRemoteClient::new();
        client
            .expect_fetch_json()
            .withf(move |url, _| url == key_id)
            .returning(move |_, _| {
                Ok(json!({
                    "id": key_id,
                    "type": "Key",
                    "owner": "https://remote.example/users/hana",
                    "publicKeyPem": "hana-key-pem"
                }))
            });
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/users/hana")
            .returning(|_, _| Ok(actor_document("hana", None)));
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/keys/stray")
            .returning(|_, _| {
                Ok(json!({
                    "id": "https://remote.example/keys/stray",
                    "owner": "https://remote.example/users/ivan",
                    "publicKeyPem": "stray-pem"
                }))
            });
        client
            .expect_fetch_json()
            .withf(|url, _| url == "https://remote.example/users/ivan")
            .returning(|_, _| Ok(actor_document("hana", None)));

        let (_db, resolver, _temp_dir) = setup(client).await;

        let person = resolver.resolve_key_owner(key_id).await.unwrap();
        assert_eq!(person.id, "https://remote.example/users/hana");
        assert_eq!(person.public_key.id, key_id);
        assert_eq!(person.public_key.public_key_pem, "hana-key-pem");

        // The owner named by the key must be the actor that answers.
        assert!(matches!(
            resolver
                .resolve_key_owner("https://remote.example/keys/stray")
                .await,
            Err(AppError::MalformedActor(_))
        ));
    }

    #[test]
    fn normalize_handle_accepts_common_forms() {
        for input in ["@bob@Remote.Example", "bob@remote.example", "acct:bob@remote.example"] {
            assert_eq!(
                normalize_handle(input).unwrap(),
                ("bob".to_string(), "remote.example".to_string())
            );
        }
        assert!(normalize_handle("@bob").is_err());
        assert!(normalize_handle("@@remote.example").is_err());
    }
}
