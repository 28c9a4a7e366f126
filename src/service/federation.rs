//! Federation service
//!
//! Looks up the blogs the federation endpoints serve and builds their
//! documents; also the entry point for pushing post events out.

use std::sync::Arc;

use serde_json::Value;

use crate::config::AppConfig;
use crate::data::{Collection, Database};
use crate::error::AppError;
use crate::federation::actor::{AS_CONTEXT, AS_PUBLIC, BlogActor, Person};
use crate::federation::client::RemoteClient;
use crate::federation::delivery::{DeliveryEngine, FederationReport, PostEvent};
use crate::federation::followers::FollowerStore;
use crate::federation::keys::{INSTANCE_KEY_ID, KeyStore};
use crate::federation::note::build_note;
use crate::federation::resolver::Resolver;
use crate::federation::webfinger::{WebFingerResponse, generate_webfinger_response, parse_resource};

/// Federation service
pub struct FederationService {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    keys: Arc<KeyStore>,
    resolver: Arc<Resolver>,
    delivery: DeliveryEngine,
    followers: FollowerStore,
}

impl FederationService {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        keys: Arc<KeyStore>,
        client: Arc<dyn RemoteClient>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            delivery: DeliveryEngine::new(
                config.clone(),
                db.clone(),
                keys.clone(),
                client,
                resolver.clone(),
            ),
            followers: FollowerStore::new(db.clone()),
            config,
            db,
            keys,
            resolver,
        }
    }

    /// Blog served under `alias`
    ///
    /// In single-blog mode every alias routes to collection 1.
    ///
    /// # Errors
    /// `CollectionNotFound` for unknown blogs and silenced owners, and for
    /// every blog while the instance is private or has federation disabled.
    pub async fn find_blog(&self, alias: &str) -> Result<Collection, AppError> {
        if self.config.instance.private || !self.config.instance.federation {
            return Err(AppError::CollectionNotFound);
        }

        let found = if self.config.instance.single_user {
            self.db.get_collection_by_id(1).await?
        } else {
            self.db.get_collection_by_alias(alias).await?
        };

        match found {
            Some(blog) if !blog.owner_silenced => Ok(blog.collection),
            Some(blog) => {
                tracing::debug!(alias = %blog.collection.alias, "Blog owner is silenced");
                Err(AppError::CollectionNotFound)
            }
            None => Err(AppError::CollectionNotFound),
        }
    }

    /// Like `find_blog`, but single-blog mode also requires the alias to match.
    async fn find_blog_strict(&self, alias: &str) -> Result<Collection, AppError> {
        let blog = self.find_blog(alias).await?;
        if self.config.instance.single_user && blog.alias != alias {
            return Err(AppError::CollectionNotFound);
        }
        Ok(blog)
    }

    fn is_instance_alias(&self, alias: &str) -> bool {
        alias.eq_ignore_ascii_case(&self.config.server.domain)
    }

    /// Person document for a blog, or for the instance actor when `alias`
    /// is the instance domain.
    pub async fn actor(&self, alias: &str) -> Result<Person, AppError> {
        if self.is_instance_alias(alias) {
            let keypair = self.keys.instance_keypair().await?;
            return Ok(BlogActor::instance(&self.config).person(&keypair));
        }

        let blog = self.find_blog(alias).await?;
        let keypair = self.keys.get_or_create(blog.id).await?;
        Ok(BlogActor::new(&blog, &self.config).person(&keypair))
    }

    /// Answer a WebFinger query for `resource`.
    pub async fn webfinger(&self, resource: &str) -> Result<WebFingerResponse, AppError> {
        let domain = &self.config.server.domain;
        let alias = parse_resource(resource, domain)?;

        let blog = self.find_blog_strict(&alias).await.map_err(|_| AppError::NotFound)?;
        if !blog.visibility().federates() {
            return Err(AppError::NotFound);
        }

        Ok(generate_webfinger_response(
            &BlogActor::new(&blog, &self.config),
            domain,
        ))
    }

    /// Outbox collection, or one page of it when `page` is given
    ///
    /// Items are `Create` activities of the blog's posts, newest first.
    pub async fn outbox(&self, alias: &str, page: Option<i64>) -> Result<Value, AppError> {
        let blog = self.find_blog_strict(alias).await?;
        let actor = BlogActor::new(&blog, &self.config);
        let total = self.db.count_collection_posts(blog.id).await?;
        let page_size = self.config.federation.page_size;
        let collection_id = actor.outbox();

        let Some(page) = page.filter(|page| *page >= 1) else {
            return Ok(ordered_collection(&collection_id, total, page_size));
        };

        let posts = self
            .db
            .get_collection_posts(blog.id, page_size, (page - 1) * page_size)
            .await?;
        let items = posts
            .iter()
            .map(|post| outbox_item(&actor, &build_note(post, &actor)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ordered_collection_page(
            &collection_id,
            total,
            page,
            page_size,
            items,
        ))
    }

    /// Followers collection, or one page of follower IRIs
    pub async fn followers(&self, alias: &str, page: Option<i64>) -> Result<Value, AppError> {
        let blog = self.find_blog(alias).await?;
        let actor = BlogActor::new(&blog, &self.config);
        let total = self.followers.follower_count(blog.id).await?;
        let page_size = self.config.federation.page_size;
        let collection_id = actor.followers();

        let Some(page) = page.filter(|page| *page >= 1) else {
            return Ok(ordered_collection(&collection_id, total, page_size));
        };

        let items = self
            .db
            .list_followers_page(blog.id, page_size, (page - 1) * page_size)
            .await?
            .into_iter()
            .map(|follower| Value::String(follower.actor_id))
            .collect();

        Ok(ordered_collection_page(
            &collection_id,
            total,
            page,
            page_size,
            items,
        ))
    }

    /// Following collection; blogs follow nobody.
    pub async fn following(&self, alias: &str, page: Option<i64>) -> Result<Value, AppError> {
        let blog = self.find_blog(alias).await?;
        let collection_id = BlogActor::new(&blog, &self.config).following();
        let page_size = self.config.federation.page_size;

        Ok(match page.filter(|page| *page >= 1) {
            Some(page) => ordered_collection_page(&collection_id, 0, page, page_size, Vec::new()),
            None => ordered_collection(&collection_id, 0, page_size),
        })
    }

    /// NodeInfo 2.0 document
    pub async fn nodeinfo(&self) -> Result<Value, AppError> {
        let users = self.db.count_users().await?;
        let local_posts = self.db.count_local_posts().await?;

        Ok(serde_json::json!({
            "version": "2.0",
            "software": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            },
            "protocols": ["activitypub"],
            "services": {
                "inbound": [],
                "outbound": []
            },
            "openRegistrations": false,
            "usage": {
                "users": {
                    "total": users
                },
                "localPosts": local_posts
            },
            "metadata": {
                "nodeName": self.config.instance.site_name,
                "nodeDescription": self.config.instance.description
            }
        }))
    }

    /// Push a post event to followers and mentioned actors.
    pub async fn federate(&self, event: &PostEvent) -> Result<FederationReport, AppError> {
        self.delivery.federate(event).await
    }

    /// Profile URL behind a `@user@host` handle.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String, AppError> {
        self.resolver.resolve_handle(handle).await
    }

    /// Drop every follower of a blog.
    pub async fn remove_all_followers(&self, alias: &str) -> Result<u64, AppError> {
        let blog = self
            .db
            .get_collection_by_alias(alias)
            .await?
            .ok_or(AppError::CollectionNotFound)?;
        let removed = self.followers.remove_all_followers(blog.collection.id).await?;
        tracing::info!(alias, removed, "Removed all followers");
        Ok(removed)
    }

    /// Make sure the instance actor has a keypair before it signs anything.
    pub async fn ensure_instance_key(&self) -> Result<(), AppError> {
        self.keys.get_or_create(INSTANCE_KEY_ID).await.map(|_| ())
    }
}

/// `OrderedCollection` pointing at its first and last pages.
pub fn ordered_collection(id: &str, total: i64, page_size: i64) -> Value {
    serde_json::json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total,
        "first": format!("{}?page=1", id),
        "last": format!("{}?page={}", id, last_page(total, page_size))
    })
}

/// One `OrderedCollectionPage` of a collection.
pub fn ordered_collection_page(
    id: &str,
    total: i64,
    page: i64,
    page_size: i64,
    items: Vec<Value>,
) -> Value {
    let mut value = serde_json::json!({
        "@context": AS_CONTEXT,
        "id": format!("{}?page={}", id, page),
        "type": "OrderedCollectionPage",
        "totalItems": total,
        "partOf": id,
        "orderedItems": items
    });

    if page < last_page(total, page_size) {
        value["next"] = Value::String(format!("{}?page={}", id, page + 1));
    }
    if page > 1 {
        value["prev"] = Value::String(format!("{}?page={}", id, page - 1));
    }
    value
}

fn last_page(total: i64, page_size: i64) -> i64 {
    if total <= 0 || page_size <= 0 {
        return 1;
    }
    (total + page_size - 1) / page_size
}

/// Outbox entry: a `Create` wrapping the Note, without its own `@context`.
fn outbox_item(actor: &BlogActor, note: &crate::federation::Note) -> Result<Value, AppError> {
    let object = serde_json::to_value(note)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize note: {}", e)))?;

    Ok(serde_json::json!({
        "id": format!("{}#Create", note.id),
        "type": "Create",
        "actor": actor.iri(),
        "published": note.published,
        "to": [AS_PUBLIC],
        "cc": [actor.followers()],
        "object": object
    }))
}
