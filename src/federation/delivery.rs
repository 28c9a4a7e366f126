//! Activity delivery
//!
//! Fans locally-authored post activities out to every follower inbox of a
//! blog and to mentioned actors.

use std::sync::Arc;

use futures::StreamExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;

use super::actor::{AS_PUBLIC, BlogActor};
use super::client::{RemoteClient, SigningIdentity};
use super::followers::{FollowerStore, inbox_buckets};
use super::keys::KeyStore;
use super::note::{Note, build_note, post_to_note};
use super::resolver::Resolver;
use crate::config::AppConfig;
use crate::data::{Database, Post};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_SENT;

/// What happened to a post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Create => "Create",
            ActivityKind::Update => "Update",
            ActivityKind::Delete => "Delete",
        }
    }
}

/// A post event to federate
#[derive(Debug, Clone)]
pub struct PostEvent {
    pub kind: ActivityKind,
    /// The post as published; for deletes, as it was before deletion
    pub post: Post,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FederationReport {
    /// POSTs issued
    pub attempted: usize,
    /// POSTs answered with success
    pub delivered: usize,
    /// POSTs that failed; never retried
    pub failed: usize,
}

impl FederationReport {
    fn record(&mut self, result: &Result<(), AppError>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.delivered += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// 20 random alphanumeric characters for activity IRIs.
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// Delivery engine
///
/// Sends activities to remote inbox endpoints, signed by the blog.
pub struct DeliveryEngine {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    keys: Arc<KeyStore>,
    client: Arc<dyn RemoteClient>,
    resolver: Arc<Resolver>,
    followers: FollowerStore,
}

impl DeliveryEngine {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        keys: Arc<KeyStore>,
        client: Arc<dyn RemoteClient>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            followers: FollowerStore::new(db.clone()),
            config,
            db,
            keys,
            client,
            resolver,
        }
    }

    /// Deliver a post event to every follower and mentioned actor
    ///
    /// Private instances, disabled federation, blogs that are neither
    /// public nor unlisted, and silenced owners make this a no-op.
    /// Individual POST failures are logged and counted, never returned.
    ///
    /// # Errors
    /// `CollectionNotFound` for an unknown blog; key and database failures.
    pub async fn federate(&self, event: &PostEvent) -> Result<FederationReport, AppError> {
        if self.config.instance.private || !self.config.instance.federation {
            tracing::debug!(post = %event.post.id, "Federation disabled; not delivering");
            return Ok(FederationReport::default());
        }

        let Some(collection_id) = event.post.collection_id else {
            tracing::debug!(post = %event.post.id, "Post has no blog; not delivering");
            return Ok(FederationReport::default());
        };

        let blog = self
            .db
            .get_collection_by_id(collection_id)
            .await?
            .ok_or(AppError::CollectionNotFound)?;

        if !blog.collection.visibility().federates() || blog.owner_silenced {
            tracing::debug!(
                collection_id,
                visibility = %blog.collection.visibility,
                silenced = blog.owner_silenced,
                "Blog does not federate; not delivering"
            );
            return Ok(FederationReport::default());
        }

        let actor = BlogActor::new(&blog.collection, &self.config);
        let signer = self.keys.signer(collection_id, &actor).await?;

        let note = match event.kind {
            ActivityKind::Delete => build_note(&event.post, &actor),
            ActivityKind::Create | ActivityKind::Update => {
                post_to_note(&event.post, &actor, &self.resolver).await
            }
        };

        let activity = build_activity(event.kind, &actor, &note)?;
        let followers = self.followers.list_followers(collection_id).await?;
        let buckets = inbox_buckets(&followers);

        tracing::info!(
            collection_id,
            post = %event.post.id,
            activity = event.kind.as_str(),
            followers = followers.len(),
            inboxes = buckets.len(),
            "Federating post"
        );

        let mut report = FederationReport::default();

        let deliveries = buckets.into_iter().map(|(inbox, actors)| {
            let addressed = address_to(&activity, event.kind, &actors);
            let signer = &signer;
            async move {
                let result = self.client.post_activity(&inbox, &addressed, signer).await;
                log_delivery(&inbox, event.kind, &result);
                result
            }
        });

        let mut results = futures::stream::iter(deliveries)
            .buffer_unordered(self.config.federation.delivery_concurrency.max(1));
        while let Some(result) = results.next().await {
            report.record(&result);
        }

        if event.kind != ActivityKind::Delete {
            self.deliver_to_mentions(&actor, &note, &signer, &mut report)
                .await;
        }

        tracing::info!(
            collection_id,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Federation complete"
        );

        Ok(report)
    }

    /// POST a `Create` of the note to each mentioned actor's own inbox.
    ///
    /// These may duplicate follower deliveries.
    async fn deliver_to_mentions(
        &self,
        actor: &BlogActor,
        note: &Note,
        signer: &SigningIdentity,
        report: &mut FederationReport,
    ) {
        for mention in note.mentions() {
            let person = match self.resolver.resolve_mention(&mention.name, &mention.href).await {
                Ok(person) => person,
                Err(error) => {
                    tracing::info!(mention = %mention.name, %error, "Could not resolve mentioned actor");
                    continue;
                }
            };

            let activity = match build_activity(ActivityKind::Create, actor, note) {
                Ok(activity) => activity,
                Err(error) => {
                    tracing::error!(%error, "Failed to build mention activity");
                    continue;
                }
            };

            let result = self
                .client
                .post_activity(&person.inbox, &activity, signer)
                .await;
            log_delivery(&person.inbox, ActivityKind::Create, &result);
            report.record(&result);
        }
    }
}

fn log_delivery(inbox: &str, kind: ActivityKind, result: &Result<(), AppError>) {
    match result {
        Ok(()) => {
            ACTIVITYPUB_ACTIVITIES_SENT
                .with_label_values(&[kind.as_str()])
                .inc();
            tracing::debug!(inbox, activity = kind.as_str(), "Delivered");
        }
        Err(error) => {
            tracing::warn!(
                inbox,
                activity = kind.as_str(),
                transient = error.is_transient(),
                %error,
                "Delivery failed"
            );
        }
    }
}

/// Wrap a note in a freshly identified activity.
pub fn build_activity(kind: ActivityKind, actor: &BlogActor, note: &Note) -> Result<Value, AppError> {
    let actor_iri = actor.iri();
    let to = vec![AS_PUBLIC];
    let cc: Vec<&str> = note.cc.iter().map(String::as_str).collect();

    let activity = match kind {
        ActivityKind::Create | ActivityKind::Update => {
            let object = serde_json::to_value(note)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize note: {}", e)))?;
            let id = format!("{}#{}-{}", actor_iri, kind.as_str(), random_suffix());
            if kind == ActivityKind::Create {
                builder::create(&id, &actor_iri, object, to, cc)
            } else {
                builder::update(&id, &actor_iri, object, to, cc)
            }
        }
        ActivityKind::Delete => {
            let id = format!("{}#Delete-{}#Delete", actor_iri, random_suffix());
            builder::delete(&id, &actor_iri, builder::tombstone(&note.id), to, cc)
        }
    };

    Ok(activity)
}

/// Copy of `activity` carbon-copied to the actors behind one inbox.
fn address_to(activity: &Value, kind: ActivityKind, actors: &[String]) -> Value {
    let mut addressed = activity.clone();
    addressed["cc"] = Value::from(actors.to_vec());
    if kind != ActivityKind::Delete {
        if let Some(object) = addressed.get_mut("object").and_then(Value::as_object_mut) {
            object.insert("cc".to_string(), Value::from(actors.to_vec()));
        }
    }
    addressed
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use crate::federation::actor::AS_CONTEXT;

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted, verbatim
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (a Note)
    /// * `to` - Primary recipients
    /// * `cc` - CC recipients
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        let published = object.get("published").cloned().unwrap_or(Value::Null);
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": published
        })
    }

    /// Build an Update activity
    pub fn update(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    /// Build a Delete activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (deleter)
    /// * `object` - Tombstone of the deleted object
    pub fn delete(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    /// Tombstone standing in for a deleted Note
    pub fn tombstone(id: &str) -> Value {
        serde_json::json!({
            "type": "Tombstone",
            "id": id,
            "formerType": "Note"
        })
    }
}
