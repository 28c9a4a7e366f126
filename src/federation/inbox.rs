//! Inbox processing
//!
//! An inbound activity is handled in two phases. `receive` authenticates the
//! request and decides what to do before the HTTP response is sent;
//! `complete` persists state and answers the remote server afterwards.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::actor::{BlogActor, Person};
use super::client::RemoteClient;
use super::delivery::{builder, random_suffix};
use super::followers::FollowerStore;
use super::keys::KeyStore;
use super::resolver::Resolver;
use super::signature::{InboundRequest, extract_signature_key_id, verify_request};
use crate::config::AppConfig;
use crate::data::{Collection, Database};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Envelope fields read from every inbound activity
#[derive(Debug, Deserialize)]
struct IncomingActivity {
    #[serde(rename = "type", default)]
    kind: String,
    actor: Option<Value>,
    object: Option<Value>,
}

/// `actor` and `object` may be an IRI or an embedded object with an `id`.
fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri.as_str()),
        Value::Object(object) => object.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// What the background phase has to do
#[derive(Debug, Clone)]
pub enum InboxAction {
    /// Store the follower, then send `accept`
    Follow { follower: Person, accept: Value },
    /// Drop the follow edge, then send `accept`
    UndoFollow { follower: Person, accept: Value },
    /// Acknowledged and otherwise ignored
    Ignore,
}

/// An authenticated activity waiting for its background phase
#[derive(Debug, Clone)]
pub struct InboxTask {
    pub collection_id: i64,
    pub blog: BlogActor,
    pub action: InboxAction,
}

/// Inbox processor
pub struct InboxProcessor {
    config: Arc<AppConfig>,
    keys: Arc<KeyStore>,
    client: Arc<dyn RemoteClient>,
    resolver: Arc<Resolver>,
    followers: FollowerStore,
}

impl InboxProcessor {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        keys: Arc<KeyStore>,
        client: Arc<dyn RemoteClient>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            config,
            keys,
            client,
            resolver,
            followers: FollowerStore::new(db),
        }
    }

    /// Authenticate an activity posted to `blog`'s inbox and decide on it
    ///
    /// # Steps
    /// 1. Require a `Signature` header
    /// 2. Parse the body as JSON
    /// 3. Resolve the signing key and verify the signature
    /// 4. Check the key's owner is the activity's `actor`
    /// 5. Choose the action by activity `type`
    ///
    /// # Errors
    /// `SignatureInvalid` for steps 1, 3 and 4; `MalformedActivity` for 2.
    pub async fn receive(
        &self,
        blog: &Collection,
        request: &InboundRequest<'_>,
    ) -> Result<InboxTask, AppError> {
        let key_id = extract_signature_key_id(request.headers)?;

        let raw: Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::MalformedActivity(format!("Invalid JSON: {}", e)))?;
        let activity: IncomingActivity = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::MalformedActivity(e.to_string()))?;

        let actor_iri = activity
            .actor
            .as_ref()
            .and_then(id_of)
            .ok_or_else(|| AppError::MalformedActivity("Missing actor".to_string()))?
            .to_string();

        let resolver = &self.resolver;
        let mut signer = None;
        let slot = &mut signer;
        verify_request(request, |key_id| async move {
            let person = resolver.resolve_key_owner(&key_id).await?;
            let public_key_pem = person.public_key.public_key_pem.clone();
            *slot = Some(person);
            Ok(public_key_pem)
        })
        .await?;
        let follower = signer.ok_or(AppError::SignatureInvalid)?;

        if follower.id != actor_iri {
            tracing::warn!(
                %key_id,
                owner = %follower.id,
                actor = %actor_iri,
                "Signature key does not belong to actor"
            );
            return Err(AppError::SignatureInvalid);
        }

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity_label(&activity.kind)])
            .inc();

        let actor = BlogActor::new(blog, &self.config);
        let action = match activity.kind.as_str() {
            "Follow" => InboxAction::Follow {
                follower,
                accept: self.accept(&actor, raw),
            },
            "Undo" if undoes_follow(&activity) => InboxAction::UndoFollow {
                follower,
                accept: self.accept(&actor, raw),
            },
            other => {
                tracing::debug!(activity = other, actor = %actor_iri, "Ignoring activity");
                InboxAction::Ignore
            }
        };

        tracing::info!(
            collection_id = blog.id,
            actor = %actor_iri,
            activity = %activity.kind,
            "Inbox activity accepted"
        );

        Ok(InboxTask {
            collection_id: blog.id,
            blog: actor,
            action,
        })
    }

    fn accept(&self, actor: &BlogActor, object: Value) -> Value {
        let iri = actor.iri();
        let id = format!("{}#accept-{}", iri, random_suffix());
        builder::accept(&id, &iri, object)
    }

    /// Persist the outcome of an activity and answer it
    ///
    /// The Accept is posted after `federation.accept_delay_ms` so the remote
    /// server has recorded its own Follow by the time it arrives.
    pub async fn complete(&self, task: InboxTask) -> Result<(), AppError> {
        let (follower, accept) = match task.action {
            InboxAction::Ignore => return Ok(()),
            InboxAction::Follow { follower, accept } => {
                let created = self
                    .followers
                    .record_follow(task.collection_id, &follower)
                    .await?;
                tracing::info!(
                    collection_id = task.collection_id,
                    follower = %follower.id,
                    created,
                    "Follower recorded"
                );
                (follower, accept)
            }
            InboxAction::UndoFollow { follower, accept } => {
                let removed = self
                    .followers
                    .remove_follower(task.collection_id, &follower.id)
                    .await?;
                tracing::info!(
                    collection_id = task.collection_id,
                    follower = %follower.id,
                    removed,
                    "Follower removed"
                );
                (follower, accept)
            }
        };

        let delay = self.config.federation.accept_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let signer = self.keys.signer(task.collection_id, &task.blog).await?;
        self.client
            .post_activity(&follower.inbox, &accept, &signer)
            .await?;
        tracing::debug!(inbox = %follower.inbox, "Accept delivered");
        Ok(())
    }

    /// Run `complete` on its own task; failures are only logged.
    pub fn spawn(self: &Arc<Self>, task: InboxTask) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let collection_id = task.collection_id;
            if let Err(error) = processor.complete(task).await {
                tracing::error!(collection_id, %error, "Inbox background processing failed");
            }
        });
    }
}

fn undoes_follow(activity: &IncomingActivity) -> bool {
    activity
        .object
        .as_ref()
        .and_then(|object| object.get("type"))
        .and_then(Value::as_str)
        == Some("Follow")
}

/// Bounded label set for the received-activities counter.
fn activity_label(kind: &str) -> &'static str {
    match kind {
        "Follow" => "Follow",
        "Undo" => "Undo",
        "Create" => "Create",
        "Update" => "Update",
        "Delete" => "Delete",
        "Accept" => "Accept",
        "Reject" => "Reject",
        "Like" => "Like",
        "Announce" => "Announce",
        _ => "other",
    }
}
