//! Follower store
//!
//! The durable follower set of each blog, and the grouping of followers
//! into delivery targets.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::actor::Person;
use crate::data::{Database, Follower};
use crate::error::AppError;
use crate::metrics::FOLLOWERS_TOTAL;

/// Follow edges between local blogs and remote actors
#[derive(Clone)]
pub struct FollowerStore {
    db: Arc<Database>,
}

impl FollowerStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a follower together with its actor row and public key.
    ///
    /// Returns `true` when the edge is new.
    pub async fn record_follow(&self, collection_id: i64, actor: &Person) -> Result<bool, AppError> {
        let key = (!actor.public_key.id.is_empty()).then(|| {
            (
                actor.public_key.id.as_str(),
                actor.public_key.public_key_pem.as_str(),
            )
        });

        let created = self
            .db
            .add_follower_with_actor(collection_id, &actor.to_remote_user(None), key)
            .await?;
        if created {
            FOLLOWERS_TOTAL.inc();
        }
        Ok(created)
    }

    /// Idempotently follow a blog with an already cached remote user.
    pub async fn add_follower(&self, collection_id: i64, remote_user_id: i64) -> Result<bool, AppError> {
        let created = self.db.add_follower(collection_id, remote_user_id).await?;
        if created {
            FOLLOWERS_TOTAL.inc();
        }
        Ok(created)
    }

    /// Delete the edge for `(blog, actor)`; the remote user stays cached.
    pub async fn remove_follower(&self, collection_id: i64, actor_iri: &str) -> Result<bool, AppError> {
        let removed = self.db.remove_follower(collection_id, actor_iri).await?;
        if removed {
            FOLLOWERS_TOTAL.dec();
        }
        Ok(removed)
    }

    /// Drop every follower of a blog in one transaction.
    pub async fn remove_all_followers(&self, collection_id: i64) -> Result<u64, AppError> {
        let removed = self.db.remove_all_followers(collection_id).await?;
        FOLLOWERS_TOTAL.sub(removed as i64);
        Ok(removed)
    }

    pub async fn list_followers(&self, collection_id: i64) -> Result<Vec<Follower>, AppError> {
        self.db.list_followers(collection_id).await
    }

    pub async fn follower_count(&self, collection_id: i64) -> Result<i64, AppError> {
        self.db.follower_count(collection_id).await
    }
}

/// Group followers by delivery inbox
///
/// Followers advertising a shared inbox are grouped under it; the rest are
/// keyed by their personal inbox. Each value lists the actor IRIs reached
/// through that inbox.
pub fn inbox_buckets(followers: &[Follower]) -> BTreeMap<String, Vec<String>> {
    let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for follower in followers {
        buckets
            .entry(follower.delivery_inbox().to_string())
            .or_default()
            .push(follower.actor_id.clone());
    }
    buckets
}
