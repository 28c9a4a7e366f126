//! SQLite database operations
//!
//! All database access goes through this module.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

const COLLECTION_WITH_OWNER_SELECT: &str = r#"
    SELECT c.id, c.alias, c.title, c.description, c.owner_id, c.visibility, c.created,
           u.silenced AS owner_silenced
    FROM collections c
    JOIN users u ON u.id = c.owner_id
"#;

const FOLLOWER_SELECT: &str = r#"
    SELECT r.id AS remote_user_id, r.actor_id, r.inbox, r.shared_inbox,
           f.created AS followed_at
    FROM remote_follows f
    JOIN remote_users r ON r.id = f.remote_user_id
    WHERE f.collection_id = ?
"#;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users & collections
    // =========================================================================

    /// Create a local user
    pub async fn insert_user(&self, username: &str) -> Result<User, AppError> {
        let result = sqlx::query("INSERT INTO users (username, silenced, created) VALUES (?, 0, ?)")
            .bind(username)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;

        Ok(user)
    }

    /// Silence or unsilence a user
    pub async fn set_user_silenced(&self, user_id: i64, silenced: bool) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE users SET silenced = ? WHERE id = ?")
            .bind(silenced)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Count local users
    pub async fn count_users(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Create a blog
    pub async fn insert_collection(
        &self,
        alias: &str,
        title: &str,
        description: &str,
        owner_id: i64,
        visibility: Visibility,
    ) -> Result<Collection, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO collections (alias, title, description, owner_id, visibility, created)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alias)
        .bind(title)
        .bind(description)
        .bind(owner_id)
        .bind(visibility.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let collection = sqlx::query_as::<_, Collection>("SELECT * FROM collections WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;

        Ok(collection)
    }

    /// Change a blog's visibility
    pub async fn set_collection_visibility(
        &self,
        collection_id: i64,
        visibility: Visibility,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE collections SET visibility = ? WHERE id = ?")
            .bind(visibility.as_str())
            .bind(collection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a blog by alias
    pub async fn get_collection_by_alias(
        &self,
        alias: &str,
    ) -> Result<Option<CollectionWithOwner>, AppError> {
        let sql = format!("{} WHERE c.alias = ?", COLLECTION_WITH_OWNER_SELECT);
        let collection = sqlx::query_as::<_, CollectionWithOwner>(&sql)
            .bind(alias)
            .fetch_optional(&self.pool)
            .await?;

        Ok(collection)
    }

    /// Get a blog by id
    pub async fn get_collection_by_id(
        &self,
        collection_id: i64,
    ) -> Result<Option<CollectionWithOwner>, AppError> {
        let sql = format!("{} WHERE c.id = ?", COLLECTION_WITH_OWNER_SELECT);
        let collection = sqlx::query_as::<_, CollectionWithOwner>(&sql)
            .bind(collection_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(collection)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Store a post
    pub async fn insert_post(&self, post: &Post) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO posts
            (id, slug, collection_id, title, content, html_content, language, created, updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.slug)
        .bind(post.collection_id)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.html_content)
        .bind(&post.language)
        .bind(post.created)
        .bind(post.updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of posts published to a blog
    pub async fn count_collection_posts(&self, collection_id: i64) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE collection_id = ?")
                .bind(collection_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Page of a blog's posts, newest first
    pub async fn get_collection_posts(
        &self,
        collection_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>, AppError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE collection_id = ?
            ORDER BY created DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(collection_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    /// Posts that belong to a blog, across the instance
    pub async fn count_local_posts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE collection_id IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Blog keypairs
    // =========================================================================

    /// Get a blog's stored keypair
    pub async fn get_collection_keypair(
        &self,
        collection_id: i64,
    ) -> Result<Option<CollectionKeypair>, AppError> {
        let keypair = sqlx::query_as::<_, CollectionKeypair>(
            "SELECT collection_id, public_key_pem, private_key_pem FROM collection_keys WHERE collection_id = ?",
        )
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(keypair)
    }

    /// Store a keypair unless one already exists for the blog.
    ///
    /// Returns `true` when this call stored it.
    pub async fn insert_collection_keypair_if_absent(
        &self,
        keypair: &CollectionKeypair,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO collection_keys (collection_id, public_key_pem, private_key_pem)
            VALUES (?, ?, ?)
            ON CONFLICT(collection_id) DO NOTHING
            "#,
        )
        .bind(keypair.collection_id)
        .bind(&keypair.public_key_pem)
        .bind(&keypair.private_key_pem)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Remote users
    // =========================================================================

    /// Get a cached remote actor by actor IRI
    pub async fn get_remote_user_by_actor_id(
        &self,
        actor_id: &str,
    ) -> Result<Option<RemoteUser>, AppError> {
        let user = sqlx::query_as::<_, RemoteUser>("SELECT * FROM remote_users WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Get a cached remote actor by row id
    pub async fn get_remote_user_by_id(&self, id: i64) -> Result<Option<RemoteUser>, AppError> {
        let user = sqlx::query_as::<_, RemoteUser>("SELECT * FROM remote_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Get a cached remote actor by `@user@host` handle
    pub async fn get_remote_user_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<RemoteUser>, AppError> {
        let user = sqlx::query_as::<_, RemoteUser>("SELECT * FROM remote_users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Cache a remote actor, refreshing its inboxes if already known.
    ///
    /// A stored url or handle is never cleared by a later refresh.
    pub async fn upsert_remote_user(&self, user: &NewRemoteUser) -> Result<RemoteUser, AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_users (actor_id, inbox, shared_inbox, url, handle, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_id) DO UPDATE SET
                inbox = excluded.inbox,
                shared_inbox = excluded.shared_inbox,
                url = COALESCE(excluded.url, remote_users.url),
                handle = COALESCE(remote_users.handle, excluded.handle)
            "#,
        )
        .bind(&user.actor_id)
        .bind(&user.inbox)
        .bind(&user.shared_inbox)
        .bind(&user.url)
        .bind(&user.handle)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_remote_user_by_actor_id(&user.actor_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "remote user {} missing after upsert",
                    user.actor_id
                ))
            })
    }

    /// Attach a handle to a cached actor that was stored without one
    pub async fn set_remote_user_handle(
        &self,
        actor_id: &str,
        handle: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE remote_users SET handle = ? WHERE actor_id = ?")
            .bind(handle)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Backfill the profile URL of a cached actor
    pub async fn set_remote_user_url(&self, actor_id: &str, url: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE remote_users SET url = ? WHERE actor_id = ?")
            .bind(url)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a cached public key by key id
    pub async fn get_remote_user_key(
        &self,
        key_id: &str,
    ) -> Result<Option<RemoteUserKey>, AppError> {
        let key = sqlx::query_as::<_, RemoteUserKey>(
            "SELECT key_id, remote_user_id, public_key_pem FROM remote_user_keys WHERE key_id = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Get the first cached public key of a remote actor
    pub async fn get_remote_user_key_for_user(
        &self,
        remote_user_id: i64,
    ) -> Result<Option<RemoteUserKey>, AppError> {
        let key = sqlx::query_as::<_, RemoteUserKey>(
            r#"
            SELECT key_id, remote_user_id, public_key_pem FROM remote_user_keys
            WHERE remote_user_id = ?
            ORDER BY key_id
            LIMIT 1
            "#,
        )
        .bind(remote_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Cache a public key; keys are write-once.
    pub async fn insert_remote_user_key_if_absent(
        &self,
        key: &RemoteUserKey,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO remote_user_keys (key_id, remote_user_id, public_key_pem) VALUES (?, ?, ?)",
        )
        .bind(&key.key_id)
        .bind(key.remote_user_id)
        .bind(&key.public_key_pem)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Record a follow edge together with the follower's actor and key.
    ///
    /// Runs as one transaction: insert the remote user if new, its key, then
    /// the edge. A unique violation on the key or the edge rolls the
    /// transaction back and the write is retried as an upsert of the edge.
    ///
    /// Returns `true` when a new edge was created.
    pub async fn add_follower_with_actor(
        &self,
        collection_id: i64,
        actor: &NewRemoteUser,
        key: Option<(&str, &str)>,
    ) -> Result<bool, AppError> {
        match self.insert_follow_graph(collection_id, actor, key).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_unique_violation() => {
                tracing::debug!(
                    collection_id,
                    actor = %actor.actor_id,
                    "Follow already partially recorded; retrying as upsert"
                );
                self.upsert_follow_graph(collection_id, actor, key).await
            }
            Err(error) => Err(error),
        }
    }

    async fn insert_follow_graph(
        &self,
        collection_id: i64,
        actor: &NewRemoteUser,
        key: Option<(&str, &str)>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query_scalar::<_, i64>("SELECT id FROM remote_users WHERE actor_id = ?")
                .bind(&actor.actor_id)
                .fetch_optional(&mut *tx)
                .await?;

        let remote_user_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO remote_users (actor_id, inbox, shared_inbox, url, handle, created)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&actor.actor_id)
                .bind(&actor.inbox)
                .bind(&actor.shared_inbox)
                .bind(&actor.url)
                .bind(&actor.handle)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            }
        };

        if let Some((key_id, public_key_pem)) = key {
            sqlx::query(
                "INSERT INTO remote_user_keys (key_id, remote_user_id, public_key_pem) VALUES (?, ?, ?)",
            )
            .bind(key_id)
            .bind(remote_user_id)
            .bind(public_key_pem)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO remote_follows (collection_id, remote_user_id, created) VALUES (?, ?, ?)",
        )
        .bind(collection_id)
        .bind(remote_user_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_follow_graph(
        &self,
        collection_id: i64,
        actor: &NewRemoteUser,
        key: Option<(&str, &str)>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO remote_users (actor_id, inbox, shared_inbox, url, handle, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_id) DO NOTHING
            "#,
        )
        .bind(&actor.actor_id)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.url)
        .bind(&actor.handle)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let remote_user_id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM remote_users WHERE actor_id = ?",
        )
        .bind(&actor.actor_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some((key_id, public_key_pem)) = key {
            sqlx::query(
                "INSERT OR IGNORE INTO remote_user_keys (key_id, remote_user_id, public_key_pem) VALUES (?, ?, ?)",
            )
            .bind(key_id)
            .bind(remote_user_id)
            .bind(public_key_pem)
            .execute(&mut *tx)
            .await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO remote_follows (collection_id, remote_user_id, created)
            VALUES (?, ?, ?)
            ON CONFLICT(collection_id, remote_user_id) DO NOTHING
            "#,
        )
        .bind(collection_id)
        .bind(remote_user_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected() > 0)
    }

    /// Record a follow edge for an already cached remote user.
    ///
    /// Idempotent; returns `true` when the edge is new.
    pub async fn add_follower(
        &self,
        collection_id: i64,
        remote_user_id: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO remote_follows (collection_id, remote_user_id, created)
            VALUES (?, ?, ?)
            ON CONFLICT(collection_id, remote_user_id) DO NOTHING
            "#,
        )
        .bind(collection_id)
        .bind(remote_user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete the follow edge between a blog and a remote actor.
    ///
    /// The cached remote user is kept. Returns `true` when an edge existed.
    pub async fn remove_follower(
        &self,
        collection_id: i64,
        actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM remote_follows
            WHERE collection_id = ?
              AND remote_user_id = (SELECT id FROM remote_users WHERE actor_id = ?)
            "#,
        )
        .bind(collection_id)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop every follow edge of a blog, e.g. when its owner is deleted.
    pub async fn remove_all_followers(&self, collection_id: i64) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM remote_follows WHERE collection_id = ?")
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    /// All followers of a blog, oldest edge first
    pub async fn list_followers(&self, collection_id: i64) -> Result<Vec<Follower>, AppError> {
        let sql = format!("{} ORDER BY f.created ASC, r.id ASC", FOLLOWER_SELECT);
        let followers = sqlx::query_as::<_, Follower>(&sql)
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(followers)
    }

    /// Page of a blog's followers, newest edge first
    pub async fn list_followers_page(
        &self,
        collection_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Follower>, AppError> {
        let sql = format!(
            "{} ORDER BY f.created DESC, r.id DESC LIMIT ? OFFSET ?",
            FOLLOWER_SELECT
        );
        let followers = sqlx::query_as::<_, Follower>(&sql)
            .bind(collection_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(followers)
    }

    /// Number of followers of a blog
    pub async fn follower_count(&self, collection_id: i64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM remote_follows WHERE collection_id = ?",
        )
        .bind(collection_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
