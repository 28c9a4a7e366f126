//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use inkfed::data::{Collection, Post, Visibility};
use inkfed::error::AppError;
use inkfed::federation::keys::generate_keypair_pem;
use inkfed::federation::{RemoteClient, SigningIdentity, sign_request};
use inkfed::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const DOMAIN: &str = "blogs.test";

/// Activity posted by the server to a remote inbox
#[derive(Debug, Clone)]
pub struct SentActivity {
    pub inbox: String,
    pub activity: Value,
    pub key_id: String,
}

/// Remote side of the federation, held in memory
///
/// Serves canned documents for signed GETs and records every POST.
#[derive(Default)]
pub struct RecordingClient {
    documents: Mutex<HashMap<String, Value>>,
    sent: Mutex<Vec<SentActivity>>,
    failing_inboxes: Mutex<Vec<String>>,
}

impl RecordingClient {
    pub fn serve(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document);
    }

    pub fn fail_inbox(&self, inbox: &str) {
        self.failing_inboxes.lock().unwrap().push(inbox.to_string());
    }

    pub fn sent(&self) -> Vec<SentActivity> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait for background deliveries to reach `count`.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<SentActivity> {
        for _ in 0..250 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} deliveries, got {:?}", self.sent());
    }
}

#[async_trait]
impl RemoteClient for RecordingClient {
    async fn post_activity(
        &self,
        inbox: &str,
        activity: &Value,
        signer: &SigningIdentity,
    ) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(SentActivity {
            inbox: inbox.to_string(),
            activity: activity.clone(),
            key_id: signer.key_id.clone(),
        });
        if self.failing_inboxes.lock().unwrap().iter().any(|i| i == inbox) {
            return Err(AppError::TransientRemote(format!("{inbox}: 503")));
        }
        Ok(())
    }

    async fn fetch_json(&self, url: &str, _signer: &SigningIdentity) -> Result<Value, AppError> {
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::RemoteNotFound(url.to_string()))
    }
}

/// A remote actor with a real keypair
pub struct RemoteActor {
    pub id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteActor {
    pub fn new(host: &str, name: &str, shared_inbox: bool) -> Self {
        let (public_key_pem, private_key_pem) = generate_keypair_pem(1024).unwrap();
        let id = format!("https://{host}/users/{name}");
        Self {
            inbox: format!("{id}/inbox"),
            shared_inbox: shared_inbox.then(|| format!("https://{host}/inbox")),
            id,
            private_key_pem,
            public_key_pem,
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    pub fn document(&self) -> Value {
        let mut document = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": self.id,
            "type": "Person",
            "inbox": self.inbox,
            "publicKey": {
                "id": self.key_id(),
                "owner": self.id,
                "publicKeyPem": self.public_key_pem
            }
        });
        if let Some(shared_inbox) = &self.shared_inbox {
            document["endpoints"] = json!({ "sharedInbox": shared_inbox });
        }
        document
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub remote: Arc<RecordingClient>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        instance: config::InstanceConfig {
            site_name: "Test Blogs".to_string(),
            description: "Test inkfed instance".to_string(),
            single_user: false,
            federation: true,
            private: false,
        },
        federation: config::FederationConfig {
            delivery_concurrency: 2,
            http_timeout_seconds: 5,
            accept_delay_ms: 0,
            key_bits: 1024,
            page_size: 10,
            allow_private_hosts: true,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        let remote = Arc::new(RecordingClient::default());
        let state = AppState::with_client(config, remote.clone()).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = inkfed::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            remote,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a blog owned by a fresh user
    pub async fn create_blog(&self, alias: &str, visibility: Visibility) -> Collection {
        let owner = self
            .state
            .db
            .insert_user(&format!("{alias}-owner"))
            .await
            .unwrap();
        self.state
            .db
            .insert_collection(alias, &format!("Blog of {alias}"), "A test blog", owner.id, visibility)
            .await
            .unwrap()
    }

    /// Publish `count` posts to a blog, oldest first
    pub async fn create_posts(&self, blog: &Collection, count: usize) -> Vec<Post> {
        let start = Utc::now() - chrono::Duration::hours(count as i64);
        let mut posts = Vec::new();
        for n in 0..count {
            let post = Post {
                id: format!("{}post{:02}", blog.alias, n),
                slug: Some(format!("post-{n}")),
                collection_id: Some(blog.id),
                title: format!("Post {n}"),
                content: format!("Body of post {n} #testing"),
                html_content: format!("<p>Body of post {n} #testing</p>"),
                language: Some("en".to_string()),
                created: start + chrono::Duration::hours(n as i64),
                updated: None,
            };
            self.state.db.insert_post(&post).await.unwrap();
            posts.push(post);
        }
        posts
    }

    /// Make `actor` discoverable and POST `activity` to `path`, signed by it
    pub async fn post_signed(
        &self,
        path: &str,
        actor: &RemoteActor,
        activity: &Value,
    ) -> reqwest::Response {
        self.remote.serve(&actor.id, actor.document());

        let body = serde_json::to_vec(activity).unwrap();
        let url = self.url(path);
        let signed = sign_request("POST", &url, &body, &actor.private_key_pem, &actor.key_id()).unwrap();

        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Actor IRI of a local blog
    pub fn blog_iri(&self, alias: &str) -> String {
        format!("https://{DOMAIN}/api/collections/{alias}")
    }
}
