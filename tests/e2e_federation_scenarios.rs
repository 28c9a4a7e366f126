//! E2E tests for federation scenarios
//!
//! These tests drive the complete flow of federation activities:
//! - Follow lifecycle: signed Follow → Accept → follower listed
//! - Undo Follow → Accept → follower gone
//! - Inbox rejection of unsigned, forged and malformed requests
//! - Local post → fan-out to follower inboxes

mod common;

use chrono::Utc;
use common::{DOMAIN, RemoteActor, TestServer};
use inkfed::data::{NewRemoteUser, Post, Visibility};
use inkfed::federation::{ActivityKind, FederationReport, PostEvent};
use serde_json::{Value, json};

fn follow_of(actor: &RemoteActor, server: &TestServer, alias: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/follows/{}", actor.id, alias),
        "type": "Follow",
        "actor": actor.id,
        "object": server.blog_iri(alias)
    })
}

async fn followers_of(server: &TestServer, alias: &str) -> Value {
    server
        .client
        .get(&server.url(&format!("/api/collections/{alias}/followers?page=1")))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// =============================================================================
// Scenario 1: Follow lifecycle
// =============================================================================

#[tokio::test]
async fn test_follow_is_accepted_and_listed() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", true);

    let follow = follow_of(&bob, &server, "alice");
    let response = server
        .post_signed("/api/collections/alice/inbox", &bob, &follow)
        .await;
    assert_eq!(response.status(), 200);

    let sent = server.remote.wait_for_sent(1).await;
    assert_eq!(sent[0].inbox, bob.inbox);
    assert_eq!(sent[0].key_id, format!("{}#main-key", server.blog_iri("alice")));
    assert_eq!(sent[0].activity["type"], "Accept");
    assert_eq!(sent[0].activity["actor"], server.blog_iri("alice"));
    assert_eq!(sent[0].activity["object"], follow);

    let followers = followers_of(&server, "alice").await;
    assert_eq!(followers["totalItems"], 1);
    assert_eq!(followers["orderedItems"][0], bob.id);
}

#[tokio::test]
async fn test_follow_via_short_inbox_path() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);

    let response = server
        .post_signed("/alice/inbox", &bob, &follow_of(&bob, &server, "alice"))
        .await;
    assert_eq!(response.status(), 200);
    server.remote.wait_for_sent(1).await;
}

#[tokio::test]
async fn test_repeated_follow_keeps_one_edge() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", true);
    let follow = follow_of(&bob, &server, "alice");

    for _ in 0..2 {
        let response = server
            .post_signed("/api/collections/alice/inbox", &bob, &follow)
            .await;
        assert_eq!(response.status(), 200);
    }

    server.remote.wait_for_sent(2).await;
    let followers = followers_of(&server, "alice").await;
    assert_eq!(followers["totalItems"], 1);
}

#[tokio::test]
async fn test_undo_follow_removes_follower() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", true);
    let follow = follow_of(&bob, &server, "alice");

    server
        .post_signed("/api/collections/alice/inbox", &bob, &follow)
        .await;
    server.remote.wait_for_sent(1).await;

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/undo/1", bob.id),
        "type": "Undo",
        "actor": bob.id,
        "object": follow
    });
    let response = server
        .post_signed("/api/collections/alice/inbox", &bob, &undo)
        .await;
    assert_eq!(response.status(), 200);

    let sent = server.remote.wait_for_sent(2).await;
    assert_eq!(sent[1].activity["type"], "Accept");
    assert_eq!(sent[1].activity["object"]["type"], "Undo");

    let followers = followers_of(&server, "alice").await;
    assert_eq!(followers["totalItems"], 0);
}

#[tokio::test]
async fn test_unhandled_activity_is_acknowledged() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);

    let like = json!({
        "type": "Like",
        "actor": bob.id,
        "object": format!("https://{DOMAIN}/alice/post-0")
    });
    let response = server
        .post_signed("/api/collections/alice/inbox", &bob, &like)
        .await;
    assert_eq!(response.status(), 200);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(server.remote.sent().is_empty());
}

// =============================================================================
// Scenario 2: Inbox rejections
// =============================================================================

#[tokio::test]
async fn test_inbox_rejects_unsigned_activity() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);

    let response = server
        .client
        .post(&server.url("/api/collections/alice/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&follow_of(&bob, &server, "alice"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_inbox_rejects_signature_from_wrong_key() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);
    let impostor = RemoteActor::new("remote.example", "bob", false);

    // The impostor signs as bob, but bob's document carries bob's key.
    server.remote.serve(&bob.id, bob.document());
    let body = serde_json::to_vec(&follow_of(&bob, &server, "alice")).unwrap();
    let url = server.url("/api/collections/alice/inbox");
    let signed = inkfed::federation::sign_request(
        "POST",
        &url,
        &body,
        &impostor.private_key_pem,
        &bob.key_id(),
    )
    .unwrap();

    let response = server
        .client
        .post(&url)
        .header("Date", signed.date)
        .header("Digest", signed.digest)
        .header("Signature", signed.signature)
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(followers_of(&server, "alice").await["totalItems"], 0);
}

#[tokio::test]
async fn test_inbox_rejects_malformed_json() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);

    let body = b"{ definitely not json".to_vec();
    let url = server.url("/api/collections/alice/inbox");
    let signed =
        inkfed::federation::sign_request("POST", &url, &body, &bob.private_key_pem, &bob.key_id())
            .unwrap();

    let response = server
        .client
        .post(&url)
        .header("Date", signed.date)
        .header("Digest", signed.digest)
        .header("Signature", signed.signature)
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_inbox_of_silenced_blog_is_not_found() {
    let server = TestServer::new().await;
    let blog = server.create_blog("muted", Visibility::Public).await;
    server.state.db.set_user_silenced(blog.owner_id, true).await.unwrap();
    let bob = RemoteActor::new("remote.example", "bob", false);

    let response = server
        .post_signed("/api/collections/muted/inbox", &bob, &follow_of(&bob, &server, "muted"))
        .await;
    assert_eq!(response.status(), 404);
}

// =============================================================================
// Scenario 3: Local post → fan-out
// =============================================================================

async fn add_follower(server: &TestServer, blog_id: i64, actor: &RemoteActor) {
    server
        .state
        .db
        .add_follower_with_actor(
            blog_id,
            &NewRemoteUser {
                actor_id: actor.id.clone(),
                inbox: actor.inbox.clone(),
                shared_inbox: actor.shared_inbox.clone(),
                url: None,
                handle: None,
            },
            None,
        )
        .await
        .unwrap();
}

fn post_for(blog_id: i64, content: &str) -> Post {
    Post {
        id: "fanout1".to_string(),
        slug: Some("fan-out".to_string()),
        collection_id: Some(blog_id),
        title: "Fan-out".to_string(),
        content: content.to_string(),
        html_content: format!("<p>{content}</p>"),
        language: None,
        created: Utc::now(),
        updated: None,
    }
}

#[tokio::test]
async fn test_create_is_delivered_once_per_shared_inbox() {
    let server = TestServer::new().await;
    let blog = server.create_blog("alice", Visibility::Public).await;

    let a1 = RemoteActor::new("a.example", "one", true);
    let a2 = RemoteActor::new("a.example", "two", true);
    let b = RemoteActor::new("b.example", "three", false);
    for actor in [&a1, &a2, &b] {
        add_follower(&server, blog.id, actor).await;
    }

    let report = server
        .state
        .federation
        .federate(&PostEvent {
            kind: ActivityKind::Create,
            post: post_for(blog.id, "Hello fediverse #intro"),
        })
        .await
        .unwrap();
    assert_eq!(
        report,
        FederationReport {
            attempted: 2,
            delivered: 2,
            failed: 0
        }
    );

    let mut sent = server.remote.sent();
    sent.sort_by(|x, y| x.inbox.cmp(&y.inbox));
    assert_eq!(sent.len(), 2);

    assert_eq!(sent[0].inbox, "https://a.example/inbox");
    let mut cc: Vec<String> = sent[0].activity["cc"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    cc.sort();
    assert_eq!(cc, vec![a1.id.clone(), a2.id.clone()]);

    assert_eq!(sent[1].inbox, b.inbox);
    assert_eq!(sent[1].activity["cc"], json!([b.id]));

    for delivery in &sent {
        assert_eq!(delivery.key_id, format!("{}#main-key", server.blog_iri("alice")));
        assert_eq!(delivery.activity["type"], "Create");
        assert_eq!(delivery.activity["object"]["type"], "Note");
        assert_eq!(delivery.activity["object"]["id"], format!("https://{DOMAIN}/alice/fan-out"));
        assert_eq!(
            delivery.activity["to"],
            json!(["https://www.w3.org/ns/activitystreams#Public"])
        );
    }
}

#[tokio::test]
async fn test_failed_inbox_does_not_stop_fan_out() {
    let server = TestServer::new().await;
    let blog = server.create_blog("alice", Visibility::Public).await;
    let down = RemoteActor::new("down.example", "gone", false);
    let up = RemoteActor::new("up.example", "here", false);
    add_follower(&server, blog.id, &down).await;
    add_follower(&server, blog.id, &up).await;
    server.remote.fail_inbox(&down.inbox);

    let report = server
        .state
        .federation
        .federate(&PostEvent {
            kind: ActivityKind::Update,
            post: post_for(blog.id, "Edited"),
        })
        .await
        .unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_delete_sends_tombstone() {
    let server = TestServer::new().await;
    let blog = server.create_blog("alice", Visibility::Public).await;
    let bob = RemoteActor::new("remote.example", "bob", false);
    add_follower(&server, blog.id, &bob).await;

    server
        .state
        .federation
        .federate(&PostEvent {
            kind: ActivityKind::Delete,
            post: post_for(blog.id, "Gone soon"),
        })
        .await
        .unwrap();

    let sent = server.remote.sent();
    assert_eq!(sent.len(), 1);
    let delete = &sent[0].activity;
    assert_eq!(delete["type"], "Delete");
    assert!(delete["id"].as_str().unwrap().ends_with("#Delete"));
    assert_eq!(delete["object"]["type"], "Tombstone");
    assert_eq!(delete["object"]["formerType"], "Note");
    assert_eq!(delete["object"]["id"], format!("https://{DOMAIN}/alice/fan-out"));
}

#[tokio::test]
async fn test_private_blog_does_not_federate() {
    let server = TestServer::new().await;
    let blog = server.create_blog("secret", Visibility::Private).await;
    let bob = RemoteActor::new("remote.example", "bob", false);
    add_follower(&server, blog.id, &bob).await;

    let report = server
        .state
        .federation
        .federate(&PostEvent {
            kind: ActivityKind::Create,
            post: post_for(blog.id, "Nobody sees this"),
        })
        .await
        .unwrap();

    assert_eq!(report, FederationReport::default());
    assert!(server.remote.sent().is_empty());
}

#[tokio::test]
async fn test_mention_resolves_handle_and_delivers_to_personal_inbox() {
    let server = TestServer::new().await;
    let blog = server.create_blog("alice", Visibility::Public).await;
    let carol = RemoteActor::new("social.example", "carol", true);

    server.remote.serve(
        "https://social.example/.well-known/webfinger?resource=acct%3Acarol%40social.example",
        json!({
            "subject": "acct:carol@social.example",
            "links": [{ "rel": "self", "type": "application/activity+json", "href": carol.id }]
        }),
    );
    server.remote.serve(&carol.id, carol.document());

    let report = server
        .state
        .federation
        .federate(&PostEvent {
            kind: ActivityKind::Create,
            post: post_for(blog.id, "Thanks @carol@social.example!"),
        })
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);

    let sent = server.remote.sent();
    assert_eq!(sent[0].inbox, carol.inbox);
    let tags = sent[0].activity["object"]["tag"].as_array().unwrap();
    assert!(tags.iter().any(|tag| {
        tag["type"] == "Mention" && tag["name"] == "@carol@social.example" && tag["href"] == carol.id
    }));

    assert_eq!(
        server
            .state
            .federation
            .resolve_handle("@carol@social.example")
            .await
            .unwrap(),
        carol.id
    );
}
