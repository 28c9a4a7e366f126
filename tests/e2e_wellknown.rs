//! E2E tests for well-known discovery endpoints

mod common;

use common::{DOMAIN, TestServer};
use inkfed::data::Visibility;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_describes_blog() {
    let server = TestServer::new().await;
    server.create_blog("alice", Visibility::Public).await;

    let response = server
        .client
        .get(&server.url(&format!(
            "/.well-known/webfinger?resource=acct:alice@{DOMAIN}"
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/jrd+json")
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], format!("acct:alice@{DOMAIN}"));
    assert_eq!(json["aliases"][0], format!("https://{DOMAIN}/alice/"));
    assert_eq!(json["aliases"][1], server.blog_iri("alice"));

    let links = json["links"].as_array().unwrap();
    let profile = links
        .iter()
        .find(|link| link["rel"] == "http://webfinger.net/rel/profile-page")
        .unwrap();
    assert_eq!(profile["type"], "text/html");
    assert_eq!(profile["href"], format!("https://{DOMAIN}/alice/"));

    let self_link = links.iter().find(|link| link["rel"] == "self").unwrap();
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], server.blog_iri("alice"));
}

#[tokio::test]
async fn test_webfinger_unlisted_blog_is_discoverable() {
    let server = TestServer::new().await;
    server.create_blog("quiet", Visibility::Unlisted).await;

    let response = server
        .client
        .get(&server.url(&format!(
            "/.well-known/webfinger?resource=acct:quiet@{DOMAIN}"
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_webfinger_not_found_cases() {
    let server = TestServer::new().await;
    server.create_blog("hidden", Visibility::Private).await;
    let silenced = server.create_blog("muted", Visibility::Public).await;
    server
        .state
        .db
        .set_user_silenced(silenced.owner_id, true)
        .await
        .unwrap();

    for resource in [
        format!("acct:nobody@{DOMAIN}"),
        "acct:alice@other.example".to_string(),
        format!("acct:hidden@{DOMAIN}"),
        format!("acct:muted@{DOMAIN}"),
        "not-an-account".to_string(),
    ] {
        let response = server
            .client
            .get(&server.url("/.well-known/webfinger"))
            .query(&[("resource", resource.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404, "resource {resource}");
    }
}

#[tokio::test]
async fn test_webfinger_requires_matching_alias_in_single_user_mode() {
    let server = TestServer::with_config(|config| config.instance.single_user = true).await;
    server.create_blog("solo", Visibility::Public).await;

    let matching = server
        .client
        .get(&server.url(&format!("/.well-known/webfinger?resource=acct:solo@{DOMAIN}")))
        .send()
        .await
        .unwrap();
    assert_eq!(matching.status(), 200);
    let json: Value = matching.json().await.unwrap();
    assert_eq!(json["aliases"][0], format!("https://{DOMAIN}/"));

    let other = server
        .client
        .get(&server.url(&format!("/.well-known/webfinger?resource=acct:other@{DOMAIN}")))
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 404);
}

#[tokio::test]
async fn test_webfinger_disabled_federation() {
    let server = TestServer::with_config(|config| config.instance.federation = false).await;
    server.create_blog("alice", Visibility::Public).await;

    let response = server
        .client
        .get(&server.url(&format!("/.well-known/webfinger?resource=acct:alice@{DOMAIN}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_host_meta_endpoint() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/xrd+xml")
    );
    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(
        "template=\"https://{DOMAIN}/.well-known/webfinger?resource={{uri}}\""
    )));
}

#[tokio::test]
async fn test_nodeinfo_discovery() {
    let server = TestServer::new().await;
    let blog = server.create_blog("alice", Visibility::Public).await;
    server.create_posts(&blog, 3).await;

    let links: Value = server
        .client
        .get(&server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        links["links"][0]["href"],
        format!("https://{DOMAIN}/nodeinfo/2.0")
    );

    let nodeinfo: Value = server
        .client
        .get(&server.url("/nodeinfo/2.0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodeinfo["software"]["name"], "inkfed");
    assert_eq!(nodeinfo["protocols"][0], "activitypub");
    assert_eq!(nodeinfo["usage"]["users"]["total"], 1);
    assert_eq!(nodeinfo["usage"]["localPosts"], 3);
    assert_eq!(nodeinfo["openRegistrations"], false);
}
