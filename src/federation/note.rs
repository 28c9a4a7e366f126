//! Post to Note mapping

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::actor::{AS_PUBLIC, BlogActor};
use super::resolver::Resolver;
use crate::data::Post;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@([A-Za-z0-9._%+-]+)(@[A-Za-z0-9.-]+\.[A-Za-z]+)\b").expect("valid mention regex")
});

static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w&#/])#(\w+)").expect("valid hashtag regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub content: String,
    pub media_type: String,
}

/// `Hashtag` or `Mention` entry of a Note's `tag` array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub kind: TagKind,
    pub href: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagKind {
    Hashtag,
    Mention,
}

/// ActivityStreams Note for a blog post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    pub attributed_to: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_map: Option<BTreeMap<String, String>>,
    pub source: Source,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub tag: Vec<Tag>,
}

impl Note {
    pub fn mentions(&self) -> impl Iterator<Item = &Tag> {
        self.tag.iter().filter(|tag| tag.kind == TagKind::Mention)
    }
}

/// Build a post's Note, with hashtags but without mentions.
pub fn build_note(post: &Post, actor: &BlogActor) -> Note {
    let url = actor.post_url(post.slug.as_deref(), &post.id);

    let tag = extract_hashtags(&post.content)
        .into_iter()
        .map(|name| Tag {
            kind: TagKind::Hashtag,
            href: actor.tag_url(&name),
            name: format!("#{}", name),
        })
        .collect();

    Note {
        id: url.clone(),
        kind: "Note".to_string(),
        url,
        name: (!post.title.is_empty()).then(|| post.title.clone()),
        published: post.created,
        updated: post.updated,
        attributed_to: actor.iri(),
        content: post.html_content.clone(),
        content_map: post
            .language
            .as_ref()
            .filter(|language| !language.is_empty())
            .map(|language| BTreeMap::from([(language.clone(), post.html_content.clone())])),
        source: Source {
            content: post.content.clone(),
            media_type: "text/markdown".to_string(),
        },
        to: vec![AS_PUBLIC.to_string()],
        cc: vec![actor.followers()],
        tag,
    }
}

/// Build a post's Note and resolve its `@user@host` mentions.
///
/// Each resolved mention is tagged and carbon-copied. Handles that cannot
/// be resolved are left out.
pub async fn post_to_note(post: &Post, actor: &BlogActor, resolver: &Resolver) -> Note {
    let mut note = build_note(post, actor);

    for handle in extract_mentions(&post.content) {
        match resolver.resolve_handle(&handle).await {
            Ok(href) => {
                if !note.cc.contains(&href) {
                    note.cc.push(href.clone());
                }
                note.tag.push(Tag {
                    kind: TagKind::Mention,
                    href,
                    name: handle,
                });
            }
            Err(error) => {
                tracing::info!(%handle, %error, "Could not resolve mentioned user");
            }
        }
    }

    note
}

/// Distinct `#tags` in a markdown source, in order of appearance.
pub fn extract_hashtags(markdown: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for captures in HASHTAG_RE.captures_iter(markdown) {
        let tag = &captures[1];
        if tag.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Distinct `@user@host` handles in a markdown source, with markup removed.
pub fn extract_mentions(markdown: &str) -> Vec<String> {
    let text = ammonia::Builder::empty().clean(markdown).to_string();

    let mut handles: Vec<String> = Vec::new();
    for found in MENTION_RE.find_iter(&text) {
        let handle = found.as_str();
        if !handles.iter().any(|existing| existing == handle) {
            handles.push(handle.to_string());
        }
    }
    handles
}
