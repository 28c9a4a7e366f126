//! ActivityPub federation module
//!
//! Handles:
//! - Blog keypairs
//! - Actor documents (local and remote)
//! - HTTP Signatures
//! - WebFinger
//! - Inbox processing
//! - Remote actor resolution and caching
//! - Follower bookkeeping
//! - Activity delivery (fan-out)
//! - Post to Note mapping

pub mod actor;
pub mod client;
pub mod delivery;
pub mod followers;
pub mod inbox;
pub mod keys;
pub mod note;
pub mod resolver;
pub mod signature;
pub mod webfinger;

pub use actor::{AS_CONTEXT, AS_PUBLIC, BlogActor, Person};
pub use client::{ACTIVITY_JSON, HttpRemoteClient, RemoteClient, SigningIdentity};
pub use delivery::{ActivityKind, DeliveryEngine, FederationReport, PostEvent};
pub use followers::{FollowerStore, inbox_buckets};
pub use inbox::{InboxAction, InboxProcessor, InboxTask};
pub use keys::{INSTANCE_KEY_ID, KeyStore};
pub use note::{Note, build_note, post_to_note};
pub use resolver::Resolver;
pub use signature::{InboundRequest, sign_request, verify_request};
pub use webfinger::{WebFingerResponse, generate_webfinger_response};
