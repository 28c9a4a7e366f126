//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate database and federation operations.

mod federation;

pub use federation::{FederationService, ordered_collection, ordered_collection_page};
