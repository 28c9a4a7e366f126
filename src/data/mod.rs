//! Data layer module
//!
//! Handles all data persistence:
//! - Blog surface read by the federation core (users, collections, posts)
//! - Federation state (keypairs, remote actors, follow edges)

mod database;
mod models;

pub use database::Database;
pub use models::*;
