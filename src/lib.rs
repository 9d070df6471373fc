//! Wasla - multi-tenant ISP subscriber management backend.

pub mod auth;
pub mod backup;
pub mod bootstrap;
pub mod config;
pub mod database;
pub mod json_store;
pub mod models;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod status;
pub mod store;

pub use config::{BackendKind, ServerConfig};
pub use database::Database;
pub use json_store::JsonStore;
pub use models::*;
pub use server::{build_router, start_server, WebAppState};
pub use store::{open_backend, open_store, Store, StoreError};
