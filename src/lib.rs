pub mod auth;
pub mod doc;
pub mod error;
pub mod ranking;
pub mod repo;
pub mod roles;
pub mod routes;
pub mod types;
pub mod view;

pub use types::*;
