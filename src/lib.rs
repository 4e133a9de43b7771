pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod social;
