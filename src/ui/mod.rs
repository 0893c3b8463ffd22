//! # User Interface Module
//!
//! Web chat front end for the GPT-J responder: an HTML page plus a small JSON
//! API, served with actix-web. See [`routes`] for the endpoints.

pub mod routes;

pub use routes::{configure, run_server, AppState, ServerConfig};
