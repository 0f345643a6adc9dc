//! The deployment platform: domain model, ports and their adapters, the
//! deployment pipeline and the HTTP surface.

pub mod api;
pub mod db;
pub mod extract;
pub mod git;
pub mod github;
pub mod handler;
pub mod jwt;
pub mod kube;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod space;
pub mod store;
pub mod webhook;
