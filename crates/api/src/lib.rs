//! HTTP surface of the identity engine: OAuth2/OIDC protocol endpoints plus
//! the account endpoints that drive a login end to end.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
