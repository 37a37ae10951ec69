//! Configuration schema and persisted state consumed by the `hatago-hub`
//! runtime: the per-upstream spec shape, the top-level hub config schema,
//! and the per-upstream metadata cache sidecar.
//!
//! This crate parses and validates a single configuration document. Config
//! inheritance, live reload, and secret storage are left to whatever
//! wraps the hub and are not implemented here.

mod metadata;
mod naming;
mod policy;
mod schema;
mod server;
mod transport;

pub use metadata::{
    hash_listing, CachedPrompt, CachedResource, CachedTool, MetadataCache, UpstreamMetadata,
};
pub use naming::{NamingStrategy, ToolNamingConfig};
pub use policy::{
    ActivationPolicy, HealthCheckMethod, HealthCheckPolicy, IdlePolicy, IdleResetAt,
    NamingOverrides, ReconnectPolicy,
};
pub use schema::{ConcurrencyConfig, HttpConfig, HubConfig, SessionConfig, TimeoutsConfig};
pub use server::UpstreamSpec;
pub use transport::{Credential, RemoteTransportKind, TransportSpec, UpstreamSource};
