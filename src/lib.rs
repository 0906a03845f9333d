//! xDS resolution core: client-side resolver and server-side listener wrapper.

pub mod config;
pub mod discovery;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod resolver;
pub mod server;

pub use config::schema::XdsConfig;
pub use discovery::{DiscoveryClient, InMemoryDiscoveryClient, WatchError};
pub use resolver::{ResolverBuilder, XdsResolver};
pub use server::{ListenerWrapper, ListenerWrapperParams};
