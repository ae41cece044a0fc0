pub mod lease;
pub mod membership;
pub mod server_registry;

pub use lease::LeasedRegistryClient;
pub use membership::MembershipManager;
pub use server_registry::{ResolveServer, ServerRegistry};
