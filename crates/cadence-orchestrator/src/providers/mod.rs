//! Provider registry, health tracking, scoring and load balancing.

pub mod balancer;
pub mod descriptor;
pub mod registry;
pub mod scoring;

pub use balancer::LoadBalancer;
pub use descriptor::{HealthSnapshot, InFlight, ProviderDescriptor, ProviderStats};
pub use registry::ProviderRegistry;
pub use scoring::{Candidate, score, select_provider};
