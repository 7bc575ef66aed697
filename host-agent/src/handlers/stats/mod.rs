//! Stats handlers (spec.md §4.6): host, container, and the shared
//! `AggregatedStat` wire type they both emit.

pub mod aggregated;
pub mod container;
pub mod host;

pub use aggregated::{AggregatedStat, ResourceType};
pub use container::ContainerStatsHandler;
pub use host::HostStatsHandler;
