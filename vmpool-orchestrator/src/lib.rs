//! Instance allocation on top of a pool registry and an IaaS compute API:
//! reuse pooled instances through an OS reload, build new ones otherwise,
//! and return instances to the pool on delete.

pub mod agent_bootstrap;
pub mod allocator;
pub mod config;
pub mod deleter;
pub mod disk_attacher;
pub mod driver;
pub mod logger;
pub mod provider_manager;
pub mod provision;
pub mod reclaim;
pub mod state_machine;
pub mod transactions;
pub mod vm_ops;
pub mod waiter;

pub use allocator::PoolAllocator;
pub use config::{AgentOptions, DriverConfig};
pub use deleter::Deleter;
pub use driver::Driver;
pub use provision::ProvisionWorkflow;
pub use reclaim::{ReclaimTarget, ReclaimWorkflow};
pub use waiter::{WaitConfig, Waiter};
