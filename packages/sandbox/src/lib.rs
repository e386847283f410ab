// ABOUTME: Sandbox fleet lifecycle: providers, sandbox records, and the lifecycle manager
// ABOUTME: Re-exports the types other fleet crates build on

pub mod manager;
pub mod providers;
pub mod storage;
pub mod sweeper;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use manager::{LifecycleSettings, ManagerError, SandboxManager};
pub use providers::{
    DockerProvider, InstanceState, InstanceStatus, LocalProcessProvider, MicroVmProvider,
    Provider, ProviderError, ProviderRegistry, SpawnConfig, SpawnedInstance,
};
pub use storage::{Sandbox, SandboxStatus, SandboxStorage};
pub use sweeper::{SweepReport, Sweeper};
