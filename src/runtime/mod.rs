use crate::error::RuntimeError;
use crate::types::ContainerIdentity;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of the currently running containers, sorted.
    async fn running_container_ids(&self) -> Result<Vec<String>, RuntimeError>;

    /// Resolves the identity of one container. Must report
    /// [`RuntimeError::Unreachable`] separately from
    /// [`RuntimeError::NotFound`].
    async fn inspect(&self, id: &str) -> Result<ContainerIdentity, RuntimeError>;
}
