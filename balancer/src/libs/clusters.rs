//! Abstracts the clusters the balancer can work against
//!
//! Kubernetes is the real target. The dry run cluster lives entirely in
//! memory and is used for `--dry-run` and for tests.
use super::resources::{NodeDescriptor, SyntheticWorkload, WorkloadSnapshot};
use crate::Error;

pub mod dry_run;
pub mod k8s;

pub use dry_run::{DryRun, DryRunNode};
pub use k8s::K8s;

/// The methods a cluster must expose to be balanced
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// List the nodes that workloads can currently be scheduled on
    async fn schedulable_nodes(&self) -> Result<Vec<NodeDescriptor>, Error>;

    /// Get a single node by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to get
    async fn node(&self, name: &str) -> Result<NodeDescriptor, Error>;

    /// List every workload in every namespace
    async fn workloads(&self) -> Result<Vec<WorkloadSnapshot>, Error>;

    /// Create a workload pinned to a node and return its name
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace to create this workload in
    /// * `workload` - The workload to create
    async fn create(&self, ns: &str, workload: &SyntheticWorkload) -> Result<String, Error>;

    /// Check whether a workload is running
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace the workload is in
    /// * `name` - The name of the workload
    async fn is_running(&self, ns: &str, name: &str) -> Result<bool, Error>;

    /// Delete a workload by name, succeeding if it is already gone
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace the workload is in
    /// * `name` - The name of the workload
    async fn delete(&self, ns: &str, name: &str) -> Result<(), Error>;

    /// Delete every workload matching a label selector
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace to delete from
    /// * `selector` - The label selector to match
    async fn delete_by_label(&self, ns: &str, selector: &str) -> Result<(), Error>;

    /// List the names of every workload matching a label selector
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace to list from
    /// * `selector` - The label selector to match
    async fn list_by_label(&self, ns: &str, selector: &str) -> Result<Vec<String>, Error>;
}
