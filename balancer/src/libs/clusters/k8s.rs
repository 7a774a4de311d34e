//! Balances a live Kubernetes cluster
//!
//! Balancing pods are plain pause pods pinned to a node through a required
//! node affinity on `metadata.name`, so they land where we want them no matter
//! what labels the nodes carry.
use kube::config::KubeConfigOptions;
use tracing::instrument;

pub mod nodes;
pub mod pods;

use nodes::Nodes;
use pods::Pods;

use super::Cluster;
use crate::Error;
use crate::libs::resources::{NodeDescriptor, SyntheticWorkload, WorkloadSnapshot};

/// A Kubernetes cluster to balance
pub struct K8s {
    /// Node wrappers
    pub nodes: Nodes,
    /// Pod wrappers
    pub pods: Pods,
}

impl K8s {
    /// Builds a new k8s wrapper
    ///
    /// If no context is given the config is inferred from the environment,
    /// falling back to the in cluster service account.
    ///
    /// # Arguments
    ///
    /// * `context` - The kubeconfig context to use
    pub async fn new(context: Option<&str>) -> Result<Self, Error> {
        // get the config for the right cluster
        let config = match context {
            Some(context) => {
                // build the options for getting a specific clusters config
                let opts = KubeConfigOptions {
                    context: Some(context.to_owned()),
                    ..Default::default()
                };
                kube::Config::from_kubeconfig(&opts).await?
            }
            None => kube::Config::infer().await?,
        };
        // create a client based on this config
        let client = kube::Client::try_from(config)?;
        Ok(Self::from_client(&client))
    }

    /// Builds a k8s wrapper around an existing client
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn from_client(client: &kube::Client) -> Self {
        K8s {
            nodes: Nodes::new(client),
            pods: Pods::new(client),
        }
    }
}

#[async_trait::async_trait]
impl Cluster for K8s {
    /// List the nodes that workloads can currently be scheduled on
    #[instrument(name = "Cluster<K8s>::schedulable_nodes", skip_all, err(Debug))]
    async fn schedulable_nodes(&self) -> Result<Vec<NodeDescriptor>, Error> {
        // only list nodes we can schedule pods on
        let nodes = self.nodes.list(&[], &["spec.unschedulable==false"]).await?;
        nodes.items.iter().map(Nodes::descriptor).collect()
    }

    #[instrument(name = "Cluster<K8s>::node", skip(self), err(Debug))]
    async fn node(&self, name: &str) -> Result<NodeDescriptor, Error> {
        let node = self.nodes.get(name).await?;
        Nodes::descriptor(&node)
    }

    #[instrument(name = "Cluster<K8s>::workloads", skip_all, err(Debug))]
    async fn workloads(&self) -> Result<Vec<WorkloadSnapshot>, Error> {
        let pods = self.pods.list_all().await?;
        pods.items.iter().map(Pods::snapshot).collect()
    }

    async fn create(&self, ns: &str, workload: &SyntheticWorkload) -> Result<String, Error> {
        self.pods.create(ns, workload).await
    }

    async fn is_running(&self, ns: &str, name: &str) -> Result<bool, Error> {
        self.pods.is_running(ns, name).await
    }

    async fn delete(&self, ns: &str, name: &str) -> Result<(), Error> {
        self.pods.delete(ns, name).await
    }

    async fn delete_by_label(&self, ns: &str, selector: &str) -> Result<(), Error> {
        self.pods.delete_by_label(ns, selector).await
    }

    async fn list_by_label(&self, ns: &str, selector: &str) -> Result<Vec<String>, Error> {
        let pods = self.pods.list(ns, &[selector]).await?;
        Ok(pods
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }
}
