//! The dry run cluster for the priority balancer

use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;
use tracing::{Level, event, instrument};

use super::Cluster;
use crate::Error;
use crate::libs::resources::{NodeDescriptor, Resources, SyntheticWorkload, WorkloadSnapshot};

/// A pretend node in a dry run cluster
#[derive(Debug, Clone)]
pub struct DryRunNode {
    /// The name and allocatable resources of this node
    pub descriptor: NodeDescriptor,
    /// Whether new workloads may be scheduled on this node
    pub unschedulable: bool,
}

impl DryRunNode {
    /// Create a dry run node
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this node
    /// * `allocatable` - The resources this node can hand out
    pub fn new<T: Into<String>>(name: T, allocatable: Resources) -> Self {
        DryRunNode {
            descriptor: NodeDescriptor::new(name, allocatable),
            unschedulable: false,
        }
    }
}

/// Check if a set of labels matches an equality based selector
///
/// # Arguments
///
/// * `labels` - The labels to check
/// * `selector` - A selector like `key=value,other=value`
fn matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                // allow the == form as well
                let value = value.trim_start_matches('=');
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            }
            // a bare key only has to exist
            None => labels.contains_key(term),
        })
}

/// The mutable state of a dry run cluster
#[derive(Debug, Default)]
struct DryRunState {
    /// The nodes in this cluster
    nodes: BTreeMap<String, DryRunNode>,
    /// Every workload in this cluster
    workloads: Vec<WorkloadSnapshot>,
    /// The nodes that reject new workloads
    failing: HashSet<String>,
    /// Whether deletes are silently ignored
    stuck_deletes: bool,
    /// Whether created workloads never start running
    never_running: bool,
    /// How many more label listings should fail
    failing_lists: usize,
}

/// A dry run cluster for testing balancing
#[derive(Debug, Default)]
pub struct DryRun {
    /// The state of our pretend cluster
    state: Mutex<DryRunState>,
}

impl DryRun {
    /// Create a default 3 node pretend cluster
    ///
    /// Each node has 32 cores and 64 GiB of memory.
    pub fn new() -> Self {
        let mut cluster = DryRun::default();
        for i in 0..3 {
            // build a name for this node
            let name = format!("Node-{i}");
            cluster = cluster.node(DryRunNode::new(
                name,
                Resources {
                    cpu: 32_000,
                    memory: 64 * 1024 * 1024 * 1024,
                },
            ));
        }
        cluster
    }

    /// Add a node to this cluster
    ///
    /// # Arguments
    ///
    /// * `node` - The node to add
    #[must_use]
    pub fn node(mut self, node: DryRunNode) -> Self {
        let state = self.state.get_mut();
        state.nodes.insert(node.descriptor.name.clone(), node);
        self
    }

    /// Add an existing workload to this cluster
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to add
    #[must_use]
    pub fn workload(mut self, workload: WorkloadSnapshot) -> Self {
        self.state.get_mut().workloads.push(workload);
        self
    }

    /// Make creating workloads on a node fail
    ///
    /// # Arguments
    ///
    /// * `node` - The node to reject workloads on
    #[must_use]
    pub fn fail_creates_on<T: Into<String>>(mut self, node: T) -> Self {
        self.state.get_mut().failing.insert(node.into());
        self
    }

    /// Make every delete a no op
    #[must_use]
    pub fn stuck_deletes(mut self) -> Self {
        self.state.get_mut().stuck_deletes = true;
        self
    }

    /// Make created workloads never start running
    #[must_use]
    pub fn never_running(mut self) -> Self {
        self.state.get_mut().never_running = true;
        self
    }

    /// Make the next label listings fail
    ///
    /// # Arguments
    ///
    /// * `count` - The number of listings to fail
    #[must_use]
    pub fn fail_lists(mut self, count: usize) -> Self {
        self.state.get_mut().failing_lists = count;
        self
    }
}

#[async_trait::async_trait]
impl Cluster for DryRun {
    async fn schedulable_nodes(&self) -> Result<Vec<NodeDescriptor>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .values()
            .filter(|node| !node.unschedulable)
            .map(|node| node.descriptor.clone())
            .collect())
    }

    async fn node(&self, name: &str) -> Result<NodeDescriptor, Error> {
        let state = self.state.lock().await;
        match state.nodes.get(name) {
            Some(node) => Ok(node.descriptor.clone()),
            None => Err(Error::new(format!("Node {name} does not exist"))),
        }
    }

    async fn workloads(&self) -> Result<Vec<WorkloadSnapshot>, Error> {
        Ok(self.state.lock().await.workloads.clone())
    }

    #[instrument(name = "Cluster<DryRun>::create", skip(self, workload), fields(pod = %workload.name), err(Debug))]
    async fn create(&self, ns: &str, workload: &SyntheticWorkload) -> Result<String, Error> {
        let mut state = self.state.lock().await;
        // pretend the api server rejected this pod
        if state.failing.contains(&workload.node) {
            return Err(Error::new(format!(
                "Node {} rejected pod {}",
                workload.node, workload.name
            )));
        }
        if !state.nodes.contains_key(&workload.node) {
            return Err(Error::new(format!("Node {} does not exist", workload.node)));
        }
        // names must be unique within a namespace
        if state
            .workloads
            .iter()
            .any(|existing| existing.namespace == ns && existing.name == workload.name)
        {
            return Err(Error::new(format!("Pod {ns}/{} already exists", workload.name)));
        }
        state.workloads.push(workload.snapshot(ns));
        event!(Level::INFO, pod = &workload.name, node = &workload.node);
        Ok(workload.name.clone())
    }

    async fn is_running(&self, ns: &str, name: &str) -> Result<bool, Error> {
        let state = self.state.lock().await;
        let exists = state
            .workloads
            .iter()
            .any(|existing| existing.namespace == ns && existing.name == name);
        if !exists {
            return Err(Error::new(format!("Pod {ns}/{name} does not exist")));
        }
        Ok(!state.never_running)
    }

    async fn delete(&self, ns: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if !state.stuck_deletes {
            state
                .workloads
                .retain(|existing| !(existing.namespace == ns && existing.name == name));
        }
        Ok(())
    }

    async fn delete_by_label(&self, ns: &str, selector: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if !state.stuck_deletes {
            state
                .workloads
                .retain(|existing| !(existing.namespace == ns && matches(&existing.labels, selector)));
        }
        Ok(())
    }

    async fn list_by_label(&self, ns: &str, selector: &str) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock().await;
        // pretend the api server could not be reached
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(Error::new(format!("Failed to list pods matching {selector}")));
        }
        Ok(state
            .workloads
            .iter()
            .filter(|existing| existing.namespace == ns && matches(&existing.labels, selector))
            .map(|existing| existing.name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_on_equality() {
        let mut labels = BTreeMap::default();
        labels.insert("podname".to_owned(), "priority-balanced-memory".to_owned());
        labels.insert("tier".to_owned(), "test".to_owned());
        assert!(matches(&labels, "podname=priority-balanced-memory"));
        assert!(matches(&labels, "podname==priority-balanced-memory,tier=test"));
        assert!(matches(&labels, "tier"));
        assert!(!matches(&labels, "podname=other"));
        assert!(!matches(&labels, "missing"));
    }

    #[tokio::test]
    async fn default_cluster_has_three_nodes() {
        let cluster = DryRun::new();
        let nodes = cluster.schedulable_nodes().await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|node| node.cpu == Some(32_000)));
    }

    #[tokio::test]
    async fn unschedulable_nodes_are_hidden() {
        let mut cordoned = DryRunNode::new("cordoned", Resources { cpu: 1000, memory: 1024 });
        cordoned.unschedulable = true;
        let cluster = DryRun::new().node(cordoned);
        let nodes = cluster.schedulable_nodes().await.unwrap();
        assert_eq!(nodes.len(), 3);
        // but it can still be looked up directly
        assert!(Cluster::node(&cluster, "cordoned").await.is_ok());
    }
}
