use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, ObjectList};
use tracing::{Level, event, instrument};

use crate::Error;
use crate::libs::helpers;
use crate::libs::resources::NodeDescriptor;

/// Wrapper for node api routes in k8s
pub struct Nodes {
    /// API client for node commands in k8s
    api: Api<Node>,
}

impl Nodes {
    /// Build new wrapper for k8s functions regarding nodes
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        // get node api
        let api: Api<Node> = Api::all(client.clone());
        Nodes { api }
    }

    /// List all nodes in this cluster
    ///
    /// # Arguments
    ///
    /// * `labels` - The labels to restrict to
    /// * `fields` - The field selectors to use
    pub async fn list(
        &self,
        labels: &[&str],
        fields: &[&str],
    ) -> Result<ObjectList<Node>, kube::Error> {
        // build list params
        let params = ListParams::default();
        // insert any label filters into list params
        let params = labels
            .iter()
            .fold(params, |params, label| params.labels(label));
        // insert any fields selectors into the list params
        let params = fields
            .iter()
            .fold(params, |params, field| params.fields(field));
        // get list of all nodes
        self.api.list(&params).await
    }

    /// Get a single node
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to get
    #[instrument(name = "k8s::Nodes::get", skip(self))]
    pub async fn get(&self, name: &str) -> Result<Node, Error> {
        Ok(self.api.get(name).await?)
    }

    /// Snapshot a node's name and allocatable resources
    ///
    /// Capacities the node does not advertise are left unset so they can be
    /// reported when the node is actually used.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to describe
    pub fn descriptor(node: &Node) -> Result<NodeDescriptor, Error> {
        // get this nodes name
        let name = match &node.metadata.name {
            Some(name) => name.clone(),
            None => return Err(Error::new("node does not have a name")),
        };
        // extract this nodes allocatable resources if it has any
        let allocatable = node
            .status
            .as_ref()
            .and_then(|status| status.allocatable.as_ref());
        let cpu = allocatable
            .and_then(|alloc| alloc.get("cpu"))
            .map(|raw| helpers::cpu(&raw.0))
            .transpose()?;
        let memory = allocatable
            .and_then(|alloc| alloc.get("memory"))
            .map(|raw| helpers::memory(&raw.0))
            .transpose()?;
        event!(Level::DEBUG, node = &name, cpu = cpu, memory = memory);
        Ok(NodeDescriptor { name, cpu, memory })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_reads_allocatable() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": "node-a"},
            "status": {"allocatable": {"cpu": "3920m", "memory": "16310004Ki", "pods": "110"}}
        }))
        .unwrap();
        let desc = Nodes::descriptor(&node).unwrap();
        assert_eq!(desc.name, "node-a");
        assert_eq!(desc.cpu, Some(3920));
        assert_eq!(desc.memory, Some(16_701_444_096));
    }

    #[test]
    fn descriptor_leaves_missing_capacity_unset() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": "node-b"},
            "status": {"allocatable": {"cpu": "2"}}
        }))
        .unwrap();
        let desc = Nodes::descriptor(&node).unwrap();
        assert_eq!(desc.cpu, Some(2000));
        assert_eq!(desc.memory, None);
    }

    #[test]
    fn nameless_nodes_are_rejected() {
        let node = Node::default();
        assert!(Nodes::descriptor(&node).is_err());
    }
}
