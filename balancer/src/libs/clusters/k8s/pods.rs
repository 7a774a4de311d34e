use k8s_openapi::api::core::v1::{Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, PostParams};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{Level, event, instrument};

use crate::Error;
use crate::libs::helpers;
use crate::libs::resources::{ResourceList, SyntheticWorkload, WorkloadRequest, WorkloadSnapshot};

/// Parse the cpu and memory out of a k8s resource map
///
/// # Arguments
///
/// * `map` - The resource map to parse
fn resource_list(map: Option<&BTreeMap<String, Quantity>>) -> Result<ResourceList, Error> {
    // an unset map means nothing was set
    let map = match map {
        Some(map) => map,
        None => return Ok(ResourceList::default()),
    };
    let cpu = map.get("cpu").map(|raw| helpers::cpu(&raw.0)).transpose()?;
    let memory = map
        .get("memory")
        .map(|raw| helpers::memory(&raw.0))
        .transpose()?;
    Ok(ResourceList { cpu, memory })
}

/// Convert a containers resource requirements
///
/// # Arguments
///
/// * `resources` - The resource requirements to convert
fn workload_request(resources: Option<&ResourceRequirements>) -> Result<WorkloadRequest, Error> {
    match resources {
        Some(resources) => Ok(WorkloadRequest {
            requests: resource_list(resources.requests.as_ref())?,
            limits: resource_list(resources.limits.as_ref())?,
        }),
        None => Ok(WorkloadRequest::default()),
    }
}

/// Pods api wrapper for kubernetes
pub struct Pods {
    /// Client to use for creating namespaced clients
    client: kube::Client,
    /// Pod API client for all namespaces
    api: Api<Pod>,
}

impl Pods {
    /// Creates new pods wrapper
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        // build pods api client
        let api: Api<Pod> = Api::all(client.clone());
        // get client for creating namespaced clients with
        let client = client.clone();
        Pods { client, api }
    }

    /// List pods in a namespace
    ///
    /// # Arguments
    ///
    /// * `ns` - Namespace to list pods from
    /// * `labels` - The label selectors to restrict to
    #[instrument(name = "k8s::Pods::list", skip(self))]
    pub async fn list(&self, ns: &str, labels: &[&str]) -> Result<ObjectList<Pod>, Error> {
        // get a namespaced client
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        // insert any label filters into our list params
        let params = labels
            .iter()
            .fold(ListParams::default(), |params, label| params.labels(label));
        let pods = api.list(&params).await?;
        Ok(pods)
    }

    /// List all pods across all namespaces
    #[instrument(name = "k8s::Pods::list_all", skip(self))]
    pub async fn list_all(&self) -> Result<ObjectList<Pod>, Error> {
        let pods = self.api.list(&ListParams::default()).await?;
        Ok(pods)
    }

    /// Snapshot a pod's placement and container resources
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to snapshot
    pub fn snapshot(pod: &Pod) -> Result<WorkloadSnapshot, Error> {
        // get this pods name
        let name = match &pod.metadata.name {
            Some(name) => name.clone(),
            None => return Err(Error::new("Pod has no name")),
        };
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        // pods without a spec have not been placed and request nothing
        let (node, containers) = match &pod.spec {
            Some(spec) => {
                let containers = spec
                    .containers
                    .iter()
                    .map(|cont| workload_request(cont.resources.as_ref()))
                    .collect::<Result<Vec<WorkloadRequest>, Error>>()?;
                (spec.node_name.clone(), containers)
            }
            None => (None, Vec::default()),
        };
        Ok(WorkloadSnapshot {
            namespace,
            name,
            node,
            labels,
            containers,
        })
    }

    /// Generate the pod spec to deploy into k8s
    ///
    /// The pod is pinned to its node with a required node affinity that
    /// matches the node's name field rather than any of its labels.
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace the pod will be created in
    /// * `workload` - The workload to generate a pod for
    pub fn generate(ns: &str, workload: &SyntheticWorkload) -> Result<Pod, Error> {
        let raw = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": ns,
                "name": &workload.name,
                "labels": &workload.labels,
            },
            "spec": {
                "containers": [{
                    "name": "pause",
                    "image": &workload.image,
                    "resources": {
                        "requests": {
                            "cpu": format!("{}m", workload.requests.cpu),
                            "memory": workload.requests.memory.to_string(),
                        }
                    }
                }],
                "affinity": {
                    "nodeAffinity": {
                        "requiredDuringSchedulingIgnoredDuringExecution": {
                            "nodeSelectorTerms": [{
                                "matchFields": [{
                                    "key": "metadata.name",
                                    "operator": "In",
                                    "values": [&workload.node],
                                }]
                            }]
                        }
                    }
                },
                "restartPolicy": "Never",
                "terminationGracePeriodSeconds": 0,
            }
        });
        // cast this json into a pod
        let pod: Pod = serde_json::from_value(raw)?;
        Ok(pod)
    }

    /// Create a balancing pod
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace to create the pod in
    /// * `workload` - The workload to create
    #[instrument(name = "k8s::Pods::create", skip(self, workload), fields(pod = %workload.name, node = %workload.node), err(Debug))]
    pub async fn create(&self, ns: &str, workload: &SyntheticWorkload) -> Result<String, Error> {
        // get a namespaced client for our pods target namespace
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let pod = Self::generate(ns, workload)?;
        let created = api.create(&PostParams::default(), &pod).await?;
        // use the name k8s gave us back in case it differs
        let name = created.metadata.name.unwrap_or_else(|| workload.name.clone());
        event!(
            Level::INFO,
            pod = &name,
            node = &workload.node,
            cpu = workload.requests.cpu,
            memory = workload.requests.memory
        );
        Ok(name)
    }

    /// Check if a pod is running
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace the pod is in
    /// * `name` - The name of the pod
    #[instrument(name = "k8s::Pods::is_running", skip(self))]
    pub async fn is_running(&self, ns: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let pod = api.get(name).await?;
        // check this pods phase
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
        match phase {
            Some("Running") => Ok(true),
            // a pod that already exited will never start running
            Some(terminal @ ("Succeeded" | "Failed")) => Err(Error::new(format!(
                "Pod {name} entered terminal phase {terminal} before running"
            ))),
            _ => Ok(false),
        }
    }

    /// Deletes a pod by name within a namespace
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace of the pod to delete
    /// * `name` - The name of the pod to delete
    #[instrument(name = "k8s::Pods::delete", skip(self))]
    pub async fn delete(&self, ns: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let params = DeleteParams::default().grace_period(0);
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            // a missing balancing pod is already deleted
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                event!(Level::DEBUG, msg = "Balancing pod already gone", pod = name);
                Ok(())
            }
            Err(error) => Err(Error::from(error)),
        }
    }

    /// Deletes all pods matching a label selector
    ///
    /// # Arguments
    ///
    /// * `ns` - The namespace to delete pods from
    /// * `selector` - The label selector to match
    #[instrument(name = "k8s::Pods::delete_by_label", skip(self), err(Debug))]
    pub async fn delete_by_label(&self, ns: &str, selector: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let delete_params = DeleteParams::default().grace_period(0);
        let list_params = ListParams::default().labels(selector);
        api.delete_collection(&delete_params, &list_params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::resources::Resources;

    fn workload() -> SyntheticWorkload {
        let mut labels = BTreeMap::default();
        labels.insert("podname".to_owned(), "priority-balanced-memory".to_owned());
        SyntheticWorkload {
            name: "balanced-1".into(),
            labels,
            node: "node-a".into(),
            requests: Resources {
                cpu: 400,
                memory: 12_582_912,
            },
            image: "registry.k8s.io/pause:3.10".into(),
        }
    }

    #[test]
    fn generated_pods_are_pinned_by_name() {
        let pod = Pods::generate("sched-priority", &workload()).unwrap();
        assert_eq!(pod.metadata.namespace.as_deref(), Some("sched-priority"));
        let spec = pod.spec.unwrap();
        let required = spec
            .affinity
            .and_then(|affinity| affinity.node_affinity)
            .and_then(|node| node.required_during_scheduling_ignored_during_execution)
            .unwrap();
        let fields = required.node_selector_terms[0].match_fields.clone().unwrap();
        assert_eq!(fields[0].key, "metadata.name");
        assert_eq!(fields[0].operator, "In");
        assert_eq!(fields[0].values, Some(vec!["node-a".to_owned()]));
        // the requests should round trip through our snapshot parsing
        let requests = spec.containers[0].resources.as_ref().unwrap();
        let parsed = workload_request(Some(requests)).unwrap();
        assert_eq!(parsed.requested(), workload().requests);
        assert_eq!(parsed.limits, ResourceList::default());
    }

    #[test]
    fn snapshots_read_placement_and_requests() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": "apps"},
            "spec": {
                "nodeName": "node-b",
                "containers": [
                    {"name": "app", "resources": {"requests": {"cpu": "500m", "memory": "1Gi"}}},
                    {"name": "sidecar"}
                ]
            }
        }))
        .unwrap();
        let snap = Pods::snapshot(&pod).unwrap();
        assert!(snap.is_on("node-b"));
        assert_eq!(snap.namespace, "apps");
        assert_eq!(snap.containers.len(), 2);
        assert_eq!(snap.containers[0].requests.cpu, Some(500));
        assert_eq!(snap.containers[0].requests.memory, Some(1_073_741_824));
        assert_eq!(snap.containers[1], WorkloadRequest::default());
    }

    #[test]
    fn unscheduled_pods_have_no_node() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "pending", "namespace": "apps"},
            "spec": {"containers": [{"name": "app"}]}
        }))
        .unwrap();
        let snap = Pods::snapshot(&pod).unwrap();
        assert_eq!(snap.node, None);
    }
}
