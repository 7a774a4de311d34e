//! The resource shapes, nodes, and workloads the balancer reasons about
use std::collections::BTreeMap;

use crate::Error;

/// The cpu the scheduler assumes a container wants when it sets no request (millicpu)
pub const DEFAULT_MILLI_CPU_REQUEST: u64 = 100;

/// The memory the scheduler assumes a container wants when it sets no request (bytes)
pub const DEFAULT_MEMORY_REQUEST: u64 = 200 * 1024 * 1024;

/// A resource dimension we balance on
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Cpu in millicpu
    Cpu,
    /// Memory in bytes
    Memory,
}

impl Dimension {
    /// Every dimension we balance on
    pub const ALL: [Dimension; 2] = [Dimension::Cpu, Dimension::Memory];

    /// The name k8s uses for this resource
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
        }
    }

    /// The request the scheduler assumes for a container that sets none
    pub fn default_request(&self) -> u64 {
        match self {
            Dimension::Cpu => DEFAULT_MILLI_CPU_REQUEST,
            Dimension::Memory => DEFAULT_MEMORY_REQUEST,
        }
    }
}

/// An amount of cpu and memory
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    /// The amount of cpu in millicpu
    pub cpu: u64,
    /// The amount of memory in bytes
    pub memory: u64,
}

impl Resources {
    /// Get a mutable reference to a specific dimension
    ///
    /// # Arguments
    ///
    /// * `dim` - The dimension to get
    pub fn get_mut(&mut self, dim: Dimension) -> &mut u64 {
        match dim {
            Dimension::Cpu => &mut self.cpu,
            Dimension::Memory => &mut self.memory,
        }
    }
}

/// A possibly partial set of resources as they are set on a container
///
/// `None` means the resource was not set at all, which is different from
/// explicitly setting it to zero.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceList {
    /// The cpu in millicpu if it was set
    pub cpu: Option<u64>,
    /// The memory in bytes if it was set
    pub memory: Option<u64>,
}

impl ResourceList {
    /// Get a specific dimension if it was set
    ///
    /// # Arguments
    ///
    /// * `dim` - The dimension to get
    pub fn get(&self, dim: Dimension) -> Option<u64> {
        match dim {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory,
        }
    }
}

impl From<Resources> for ResourceList {
    fn from(resources: Resources) -> Self {
        ResourceList {
            cpu: Some(resources.cpu),
            memory: Some(resources.memory),
        }
    }
}

/// The requests and limits for a single container
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadRequest {
    /// The resources requested
    pub requests: ResourceList,
    /// The resource limits
    pub limits: ResourceList,
}

impl WorkloadRequest {
    /// Build a request whose requests and limits are the same
    ///
    /// # Arguments
    ///
    /// * `shape` - The resources to request and limit
    pub fn guaranteed(shape: Resources) -> Self {
        WorkloadRequest {
            requests: shape.into(),
            limits: shape.into(),
        }
    }

    /// Build a request with no limits
    ///
    /// # Arguments
    ///
    /// * `shape` - The resources to request
    pub fn requests(shape: Resources) -> Self {
        WorkloadRequest {
            requests: shape.into(),
            limits: ResourceList::default(),
        }
    }

    /// The request k8s will see for a dimension
    ///
    /// The API server defaults a missing request to the limit.
    ///
    /// # Arguments
    ///
    /// * `dim` - The dimension to get
    pub fn effective_request(&self, dim: Dimension) -> Option<u64> {
        self.requests.get(dim).or_else(|| self.limits.get(dim))
    }

    /// The requested resources with any unset values as zero
    pub fn requested(&self) -> Resources {
        Resources {
            cpu: self.effective_request(Dimension::Cpu).unwrap_or(0),
            memory: self.effective_request(Dimension::Memory).unwrap_or(0),
        }
    }
}

/// A snapshot of a node's identity and allocatable capacity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// The name of this node
    pub name: String,
    /// The allocatable cpu in millicpu if the node advertises it
    pub cpu: Option<u64>,
    /// The allocatable memory in bytes if the node advertises it
    pub memory: Option<u64>,
}

impl NodeDescriptor {
    /// Create a node descriptor with both capacities set
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this node
    /// * `allocatable` - The allocatable resources on this node
    pub fn new<T: Into<String>>(name: T, allocatable: Resources) -> Self {
        NodeDescriptor {
            name: name.into(),
            cpu: Some(allocatable.cpu),
            memory: Some(allocatable.memory),
        }
    }

    /// Get the allocatable amount of a dimension or error if its not advertised
    ///
    /// # Arguments
    ///
    /// * `dim` - The dimension to get
    pub fn allocatable(&self, dim: Dimension) -> Result<u64, Error> {
        let amount = match dim {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory,
        };
        amount.ok_or_else(|| Error::MissingAllocatable {
            node: self.name.clone(),
            resource: dim.as_str(),
        })
    }
}

/// A workload currently known to the cluster
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    /// The namespace this workload is in
    pub namespace: String,
    /// The name of this workload
    pub name: String,
    /// The node this workload was placed on if it has been scheduled
    pub node: Option<String>,
    /// The labels on this workload
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// The requests and limits of each container in this workload
    pub containers: Vec<WorkloadRequest>,
}

impl WorkloadSnapshot {
    /// Whether this workload is placed on a specific node
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    pub fn is_on(&self, node: &str) -> bool {
        self.node.as_deref() == Some(node)
    }

    /// Whether this workload has no resource floor for a dimension
    ///
    /// The scheduler does not count these against allocatable capacity.
    ///
    /// # Arguments
    ///
    /// * `dim` - The dimension to check
    pub fn is_best_effort(&self, dim: Dimension) -> bool {
        self.containers.iter().all(|container| {
            container.requests.get(dim).unwrap_or(0) == 0
                && container.limits.get(dim).unwrap_or(0) == 0
        })
    }

    /// Sum the requests of all containers, using the scheduler's defaults
    /// for any container that does not set one
    pub fn non_zero_requests(&self) -> Resources {
        let mut total = Resources::default();
        for container in &self.containers {
            for dim in Dimension::ALL {
                let request = container
                    .effective_request(dim)
                    .unwrap_or_else(|| dim.default_request());
                let sum = total.get_mut(dim);
                *sum = sum.saturating_add(request);
            }
        }
        total
    }

    /// The demand this workload places on a node for accounting purposes
    ///
    /// Dimensions this workload is best effort on contribute nothing.
    pub fn demand(&self) -> Resources {
        let mut demand = self.non_zero_requests();
        for dim in Dimension::ALL {
            if self.is_best_effort(dim) {
                *demand.get_mut(dim) = 0;
            }
        }
        demand
    }
}

/// A pod created only to raise a node's utilization
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyntheticWorkload {
    /// The unique name of this workload
    pub name: String,
    /// The labels shared by every balancing workload
    pub labels: BTreeMap<String, String>,
    /// The node this workload must land on
    pub node: String,
    /// The resources this workload requests
    pub requests: Resources,
    /// The image to run
    pub image: String,
}

impl SyntheticWorkload {
    /// Describe this workload as the cluster would list it once placed
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace this workload was created in
    pub fn snapshot(&self, namespace: &str) -> WorkloadSnapshot {
        WorkloadSnapshot {
            namespace: namespace.to_owned(),
            name: self.name.clone(),
            node: Some(self.node.clone()),
            labels: self.labels.clone(),
            containers: vec![WorkloadRequest::requests(self.requests)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(containers: Vec<WorkloadRequest>) -> WorkloadSnapshot {
        WorkloadSnapshot {
            namespace: "default".into(),
            name: "pod".into(),
            node: Some("node-a".into()),
            labels: BTreeMap::default(),
            containers,
        }
    }

    #[test]
    fn best_effort_is_per_dimension() {
        // a container that only asks for memory
        let memory_only = WorkloadRequest {
            requests: ResourceList {
                cpu: None,
                memory: Some(1024),
            },
            limits: ResourceList::default(),
        };
        let pod = workload(vec![memory_only]);
        assert!(pod.is_best_effort(Dimension::Cpu));
        assert!(!pod.is_best_effort(Dimension::Memory));
        assert_eq!(
            pod.demand(),
            Resources {
                cpu: 0,
                memory: 1024
            }
        );
    }

    #[test]
    fn fully_best_effort_workloads_contribute_nothing() {
        let pod = workload(vec![WorkloadRequest::default(), WorkloadRequest::default()]);
        assert_eq!(pod.demand(), Resources::default());
        // a container with no containers at all is best effort too
        assert_eq!(workload(Vec::new()).demand(), Resources::default());
    }

    #[test]
    fn missing_requests_use_scheduler_defaults() {
        let sized = WorkloadRequest::requests(Resources {
            cpu: 500,
            memory: 1024,
        });
        // the sidecar sets nothing so it gets the scheduler defaults
        let pod = workload(vec![sized, WorkloadRequest::default()]);
        assert_eq!(
            pod.demand(),
            Resources {
                cpu: 500 + DEFAULT_MILLI_CPU_REQUEST,
                memory: 1024 + DEFAULT_MEMORY_REQUEST,
            }
        );
    }

    #[test]
    fn limits_stand_in_for_missing_requests() {
        let limited = WorkloadRequest {
            requests: ResourceList::default(),
            limits: ResourceList {
                cpu: Some(250),
                memory: Some(2048),
            },
        };
        let pod = workload(vec![limited]);
        assert_eq!(
            pod.demand(),
            Resources {
                cpu: 250,
                memory: 2048
            }
        );
    }

    #[test]
    fn missing_allocatable_is_an_error() {
        let node = NodeDescriptor {
            name: "node-a".into(),
            cpu: Some(2000),
            memory: None,
        };
        assert_eq!(node.allocatable(Dimension::Cpu).unwrap(), 2000);
        match node.allocatable(Dimension::Memory) {
            Err(Error::MissingAllocatable { node, resource }) => {
                assert_eq!(node, "node-a");
                assert_eq!(resource, "memory");
            }
            other => panic!("expected a missing allocatable error, got {other:?}"),
        }
    }
}
