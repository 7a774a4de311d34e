//! Computes how much of a node's allocatable cpu and memory is already requested
use tracing::{Level, event};

use super::resources::{Dimension, NodeDescriptor, Resources, WorkloadRequest, WorkloadSnapshot};
use crate::Error;

/// The utilization of a single node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeFraction {
    /// The node these fractions are for
    pub node: String,
    /// The fraction of allocatable cpu that is requested
    pub cpu: f64,
    /// The fraction of allocatable memory that is requested
    pub memory: f64,
    /// The allocatable cpu in millicpu
    pub cpu_allocatable: u64,
    /// The allocatable memory in bytes
    pub memory_allocatable: u64,
    /// The total demand we counted, baseline included
    pub requested: Resources,
}

impl NodeFraction {
    /// The highest fraction across both dimensions
    pub fn max(&self) -> f64 {
        self.cpu.max(self.memory)
    }

    /// The memory in bytes that is not yet requested on this node
    pub fn free_memory(&self) -> u64 {
        let free = self.memory_allocatable as f64 * (1.0 - self.memory);
        free.max(0.0) as u64
    }
}

/// Divide a demand by a capacity and clamp it to at most 1
///
/// A node with no capacity for a resource is treated as full.
fn clamped(requested: u64, allocatable: u64) -> f64 {
    if allocatable == 0 {
        return 1.0;
    }
    (requested as f64 / allocatable as f64).min(1.0)
}

/// Compute the cpu and memory fractions for a node
///
/// The baseline request is counted once on top of every non best effort
/// workload already placed on this node.
///
/// # Arguments
///
/// * `node` - The node to compute fractions for
/// * `baseline` - The reference workload shape to seed our demand with
/// * `workloads` - Every workload in the cluster
pub fn compute_fraction(
    node: &NodeDescriptor,
    baseline: &WorkloadRequest,
    workloads: &[WorkloadSnapshot],
) -> Result<NodeFraction, Error> {
    // make sure this node advertises both of its capacities before doing any work
    let cpu_allocatable = node.allocatable(Dimension::Cpu)?;
    let memory_allocatable = node.allocatable(Dimension::Memory)?;
    // start our demand at the baseline
    let mut requested = baseline.requested();
    // crawl over the workloads placed on this node
    for workload in workloads.iter().filter(|workload| workload.is_on(&node.name)) {
        let demand = workload.demand();
        event!(
            Level::DEBUG,
            node = &node.name,
            workload = &workload.name,
            namespace = &workload.namespace,
            cpu = demand.cpu,
            memory = demand.memory,
        );
        // huge requests saturate and clamp to a full node
        requested.cpu = requested.cpu.saturating_add(demand.cpu);
        requested.memory = requested.memory.saturating_add(demand.memory);
    }
    let cpu = clamped(requested.cpu, cpu_allocatable);
    let memory = clamped(requested.memory, memory_allocatable);
    event!(
        Level::INFO,
        node = &node.name,
        requested_cpu = requested.cpu,
        cpu_allocatable,
        cpu_fraction = cpu,
    );
    event!(
        Level::INFO,
        node = &node.name,
        requested_memory = requested.memory,
        memory_allocatable,
        memory_fraction = memory,
    );
    Ok(NodeFraction {
        node: node.name.clone(),
        cpu,
        memory,
        cpu_allocatable,
        memory_allocatable,
        requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::resources::ResourceList;
    use std::collections::BTreeMap;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn baseline() -> WorkloadRequest {
        WorkloadRequest::guaranteed(Resources {
            cpu: 100,
            memory: 100 * MIB,
        })
    }

    fn node(name: &str) -> NodeDescriptor {
        NodeDescriptor::new(
            name,
            Resources {
                cpu: 2000,
                memory: 4 * GIB,
            },
        )
    }

    fn pod(name: &str, node: &str, containers: Vec<WorkloadRequest>) -> WorkloadSnapshot {
        WorkloadSnapshot {
            namespace: "default".into(),
            name: name.into(),
            node: Some(node.into()),
            labels: BTreeMap::default(),
            containers,
        }
    }

    #[test]
    fn counts_baseline_and_local_workloads() {
        let workloads = vec![
            pod(
                "busy",
                "node-a",
                vec![WorkloadRequest::requests(Resources {
                    cpu: 500,
                    memory: GIB,
                })],
            ),
            // this pod lives elsewhere and must be ignored
            pod(
                "elsewhere",
                "node-b",
                vec![WorkloadRequest::requests(Resources {
                    cpu: 1500,
                    memory: GIB,
                })],
            ),
        ];
        let fraction = compute_fraction(&node("node-a"), &baseline(), &workloads).unwrap();
        assert!((fraction.cpu - 0.30).abs() < 1e-9);
        assert!((fraction.memory - (GIB + 100 * MIB) as f64 / (4 * GIB) as f64).abs() < 1e-9);
        assert_eq!(fraction.cpu_allocatable, 2000);
        assert_eq!(fraction.memory_allocatable, 4 * GIB);
        // an empty node only carries the baseline
        let empty = compute_fraction(&node("node-c"), &baseline(), &workloads).unwrap();
        assert!((empty.cpu - 0.05).abs() < 1e-9);
        assert!((empty.memory - 0.0244140625).abs() < 1e-9);
    }

    #[test]
    fn over_committed_nodes_clamp_to_one() {
        let workloads = vec![pod(
            "huge",
            "node-a",
            vec![WorkloadRequest::requests(Resources {
                cpu: 10_000,
                memory: 64 * GIB,
            })],
        )];
        let fraction = compute_fraction(&node("node-a"), &baseline(), &workloads).unwrap();
        assert_eq!(fraction.cpu, 1.0);
        assert_eq!(fraction.memory, 1.0);
        assert_eq!(fraction.free_memory(), 0);
    }

    #[test]
    fn best_effort_workloads_are_ignored() {
        // a best effort pod plus one that is only best effort on cpu
        let memory_only = WorkloadRequest {
            requests: ResourceList {
                cpu: None,
                memory: Some(GIB),
            },
            limits: ResourceList::default(),
        };
        let workloads = vec![
            pod("best-effort", "node-a", vec![WorkloadRequest::default()]),
            pod("memory-only", "node-a", vec![memory_only]),
        ];
        let fraction = compute_fraction(&node("node-a"), &baseline(), &workloads).unwrap();
        assert!((fraction.cpu - 0.05).abs() < 1e-9);
        assert_eq!(fraction.requested.memory, GIB + 100 * MIB);
    }

    #[test]
    fn huge_requests_saturate_instead_of_overflowing() {
        // two containers that together ask for more than u64::MAX bytes
        let huge = WorkloadRequest::requests(Resources {
            cpu: u64::MAX / 2 + 1,
            memory: 10_000_000_000_000_000_000,
        });
        let workloads = vec![pod("bound", "node-a", vec![huge, huge])];
        let fraction = compute_fraction(&node("node-a"), &baseline(), &workloads).unwrap();
        assert_eq!(fraction.requested.cpu, u64::MAX);
        assert_eq!(fraction.requested.memory, u64::MAX);
        assert_eq!(fraction.cpu, 1.0);
        assert_eq!(fraction.memory, 1.0);
    }

    #[test]
    fn missing_capacity_is_fatal() {
        let malformed = NodeDescriptor {
            name: "node-a".into(),
            cpu: None,
            memory: Some(GIB),
        };
        let err = compute_fraction(&malformed, &baseline(), &[]).unwrap_err();
        assert!(matches!(err, Error::MissingAllocatable { resource: "cpu", .. }));
    }

    #[test]
    fn zero_capacity_is_full() {
        let full = NodeDescriptor::new("node-a", Resources { cpu: 0, memory: 0 });
        let fraction = compute_fraction(&full, &WorkloadRequest::default(), &[]).unwrap();
        assert_eq!(fraction.cpu, 1.0);
        assert_eq!(fraction.memory, 1.0);
    }
}
