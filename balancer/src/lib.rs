//! Raises every node in a cluster to a common cpu and memory utilization
//!
//! Scheduler scoring functions that depend on relative resource availability
//! are only testable once pre-existing load is evened out. This crate surveys
//! how much of each node is already requested and pins pause pods to every
//! node so they all sit at the same ratio.

#[macro_use]
extern crate serde_derive;

pub mod libs;

pub use libs::errors::Error;
pub use libs::{
    BalancePlan, Balancer, Cleanup, CleanupStatus, Cluster, Conf, DryRun, DryRunNode, Headroom,
    K8s, NodeDescriptor, NodeFraction, NodePlan, Resources, Survey, SyntheticWorkload,
    WorkloadRequest, WorkloadSnapshot, compute_fraction,
};
