pub mod balancer;
pub mod cleanup;
pub mod clusters;
pub mod conf;
pub mod errors;
pub mod fraction;
pub mod helpers;
pub mod resources;
pub mod trace;

pub use balancer::{BalancePlan, Balancer, Headroom, NodePlan, Survey};
pub use cleanup::{Cleanup, CleanupStatus};
pub use clusters::{Cluster, DryRun, DryRunNode, K8s};
pub use conf::Conf;
pub use fraction::{NodeFraction, compute_fraction};
pub use resources::{NodeDescriptor, Resources, SyntheticWorkload, WorkloadRequest, WorkloadSnapshot};
