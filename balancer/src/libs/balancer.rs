//! Raises every node to a common utilization ratio
//!
//! Balancing only ever adds load. Each node gets exactly one pause pod pinned
//! to it that requests whatever cpu and memory it takes to bring that node up
//! to the target ratio, so scheduler scoring starts from an even cluster.
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::cleanup::Cleanup;
use super::clusters::Cluster;
use super::conf::{Conf, Polling};
use super::fraction::{NodeFraction, compute_fraction};
use super::helpers;
use super::resources::{NodeDescriptor, Resources, SyntheticWorkload, WorkloadRequest};
use crate::Error;

/// The fractions of every surveyed node keyed by node name
pub type Survey = BTreeMap<String, NodeFraction>;

/// What balancing a single node takes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodePlan {
    /// The node to balance
    pub node: String,
    /// The fractions this node had before balancing
    pub fraction: NodeFraction,
    /// The resources the balancing pod for this node requests
    pub extra: Resources,
    /// The name of the balancing pod once it has been created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
}

/// The target ratio and per node requests for a balancing pass
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BalancePlan {
    /// The ratio every node is raised to
    pub target: f64,
    /// The plan for each node
    pub nodes: Vec<NodePlan>,
}

impl BalancePlan {
    /// Get the plan for a specific node
    ///
    /// # Arguments
    ///
    /// * `node` - The node to get a plan for
    pub fn get(&self, node: &str) -> Option<&NodePlan> {
        self.nodes.iter().find(|plan| plan.node == node)
    }

    /// The names of the balancing pods that were created
    pub fn workloads(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|plan| plan.workload.as_deref())
            .collect()
    }
}

/// Whether every node has enough free memory to be balanced
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Headroom {
    /// Every node can take a balancing pod
    Sufficient,
    /// At least one node is too full to balance safely
    TooUtilized {
        /// The first node found without enough headroom
        node: String,
        /// The free memory on this node in bytes
        free_memory: u64,
        /// The free memory we need in bytes
        required: u64,
    },
}

impl Headroom {
    /// Turn insufficient headroom into an error
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Headroom::Sufficient => Ok(()),
            Headroom::TooUtilized {
                node,
                free_memory,
                required,
            } => Err(Error::TooUtilized {
                node,
                free_memory,
                required,
            }),
        }
    }
}

/// Make sure a balancing ratio is a finite value within [0, 1]
///
/// # Arguments
///
/// * `ratio` - The ratio to check
pub fn validate_ratio(ratio: f64) -> Result<(), Error> {
    if ratio.is_finite() && (0.0..=1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(Error::InvalidRatio(ratio))
    }
}

/// Check that every surveyed node has at least twice the memory floor free
///
/// # Arguments
///
/// * `survey` - The surveyed nodes to check
/// * `memory_floor` - The memory added to every balancing pod
pub fn headroom(survey: &Survey, memory_floor: u64) -> Headroom {
    let required = memory_floor.saturating_mul(2);
    for fraction in survey.values() {
        let free_memory = fraction.free_memory();
        if free_memory < required {
            return Headroom::TooUtilized {
                node: fraction.node.clone(),
                free_memory,
                required,
            };
        }
    }
    Headroom::Sufficient
}

/// Get how much of a dimension it takes to raise a fraction to our target
///
/// Negative requests are invalid so anything already at or above the target
/// gets nothing. Partial units are truncated.
///
/// # Arguments
///
/// * `target` - The ratio to raise this dimension to
/// * `fraction` - The current fraction for this dimension
/// * `allocatable` - The allocatable amount for this dimension
fn extra(target: f64, fraction: f64, allocatable: u64) -> u64 {
    let extra = (target - fraction) * allocatable as f64;
    if !extra.is_finite() || extra <= 0.0 {
        return 0;
    }
    // snap float noise to the nearest whole unit before truncating
    let nearest = extra.round();
    if (extra - nearest).abs() <= nearest * 1e-12 {
        nearest as u64
    } else {
        extra as u64
    }
}

/// Size the balancing pod for every surveyed node
///
/// The target is the floor ratio or the most loaded dimension of any node,
/// whichever is higher, since balancing can only add load.
///
/// # Arguments
///
/// * `survey` - The surveyed nodes to plan for
/// * `floor_ratio` - The lowest ratio to balance to
/// * `memory_floor` - The memory to add on top of every memory request
pub fn plan(survey: &Survey, floor_ratio: f64, memory_floor: u64) -> Result<BalancePlan, Error> {
    validate_ratio(floor_ratio)?;
    // find the most loaded dimension across all nodes
    let observed = survey
        .values()
        .map(NodeFraction::max)
        .fold(0.0, f64::max);
    let target = floor_ratio.max(observed);
    event!(Level::INFO, floor_ratio, observed, target);
    // size each nodes balancing pod
    let nodes = survey
        .values()
        .map(|fraction| {
            let cpu = extra(target, fraction.cpu, fraction.cpu_allocatable);
            let memory = extra(target, fraction.memory, fraction.memory_allocatable)
                .saturating_add(memory_floor);
            NodePlan {
                node: fraction.node.clone(),
                fraction: fraction.clone(),
                extra: Resources { cpu, memory },
                workload: None,
            }
        })
        .collect();
    Ok(BalancePlan { target, nodes })
}

/// Balances the nodes of a cluster
pub struct Balancer<C: Cluster> {
    /// The cluster to balance
    cluster: Arc<C>,
    /// The namespace to create balancing pods in
    namespace: String,
    /// The labels every balancing pod gets
    labels: BTreeMap<String, String>,
    /// The selector matching every balancing pod
    selector: String,
    /// The prefix for balancing pod names
    name_prefix: String,
    /// The image balancing pods run
    image: String,
    /// The memory added to every balancing pod
    memory_floor: u64,
    /// How to wait on the cluster
    polling: Polling,
}

impl<C: Cluster> Balancer<C> {
    /// Create a new balancer
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster to balance
    /// * `conf` - The balancer config
    pub fn new(cluster: Arc<C>, conf: &Conf) -> Self {
        Balancer {
            cluster,
            namespace: conf.namespace.clone(),
            labels: conf.labels.clone(),
            selector: conf.label_selector(),
            name_prefix: conf.name_prefix.clone(),
            image: conf.image.clone(),
            memory_floor: conf.memory_floor,
            polling: conf.polling.clone(),
        }
    }

    /// Get the cluster we are balancing
    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    /// Build a cleanup handle that removes balancing pods by label only
    ///
    /// Useful for removing pods left behind by a crashed run.
    pub fn cleanup(&self) -> Cleanup<C> {
        Cleanup::new(
            self.cluster.clone(),
            &self.namespace,
            &self.selector,
            self.polling.clone(),
        )
    }

    /// Compute the fractions of a set of nodes
    ///
    /// The cluster's workloads are listed once and shared by every node.
    ///
    /// # Arguments
    ///
    /// * `nodes` - The nodes to survey
    /// * `baseline` - The reference workload shape
    #[instrument(name = "Balancer::survey", skip_all, fields(nodes = nodes.len()), err(Debug))]
    pub async fn survey(
        &self,
        nodes: &[NodeDescriptor],
        baseline: &WorkloadRequest,
    ) -> Result<Survey, Error> {
        let workloads = self.cluster.workloads().await?;
        let mut survey = Survey::default();
        for node in nodes {
            let fraction = compute_fraction(node, baseline, &workloads)?;
            survey.insert(node.name.clone(), fraction);
        }
        Ok(survey)
    }

    /// Check whether any node is too full to balance
    ///
    /// # Arguments
    ///
    /// * `nodes` - The nodes to check
    /// * `baseline` - The reference workload shape
    pub async fn too_utilized(
        &self,
        nodes: &[NodeDescriptor],
        baseline: &WorkloadRequest,
    ) -> Result<Headroom, Error> {
        let survey = self.survey(nodes, baseline).await?;
        Ok(headroom(&survey, self.memory_floor))
    }

    /// Raise every node to a common utilization ratio
    ///
    /// The cleanup handle is always returned, even on failure, and covers
    /// every balancing pod that was created before the failure.
    ///
    /// # Arguments
    ///
    /// * `nodes` - The nodes to balance
    /// * `baseline` - The reference workload shape
    /// * `floor_ratio` - The lowest ratio to balance to
    pub async fn balance(
        &self,
        nodes: &[NodeDescriptor],
        baseline: &WorkloadRequest,
        floor_ratio: f64,
    ) -> (Cleanup<C>, Result<BalancePlan, Error>) {
        let mut cleanup = self.cleanup();
        let result = self
            .balance_with(&mut cleanup, nodes, baseline, floor_ratio)
            .await;
        (cleanup, result)
    }

    /// Balance while tracking created pods in a cleanup handle
    ///
    /// # Arguments
    ///
    /// * `cleanup` - The handle to track created pods in
    /// * `nodes` - The nodes to balance
    /// * `baseline` - The reference workload shape
    /// * `floor_ratio` - The lowest ratio to balance to
    #[instrument(name = "Balancer::balance", skip_all, fields(nodes = nodes.len(), floor_ratio = floor_ratio), err(Debug))]
    async fn balance_with(
        &self,
        cleanup: &mut Cleanup<C>,
        nodes: &[NodeDescriptor],
        baseline: &WorkloadRequest,
        floor_ratio: f64,
    ) -> Result<BalancePlan, Error> {
        validate_ratio(floor_ratio)?;
        let survey = self.survey(nodes, baseline).await?;
        // refuse to touch a cluster that is already too full
        headroom(&survey, self.memory_floor).into_result()?;
        let mut plan = plan(&survey, floor_ratio, self.memory_floor)?;
        for node_plan in &mut plan.nodes {
            let name = self
                .inject(cleanup, node_plan)
                .await
                .map_err(|source| Error::Create {
                    node: node_plan.node.clone(),
                    source: Box::new(source),
                })?;
            node_plan.workload = Some(name);
        }
        self.verify(nodes, baseline, plan.target).await;
        Ok(plan)
    }

    /// Create a single balancing pod and wait for it to start running
    ///
    /// # Arguments
    ///
    /// * `cleanup` - The handle to track the created pod in
    /// * `node_plan` - The plan for the node to balance
    async fn inject(&self, cleanup: &mut Cleanup<C>, node_plan: &NodePlan) -> Result<String, Error> {
        let workload = SyntheticWorkload {
            name: helpers::unique_name(&self.name_prefix),
            labels: self.labels.clone(),
            node: node_plan.node.clone(),
            requests: node_plan.extra,
            image: self.image.clone(),
        };
        let name = self.cluster.create(&self.namespace, &workload).await?;
        // track this pod before waiting on it so a timeout still cleans it up
        cleanup.track(name.clone());
        event!(
            Level::INFO,
            msg = "Created balancing pod",
            pod = &name,
            node = &node_plan.node,
            cpu = node_plan.extra.cpu,
            memory = node_plan.extra.memory
        );
        let waiting_for = format!("balancing pod {name} to run on {}", node_plan.node);
        let cluster = &self.cluster;
        let namespace = self.namespace.as_str();
        let pod = name.as_str();
        helpers::poll_until(
            self.polling.interval(),
            self.polling.running_timeout(),
            &waiting_for,
            move || cluster.is_running(namespace, pod),
        )
        .await?;
        Ok(name)
    }

    /// Recompute and log every node's fractions after balancing
    ///
    /// # Arguments
    ///
    /// * `nodes` - The nodes that were balanced
    /// * `baseline` - The reference workload shape
    /// * `target` - The ratio we balanced to
    async fn verify(&self, nodes: &[NodeDescriptor], baseline: &WorkloadRequest, target: f64) {
        match self.survey(nodes, baseline).await {
            Ok(after) => {
                for fraction in after.values() {
                    event!(
                        Level::INFO,
                        msg = "Balanced node",
                        node = &fraction.node,
                        cpu_fraction = fraction.cpu,
                        memory_fraction = fraction.memory,
                        target
                    );
                }
            }
            Err(error) => event!(
                Level::WARN,
                msg = "Failed to verify balancing",
                error = error.to_string()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::conf::CRIO_MIN_MEM_LIMIT;
    use crate::libs::resources::WorkloadSnapshot;

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

    fn pod(node: &str, cpu: u64, memory: u64) -> WorkloadSnapshot {
        WorkloadSnapshot {
            namespace: "apps".into(),
            name: format!("{node}-pod"),
            node: Some(node.into()),
            labels: BTreeMap::default(),
            containers: vec![WorkloadRequest::requests(Resources { cpu, memory })],
        }
    }

    fn survey(nodes: &[NodeDescriptor], workloads: &[WorkloadSnapshot]) -> Survey {
        nodes
            .iter()
            .map(|node| {
                let fraction = compute_fraction(node, &baseline(), workloads).unwrap();
                (node.name.clone(), fraction)
            })
            .collect()
    }

    #[test]
    fn two_node_example() {
        let survey = survey(&[node("a"), node("b")], &[pod("a", 500, GIB)]);
        let plan = plan(&survey, 0.5, CRIO_MIN_MEM_LIMIT).unwrap();
        assert_eq!(plan.target, 0.5);
        let a = plan.get("a").unwrap();
        let b = plan.get("b").unwrap();
        assert_eq!(a.extra.cpu, 400);
        assert_eq!(b.extra.cpu, 900);
        // memory is topped up to half of 4 GiB plus the floor
        assert_eq!(a.extra.memory, 2 * GIB - GIB - 100 * MIB + CRIO_MIN_MEM_LIMIT);
        assert_eq!(b.extra.memory, 2 * GIB - 100 * MIB + CRIO_MIN_MEM_LIMIT);
        assert!(plan.workloads().is_empty());
    }

    #[test]
    fn target_follows_the_most_loaded_node() {
        // node a is at 60% cpu which is above our floor
        let survey = survey(&[node("a"), node("b")], &[pod("a", 1100, 0)]);
        let plan = plan(&survey, 0.2, 0).unwrap();
        assert!((plan.target - 0.6).abs() < 1e-9);
        for node_plan in &plan.nodes {
            assert!(plan.target >= node_plan.fraction.max());
        }
        // the node that set the target gets no cpu
        assert_eq!(plan.get("a").unwrap().extra.cpu, 0);
        assert_eq!(plan.get("b").unwrap().extra.cpu, 1100);
    }

    #[test]
    fn target_node_gets_one_memory_floor() {
        // node a sits at exactly half of its memory and sets the target
        let survey = survey(&[node("a"), node("b")], &[pod("a", 0, 2 * GIB - 100 * MIB)]);
        let plan = plan(&survey, 0.2, CRIO_MIN_MEM_LIMIT).unwrap();
        assert_eq!(plan.target, 0.5);
        assert_eq!(plan.get("a").unwrap().extra.memory, CRIO_MIN_MEM_LIMIT);
        // every other node is offset by the same single floor
        assert_eq!(
            plan.get("b").unwrap().extra.memory,
            2 * GIB - 100 * MIB + CRIO_MIN_MEM_LIMIT
        );
        // the pre-check is what demands twice the floor
        let Headroom::Sufficient = headroom(&survey, CRIO_MIN_MEM_LIMIT) else {
            panic!("half full nodes have room for two floors");
        };
    }

    #[test]
    fn extra_requests_never_go_negative() {
        assert_eq!(extra(0.5, 0.75, 2000), 0);
        assert_eq!(extra(0.5, 0.5, 2000), 0);
        assert_eq!(extra(0.5, f64::NAN, 2000), 0);
        // partial millicpu are truncated
        assert_eq!(extra(0.5, 0.4999, 2000), 0);
        assert_eq!(extra(0.5, 0.25, 2001), 500);
        // a node over the target in one dimension still gets the memory floor
        let survey = survey(&[node("a"), node("b")], &[pod("a", 1900, 0)]);
        let plan = plan(&survey, 0.0, CRIO_MIN_MEM_LIMIT).unwrap();
        let a = plan.get("a").unwrap();
        assert_eq!(a.extra.cpu, 0);
        assert!(a.extra.memory >= CRIO_MIN_MEM_LIMIT);
    }

    #[test]
    fn invalid_ratios_are_rejected() {
        let survey = survey(&[node("a")], &[]);
        for ratio in [-0.1, 1.5, f64::NAN, f64::INFINITY] {
            let err = plan(&survey, ratio, 0).unwrap_err();
            assert!(matches!(err, Error::InvalidRatio(_)));
        }
        assert!(plan(&survey, 1.0, 0).is_ok());
        assert!(plan(&survey, 0.0, 0).is_ok());
    }

    #[test]
    fn full_nodes_lack_headroom() {
        // leave node b with only 20 MiB of memory free
        let full = pod("b", 0, 4 * GIB - 120 * MIB);
        let survey = survey(&[node("a"), node("b")], &[full]);
        match headroom(&survey, CRIO_MIN_MEM_LIMIT) {
            Headroom::TooUtilized {
                node,
                free_memory,
                required,
            } => {
                assert_eq!(node, "b");
                assert_eq!(free_memory, 20 * MIB);
                assert_eq!(required, 2 * CRIO_MIN_MEM_LIMIT);
            }
            Headroom::Sufficient => panic!("node b should be too utilized"),
        }
        // a smaller floor fits
        assert_eq!(headroom(&survey, 8 * MIB), Headroom::Sufficient);
        assert!(Headroom::Sufficient.into_result().is_ok());
    }
}
