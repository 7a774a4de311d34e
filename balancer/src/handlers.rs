//! Runs the balancer's subcommands against a cluster

use std::sync::Arc;
use tracing::{Level, event};

use crate::args::{Args, Balance, SubCommands, Survey};
use priority_balancer::libs::balancer::{self as balancing, Headroom};
use priority_balancer::{
    BalancePlan, Balancer, CleanupStatus, Cluster, Conf, Error, NodeDescriptor, Survey as Fractions,
};

/// What a survey found
#[derive(Serialize, Debug)]
struct SurveyReport {
    /// The fractions of each surveyed node
    fractions: Fractions,
    /// Whether every node can be balanced safely
    headroom: Headroom,
    /// What balancing these nodes would create
    plan: BalancePlan,
}

/// Print a value as pretty json
///
/// # Arguments
///
/// * `value` - The value to print
fn print<T: serde::Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Get the nodes to work on
///
/// # Arguments
///
/// * `cluster` - The cluster to get nodes from
/// * `names` - The names of the nodes to get or nothing for every schedulable node
async fn nodes<C: Cluster>(cluster: &C, names: &[String]) -> Result<Vec<NodeDescriptor>, Error> {
    if names.is_empty() {
        return cluster.schedulable_nodes().await;
    }
    let mut nodes = Vec::with_capacity(names.len());
    for name in names {
        nodes.push(cluster.node(name).await?);
    }
    Ok(nodes)
}

/// Survey nodes and print what balancing them would do
///
/// # Arguments
///
/// * `balancer` - The balancer to survey with
/// * `conf` - The balancer config
/// * `cmd` - The survey args
async fn survey<C: Cluster>(balancer: &Balancer<C>, conf: &Conf, cmd: &Survey) -> Result<(), Error> {
    let nodes = nodes(balancer.cluster().as_ref(), &cmd.node).await?;
    let baseline = conf.baseline.request()?;
    let fractions = balancer.survey(&nodes, &baseline).await?;
    let floor = cmd.floor.unwrap_or(conf.floor_ratio);
    let report = SurveyReport {
        headroom: balancing::headroom(&fractions, conf.memory_floor),
        plan: balancing::plan(&fractions, floor, conf.memory_floor)?,
        fractions,
    };
    print(&report)
}

/// Balance nodes and optionally hold them balanced until ctrl-c
///
/// # Arguments
///
/// * `balancer` - The balancer to balance with
/// * `conf` - The balancer config
/// * `cmd` - The balance args
async fn balance<C: Cluster>(balancer: &Balancer<C>, conf: &Conf, cmd: &Balance) -> Result<(), Error> {
    let nodes = nodes(balancer.cluster().as_ref(), &cmd.node).await?;
    let baseline = conf.baseline.request()?;
    let floor = cmd.floor.unwrap_or(conf.floor_ratio);
    let (mut cleanup, result) = balancer.balance(&nodes, &baseline, floor).await;
    let plan = match result {
        Ok(plan) => plan,
        // a cluster too full to balance is skipped rather than failed
        Err(error) if error.is_precondition() => {
            event!(Level::WARN, msg = "Skipping balancing", error = error.to_string());
            return Ok(());
        }
        Err(error) => {
            // remove anything we created before failing
            cleanup.run().await;
            return Err(error);
        }
    };
    print(&plan)?;
    if cmd.hold {
        event!(Level::INFO, msg = "Holding balancing pods until ctrl-c");
        tokio::signal::ctrl_c().await?;
        print(&cleanup.run().await)?;
    }
    Ok(())
}

/// Delete any balancing pods left in the cluster
///
/// # Arguments
///
/// * `balancer` - The balancer whose pods should be deleted
async fn cleanup<C: Cluster>(balancer: &Balancer<C>) -> Result<(), Error> {
    let status = balancer.cleanup().run().await;
    print(&status)?;
    match status {
        CleanupStatus::Complete => Ok(()),
        CleanupStatus::Incomplete { remaining } => Err(Error::new(format!(
            "{} balancing pods could not be deleted",
            remaining.len()
        ))),
    }
}

/// Run the requested subcommand against a cluster
///
/// # Arguments
///
/// * `cluster` - The cluster to work on
/// * `args` - The command line args
/// * `conf` - The balancer config
pub async fn handle<C: Cluster>(cluster: Arc<C>, args: &Args, conf: &Conf) -> Result<(), Error> {
    let balancer = Balancer::new(cluster, conf);
    match &args.cmd {
        SubCommands::Survey(cmd) => survey(&balancer, conf, cmd).await,
        SubCommands::Balance(cmd) => balance(&balancer, conf, cmd).await,
        SubCommands::Cleanup => cleanup(&balancer).await,
    }
}
