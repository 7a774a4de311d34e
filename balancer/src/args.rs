//! The command line args for the priority balancer

use clap::Parser;
use std::path::PathBuf;

/// The command line args passed to the priority balancer
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "balancer.yml")]
    pub config: PathBuf,
    /// Balance an in memory pretend cluster instead of a real one
    #[clap(long, default_value_t)]
    pub dry_run: bool,
    /// The kubeconfig context to use instead of inferring one
    #[clap(long)]
    pub context: Option<String>,
    /// The action to take
    #[clap(subcommand)]
    pub cmd: SubCommands,
}

/// The actions the balancer can take
#[derive(Parser, Debug, Clone)]
pub enum SubCommands {
    /// Print each node's utilization and the plan to balance them
    #[clap(version, author)]
    Survey(Survey),
    /// Raise every node to a common utilization ratio
    #[clap(version, author)]
    Balance(Balance),
    /// Delete any balancing pods left behind in the cluster
    #[clap(version, author)]
    Cleanup,
}

/// The args for surveying nodes
#[derive(Parser, Debug, Clone)]
pub struct Survey {
    /// The nodes to survey (defaults to all schedulable nodes)
    #[clap(short, long)]
    pub node: Vec<String>,
    /// The lowest ratio to plan for (defaults to the configured floor)
    #[clap(short, long)]
    pub floor: Option<f64>,
}

/// The args for balancing nodes
#[derive(Parser, Debug, Clone)]
pub struct Balance {
    /// The nodes to balance (defaults to all schedulable nodes)
    #[clap(short, long)]
    pub node: Vec<String>,
    /// The lowest ratio to balance to (defaults to the configured floor)
    #[clap(short, long)]
    pub floor: Option<f64>,
    /// Keep the balancing pods until ctrl-c is pressed and then clean them up
    #[clap(long)]
    pub hold: bool,
}
