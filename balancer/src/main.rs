//! A CLI for balancing the utilization of a cluster's nodes

#[macro_use]
extern crate serde_derive;

use clap::Parser;
use priority_balancer::libs::trace;
use priority_balancer::{Conf, DryRun, K8s};
use std::sync::Arc;

mod args;
mod handlers;

use args::Args;

#[tokio::main]
async fn main() {
    // install a crypto provider for rustls
    // Rustls will complain if this is not run but we can ignore any errors
    let _ = rustls::crypto::ring::default_provider().install_default();
    // get the command line args that were passed in
    let args = Args::parse();
    // try to load a config file
    let conf = Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    trace::setup("PriorityBalancer", &conf.tracing);
    // run against the right cluster
    let result = if args.dry_run {
        handlers::handle(Arc::new(DryRun::new()), &args, &conf).await
    } else {
        match K8s::new(args.context.as_deref()).await {
            Ok(k8s) => handlers::handle(Arc::new(k8s), &args, &conf).await,
            Err(err) => Err(err),
        }
    };
    if let Err(err) = result {
        // print the error
        eprintln!("{err}");
        std::process::exit(1);
    }
}
