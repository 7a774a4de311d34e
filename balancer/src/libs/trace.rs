//! Sets up tracing for the balancer on stdout

use tracing::{Level, event};
use tracing_subscriber::prelude::*;

use super::conf::Tracing;

/// Setup our stdout tracer
///
/// Setting up tracing more than once is not an error so tests and
/// embedding callers can call this freely.
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // build our local layer filtered to our log level
    let local = tracing_subscriber::fmt::layer().with_filter(conf.level.to_filter());
    // add our local tracer to our registry
    if tracing_subscriber::registry().with(local).try_init().is_ok() {
        event!(Level::INFO, msg = "Tracing to stdout", service = name, level = %conf.level);
    }
}
