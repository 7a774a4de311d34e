//! The config for the priority balancer
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::helpers;
use super::resources::{Resources, WorkloadRequest};
use crate::Error;

/// The smallest memory limit cri-o will accept for a container (12 MiB)
pub const CRIO_MIN_MEM_LIMIT: u64 = 12 * 1024 * 1024;

/// Helps serde default the namespace to put balancing pods in
fn default_namespace() -> String {
    "default".to_owned()
}

/// Helps serde default the floor ratio to 50%
fn default_floor_ratio() -> f64 {
    0.5
}

/// Helps serde default the memory floor to the cri-o minimum
fn default_memory_floor() -> u64 {
    CRIO_MIN_MEM_LIMIT
}

/// Helps serde default the labels shared by all balancing pods
fn default_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::default();
    labels.insert("podname".to_owned(), "priority-balanced-memory".to_owned());
    labels
}

/// Helps serde default the prefix for balancing pod names
fn default_name_prefix() -> String {
    "balanced".to_owned()
}

/// Helps serde default the image balancing pods run
fn default_image() -> String {
    "registry.k8s.io/pause:3.10".to_owned()
}

/// Helps serde default the baseline cpu
fn default_baseline_cpu() -> String {
    "100m".to_owned()
}

/// Helps serde default the baseline memory
fn default_baseline_memory() -> String {
    "100Mi".to_owned()
}

/// Helps serde default the poll interval to 2 seconds
fn default_interval() -> u64 {
    2
}

/// Helps serde default the cleanup timeout to 1 minute
fn default_cleanup_timeout() -> u64 {
    60
}

/// Helps serde default the running timeout to 5 minutes
fn default_running_timeout() -> u64 {
    300
}

/// The shape of the reference workload a test is going to launch
///
/// This is used as both the request and the limit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Baseline {
    /// The cpu to request (k8s quantity format)
    #[serde(default = "default_baseline_cpu")]
    pub cpu: String,
    /// The memory to request (k8s quantity format)
    #[serde(default = "default_baseline_memory")]
    pub memory: String,
}

impl Default for Baseline {
    fn default() -> Self {
        Baseline {
            cpu: default_baseline_cpu(),
            memory: default_baseline_memory(),
        }
    }
}

impl Baseline {
    /// Parse this baseline into a workload request
    pub fn request(&self) -> Result<WorkloadRequest, Error> {
        // parse our quantities
        let shape = Resources {
            cpu: helpers::cpu(&self.cpu)?,
            memory: helpers::memory(&self.memory)?,
        };
        Ok(WorkloadRequest::guaranteed(shape))
    }
}

/// How long to wait between and for polls
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Polling {
    /// The seconds to wait between polls
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// The seconds to wait for balancing pods to be deleted
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout: u64,
    /// The seconds to wait for a balancing pod to start running
    #[serde(default = "default_running_timeout")]
    pub running_timeout: u64,
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            interval: default_interval(),
            cleanup_timeout: default_cleanup_timeout(),
            running_timeout: default_running_timeout(),
        }
    }
}

impl Polling {
    /// The interval between polls
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// How long cleanup may wait for pods to disappear
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout)
    }

    /// How long creation may wait for a pod to start running
    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout)
    }
}

/// The different levels to log at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Log at the info level
    #[default]
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[must_use]
    pub fn to_filter(&self) -> tracing_subscriber::filter::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// The tracing settings to use
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Tracing {
    /// The log level to use for stdout
    #[serde(default)]
    pub level: LogLevel,
}

/// The config for the priority balancer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Conf {
    /// The namespace to create balancing pods in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// The lowest utilization ratio nodes will be balanced to
    #[serde(default = "default_floor_ratio")]
    pub floor_ratio: f64,
    /// The reference workload shape used when computing fractions
    #[serde(default)]
    pub baseline: Baseline,
    /// The memory in bytes added on top of every balancing pod's request
    #[serde(default = "default_memory_floor")]
    pub memory_floor: u64,
    /// The labels every balancing pod is created with
    #[serde(default = "default_labels")]
    pub labels: BTreeMap<String, String>,
    /// The prefix for balancing pod names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// The image balancing pods run
    #[serde(default = "default_image")]
    pub image: String,
    /// The poll settings to use
    #[serde(default)]
    pub polling: Polling,
    /// The tracing settings to use
    #[serde(default)]
    pub tracing: Tracing,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            namespace: default_namespace(),
            floor_ratio: default_floor_ratio(),
            baseline: Baseline::default(),
            memory_floor: default_memory_floor(),
            labels: default_labels(),
            name_prefix: default_name_prefix(),
            image: default_image(),
            polling: Polling::default(),
            tracing: Tracing::default(),
        }
    }
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// A missing config file is not an error; defaults and any environment
    /// overrides are used instead.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // load from a file first
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("balancer")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Build the label selector matching all balancing pods
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<String>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cri_o_floor() {
        let conf = Conf::default();
        assert_eq!(conf.memory_floor, 12_582_912);
        assert_eq!(conf.label_selector(), "podname=priority-balanced-memory");
        assert_eq!(conf.polling.interval(), Duration::from_secs(2));
        assert_eq!(conf.polling.cleanup_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn baseline_parses_to_a_guaranteed_request() {
        let request = Conf::default().baseline.request().unwrap();
        let shape = Resources {
            cpu: 100,
            memory: 100 * 1024 * 1024,
        };
        assert_eq!(request.requests, shape.into());
        assert_eq!(request.limits, shape.into());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let conf = Conf::new("/nonexistent/balancer.yml").unwrap();
        assert_eq!(conf.namespace, "default");
        assert_eq!(conf.floor_ratio, 0.5);
        assert_eq!(conf.tracing.level, LogLevel::Info);
    }
}
