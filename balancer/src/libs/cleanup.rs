//! Removes the balancing pods a balancing pass created
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::clusters::Cluster;
use super::conf::Polling;
use super::helpers;
use crate::Error;

/// How a cleanup pass ended
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Every balancing pod is gone
    Complete,
    /// Some balancing pods may still exist
    Incomplete {
        /// The balancing pods we last saw or failed to delete
        remaining: Vec<String>,
    },
}

impl CleanupStatus {
    /// Whether every balancing pod is gone
    pub fn is_complete(&self) -> bool {
        matches!(self, CleanupStatus::Complete)
    }
}

/// A handle that deletes balancing pods
///
/// Pods are deleted by name first and then by label in case anything was
/// created without us learning its name.
pub struct Cleanup<C: Cluster> {
    /// The cluster our pods are in
    cluster: Arc<C>,
    /// The namespace our pods are in
    namespace: String,
    /// The selector matching every balancing pod
    selector: String,
    /// The names of the pods we created
    created: Vec<String>,
    /// How to wait for our pods to disappear
    polling: Polling,
}

impl<C: Cluster> Cleanup<C> {
    /// Create a new cleanup handle that owns no pods yet
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster our pods are in
    /// * `namespace` - The namespace our pods are in
    /// * `selector` - The selector matching every balancing pod
    /// * `polling` - How to wait for our pods to disappear
    pub fn new<N: Into<String>, S: Into<String>>(
        cluster: Arc<C>,
        namespace: N,
        selector: S,
        polling: Polling,
    ) -> Self {
        Cleanup {
            cluster,
            namespace: namespace.into(),
            selector: selector.into(),
            created: Vec::default(),
            polling,
        }
    }

    /// Take ownership of a created pod
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the pod to own
    pub fn track(&mut self, name: String) {
        self.created.push(name);
    }

    /// The names of the pods this handle owns
    pub fn created(&self) -> &[String] {
        &self.created
    }

    /// Delete every balancing pod and wait for them to disappear
    ///
    /// This never fails. Anything that goes wrong is logged and reported as
    /// an incomplete cleanup, and running it again is always safe.
    #[instrument(name = "Cleanup::run", skip(self), fields(namespace = %self.namespace, owned = self.created.len()))]
    pub async fn run(&mut self) -> CleanupStatus {
        let cluster = &self.cluster;
        let namespace = self.namespace.as_str();
        let selector = self.selector.as_str();
        // delete the pods we own 10 at a time
        let attempts = stream::iter(&self.created)
            .map(|name| async move { cluster.delete(namespace, name).await })
            .buffered(10)
            .collect::<Vec<_>>()
            .await;
        let mut failed = Vec::default();
        for (name, attempt) in self.created.iter().zip(attempts) {
            // log any failed deletes
            if let Err(error) = attempt {
                event!(
                    Level::ERROR,
                    msg = "Failed to delete balancing pod",
                    pod = name,
                    error = error.to_string()
                );
                failed.push(name.clone());
            }
        }
        // sweep up anything we do not know the name of
        if let Err(error) = cluster.delete_by_label(namespace, selector).await {
            event!(
                Level::WARN,
                msg = "Failed to delete balancing pods by label",
                selector,
                error = error.to_string()
            );
        }
        // wait for every balancing pod to be gone
        let waiting_for = format!("balancing pods matching {selector} to be deleted");
        let gone = helpers::poll_until(
            self.polling.interval(),
            self.polling.cleanup_timeout(),
            &waiting_for,
            move || async move {
                // a failed listing is not proof the pods are gone so keep polling
                match cluster.list_by_label(namespace, selector).await {
                    Ok(left) => Ok::<bool, Error>(left.is_empty()),
                    Err(error) => {
                        event!(
                            Level::WARN,
                            msg = "Failed to list balancing pods",
                            selector,
                            error = error.to_string()
                        );
                        Ok(false)
                    }
                }
            },
        )
        .await;
        match gone {
            Ok(()) => {
                event!(Level::INFO, msg = "Balancing pods deleted", count = self.created.len());
                self.created.clear();
                CleanupStatus::Complete
            }
            Err(error) => {
                // report whatever we can still see
                let remaining = match cluster.list_by_label(namespace, selector).await {
                    Ok(left) => left,
                    Err(_) => failed,
                };
                event!(
                    Level::WARN,
                    msg = "Balancing pods may not have been cleaned up",
                    remaining = remaining.len(),
                    error = error.to_string()
                );
                CleanupStatus::Incomplete { remaining }
            }
        }
    }
}
