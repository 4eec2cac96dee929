//! plimni keeps an HAProxy load balancer in sync with the services of a
//! Kubernetes or Nomad cluster.

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod reconcile;
pub mod reload;
pub mod service;
