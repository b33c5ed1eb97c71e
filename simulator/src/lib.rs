//! Fabricates batch workloads against a Kubernetes control plane.
//!
//! The pieces fit together as follows: a [`manager::Manager`] owns one rate
//! limited producer per resource kind ([`limiter::RateLimiter`]), each driving
//! a kwok-aware executor ([`executors`]) that submits synthetic nodes, pods
//! and jobs built by [`resources`]. A [`reporter::ProgressReporter`] samples
//! the producers' counters while they run.
#![warn(missing_docs)]

pub mod client;
pub mod executors;
pub mod kwok;
pub mod limiter;
pub mod manager;
pub mod rbac;
pub mod remote;
pub mod reporter;
pub mod resources;
pub mod utils;
