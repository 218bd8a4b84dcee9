//! boombox: an SSH gateway to per-user development pods.
//!
//! Each SSH login is a [`session::Session`] that finds or provisions the
//! user's home volume and pod on Kubernetes, shows setup progress, attaches
//! an interactive shell, and deletes the pod when the last terminal leaves.

pub mod cluster;
pub mod config;
pub mod registry;
pub mod render;
pub mod session;
pub mod shutdown;
pub mod ssh;
pub mod state;
pub mod teardown;
pub mod terminal;
