//! Centralized constants for the k3rs rollouts controller.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod paths;
pub mod rollout;
pub mod state;
