//! Progressive-delivery controllers for k3rs.
//!
//! The Rollout controller drives canary and blue-green releases by managing
//! ReplicaSets and service selectors through a [`client::ClusterClient`].

pub mod client;
pub mod collaborators;
pub mod error;
pub mod patch;
pub mod queue;
pub mod retry;
pub mod rollout;

#[cfg(test)]
mod testing;
