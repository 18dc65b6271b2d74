pub mod config;
pub mod event;
pub mod intstr;
pub mod meta;
pub mod pod;
pub mod replicaset;
pub mod rollout;
pub mod service;
pub mod validate;
