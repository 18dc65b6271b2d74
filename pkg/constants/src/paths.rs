//! Filesystem path constants.

/// Default config file path for the rollouts controller.
pub const DEFAULT_CONTROLLER_CONFIG: &str = "/etc/k3rs/rollouts.yaml";

/// Default data directory for the controller's state store.
pub const DEFAULT_CONTROLLER_DATA_DIR: &str = "/tmp/k3rs-data";
