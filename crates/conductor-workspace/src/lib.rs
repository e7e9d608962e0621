//! Per-agent isolated container workspaces.
//!
//! The controller owns every container in the fleet: creation with resource
//! caps and a bind-mounted workspace, command execution, filesystem
//! snapshots, and cleanup. It talks to any Docker-API-compatible runtime
//! (Docker or Podman's compatibility socket).

pub mod controller;
pub mod environments;

pub use controller::{ExecOutput, WorkspaceContainer, WorkspaceController};
