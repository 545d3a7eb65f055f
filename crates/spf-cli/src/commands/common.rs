//! Shared helpers for CLI commands.

use std::path::Path;

use anyhow::Context;
use spf_config::{GraphDescription, PortAddr};
use spf_container::{ContainerHandle, PowerManager, launch_described};
use spf_core::TopoState;

/// Loads a graph description.
pub fn load_graph(path: &Path) -> anyhow::Result<GraphDescription> {
    GraphDescription::load(path)
        .with_context(|| format!("failed to load graph description {}", path.display()))
}

/// Launches the container a description names.
pub fn launch(desc: &GraphDescription, power: Box<dyn PowerManager>) -> anyhow::Result<ContainerHandle> {
    launch_described(desc, power)
        .with_context(|| format!("failed to launch container 0x{:X}", desc.container.id))
}

/// `0x10:2` form of a port address.
pub fn port_label(addr: PortAddr) -> String {
    format!("0x{:X}:{}", addr.module, addr.port)
}

/// Upper case state name.
pub fn state_label(state: TopoState) -> &'static str {
    match state {
        TopoState::Started => "STARTED",
        TopoState::Prepared => "PREPARED",
        TopoState::Stopped => "STOPPED",
        TopoState::Suspended => "SUSPENDED",
        TopoState::Invalid => "INVALID",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_label() {
        assert_eq!(port_label(PortAddr { module: 0x10, port: 2 }), "0x10:2");
    }

    #[test]
    fn test_state_label() {
        assert_eq!(state_label(TopoState::Started), "STARTED");
        assert_eq!(state_label(TopoState::Invalid), "INVALID");
    }
}
