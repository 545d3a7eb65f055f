//! SPF Container - the container control plane
//!
//! A container owns one [`Topology`](spf_core::Topology) and one worker
//! thread. Everything outside the container talks to it through messages on
//! its command queue; peer containers exchange data over external port links.
//!
//! # Control Plane
//!
//! - [`CuBase`] - state shared by every container variant
//! - [`ContainerOps`] - variant hooks ([`GenericOps`], [`SignalOps`])
//! - [`Container::graph_mgmt`] - PREPARE / START / STOP / SUSPEND / FLUSH /
//!   DISCONNECT / CLOSE on subgraphs, external ports and data links
//! - [`port_state`] - port state recompute after every command
//! - [`peer`] - real-time flags, states and frame lengths exchanged with peers
//! - [`pm`] - clock, bandwidth and latency votes
//!
//! # Runtime
//!
//! - [`launch`] - start the worker, get a [`ContainerHandle`]
//! - [`connect`] - link an external output of one container to an external
//!   input of another
//! - [`builder`] - containers from a TOML [`GraphDescription`](spf_config::GraphDescription)
//!
//! # Example
//!
//! ```rust
//! use spf_config::GraphDescription;
//! use spf_container::{NullPowerManager, SgOps, graph_cmd_all, launch_described};
//!
//! let desc = GraphDescription::from_toml(r#"
//! [container]
//! id = 0x4000
//! frame_size_us = 1000
//!
//! [[subgraphs]]
//! id = 1
//!
//! [[modules]]
//! instance_id = 0x10
//! module_id = 0x07002000
//! subgraph = 1
//! "#).unwrap();
//!
//! let cntr = launch_described(&desc, Box::new(NullPowerManager::default())).unwrap();
//! cntr.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&desc)).unwrap();
//! cntr.graph_mgmt(SgOps::START, graph_cmd_all(&desc)).unwrap();
//! assert!(cntr.snapshot().unwrap().is_started);
//! cntr.destroy().unwrap();
//! ```

pub mod base;
pub mod builder;
mod cmd;
pub mod container;
pub mod error;
pub mod event_flags;
pub mod ext_port;
pub mod frame_len;
pub mod generic;
pub mod msg;
pub mod ops;
pub mod peer;
pub mod pm;
pub mod port_state;
pub mod process;
pub mod sg_mgmt;
pub mod thread;
pub mod unique_id;

pub use base::{CuBase, CuFlags, DEFAULT_STACK_SIZE, ThreadInfo};
pub use builder::{DescribedModule, build_container, build_topology, graph_cmd_all, launch_described};
pub use cmd::{CNTR_PARAM_ID_DATA_PORT_MEDIA_FORMAT, CNTR_PARAM_ID_PROC_DURATION, HOST_PROC_DOMAIN};
pub use container::{Container, Wake};
pub use error::{CuError, CuResult};
pub use event_flags::{EventFlags, FwkEvent};
pub use ext_port::{DeinitScope, ExtCtrlPort, ExtInPort, ExtOutPort, ExtPorts};
pub use generic::{GenericOps, SignalOps};
pub use msg::{
    CntrMsg, ContainerSnapshot, CtrlLink, CtrlPortSnapshot, DataLink, DataMsg, GraphMgmtCmd,
    PeerHandle, PeerProperty, PortSnapshot,
};
pub use ops::ContainerOps;
pub use pm::{NullPowerManager, PmRequest, PowerManager, RecordingPowerManager};
pub use spf_core::{SgOps, TopoState};
pub use thread::{ContainerHandle, connect, connect_ctrl, launch};
pub use unique_id::UniqueIdAllocator;
