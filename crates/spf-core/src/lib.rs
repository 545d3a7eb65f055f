//! SPF Core - topology engine of the SPF container runtime
//!
//! This crate holds everything a container needs to reason about its graph
//! without owning a thread: the module/port/subgraph model, the algorithms
//! that walk it, and the small pure calculators used when containers talk to
//! each other.
//!
//! # Graph Model
//!
//! - [`Topology`] - arenas of modules, ports and subgraphs plus the sorted order
//! - [`ModuleId`], [`InPortId`], [`OutPortId`] - arena handles
//! - [`CapiModule`] - the plugin seam every processing module implements
//! - [`TopoState`], [`SgOps`] - port/subgraph states and graph operations
//!
//! # Algorithms
//!
//! - Media format propagation with bypass on rejection
//!   ([`Topology::propagate_media_fmt`])
//! - Port thresholds and in-place decisions ([`Topology::determine_port_thresholds`])
//! - Non-buffering linear chains ([`Topology::assign_non_buf_lin_chains`])
//! - Real-time flag and boundary port-state propagation
//!   ([`Topology::propagate_port_props`], [`Topology::propagate_boundary_modules_port_state`])
//! - Scratch memory sizing ([`Topology::check_n_realloc_scratch_memory`])
//! - Trigger policy for signal-driven containers ([`spl`])
//! - Port media format dumps for the real-time monitor ([`rtm`])
//!
//! # Inter-Container Buffering
//!
//! [`determine_buffering`] decides how many buffers an external output keeps
//! for its downstream peer.
//!
//! # no_std Support
//!
//! The crate is `no_std` with `alloc`. Disable the default `std` feature:
//!
//! ```toml
//! [dependencies]
//! spf-core = { version = "0.1", default-features = false }
//! ```
//!
//! Enable the `tracing` feature to get log output from the algorithms.
//!
//! # Example
//!
//! ```rust
//! use spf_core::{ModuleCaps, ModuleSpec, Topology};
//!
//! let mut topo = Topology::new(0x4000, 1);
//! topo.add_subgraph(1, 1).unwrap();
//! let spec = ModuleSpec {
//!     instance_id: 0x1001,
//!     module_id: 0x0700_2000,
//!     serial_num: 0,
//!     max_inputs: 1,
//!     max_outputs: 1,
//!     min_outputs: 1,
//!     caps: ModuleCaps::default(),
//! };
//! let m = topo.add_module(1, &spec, None).unwrap();
//! topo.add_input_port(m, 2).unwrap();
//! assert_eq!(topo.sorted(), &[m]);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod capi;
pub mod error;
pub mod icb;
pub mod media_format;
pub mod rtm;
pub mod spl;
pub mod state;
pub mod topo;

// Re-export main types at crate root
pub use capi::{CapiModule, GlobalShmem};
pub use error::{SpfError, SpfResult, accumulate};
pub use icb::{
    DownstreamInfo, FrameLength, IcbBuffering, IcbFlags, SID_VOICE_CALL, UpstreamInfo,
    determine_buffering,
};
pub use media_format::{DataFormat, Interleaving, MediaFormat};
pub use rtm::{PortRef, RtmPacket};
pub use spl::{ExtPortView, NoExtPorts, TriggerNeed};
pub use state::{DataFlowState, GuStatus, SgOps, TopoState};
pub use topo::{
    CtrlPortId, InPortId, ModuleCaps, ModuleId, ModuleSpec, OutPortId, PortProperty, TopoToCntr,
    Topology,
};
