//! Generic topology engine.
//!
//! [`Topology`] owns the modules, ports and subgraphs of one container in
//! arenas addressed by [`ModuleId`], [`InPortId`] and [`OutPortId`]. The
//! algorithms that walk the graph live in their own files as further `impl
//! Topology` blocks:
//!
//! - `media_fmt`: format propagation and the dynamic in-place check
//! - `threshold`: port thresholds and buffer sizes
//! - `nblc`: non-buffering linear chains
//! - `port_prop`: real-time flags, buffering needs, boundary port state
//! - `bypass`: bypass shim
//! - `ctrl_port`: control ports and their links
//! - `scratch`: shared scratch memory

mod bypass;
mod ctrl_port;
mod graph;
mod media_fmt;
mod nblc;
mod node;
mod port_prop;
mod scratch;
pub(crate) mod threshold;

pub use bypass::{BypassShim, memcpy_kpps};
pub use graph::{TopoEvents, TopoFlags, Topology};
pub use nblc::{NBLC_MAX_DEPTH, PortSide};
pub use node::{
    AttachedModule, CommonPort, CtrlPort, CtrlPortId, InPortId, InputPort, Module, ModuleCaps,
    ModuleFlags, ModuleId, ModuleSpec, NontriggerPolicy, OutPortId, OutputPort, PortBuf, PortFlags,
    Subgraph, TriggerEval,
};
pub use port_prop::{PortProperty, TopoToCntr};
pub use scratch::ScratchMem;
pub use threshold::{DEFAULT_PORT_BUF_LEN, frame_bytes_at};
