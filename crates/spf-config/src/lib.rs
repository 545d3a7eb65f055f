//! Configuration for the SPF container runtime.
//!
//! Two formats are handled here:
//!
//! - **Container configuration**: the binary property chain a container
//!   receives when it is created ([`ContainerConfig::parse`]).
//! - **Graph descriptions**: TOML files describing a container with its
//!   subgraphs, modules and links ([`GraphDescription`]). Used by tests and
//!   the command line tool.
//!
//! # Example
//!
//! ```rust
//! use spf_config::{CfgWriter, ContainerConfig, FrameSizeCfg, PROP_ID_FRAME_SIZE};
//!
//! let mut w = CfgWriter::new(0x4000);
//! w.prop(PROP_ID_FRAME_SIZE, &[1, 5000]);
//! let cfg = ContainerConfig::parse(&w.finish()).unwrap();
//! assert_eq!(cfg.frame_size, Some(FrameSizeCfg::Time(5000)));
//! ```

mod container_cfg;
mod error;
mod graph;

pub use container_cfg::{
    CONTAINER_TYPE_GC, CONTAINER_TYPE_SC, CfgWriter, ContainerConfig, FrameSizeCfg,
    GRAPH_POS_GLOBAL_DEV, GRAPH_POS_PER_STR_PER_DEV, GRAPH_POS_STR_DEV, GRAPH_POS_STREAM,
    HEAP_DEFAULT, HEAP_LOW_POWER, PROP_ID_CONTAINER_TYPE, PROP_ID_DONT_CARE, PROP_ID_FRAME_SIZE,
    PROP_ID_GRAPH_POS, PROP_ID_HEAP_ID, PROP_ID_PARENT_CONTAINER_ID, PROP_ID_PROC_DOMAIN,
    PROP_ID_STACK_SIZE, PROP_ID_THREAD_CORE_AFFINITY, PROP_ID_THREAD_PRIORITY,
    PROP_ID_THREAD_SCHED_POLICY, assign_if_zero_else_verify,
};
pub use error::ConfigError;
pub use graph::{
    ContainerKind, ContainerSection, CtrlLinkDesc, ExtInputDesc, GraphDescription, HeapKind,
    LinkDesc, ModuleDesc, PcmDesc, PortAddr, SubgraphDesc,
};
