//! Modules, ports and subgraphs of a container topology.
//!
//! All entities live in arenas owned by [`Topology`](super::Topology) and
//! refer to each other through copyable ids. A port id stays valid until its
//! module is destroyed; ids are never reused within one topology.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::capi::CapiModule;
use crate::media_format::MediaFormat;
use crate::state::{DataFlowState, GuStatus, TopoState};

use super::bypass::BypassShim;

/// Arena index of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) u32);

/// Arena index of an input port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InPortId(pub(crate) u32);

/// Arena index of an output port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPortId(pub(crate) u32);

/// Arena index of a control port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtrlPortId(pub(crate) u32);

macro_rules! arena_id {
    ($($name:ident),*) => {$(
        impl $name {
            /// Returns the raw arena index.
            #[inline]
            pub fn index(self) -> u32 {
                self.0
            }

            #[inline]
            pub(crate) fn slot(self) -> usize {
                self.0 as usize
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    )*};
}

arena_id!(ModuleId, InPortId, OutPortId, CtrlPortId);

/// What a port does when its module is triggered by another port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NontriggerPolicy {
    /// Port must be satisfied for the module to run.
    #[default]
    Mandatory,
    /// Port is served if possible but never holds the module back.
    Optional,
    /// Port is ignored entirely.
    Blocked,
}

/// Per-cycle cached trigger evaluation of a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerEval {
    /// Not computed in this cycle.
    #[default]
    NotEvaluated,
    /// Trigger condition holds.
    Present,
    /// Trigger condition does not hold.
    NotPresent,
}

/// Flags common to input and output ports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// A new media format is pending on this port.
    pub media_fmt_event: bool,
    /// `media_fmt` holds a usable format.
    pub is_mf_valid: bool,
    /// The module reported a threshold larger than one byte.
    pub port_has_threshold: bool,
    /// Some module downstream requires buffered data.
    pub downstream_req_data_buffering: bool,
    /// Data reaching this port originates from a real-time source.
    pub is_upstream_rt: bool,
    /// Data leaving this port is consumed by a real-time sink.
    pub is_downstream_rt: bool,
    /// Downstream state must not be propagated across this port.
    pub is_state_prop_blocked: bool,
    /// The module raised an RT property change on this port.
    pub port_prop_is_rt_change: bool,
    /// The module raised a state property change on this port.
    pub port_prop_state_change: bool,
}

/// Data buffer of a port. The vector's length is the filled length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortBuf {
    /// Filled bytes.
    pub data: Vec<u8>,
    /// Capacity the port is allowed to hold.
    pub max_len: u32,
}

impl PortBuf {
    /// Filled length in bytes.
    #[inline]
    pub fn actual_len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Bytes that still fit.
    #[inline]
    pub fn free_len(&self) -> u32 {
        self.max_len.saturating_sub(self.actual_len())
    }

    /// Drops everything buffered.
    pub fn drop_data(&mut self) {
        self.data.clear();
    }
}

/// State shared by both port directions.
#[derive(Clone, Debug, Default)]
pub struct CommonPort {
    /// Port id as assigned by the graph description.
    pub port_id: u32,
    /// Position in the module's port list.
    pub index: u32,
    /// Current media format.
    pub media_fmt: MediaFormat,
    /// Boolean state.
    pub flags: PortFlags,
    /// Bytes per process call, all channels. Zero when unset.
    pub threshold: u32,
    /// Downgraded port state.
    pub state: TopoState,
    /// Steady flow or at a gap.
    pub data_flow: DataFlowState,
    /// Buffered data.
    pub buf: PortBuf,
    /// Metadata items waiting on this port.
    pub metadata_count: u32,
    /// Behavior when the module is triggered elsewhere.
    pub nontrigger_policy: NontriggerPolicy,
    /// Cached trigger evaluation.
    pub trigger_eval: TriggerEval,
}

impl CommonPort {
    /// True when data or metadata is waiting.
    #[inline]
    pub fn has_pending_data(&self) -> bool {
        !self.buf.data.is_empty() || self.metadata_count != 0
    }
}

/// Input port.
#[derive(Debug)]
pub struct InputPort {
    /// Arena id.
    pub id: InPortId,
    /// Owning module.
    pub module: ModuleId,
    /// Peer output inside this container.
    pub conn_out: Option<OutPortId>,
    /// Connected to another container.
    pub is_ext: bool,
    /// Shared port state.
    pub common: CommonPort,
    /// A media format was received at least once.
    pub media_fmt_received: bool,
    /// First input of the non-buffering linear chain this port belongs to.
    pub nblc_start: Option<InPortId>,
    /// Last buffering input of that chain.
    pub nblc_end: Option<InPortId>,
    /// Zeros still to be pushed in, in bytes.
    pub pending_zeros: u32,
    /// A flushing end of stream is waiting here.
    pub flushing_eos: bool,
    /// End of frame marker is waiting here.
    pub pending_eof: bool,
    /// Graph utility status.
    pub gu_status: GuStatus,
}

/// Output port.
#[derive(Debug)]
pub struct OutputPort {
    /// Arena id.
    pub id: OutPortId,
    /// Owning module.
    pub module: ModuleId,
    /// Peer input inside this container.
    pub conn_in: Option<InPortId>,
    /// Connected to another container.
    pub is_ext: bool,
    /// Shared port state.
    pub common: CommonPort,
    /// First output of the non-buffering linear chain this port belongs to.
    pub nblc_start: Option<OutPortId>,
    /// Last output of that chain.
    pub nblc_end: Option<OutPortId>,
    /// A media format is computed but data of the old format is still buffered.
    pub pending_out_media_fmt: bool,
    /// End of frame marker is waiting here.
    pub pending_eof: bool,
    /// A flushing end of stream travels with the buffered data.
    pub flushing_eos: bool,
    /// Graph utility status.
    pub gu_status: GuStatus,
    /// Module attached to this output, fed with its media format.
    pub attached: Option<AttachedModule>,
}

/// Control port. Carries intents between modules, never data.
#[derive(Debug)]
pub struct CtrlPort {
    /// Arena id.
    pub id: CtrlPortId,
    /// Owning module.
    pub module: ModuleId,
    /// Port id as assigned by the graph description.
    pub port_id: u32,
    /// Peer control port inside this container.
    pub peer: Option<CtrlPortId>,
    /// Linked to a module of another container.
    pub is_ext: bool,
    /// Downgraded port state.
    pub state: TopoState,
    /// Graph utility status.
    pub gu_status: GuStatus,
}

/// A module hanging off an output port. It sees the host port's format
/// and runs right after the host module.
pub struct AttachedModule {
    /// Instance id.
    pub instance_id: u32,
    /// Plugin.
    pub capi: Box<dyn CapiModule + Send>,
    /// Last format applied.
    pub media_fmt: MediaFormat,
    /// Port state mirrored from the host output.
    pub state: TopoState,
}

impl core::fmt::Debug for AttachedModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttachedModule")
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Static capabilities of a module, fixed at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ModuleCaps {
    /// May process in place when no port has a threshold.
    pub inplace: bool,
    /// Needs its input buffered across calls.
    pub requires_data_buf: bool,
    /// Manages its own multi-port buffering.
    pub need_mp_buf_extn: bool,
    /// Drives its own trigger policy.
    pub need_trigger_policy_extn: bool,
    /// Signal triggered module (hardware endpoint, timer).
    pub need_stm_extn: bool,
    /// Requires frame sizes scaled to the container frame.
    pub need_sync_extn: bool,
    /// Propagates RT properties itself.
    pub supports_prop_is_rt: bool,
    /// Propagates downstream state itself.
    pub supports_ds_state: bool,
    /// Understands deinterleaved unpacked V2 buffers.
    pub supports_deintlvd_unpacked_v2: bool,
    /// Dynamic-mode module with a fixed output size.
    pub dm_fixed_output: bool,
    /// Accepts global shared-memory messages.
    pub global_shmem: bool,
    /// Switches in-place on and off with its media format.
    pub dynamic_inplace: bool,
    /// Allowed to be data triggered inside a signal-triggered container.
    pub data_trigger_in_st: bool,
}

/// Runtime flags of a module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ModuleFlags {
    /// Effective in-place decision.
    pub inplace: bool,
    /// Module bounds a non-buffering linear chain.
    pub is_nblc_boundary: bool,
    /// The module refused its last input media format.
    pub module_rejected_mf: bool,
    /// Module asked to be skipped.
    pub disabled: bool,
    /// Output is at a subgraph or container boundary.
    pub is_ds_at_sg_or_cntr_boundary: bool,
    /// Input is at a subgraph or container boundary.
    pub is_us_at_sg_or_cntr_boundary: bool,
    /// Inputs changed format during the current propagation.
    pub input_mf_changed: bool,
}

/// Parameters to create a module.
#[derive(Clone, Debug, Default)]
pub struct ModuleSpec {
    /// Instance id, unique in the graph.
    pub instance_id: u32,
    /// Module type id.
    pub module_id: u32,
    /// Process order among modules without a data dependency.
    pub serial_num: u32,
    /// Input port limit. Zero makes the module a source.
    pub max_inputs: u32,
    /// Output port limit. Zero makes the module a sink.
    pub max_outputs: u32,
    /// Outputs the module needs to operate.
    pub min_outputs: u32,
    /// Capabilities.
    pub caps: ModuleCaps,
}

/// A module instance.
pub struct Module {
    /// Arena id.
    pub id: ModuleId,
    /// Instance id.
    pub instance_id: u32,
    /// Module type id.
    pub module_id: u32,
    /// Owning subgraph id.
    pub sg_id: u32,
    /// Deterministic tie-break in the sorted order.
    pub serial_num: u32,
    /// Plugin. `None` for framework modules.
    pub capi: Option<Box<dyn CapiModule + Send>>,
    /// Inputs in index order.
    pub inputs: Vec<InPortId>,
    /// Outputs in index order.
    pub outputs: Vec<OutPortId>,
    /// Control ports.
    pub ctrl_ports: Vec<CtrlPortId>,
    /// Input port limit.
    pub max_inputs: u32,
    /// Output port limit.
    pub max_outputs: u32,
    /// Minimum outputs.
    pub min_outputs: u32,
    /// Capabilities.
    pub caps: ModuleCaps,
    /// Runtime flags.
    pub flags: ModuleFlags,
    /// Set while the module runs as a bypass shim.
    pub bypass: Option<BypassShim>,
    /// Last reported processing load.
    pub kpps: u32,
    /// Last reported bandwidth.
    pub bw: u32,
    /// Samples a fixed-output dynamic-mode module needs per call.
    pub dm_required_samples: u32,
    /// Graph utility status.
    pub gu_status: GuStatus,
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("module_id", &self.module_id)
            .field("sg_id", &self.sg_id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("bypassed", &self.bypass.is_some())
            .finish_non_exhaustive()
    }
}

impl Module {
    /// No input allowed.
    #[inline]
    pub fn is_source(&self) -> bool {
        self.max_inputs == 0
    }

    /// No output allowed.
    #[inline]
    pub fn is_sink(&self) -> bool {
        self.max_outputs == 0
    }

    /// More than one connected input or output.
    #[inline]
    pub fn is_mimo(&self) -> bool {
        self.inputs.len() > 1 || self.outputs.len() > 1
    }

    /// Exactly one input and one output.
    #[inline]
    pub fn is_siso(&self) -> bool {
        self.inputs.len() == 1 && self.outputs.len() == 1
    }

    /// Framework module without a plugin.
    #[inline]
    pub fn is_framework(&self) -> bool {
        self.capi.is_none()
    }
}

/// A subgraph.
#[derive(Clone, Debug, Default)]
pub struct Subgraph {
    /// Subgraph id.
    pub id: u32,
    /// Scenario id.
    pub sid: u32,
    /// Collective state.
    pub state: TopoState,
    /// Graph utility status.
    pub gu_status: GuStatus,
    /// Member modules in creation order.
    pub modules: Vec<ModuleId>,
}
