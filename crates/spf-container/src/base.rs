//! Container base: the state every container variant shares.

use std::sync::Arc;

use parking_lot::Mutex;
use spf_config::ContainerConfig;
use spf_core::{FrameLength, SID_VOICE_CALL, Topology};
use tracing::debug;

use crate::event_flags::EventFlags;
use crate::ext_port::ExtPorts;
use crate::pm::{PmInfo, PowerManager};
use crate::unique_id::UniqueIdAllocator;

/// Channel bit of the command queue.
pub const CMD_BIT: u32 = 0;
/// Channel bit of the asynchronous continuation signal.
pub const ASYNC_BIT: u32 = 1;
/// Channel bit of the general purpose signal.
pub const GP_BIT: u32 = 2;
/// First channel bit handed out to external input data queues.
pub const FIRST_DATA_BIT: u32 = 3;
/// Number of channel bits.
pub const MAX_CHANNEL_BITS: u32 = 32;

/// Stack size used when the configuration leaves it to the runtime.
pub const DEFAULT_STACK_SIZE: u32 = 256 * 1024;
/// Smallest stack a worker thread is spawned with.
pub const MIN_STACK_SIZE: u32 = 64 * 1024;

/// Flags of the control plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CuFlags {
    /// Any subgraph is started.
    pub is_cntr_started: bool,
    /// Trigger period was set by a parameter and is not derived.
    pub is_period_set_paramed: bool,
    /// Processing duration was set by a parameter and is not derived.
    pub is_proc_dur_set_paramed: bool,
    /// Currently handling a graph manager command. Power votes must not block.
    pub apm_cmd_context: bool,
}

/// Worker thread bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Requested stack size.
    pub stack_size: u32,
    /// Stack size the running thread was spawned with.
    pub actual_stack_size: u32,
    /// Requested stack size of the root thread.
    pub root_stack_size: u32,
    /// Root stack size the running thread was spawned with.
    pub actual_root_stack_size: u32,
    /// Generation of the running thread, 0 before the first launch.
    pub thread_id: u32,
    /// Generation of a thread that must exit on its next wake-up.
    pub thread_id_to_exit: Option<u32>,
    /// Thread name.
    pub name: String,
    /// Thread priority requested by the configuration.
    pub priority: i32,
    /// A worker thread was launched at least once.
    pub launched: bool,
}

impl ThreadInfo {
    /// Stack the worker thread is actually spawned with.
    pub fn spawn_stack_size(&self) -> usize {
        self.stack_size.max(self.root_stack_size).max(MIN_STACK_SIZE) as usize
    }
}

/// State shared by all container variants.
pub struct CuBase {
    /// Container instance id.
    pub cntr_id: u32,
    /// Log id attached to every log line.
    pub log_id: u32,
    /// Last configuration applied.
    pub cfg: ContainerConfig,
    /// External ports.
    pub ext: ExtPorts,
    /// Framework events.
    pub events: EventFlags,
    /// Container frame length.
    pub cntr_frame_len: FrameLength,
    /// Trigger period in microseconds.
    pub period_us: u32,
    /// Processing duration in microseconds.
    pub proc_duration_us: u32,
    /// Control plane flags.
    pub flags: CuFlags,
    /// Last power votes.
    pub pm: PmInfo,
    /// Power manager client.
    pub power: Box<dyn PowerManager>,
    /// Channel bits the worker waits on.
    pub curr_chan_mask: u32,
    /// Channel bits in use.
    pub avail_bits: u32,
    /// Worker thread bookkeeping.
    pub thread: ThreadInfo,
    /// Shared id source.
    pub ids: Arc<UniqueIdAllocator>,
    gu_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for CuBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuBase")
            .field("cntr_id", &self.cntr_id)
            .field("log_id", &self.log_id)
            .field("flags", &self.flags)
            .field("cntr_frame_len", &self.cntr_frame_len)
            .field("period_us", &self.period_us)
            .field("proc_duration_us", &self.proc_duration_us)
            .field("curr_chan_mask", &format_args!("0x{:X}", self.curr_chan_mask))
            .finish_non_exhaustive()
    }
}

impl CuBase {
    /// Creates a base listening on its command queue only.
    pub fn new(cntr_id: u32, log_id: u32, power: Box<dyn PowerManager>) -> Self {
        let fixed = (1 << CMD_BIT) | (1 << ASYNC_BIT) | (1 << GP_BIT);
        Self {
            cntr_id,
            log_id,
            cfg: ContainerConfig {
                container_id: cntr_id,
                ..ContainerConfig::default()
            },
            ext: ExtPorts::default(),
            events: EventFlags::new(),
            cntr_frame_len: FrameLength::default(),
            period_us: 0,
            proc_duration_us: 0,
            flags: CuFlags::default(),
            pm: PmInfo::default(),
            power,
            curr_chan_mask: 1 << CMD_BIT,
            avail_bits: fixed,
            thread: ThreadInfo {
                stack_size: DEFAULT_STACK_SIZE,
                name: format!("spf_cntr_{cntr_id:x}"),
                ..ThreadInfo::default()
            },
            ids: Arc::new(UniqueIdAllocator::new()),
            gu_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Lock guarding structures a peer container may read concurrently.
    ///
    /// Returned as a clone so the caller can hold it while mutating `self`.
    pub fn gu_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.gu_lock)
    }

    /// Reserves the lowest free data channel bit.
    pub fn alloc_bit(&mut self) -> Option<u32> {
        let bit = (FIRST_DATA_BIT..MAX_CHANNEL_BITS).find(|b| self.avail_bits & (1 << b) == 0)?;
        self.avail_bits |= 1 << bit;
        Some(bit)
    }

    /// Returns a data channel bit and stops listening to it.
    pub fn release_bit(&mut self, bit: u32) {
        if bit >= FIRST_DATA_BIT && bit < MAX_CHANNEL_BITS {
            self.avail_bits &= !(1 << bit);
            self.stop_listen(bit);
        }
    }

    /// Adds `bit` to the wait mask.
    pub fn start_listen(&mut self, bit: u32) {
        if bit < MAX_CHANNEL_BITS {
            self.curr_chan_mask |= 1 << bit;
        }
    }

    /// Removes `bit` from the wait mask.
    pub fn stop_listen(&mut self, bit: u32) {
        if bit < MAX_CHANNEL_BITS {
            self.curr_chan_mask &= !(1 << bit);
        }
    }

    /// True if the worker waits on `bit`.
    pub fn is_listening(&self, bit: u32) -> bool {
        bit < MAX_CHANNEL_BITS && self.curr_chan_mask & (1 << bit) != 0
    }

    /// True if any subgraph belongs to a voice call.
    pub fn is_voice(topo: &Topology) -> bool {
        topo.subgraphs().iter().any(|sg| sg.sid == SID_VOICE_CALL)
    }

    /// True if the container runs in real time: signal triggered, or a
    /// real-time flag reached one of its external ports.
    pub fn is_rt(&self, topo: &Topology) -> bool {
        topo.flags.is_signal_triggered
            || self.ext.outputs.values().any(|p| p.prop.is_ds_rt)
            || self.ext.inputs.values().any(|p| p.prop.is_us_rt)
    }

    /// Recomputes the started flag. Returns true when it flipped.
    pub fn refresh_started(&mut self, topo: &Topology) -> bool {
        let started = topo
            .subgraphs()
            .iter()
            .any(|sg| sg.state == spf_core::TopoState::Started);
        let changed = started != self.flags.is_cntr_started;
        if changed {
            debug!(
                log_id = self.log_id,
                started, "cu: container run state changed"
            );
        }
        self.flags.is_cntr_started = started;
        changed
    }
}
