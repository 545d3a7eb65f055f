//! A container: control plane base, topology and variant hooks behind one
//! worker thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use spf_config::PortAddr;
use spf_core::{GuStatus, InPortId, OutPortId, TopoState, Topology};
use tracing::{debug, info, warn};

use crate::base::{ASYNC_BIT, CMD_BIT, CuBase, GP_BIT, MAX_CHANNEL_BITS};
use crate::error::CuResult;
use crate::ext_port::{self, DeinitScope};
use crate::event_flags::FwkEvent;
use crate::msg::{Ack, CntrMsg, ContainerSnapshot, CtrlPortSnapshot, DataMsg, PortSnapshot};
use crate::ops::ContainerOps;
use crate::pm::VoteType;

/// What woke the worker.
#[derive(Debug)]
pub enum Wake {
    /// A command.
    Cmd(CntrMsg),
    /// The asynchronous continuation signal.
    Async,
    /// The general purpose signal.
    Gp,
    /// Data on an external input.
    Data(DataMsg),
    /// The queue behind the bit lost all its senders.
    Closed,
}

/// Handler of one channel bit.
pub type Handler<O> = fn(&mut Container<O>, u32, Wake) -> CuResult<()>;

/// Work left for the next scheduling opportunity.
pub type Continuation<O> = Box<dyn FnOnce(&mut Container<O>) -> CuResult<()> + Send>;

/// Queues owned by the worker.
#[derive(Debug)]
pub(crate) struct Channels {
    pub cmd_tx: Sender<CntrMsg>,
    pub cmd_rx: Receiver<CntrMsg>,
    pub async_tx: Sender<()>,
    pub async_rx: Receiver<()>,
    pub gp_tx: Sender<()>,
    pub gp_rx: Receiver<()>,
}

impl Channels {
    fn new() -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let (async_tx, async_rx) = unbounded();
        let (gp_tx, gp_rx) = unbounded();
        Self {
            cmd_tx,
            cmd_rx,
            async_tx,
            async_rx,
            gp_tx,
            gp_rx,
        }
    }
}

/// One container.
pub struct Container<O: ContainerOps> {
    /// Control plane state.
    pub cu: CuBase,
    /// Graph.
    pub topo: Topology,
    /// Variant hooks.
    pub ops: O,
    pub(crate) chans: Channels,
    pub(crate) handlers: [Option<Handler<O>>; MAX_CHANNEL_BITS as usize],
    pub(crate) handle_rest: Option<Continuation<O>>,
    pub(crate) join_slot: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Ack of a configuration waiting for the worker to be relaunched.
    pub(crate) relaunch_ack: Option<Ack>,
    pub(crate) last_events: FwkEvent,
    pub(crate) exit: bool,
}

impl<O: ContainerOps> std::fmt::Debug for Container<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("variant", &self.ops.name())
            .field("cu", &self.cu)
            .field("modules", &self.topo.module_count())
            .finish_non_exhaustive()
    }
}

impl<O: ContainerOps> Container<O> {
    /// Wraps a base and a topology. External ports already registered in
    /// `cu.ext` with status `NEW` are initialized.
    pub fn new(cu: CuBase, topo: Topology, ops: O) -> CuResult<Self> {
        let mut handlers: [Option<Handler<O>>; MAX_CHANNEL_BITS as usize] =
            [None; MAX_CHANNEL_BITS as usize];
        handlers[CMD_BIT as usize] = Some(Self::handle_cmd_wake);
        handlers[ASYNC_BIT as usize] = Some(Self::handle_async_wake);
        handlers[GP_BIT as usize] = Some(Self::handle_gp_wake);
        let mut c = Self {
            cu,
            topo,
            ops,
            chans: Channels::new(),
            handlers,
            handle_rest: None,
            join_slot: Arc::new(Mutex::new(None)),
            relaunch_ack: None,
            last_events: FwkEvent::NONE,
            exit: false,
        };
        c.cu.pm_register()?;
        c.init_external_ports()?;
        Ok(c)
    }

    /// Splits into the three parts hooks work on.
    pub fn parts(&mut self) -> (&mut CuBase, &mut Topology, &mut O) {
        (&mut self.cu, &mut self.topo, &mut self.ops)
    }

    /// Installs work to run at the next scheduling opportunity.
    pub fn set_handle_rest(&mut self, rest: Continuation<O>) {
        self.handle_rest = Some(rest);
        self.cu.start_listen(ASYNC_BIT);
        // wakes the worker even if it is blocked
        let _ = self.chans.async_tx.send(());
    }

    /// Runs the pending continuation, if any.
    pub fn run_handle_rest(&mut self) -> CuResult<()> {
        self.cu.stop_listen(ASYNC_BIT);
        match self.handle_rest.take() {
            Some(rest) => rest(self),
            None => Ok(()),
        }
    }

    // --- external ports ---

    /// Initializes external ports created since the last call.
    pub fn init_external_ports(&mut self) -> CuResult<()> {
        let (cu, topo, ops) = self.parts();
        let lock = cu.gu_lock();
        let _cs = lock.lock();

        let new_inputs: Vec<InPortId> = cu
            .ext
            .inputs
            .values()
            .filter(|p| p.gu_status == GuStatus::New)
            .map(|p| p.id)
            .collect();
        for id in new_inputs {
            if let Some(p) = cu.ext.inputs.get_mut(&id) {
                p.prop.mode = ext_port::prop_mode_for(p.module_id);
                p.icb_flags.is_real_time = topo.flags.is_signal_triggered;
                ext_port::log_prop_init(cu.log_id, p.addr, p.prop.mode);
            }
            ops.init_ext_in_port(cu, topo, id)?;
            if let Some(p) = cu.ext.inputs.get_mut(&id) {
                p.inited = true;
                p.gu_status = GuStatus::Default;
            }
        }

        let new_outputs: Vec<OutPortId> = cu
            .ext
            .outputs
            .values()
            .filter(|p| p.gu_status == GuStatus::New)
            .map(|p| p.id)
            .collect();
        for id in new_outputs {
            if let Some(p) = cu.ext.outputs.get_mut(&id) {
                p.prop.mode = ext_port::prop_mode_for(p.module_id);
                ext_port::log_prop_init(cu.log_id, p.addr, p.prop.mode);
            }
            ops.init_ext_out_port(cu, topo, id)?;
            if let Some(p) = cu.ext.outputs.get_mut(&id) {
                p.inited = true;
                p.gu_status = GuStatus::Default;
            }
        }

        for p in cu.ext.ctrl.values_mut().filter(|p| p.gu_status == GuStatus::New) {
            p.inited = true;
            p.gu_status = GuStatus::Default;
            debug!(
                log_id = cu.log_id,
                miid = p.addr.module,
                port = p.addr.port,
                "cu: external control port initialized"
            );
        }
        Ok(())
    }

    /// Tears down external ports in `scope`.
    pub fn deinit_external_ports(&mut self, scope: DeinitScope) {
        let Self {
            cu,
            topo,
            ops,
            handlers,
            ..
        } = self;
        let lock = cu.gu_lock();
        let _cs = lock.lock();

        let inputs: Vec<InPortId> = cu
            .ext
            .inputs
            .values()
            .filter(|p| p.inited && ext_port::in_port_in_scope(p, topo, scope))
            .map(|p| p.id)
            .collect();
        for id in inputs {
            ops.deinit_ext_in_port(cu, topo, id);
            let bit = cu.ext.inputs.get_mut(&id).and_then(|p| {
                p.inited = false;
                p.data_rx = None;
                p.upstream = None;
                p.bit.take()
            });
            if let Some(bit) = bit {
                cu.release_bit(bit);
                if let Some(slot) = handlers.get_mut(bit as usize) {
                    *slot = None;
                }
            }
        }

        let outputs: Vec<OutPortId> = cu
            .ext
            .outputs
            .values()
            .filter(|p| p.inited && ext_port::out_port_in_scope(p, topo, scope))
            .map(|p| p.id)
            .collect();
        for id in outputs {
            ops.deinit_ext_out_port(cu, topo, id);
            if let Some(p) = cu.ext.outputs.get_mut(&id) {
                p.inited = false;
                p.data_tx = None;
                p.downstream = None;
            }
        }

        for p in cu
            .ext
            .ctrl
            .values_mut()
            .filter(|p| p.inited && ext_port::ctrl_port_in_scope(p, topo, scope))
        {
            p.inited = false;
            p.is_polling = false;
            p.peer = None;
            p.peer_domain_id = 0;
        }
    }

    /// Removes everything a CLOSE marked as closing.
    pub fn destroy_closing(&mut self) -> CuResult<()> {
        self.deinit_external_ports(DeinitScope::Closing);

        let lock = self.cu.gu_lock();
        let _cs = lock.lock();
        let topo = &self.topo;
        self.cu
            .ext
            .inputs
            .retain(|_, p| !ext_port::in_port_in_scope(p, topo, DeinitScope::Closing));
        self.cu
            .ext
            .outputs
            .retain(|_, p| !ext_port::out_port_in_scope(p, topo, DeinitScope::Closing));
        self.cu
            .ext
            .ctrl
            .retain(|_, p| !ext_port::ctrl_port_in_scope(p, topo, DeinitScope::Closing));

        let closing: Vec<u32> = self
            .topo
            .subgraphs()
            .iter()
            .filter(|sg| sg.gu_status == GuStatus::Closing)
            .map(|sg| sg.id)
            .collect();
        for sg_id in closing {
            info!(log_id = self.cu.log_id, sg_id, "cu: destroying subgraph");
            self.topo.remove_subgraph(sg_id)?;
        }
        self.topo.clear_gu_status();
        Ok(())
    }

    // --- power ---

    /// Re-aggregates the load of started modules and votes it.
    pub fn update_votes(&mut self, force: bool) -> CuResult<()> {
        let (mut kpps, mut bw) = (0u32, 0u32);
        for m in self.topo.modules() {
            if self.topo.sg_state(m.sg_id) == TopoState::Started {
                kpps = kpps.saturating_add(m.kpps);
                bw = bw.saturating_add(m.bw);
            }
        }
        let vote_type = if self.cu.flags.is_cntr_started {
            VoteType::ReqKppsBw
        } else {
            kpps = 0;
            bw = 0;
            VoteType::RelKppsBw
        };
        let is_voice = CuBase::is_voice(&self.topo);
        self.cu
            .handle_clk_vote_change(vote_type, force, kpps, bw, kpps << 4, is_voice)?;
        self.topo.events.kpps_bw_change = false;

        let is_rt = self.cu.is_rt(&self.topo);
        let release = !self.cu.flags.is_cntr_started;
        self.cu.vote_latency(release, is_rt, is_voice)
    }

    // --- queries ---

    /// Address of an input port.
    pub fn input_addr(&self, id: InPortId) -> Option<PortAddr> {
        let p = self.topo.input(id)?;
        let m = self.topo.module(p.module)?;
        Some(PortAddr {
            module: m.instance_id,
            port: p.common.port_id,
        })
    }

    /// Address of an output port.
    pub fn output_addr(&self, id: OutPortId) -> Option<PortAddr> {
        let p = self.topo.output(id)?;
        let m = self.topo.module(p.module)?;
        Some(PortAddr {
            module: m.instance_id,
            port: p.common.port_id,
        })
    }

    /// Point-in-time view. Collects pending real-time monitor packets.
    pub fn snapshot(&mut self) -> ContainerSnapshot {
        let events = self.last_events | self.cu.events.reconcile();
        let inputs = self
            .topo
            .inputs()
            .filter_map(|p| {
                let m = self.topo.module(p.module)?;
                let fmt = &p.common.media_fmt;
                Some(PortSnapshot {
                    addr: PortAddr {
                        module: m.instance_id,
                        port: p.common.port_id,
                    },
                    state: p.common.state,
                    is_ext: p.is_ext,
                    buffered: p.common.buf.actual_len(),
                    sample_rate: fmt.pcm.sample_rate,
                    channels: fmt.pcm.num_channels,
                    is_upstream_rt: p.common.flags.is_upstream_rt,
                    is_downstream_rt: p.common.flags.is_downstream_rt,
                    delivered: 0,
                })
            })
            .collect();
        let outputs = self
            .topo
            .outputs()
            .filter_map(|p| {
                let m = self.topo.module(p.module)?;
                let fmt = &p.common.media_fmt;
                let delivered = self.cu.ext.outputs.get(&p.id).map_or(0, |e| e.delivered);
                Some(PortSnapshot {
                    addr: PortAddr {
                        module: m.instance_id,
                        port: p.common.port_id,
                    },
                    state: p.common.state,
                    is_ext: p.is_ext,
                    buffered: p.common.buf.actual_len(),
                    sample_rate: fmt.pcm.sample_rate,
                    channels: fmt.pcm.num_channels,
                    is_upstream_rt: p.common.flags.is_upstream_rt,
                    is_downstream_rt: p.common.flags.is_downstream_rt,
                    delivered,
                })
            })
            .collect();
        let ctrl_ports = self
            .topo
            .ctrl_ports()
            .filter_map(|p| {
                let m = self.topo.module(p.module)?;
                Some(CtrlPortSnapshot {
                    addr: PortAddr {
                        module: m.instance_id,
                        port: p.port_id,
                    },
                    state: p.state,
                    is_ext: p.is_ext,
                    is_linked: p.peer.is_some()
                        || self.cu.ext.ctrl.get(&p.id).is_some_and(|e| e.peer.is_some()),
                })
            })
            .collect();
        ContainerSnapshot {
            cntr_id: self.cu.cntr_id,
            is_started: self.cu.flags.is_cntr_started,
            subgraphs: self
                .topo
                .subgraphs()
                .iter()
                .map(|sg| (sg.id, sg.state))
                .collect(),
            inputs,
            outputs,
            ctrl_ports,
            ext_out_buffering: self
                .cu
                .ext
                .outputs
                .values()
                .map(|p| (p.addr, p.icb.buffering))
                .collect(),
            frame_len: self.cu.cntr_frame_len,
            period_us: self.cu.period_us,
            proc_duration_us: self.cu.proc_duration_us,
            events,
            curr_chan_mask: self.cu.curr_chan_mask,
            rtm: self.topo.take_rtm_packets(),
        }
    }

    pub(crate) fn set_data_handler(&mut self, bit: u32) {
        if let Some(slot) = self.handlers.get_mut(bit as usize) {
            *slot = Some(Self::handle_data_wake);
            debug!(log_id = self.cu.log_id, bit, "cu: data handler installed");
        }
    }

    pub(crate) fn dispatch(&mut self, bit: u32, wake: Wake) -> CuResult<()> {
        match self.handlers.get(bit as usize).copied().flatten() {
            Some(h) => h(self, bit, wake),
            None => {
                warn!(log_id = self.cu.log_id, bit, "cu: no handler for channel bit");
                self.cu.stop_listen(bit);
                Ok(())
            }
        }
    }
}
