//! External ports: the container side of links to other containers.
//!
//! The topology only knows a port is external. Everything the container
//! keeps about the link (peer handles, connected states, buffering toward
//! the peer, what was already told to the peer) lives in [`ExtPorts`],
//! keyed by the topology's port ids.

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender};
use spf_config::PortAddr;
use spf_core::capi::{MODULE_ID_RD_SHARED_MEM_EP, MODULE_ID_WR_SHARED_MEM_EP};
use spf_core::{
    CtrlPortId, DownstreamInfo, ExtPortView, GuStatus, IcbBuffering, IcbFlags, InPortId,
    MediaFormat, OutPortId, PortProperty, SgOps, TopoState, TopoToCntr, Topology,
};
use tracing::{debug, info, warn};

use crate::base::CuBase;
use crate::error::{CuError, CuResult};
use crate::event_flags::FwkEvent;
use crate::msg::{DataMsg, PeerHandle};

/// How port properties travel across a link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PropMode {
    /// Not initialized, nothing is sent.
    #[default]
    Disabled,
    /// Ordinary link to a peer container.
    Peer,
    /// Shared memory endpoint talking to a client or a satellite domain.
    Offload,
}

/// What a port tells its peer, and what it already told.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropInfo {
    /// Propagation mode.
    pub mode: PropMode,
    /// Upstream real-time flag. Received on inputs, propagated by the topology on outputs.
    pub is_us_rt: bool,
    /// Downstream real-time flag. Propagated by the topology on inputs, received on outputs.
    pub is_ds_rt: bool,
    /// Last real-time value sent to the peer.
    pub sent_rt: Option<bool>,
    /// Last port state sent upstream (inputs only).
    pub sent_state: Option<TopoState>,
}

impl PropInfo {
    /// True when properties are sent to the peer.
    pub fn is_enabled(&self) -> bool {
        self.mode != PropMode::Disabled
    }
}

/// Container side of an external input.
#[derive(Debug)]
pub struct ExtInPort {
    /// Topology port.
    pub id: InPortId,
    /// Port address.
    pub addr: PortAddr,
    /// Subgraph of the owning module.
    pub sg_id: u32,
    /// Module id of the owning module.
    pub module_id: u32,
    /// State of the upstream peer port.
    pub connected_state: TopoState,
    /// Last state applied by the port-state pass.
    pub downgraded_state: TopoState,
    /// Flags reported upstream with the frame length.
    pub icb_flags: IcbFlags,
    /// Property bookkeeping.
    pub prop: PropInfo,
    /// Upstream frame length and flags were reported at least once.
    pub did_inform_us_of_frame_len: bool,
    /// Upstream peer.
    pub upstream: Option<PeerHandle>,
    /// Data queue from the upstream peer.
    pub data_rx: Option<Receiver<DataMsg>>,
    /// Channel bit of the data queue.
    pub bit: Option<u32>,
    /// Last format received.
    pub media_fmt: MediaFormat,
    /// Graph utility status.
    pub gu_status: GuStatus,
    /// Container specific init ran.
    pub inited: bool,
}

/// Buffering state of an external output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtOutIcb {
    /// What downstream reported.
    pub ds: DownstreamInfo,
    /// Current buffering decision.
    pub buffering: IcbBuffering,
    /// Producer refuses a one-time pre-buffer.
    pub disable_otp: bool,
    /// Buffers must be recreated at the next PREPARE.
    pub recreate_pending: bool,
}

/// Container side of an external output.
#[derive(Debug)]
pub struct ExtOutPort {
    /// Topology port.
    pub id: OutPortId,
    /// Port address.
    pub addr: PortAddr,
    /// Subgraph of the owning module.
    pub sg_id: u32,
    /// Module id of the owning module.
    pub module_id: u32,
    /// State of the downstream peer port as set by graph commands.
    pub connected_state: TopoState,
    /// State the downstream peer propagated back.
    pub propagated_state: TopoState,
    /// Result of the last downstream evaluation.
    pub downgraded_state: TopoState,
    /// Buffering toward the peer.
    pub icb: ExtOutIcb,
    /// Property bookkeeping.
    pub prop: PropInfo,
    /// Downstream peer.
    pub downstream: Option<PeerHandle>,
    /// Data queue into the downstream peer.
    pub data_tx: Option<Sender<DataMsg>>,
    /// Format of the data sent.
    pub media_fmt: MediaFormat,
    /// Format was announced to the peer.
    pub media_fmt_sent: bool,
    /// Frame length changed after the format was announced.
    pub upstream_frame_len_changed: bool,
    /// Bytes delivered so far.
    pub delivered: u64,
    /// Graph utility status.
    pub gu_status: GuStatus,
    /// Container specific init ran.
    pub inited: bool,
}

impl ExtOutPort {
    /// Downstream state: the connected state, downgraded by the propagated
    /// one once the peer propagated something.
    pub fn evaluate_ds_state(&self) -> TopoState {
        if self.propagated_state == TopoState::Invalid {
            self.connected_state
        } else {
            self.connected_state.downgrade(self.propagated_state)
        }
    }
}

/// Container side of an external control port.
#[derive(Debug)]
pub struct ExtCtrlPort {
    /// Topology port.
    pub id: CtrlPortId,
    /// Port address.
    pub addr: PortAddr,
    /// Subgraph of the owning module.
    pub sg_id: u32,
    /// State of the peer port as set by graph commands.
    pub connected_state: TopoState,
    /// Peer port in another container.
    pub peer: Option<PeerHandle>,
    /// Processor domain of the peer, 0 when it is local or unknown.
    pub peer_domain_id: u32,
    /// Incoming control messages are being listened to.
    pub is_polling: bool,
    /// Graph utility status.
    pub gu_status: GuStatus,
    /// Container specific init ran.
    pub inited: bool,
}

/// All external ports of a container.
#[derive(Debug, Default)]
pub struct ExtPorts {
    /// External inputs.
    pub inputs: BTreeMap<InPortId, ExtInPort>,
    /// External outputs.
    pub outputs: BTreeMap<OutPortId, ExtOutPort>,
    /// External control ports.
    pub ctrl: BTreeMap<CtrlPortId, ExtCtrlPort>,
}

impl ExtPorts {
    /// External input at `addr`.
    pub fn input_by_addr(&self, addr: PortAddr) -> Option<InPortId> {
        self.inputs
            .values()
            .find(|p| p.addr == addr)
            .map(|p| p.id)
    }

    /// External output at `addr`.
    pub fn output_by_addr(&self, addr: PortAddr) -> Option<OutPortId> {
        self.outputs
            .values()
            .find(|p| p.addr == addr)
            .map(|p| p.id)
    }

    /// External control port at `addr`.
    pub fn ctrl_by_addr(&self, addr: PortAddr) -> Option<CtrlPortId> {
        self.ctrl.values().find(|p| p.addr == addr).map(|p| p.id)
    }

    /// External input listening on channel `bit`.
    pub fn input_by_bit(&self, bit: u32) -> Option<InPortId> {
        self.inputs
            .values()
            .find(|p| p.bit == Some(bit))
            .map(|p| p.id)
    }

    /// Registers a new external input in `NEW` status.
    pub fn add_input(&mut self, topo: &Topology, id: InPortId) -> CuResult<()> {
        let (addr, sg_id, module_id) = input_identity(topo, id)?;
        self.inputs.insert(
            id,
            ExtInPort {
                id,
                addr,
                sg_id,
                module_id,
                connected_state: TopoState::Stopped,
                downgraded_state: TopoState::Invalid,
                icb_flags: IcbFlags::default(),
                prop: PropInfo::default(),
                did_inform_us_of_frame_len: false,
                upstream: None,
                data_rx: None,
                bit: None,
                media_fmt: MediaFormat::default(),
                gu_status: GuStatus::New,
                inited: false,
            },
        );
        Ok(())
    }

    /// Registers a new external output in `NEW` status.
    pub fn add_output(&mut self, topo: &Topology, id: OutPortId) -> CuResult<()> {
        let (addr, sg_id, module_id) = output_identity(topo, id)?;
        self.outputs.insert(
            id,
            ExtOutPort {
                id,
                addr,
                sg_id,
                module_id,
                connected_state: TopoState::Stopped,
                propagated_state: TopoState::Invalid,
                downgraded_state: TopoState::Invalid,
                icb: ExtOutIcb {
                    buffering: IcbBuffering::fallback(),
                    ..ExtOutIcb::default()
                },
                prop: PropInfo::default(),
                downstream: None,
                data_tx: None,
                media_fmt: MediaFormat::default(),
                media_fmt_sent: false,
                upstream_frame_len_changed: false,
                delivered: 0,
                gu_status: GuStatus::New,
                inited: false,
            },
        );
        Ok(())
    }
}

impl ExtPorts {
    /// Registers a new external control port in `NEW` status.
    pub fn add_ctrl(&mut self, topo: &Topology, id: CtrlPortId) -> CuResult<()> {
        let p = topo.ctrl_port(id).ok_or(spf_core::SpfError::NotFound)?;
        let m = topo.module(p.module).ok_or(spf_core::SpfError::NotFound)?;
        self.ctrl.insert(
            id,
            ExtCtrlPort {
                id,
                addr: PortAddr {
                    module: m.instance_id,
                    port: p.port_id,
                },
                sg_id: m.sg_id,
                connected_state: TopoState::Stopped,
                peer: None,
                peer_domain_id: 0,
                is_polling: false,
                gu_status: GuStatus::New,
                inited: false,
            },
        );
        Ok(())
    }
}

fn input_identity(topo: &Topology, id: InPortId) -> CuResult<(PortAddr, u32, u32)> {
    let p = topo.input(id).ok_or(spf_core::SpfError::NotFound)?;
    let m = topo.module(p.module).ok_or(spf_core::SpfError::NotFound)?;
    Ok((
        PortAddr {
            module: m.instance_id,
            port: p.common.port_id,
        },
        m.sg_id,
        m.module_id,
    ))
}

fn output_identity(topo: &Topology, id: OutPortId) -> CuResult<(PortAddr, u32, u32)> {
    let p = topo.output(id).ok_or(spf_core::SpfError::NotFound)?;
    let m = topo.module(p.module).ok_or(spf_core::SpfError::NotFound)?;
    Ok((
        PortAddr {
            module: m.instance_id,
            port: p.common.port_id,
        },
        m.sg_id,
        m.module_id,
    ))
}

impl TopoToCntr for ExtPorts {
    fn set_propagated_prop_on_ext_output(&mut self, out: OutPortId, prop: PortProperty, value: bool) {
        if let (Some(p), PortProperty::IsUpstreamRt) = (self.outputs.get_mut(&out), prop) {
            p.prop.is_us_rt = value;
        }
    }

    fn set_propagated_prop_on_ext_input(&mut self, inp: InPortId, prop: PortProperty, value: bool) {
        if let (Some(p), PortProperty::IsDownstreamRt) = (self.inputs.get_mut(&inp), prop) {
            p.prop.is_ds_rt = value;
        }
    }
}

impl ExtPortView for ExtPorts {
    fn ext_out_has_buf(&self, out: OutPortId) -> bool {
        self.outputs.get(&out).is_some_and(|p| match &p.data_tx {
            // one queued message per regular buffer
            Some(tx) => (tx.len() as u32) < p.icb.buffering.num_reg_bufs.max(1),
            None => true,
        })
    }

    fn ext_out_is_full(&self, out: OutPortId) -> bool {
        self.outputs.get(&out).is_some_and(|p| {
            p.data_tx
                .as_ref()
                .is_some_and(|tx| tx.len() as u32 >= p.icb.buffering.num_reg_bufs.max(1))
        })
    }
}

// --- graph commands on external ports ---

/// Disconnect check for an external input.
///
/// Fails when the port or its upstream peer is still started. Returns
/// whether there is a peer to drop.
pub fn is_disconnect_ext_in_port_needed(
    cu: &CuBase,
    topo: &Topology,
    id: InPortId,
    sg_in_cmd: bool,
) -> CuResult<bool> {
    let Some(ext) = cu.ext.inputs.get(&id) else {
        return Ok(false);
    };
    let state = topo.input(id).map_or(TopoState::Invalid, |p| p.common.state);
    if ext.connected_state == TopoState::Started || state == TopoState::Started {
        return Err(CuError::DisconnectStarted {
            miid: ext.addr.module,
            port_id: ext.addr.port,
        });
    }
    if ext.upstream.is_some() {
        return Ok(true);
    }
    if !sg_in_cmd {
        info!(
            log_id = cu.log_id,
            miid = ext.addr.module,
            port = ext.addr.port,
            "cu: external input already disconnected"
        );
    }
    Ok(false)
}

/// Disconnect check for an external output. See [`is_disconnect_ext_in_port_needed`].
pub fn is_disconnect_ext_out_port_needed(
    cu: &CuBase,
    topo: &Topology,
    id: OutPortId,
    sg_in_cmd: bool,
) -> CuResult<bool> {
    let Some(ext) = cu.ext.outputs.get(&id) else {
        return Ok(false);
    };
    let state = topo.output(id).map_or(TopoState::Invalid, |p| p.common.state);
    if ext.connected_state == TopoState::Started || state == TopoState::Started {
        return Err(CuError::DisconnectStarted {
            miid: ext.addr.module,
            port_id: ext.addr.port,
        });
    }
    if ext.downstream.is_some() {
        return Ok(true);
    }
    if !sg_in_cmd {
        info!(
            log_id = cu.log_id,
            miid = ext.addr.module,
            port = ext.addr.port,
            "cu: external output already disconnected"
        );
    }
    Ok(false)
}

/// Applies graph operations to one external input.
pub fn operate_on_ext_in_port(
    cu: &mut CuBase,
    topo: &mut Topology,
    id: InPortId,
    ops: SgOps,
    sg_in_cmd: bool,
) -> CuResult<()> {
    if ops.intersects(SgOps::FLUSH | SgOps::STOP) {
        if let Some(p) = topo.input_mut(id) {
            p.common.buf.drop_data();
            p.pending_eof = false;
            p.flushing_eos = false;
        }
        if let Some(rx) = cu.ext.inputs.get(&id).and_then(|p| p.data_rx.as_ref()) {
            let dropped = rx.try_iter().count();
            if dropped != 0 {
                debug!(log_id = cu.log_id, dropped, "cu: flushed external input queue");
            }
        }
        cu.events.set(FwkEvent::PORT_FLUSHED);
    }
    if ops.intersects(SgOps::STOP | SgOps::SUSPEND) {
        if let Some(bit) = cu.ext.inputs.get(&id).and_then(|p| p.bit) {
            cu.stop_listen(bit);
        }
    }
    if ops.intersects(SgOps::DISCONNECT)
        && is_disconnect_ext_in_port_needed(cu, topo, id, sg_in_cmd)?
    {
        let lock = cu.gu_lock();
        let _cs = lock.lock();
        let bit = cu.ext.inputs.get_mut(&id).and_then(|p| {
            p.upstream = None;
            p.data_rx = None;
            p.prop.sent_rt = None;
            p.prop.sent_state = None;
            p.did_inform_us_of_frame_len = false;
            p.bit.take()
        });
        if let Some(bit) = bit {
            cu.release_bit(bit);
        }
    }
    if ops.intersects(SgOps::CLOSE) {
        let lock = cu.gu_lock();
        let _cs = lock.lock();
        if let Some(p) = cu.ext.inputs.get_mut(&id) {
            p.gu_status = GuStatus::Closing;
        }
        if let Some(p) = topo.input_mut(id) {
            p.gu_status = GuStatus::Closing;
        }
    }
    Ok(())
}

/// Applies graph operations to one external output.
pub fn operate_on_ext_out_port(
    cu: &mut CuBase,
    topo: &mut Topology,
    id: OutPortId,
    ops: SgOps,
    sg_in_cmd: bool,
) -> CuResult<()> {
    if ops.intersects(SgOps::FLUSH | SgOps::STOP) {
        if let Some(p) = topo.output_mut(id) {
            p.common.buf.drop_data();
            p.pending_eof = false;
            p.flushing_eos = false;
        }
    }
    if ops.intersects(SgOps::DISCONNECT)
        && is_disconnect_ext_out_port_needed(cu, topo, id, sg_in_cmd)?
    {
        let lock = cu.gu_lock();
        let _cs = lock.lock();
        if let Some(p) = cu.ext.outputs.get_mut(&id) {
            p.downstream = None;
            p.data_tx = None;
            p.prop.sent_rt = None;
            p.media_fmt_sent = false;
            p.icb.ds = DownstreamInfo::default();
        }
    }
    if ops.intersects(SgOps::CLOSE) {
        let lock = cu.gu_lock();
        let _cs = lock.lock();
        if let Some(p) = cu.ext.outputs.get_mut(&id) {
            p.gu_status = GuStatus::Closing;
        }
        if let Some(p) = topo.output_mut(id) {
            p.gu_status = GuStatus::Closing;
        }
    }
    Ok(())
}

/// Disconnect check for an external control port. Returns whether there is
/// a peer to drop.
pub fn is_disconnect_ext_ctrl_port_needed(cu: &CuBase, id: CtrlPortId, sg_in_cmd: bool) -> bool {
    let Some(ext) = cu.ext.ctrl.get(&id) else {
        return false;
    };
    if ext.peer.is_some() || ext.peer_domain_id != 0 {
        return true;
    }
    if !sg_in_cmd {
        info!(
            log_id = cu.log_id,
            miid = ext.addr.module,
            port = ext.addr.port,
            "cu: external control port already disconnected"
        );
    }
    false
}

/// Applies graph operations to one external control port.
///
/// START and PREPARE only matter when the port's own subgraph is in the
/// command. CLOSE coming from the peer's side closes the topology port but
/// leaves the container side to its own subgraph.
pub fn operate_on_ext_ctrl_port(
    cu: &mut CuBase,
    topo: &mut Topology,
    id: CtrlPortId,
    ops: SgOps,
    sg_in_cmd: bool,
) -> CuResult<()> {
    if !sg_in_cmd && ops.intersects(SgOps::START | SgOps::PREPARE) {
        return Ok(());
    }
    let disconnect = ops.intersects(SgOps::DISCONNECT)
        && is_disconnect_ext_ctrl_port_needed(cu, id, sg_in_cmd);

    let lock = cu.gu_lock();
    let _cs = lock.lock();
    let Some(p) = cu.ext.ctrl.get_mut(&id) else {
        return Ok(());
    };
    if ops.intersects(SgOps::STOP | SgOps::SUSPEND) {
        p.is_polling = false;
    } else if sg_in_cmd && ops.intersects(SgOps::START) {
        p.is_polling = true;
    }
    if disconnect {
        p.peer = None;
        p.peer_domain_id = 0;
        debug!(
            log_id = cu.log_id,
            miid = p.addr.module,
            port = p.addr.port,
            "cu: external control port disconnected"
        );
    }
    if ops.intersects(SgOps::CLOSE) {
        if let Some(t) = topo.ctrl_port_mut(id) {
            t.gu_status = GuStatus::Closing;
        }
    }
    if ops == SgOps::CLOSE {
        p.gu_status = GuStatus::Closing;
    }
    Ok(())
}

// --- init / deinit ---

/// Property mode a fresh external port gets.
pub(crate) fn prop_mode_for(module_id: u32) -> PropMode {
    match module_id {
        MODULE_ID_WR_SHARED_MEM_EP | MODULE_ID_RD_SHARED_MEM_EP => PropMode::Offload,
        _ => PropMode::Peer,
    }
}

/// True for ports of shared memory endpoints, whose states follow their own subgraph.
pub(crate) fn is_shmem_ep(module_id: u32) -> bool {
    matches!(
        module_id,
        MODULE_ID_WR_SHARED_MEM_EP | MODULE_ID_RD_SHARED_MEM_EP
    )
}

/// Which external ports a deinit pass acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeinitScope {
    /// Ports marked closing, and ports of closing subgraphs.
    Closing,
    /// Ports marked closing only. Ports of closing subgraphs are left to subgraph teardown.
    ClosingPortsOnly,
    /// Every port.
    All,
}

pub(crate) fn in_port_in_scope(p: &ExtInPort, topo: &Topology, scope: DeinitScope) -> bool {
    match scope {
        DeinitScope::All => true,
        DeinitScope::ClosingPortsOnly => p.gu_status == GuStatus::Closing,
        DeinitScope::Closing => {
            p.gu_status == GuStatus::Closing
                || topo
                    .subgraph(p.sg_id)
                    .is_some_and(|sg| sg.gu_status == GuStatus::Closing)
        }
    }
}

pub(crate) fn out_port_in_scope(p: &ExtOutPort, topo: &Topology, scope: DeinitScope) -> bool {
    match scope {
        DeinitScope::All => true,
        DeinitScope::ClosingPortsOnly => p.gu_status == GuStatus::Closing,
        DeinitScope::Closing => {
            p.gu_status == GuStatus::Closing
                || topo
                    .subgraph(p.sg_id)
                    .is_some_and(|sg| sg.gu_status == GuStatus::Closing)
        }
    }
}

pub(crate) fn ctrl_port_in_scope(p: &ExtCtrlPort, topo: &Topology, scope: DeinitScope) -> bool {
    match scope {
        DeinitScope::All => true,
        DeinitScope::ClosingPortsOnly => p.gu_status == GuStatus::Closing,
        DeinitScope::Closing => {
            p.gu_status == GuStatus::Closing
                || topo
                    .subgraph(p.sg_id)
                    .is_some_and(|sg| sg.gu_status == GuStatus::Closing)
        }
    }
}

pub(crate) fn log_prop_init(log_id: u32, addr: PortAddr, mode: PropMode) {
    match mode {
        PropMode::Offload => debug!(
            log_id,
            miid = addr.module,
            port = addr.port,
            "cu: property propagation through shared memory endpoint"
        ),
        PropMode::Peer => debug!(
            log_id,
            miid = addr.module,
            port = addr.port,
            "cu: property propagation to peer container"
        ),
        PropMode::Disabled => warn!(
            log_id,
            miid = addr.module,
            port = addr.port,
            "cu: property propagation disabled"
        ),
    }
}
