//! Command queue handling.
//!
//! Every command is acknowledged, failures included. The only deferred ack
//! belongs to a container configuration that needs a new worker thread: it
//! is sent once the relaunched worker picks up.

use spf_config::{ContainerConfig, assign_if_zero_else_verify};
use spf_core::{GlobalShmem, ModuleId, SpfError, SpfResult};
use tracing::{debug, info, warn};

use crate::base::DEFAULT_STACK_SIZE;
use crate::container::{Container, Wake};
use crate::error::CuResult;
use crate::event_flags::FwkEvent;
use crate::ext_port::DeinitScope;
use crate::msg::{Ack, CntrMsg};
use crate::ops::ContainerOps;
use crate::peer;
use crate::port_state::update_all_sg_port_states;
use crate::process::handle_topo_events;

/// Fixes the processing duration. Payload `{proc_duration_us, safety_margin_us}`.
pub const CNTR_PARAM_ID_PROC_DURATION: u32 = 0x0800_1B00;
/// Enables the full port media format dump. Payload `{enable}`.
pub const CNTR_PARAM_ID_DATA_PORT_MEDIA_FORMAT: u32 = 0x0800_1B01;
/// Processor domain containers of this runtime live in.
pub const HOST_PROC_DOMAIN: u32 = 2;

fn ack_with(ack: &Ack, log_id: u32, what: &str, result: CuResult<()>) {
    if let Err(e) = &result {
        warn!(log_id, error = %e, code = e.code(), "cu: {what} failed");
    }
    // the requester may have given up waiting
    let _ = ack.send(result.map_err(|e| e.to_spf()));
}

fn read_u32(payload: &[u8], word: usize) -> Option<u32> {
    let b = payload.get(word * 4..word * 4 + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl<O: ContainerOps> Container<O> {
    pub(crate) fn handle_cmd_wake(&mut self, _bit: u32, wake: Wake) -> CuResult<()> {
        match wake {
            Wake::Cmd(msg) => self.handle_msg(msg),
            Wake::Closed => {
                info!(log_id = self.cu.log_id, "cu: command queue closed, exiting");
                self.exit = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// Handles one command queue message.
    pub fn handle_msg(&mut self, msg: CntrMsg) {
        let log_id = self.cu.log_id;
        match msg {
            CntrMsg::GraphMgmt { ops, cmd, ack } => {
                let r = self.graph_mgmt(ops, &cmd);
                ack_with(&ack, log_id, "graph management", r);
            }
            CntrMsg::SetCntrParam {
                param_id,
                payload,
                ack,
            } => {
                let r = self.set_cntr_param(param_id, &payload);
                ack_with(&ack, log_id, "set container param", r);
            }
            CntrMsg::SetCfg {
                miid,
                param_id,
                payload,
                ack,
            } => {
                let r = self.set_module_cfg(miid, param_id, &payload);
                ack_with(&ack, log_id, "set cfg", r);
            }
            CntrMsg::GetCfg {
                miid,
                param_id,
                ack,
            } => {
                let r = self.get_module_cfg(miid, param_id);
                if let Err(e) = &r {
                    warn!(log_id, miid, param_id, error = %e, "cu: get cfg failed");
                }
                let _ = ack.send(r);
            }
            CntrMsg::ContainerCfg { payload, ack } => match self.container_cfg(&payload) {
                Ok(true) => self.relaunch_ack = Some(ack),
                Ok(false) => ack_with(&ack, log_id, "container cfg", Ok(())),
                Err(e) => ack_with(&ack, log_id, "container cfg", Err(e)),
            },
            CntrMsg::ConnectExtOut {
                port,
                peer,
                data_tx,
                ack,
            } => {
                let r = self.connect_ext_out(port, peer, data_tx);
                ack_with(&ack, log_id, "connect external output", r);
            }
            CntrMsg::ConnectExtIn {
                port,
                peer,
                data_rx,
                ack,
            } => {
                let r = self.connect_ext_in(port, peer, data_rx);
                ack_with(&ack, log_id, "connect external input", r);
            }
            CntrMsg::ConnectExtCtrl {
                port,
                peer,
                peer_domain_id,
                ack,
            } => {
                let r = self.connect_ext_ctrl(port, peer, peer_domain_id);
                ack_with(&ack, log_id, "connect external control port", r);
            }
            CntrMsg::IcbInfoFromDownstream { port, info } => {
                if let Err(e) = peer::icb_info_from_downstream(&mut self.cu, &self.topo, port, info) {
                    warn!(log_id, miid = port.module, error = %e, "icb: downstream info dropped");
                }
            }
            CntrMsg::PeerProperty { port, prop } => {
                if let Err(e) = self.peer_property(port, prop) {
                    warn!(log_id, miid = port.module, error = %e, "cu: peer property failed");
                }
            }
            CntrMsg::GlobalShmem { dst, payload, ack } => match GlobalShmem::decode(&payload) {
                Ok(msg) => {
                    let r = self.global_shmem(dst, &msg);
                    if msg.is_ack_not_required() {
                        if let Err(e) = r {
                            warn!(log_id, dst, error = %e, "cu: global shmem failed");
                        }
                    } else {
                        ack_with(&ack, log_id, "global shmem", r);
                    }
                }
                Err(e) => ack_with(&ack, log_id, "global shmem", Err(e.into())),
            },
            CntrMsg::Snapshot { ack } => {
                let _ = ack.send(self.snapshot());
            }
            CntrMsg::Destroy { ack } => {
                let r = self.destroy();
                ack_with(&ack, log_id, "destroy", r);
            }
        }
    }

    /// Handles the events raised since the last call, in dependency order.
    pub(crate) fn handle_fwk_events(&mut self) -> CuResult<()> {
        let (cu, topo, ops) = self.parts();
        handle_topo_events(cu, topo, ops, false)?;

        let mut ev = self.cu.events.take();
        let vote_events = FwkEvent::SG_STATE_CHANGE
            | FwkEvent::CNTR_RUN_STATE_CHANGE
            | FwkEvent::KPPS_BW_SCALE_FACTOR_CHANGE
            | FwkEvent::RT_FTRT_CHANGE;
        if ev.intersects(vote_events) || self.topo.events.kpps_bw_change {
            self.update_votes(false)?;
        }
        // voting may have moved the proc duration
        ev |= self.cu.events.take();

        if ev.intersects(FwkEvent::PROC_DUR_CHANGE) {
            let (cu, topo, ops) = self.parts();
            ops.handle_proc_duration_change(cu, topo)?;
        }
        if ev.intersects(FwkEvent::CNTR_RUN_STATE_CHANGE) {
            self.handle_run_state_change();
        }
        if !ev.is_empty() {
            debug!(
                log_id = self.cu.log_id,
                events = format_args!("0x{:X}", ev.bits()),
                "cu: framework events handled"
            );
        }
        self.last_events = ev;
        Ok(())
    }

    fn set_cntr_param(&mut self, param_id: u32, payload: &[u8]) -> CuResult<()> {
        match param_id {
            CNTR_PARAM_ID_PROC_DURATION => {
                let (Some(dur), Some(margin)) = (read_u32(payload, 0), read_u32(payload, 1)) else {
                    return Err(SpfError::Failed.into());
                };
                if dur == 0 {
                    return Err(SpfError::Failed.into());
                }
                self.cu.flags.is_proc_dur_set_paramed = true;
                if dur != self.cu.proc_duration_us {
                    self.cu.proc_duration_us = dur;
                    self.cu.events.set(FwkEvent::PROC_DUR_CHANGE);
                }
                info!(
                    log_id = self.cu.log_id,
                    proc_duration_us = dur,
                    safety_margin_us = margin,
                    "cu: proc duration set"
                );
                self.handle_fwk_events()
            }
            CNTR_PARAM_ID_DATA_PORT_MEDIA_FORMAT => {
                let Some(enable) = read_u32(payload, 0) else {
                    return Err(SpfError::BadParam.into());
                };
                self.topo.rtm_dump_data_port_mf_for_all_ports(enable != 0);
                Ok(())
            }
            _ => {
                warn!(
                    log_id = self.cu.log_id,
                    param_id = format_args!("0x{param_id:08X}"),
                    "cu: unknown container param"
                );
                Err(SpfError::Unexpected.into())
            }
        }
    }

    fn set_module_cfg(&mut self, miid: u32, param_id: u32, payload: &[u8]) -> CuResult<()> {
        let mid = self.topo.module_by_instance(miid).ok_or(SpfError::Failed)?;
        let capi = self
            .topo
            .module_mut(mid)
            .and_then(|m| m.capi.as_mut())
            .ok_or(SpfError::Unsupported)?;
        capi.set_param(param_id, payload)?;
        // a parameter may change load or format
        self.topo.events.kpps_bw_change = true;
        self.handle_fwk_events()
    }

    fn get_module_cfg(&mut self, miid: u32, param_id: u32) -> SpfResult<Vec<u8>> {
        let mid = self.topo.module_by_instance(miid).ok_or(SpfError::Failed)?;
        let capi = self
            .topo
            .module_mut(mid)
            .and_then(|m| m.capi.as_mut())
            .ok_or(SpfError::Unsupported)?;
        let mut out = Vec::new();
        capi.get_param(param_id, &mut out)?;
        Ok(out)
    }

    /// Applies a container configuration payload.
    ///
    /// Returns true when the worker has to be relaunched for a new stack size
    /// before the configuration can be acknowledged.
    fn container_cfg(&mut self, payload: &[u8]) -> CuResult<bool> {
        let new = ContainerConfig::parse(payload)?;
        new.verify_proc_domain(HOST_PROC_DOMAIN)?;
        let cfg = &mut self.cu.cfg;
        assign_if_zero_else_verify("container_id", &mut cfg.container_id, new.container_id)?;
        let mut pos = cfg.graph_pos.unwrap_or(0);
        assign_if_zero_else_verify("graph_pos", &mut pos, new.graph_pos.unwrap_or(0))?;
        cfg.graph_pos = (pos != 0).then_some(pos);

        let frame_changed = new.frame_size.is_some() && new.frame_size != cfg.frame_size;
        if new.frame_size.is_some() {
            cfg.frame_size = new.frame_size;
        }
        cfg.container_type = new.container_type.or(cfg.container_type);
        cfg.proc_domain = new.proc_domain.or(cfg.proc_domain);
        cfg.heap_id = new.heap_id.or(cfg.heap_id);
        cfg.parent_container_id = new.parent_container_id.or(cfg.parent_container_id);
        cfg.sched_policy = new.sched_policy.or(cfg.sched_policy);
        cfg.core_affinity = new.core_affinity.or(cfg.core_affinity);
        if let Some(p) = new.thread_priority {
            cfg.thread_priority = Some(p);
            self.cu.thread.priority = p;
        }
        if let Some(s) = new.stack_size {
            cfg.stack_size = Some(s);
            self.cu.thread.stack_size = if s == 0 { DEFAULT_STACK_SIZE } else { s };
        }

        if frame_changed {
            info!(
                log_id = self.cu.log_id,
                frame_size = ?self.cu.cfg.frame_size,
                "cu: configured frame size changed"
            );
            let (cu, topo, ops) = self.parts();
            handle_topo_events(cu, topo, ops, false)?;
            self.handle_fwk_events()?;
        }

        let t = &self.cu.thread;
        let relaunch = t.launched
            && (t.stack_size != t.actual_stack_size || t.root_stack_size != t.actual_root_stack_size);
        if relaunch {
            info!(
                log_id = self.cu.log_id,
                stack_size = t.stack_size,
                actual = t.actual_stack_size,
                "cu: stack size changed, relaunching worker"
            );
        }
        Ok(relaunch)
    }

    fn connect_ext_out(
        &mut self,
        port: spf_config::PortAddr,
        peer: Option<crate::msg::PeerHandle>,
        data_tx: crossbeam_channel::Sender<crate::msg::DataMsg>,
    ) -> CuResult<()> {
        let id = self.cu.ext.output_by_addr(port).ok_or(SpfError::NotFound)?;
        let lock = self.cu.gu_lock();
        let _cs = lock.lock();
        let p = self.cu.ext.outputs.get_mut(&id).ok_or(SpfError::NotFound)?;
        p.downstream = peer;
        p.data_tx = Some(data_tx);
        p.media_fmt_sent = false;
        info!(
            log_id = self.cu.log_id,
            miid = port.module,
            port = port.port,
            peer = p.downstream.as_ref().map(|d| d.cntr_id),
            "cu: external output connected"
        );
        Ok(())
    }

    fn connect_ext_ctrl(
        &mut self,
        port: spf_config::PortAddr,
        peer: crate::msg::PeerHandle,
        peer_domain_id: u32,
    ) -> CuResult<()> {
        let id = self.cu.ext.ctrl_by_addr(port).ok_or(SpfError::NotFound)?;
        let is_started = self
            .topo
            .ctrl_port(id)
            .is_some_and(|p| p.state == spf_core::TopoState::Started);
        let lock = self.cu.gu_lock();
        let _cs = lock.lock();
        let p = self.cu.ext.ctrl.get_mut(&id).ok_or(SpfError::NotFound)?;
        info!(
            log_id = self.cu.log_id,
            miid = port.module,
            port = port.port,
            peer = peer.cntr_id,
            "cu: external control port connected"
        );
        p.peer = Some(peer);
        p.peer_domain_id = peer_domain_id;
        p.is_polling = is_started;
        Ok(())
    }

    fn connect_ext_in(
        &mut self,
        port: spf_config::PortAddr,
        peer: Option<crate::msg::PeerHandle>,
        data_rx: crossbeam_channel::Receiver<crate::msg::DataMsg>,
    ) -> CuResult<()> {
        let id = self.cu.ext.input_by_addr(port).ok_or(SpfError::NotFound)?;
        let old_bit = self.cu.ext.inputs.get(&id).and_then(|p| p.bit);
        let bit = match old_bit {
            Some(b) => b,
            None => self.cu.alloc_bit().ok_or(SpfError::NoMemory)?,
        };
        self.set_data_handler(bit);
        let is_started = self
            .topo
            .input(id)
            .is_some_and(|i| i.common.state == spf_core::TopoState::Started);
        {
            let lock = self.cu.gu_lock();
            let _cs = lock.lock();
            let p = self.cu.ext.inputs.get_mut(&id).ok_or(SpfError::NotFound)?;
            p.upstream = peer;
            p.data_rx = Some(data_rx);
            p.bit = Some(bit);
            p.did_inform_us_of_frame_len = false;
        }
        if is_started && self.ops.process_on_data() {
            self.cu.start_listen(bit);
        }
        info!(log_id = self.cu.log_id, miid = port.module, port = port.port, bit, "cu: external input connected");
        if !self.cu.cntr_frame_len.is_zero() {
            self.cu.inform_upstreams_of_frame_len(&self.topo, false);
        }
        Ok(())
    }

    fn peer_property(
        &mut self,
        port: spf_config::PortAddr,
        prop: crate::msg::PeerProperty,
    ) -> CuResult<()> {
        let (cu, topo, ops) = self.parts();
        let follow = peer::process_peer_property(cu, topo, port, prop)?;
        if follow.update_states {
            update_all_sg_port_states(cu, topo, ops)?;
        }
        if follow.inform_ds {
            peer::inform_downstream_about_us_property(cu, topo);
        }
        if follow.inform_us {
            peer::inform_upstream_about_ds_property(cu, topo);
        }
        self.handle_fwk_events()
    }

    /// Routes a global shared memory message to the module it names.
    fn global_shmem(&mut self, dst: u32, msg: &GlobalShmem) -> CuResult<()> {
        if dst == self.cu.cntr_id {
            return Err(SpfError::Unsupported.into());
        }
        let mid = self.topo.module_by_instance(dst).ok_or(SpfError::NotFound)?;
        let m = self.topo.module_mut(mid).ok_or(SpfError::NotFound)?;
        if !m.caps.global_shmem {
            return Err(SpfError::Unsupported.into());
        }
        let capi = m.capi.as_mut().ok_or(SpfError::Unsupported)?;
        capi.handle_global_shmem(msg)?;
        debug!(
            log_id = self.cu.log_id,
            miid = dst,
            shmem_id = msg.shmem_id,
            release = msg.is_release(),
            "cu: global shmem delivered"
        );
        Ok(())
    }

    fn destroy(&mut self) -> CuResult<()> {
        info!(log_id = self.cu.log_id, "cu: destroying container");
        self.deinit_external_ports(DeinitScope::All);
        self.cu.flags.is_cntr_started = false;
        let r = self.update_votes(true);
        let ids: Vec<ModuleId> = self.topo.modules().map(|m| m.id).collect();
        for mid in ids {
            if let Some(capi) = self.topo.module_mut(mid).and_then(|m| m.capi.as_mut()) {
                capi.end();
            }
        }
        self.exit = true;
        r
    }
}
