//! Graph management commands.
//!
//! A command names subgraphs, external data and control ports and, for
//! CLOSE, data and control links.
//! Structural operations run first over the whole batch. Port states are
//! recomputed once afterwards so every port sees a consistent view.

use spf_config::PortAddr;
use spf_core::{CtrlPortId, InPortId, OutPortId, PortProperty, SgOps, TopoState, Topology};
use tracing::{debug, info, warn};

use crate::base::{CuBase, GP_BIT};
use crate::container::Container;
use crate::error::CuResult;
use crate::event_flags::FwkEvent;
use crate::msg::{CtrlLink, DataLink, GraphMgmtCmd};
use crate::ops::ContainerOps;
use crate::peer;
use crate::port_state::update_all_sg_port_states;

/// Subgraph state a set of operations leads to. FLUSH and DISCONNECT do not
/// change the state and map to `Invalid`.
pub fn sg_state_for(ops: SgOps) -> TopoState {
    if ops.intersects(SgOps::CLOSE) {
        TopoState::Stopped
    } else {
        ops.to_port_state()
    }
}

impl<O: ContainerOps> Container<O> {
    /// Runs one graph management command and everything that follows from
    /// it: teardown of closed entities, event handling and power votes.
    pub fn graph_mgmt(&mut self, ops: SgOps, cmd: &GraphMgmtCmd) -> CuResult<()> {
        self.cu.flags.apm_cmd_context = true;
        let result = self.graph_mgmt_inner(ops, cmd);
        self.cu.flags.apm_cmd_context = false;
        result
    }

    fn graph_mgmt_inner(&mut self, ops: SgOps, cmd: &GraphMgmtCmd) -> CuResult<()> {
        let sg_state = sg_state_for(ops);
        info!(
            log_id = self.cu.log_id,
            ops = format_args!("0x{:X}", ops.bits()),
            ?sg_state,
            num_sgs = cmd.sg_ids.len(),
            "cu: graph management command"
        );
        let (cu, topo, o) = self.parts();
        handle_sg_mgmt_cmd(cu, topo, o, ops, sg_state, cmd)?;

        if ops.intersects(SgOps::CLOSE) {
            self.destroy_closing()?;
        }
        if ops.intersects(SgOps::PREPARE | SgOps::START) {
            self.init_external_ports()?;
        }
        self.handle_fwk_events()?;
        Ok(())
    }

    /// Reacts to a flip of the container run state.
    pub(crate) fn handle_run_state_change(&mut self) {
        if !self.topo.flags.is_signal_triggered {
            return;
        }
        if self.cu.flags.is_cntr_started {
            self.cu.start_listen(GP_BIT);
        } else {
            self.cu.stop_listen(GP_BIT);
        }
        debug!(
            log_id = self.cu.log_id,
            started = self.cu.flags.is_cntr_started,
            "cu: signal trigger listen updated"
        );
    }
}

/// Applies `ops` to every entity named by `cmd`.
pub fn handle_sg_mgmt_cmd<O: ContainerOps + ?Sized>(
    cu: &mut CuBase,
    topo: &mut Topology,
    ops: &mut O,
    sg_ops: SgOps,
    sg_state: TopoState,
    cmd: &GraphMgmtCmd,
) -> CuResult<()> {
    let only_ctrl = !cmd.touches_data_ports();

    for &sg_id in &cmd.sg_ids {
        if topo.subgraph(sg_id).is_none() {
            // an earlier open may have failed, the batch must go on
            info!(log_id = cu.log_id, sg_id, "cu: subgraph not found, skipped");
            continue;
        }
        ops.operate_on_subgraph(cu, topo, sg_id, sg_ops, sg_state, cmd)?;
    }

    let port_state = sg_ops.to_port_state();
    let named_inputs = resolve_ext_inputs(cu, &cmd.ext_inputs);
    for &id in &named_inputs {
        let sg_in_cmd = cu.ext.inputs.get(&id).is_some_and(|p| cmd.names_sg(p.sg_id));
        if !sg_in_cmd {
            ops.operate_on_ext_in_port(cu, topo, id, sg_ops, false)?;
        }
        if port_state != TopoState::Invalid {
            if let Some(p) = cu.ext.inputs.get_mut(&id) {
                p.connected_state = port_state;
            }
        }
    }
    let named_outputs = resolve_ext_outputs(cu, &cmd.ext_outputs);
    for &id in &named_outputs {
        let sg_in_cmd = cu.ext.outputs.get(&id).is_some_and(|p| cmd.names_sg(p.sg_id));
        if !sg_in_cmd {
            ops.operate_on_ext_out_port(cu, topo, id, sg_ops, false)?;
        }
        if port_state != TopoState::Invalid {
            if let Some(p) = cu.ext.outputs.get_mut(&id) {
                p.connected_state = port_state;
            }
        }
    }

    for &id in &resolve_ext_ctrl_ports(cu, &cmd.ext_ctrl_ports) {
        let sg_in_cmd = cu.ext.ctrl.get(&id).is_some_and(|p| cmd.names_sg(p.sg_id));
        if !sg_in_cmd {
            ops.operate_on_ext_ctrl_port(cu, topo, id, sg_ops, false)?;
        }
        if port_state != TopoState::Invalid {
            if let Some(p) = cu.ext.ctrl.get_mut(&id) {
                p.connected_state = port_state;
            }
        }
    }

    if sg_ops.intersects(SgOps::CLOSE) {
        for link in &cmd.data_links {
            close_data_link(cu, topo, link)?;
        }
        for link in &cmd.ctrl_links {
            close_ctrl_link(cu, topo, link)?;
        }
    }

    // real-time flags go first so a faster than real-time path never sees a stale stop
    if !only_ctrl
        && sg_ops.intersects(SgOps::PREPARE | SgOps::STOP | SgOps::SUSPEND | SgOps::CLOSE)
    {
        topo.propagate_port_props(&mut cu.ext, PortProperty::IsUpstreamRt)?;
        topo.propagate_port_props(&mut cu.ext, PortProperty::IsDownstreamRt)?;
    }

    if sg_state != TopoState::Invalid {
        update_all_sg_port_states(cu, topo, ops)?;
        peer::inform_downstream_about_us_property(cu, topo);
        peer::inform_upstream_about_ds_property(cu, topo);
    }

    for &id in &named_inputs {
        let sg_in_cmd = cu.ext.inputs.get(&id).is_some_and(|p| cmd.names_sg(p.sg_id));
        if !sg_in_cmd {
            ops.post_operate_on_ext_in_port(cu, topo, id, sg_ops)?;
        }
    }
    for &id in &named_outputs {
        let sg_in_cmd = cu.ext.outputs.get(&id).is_some_and(|p| cmd.names_sg(p.sg_id));
        if !sg_in_cmd {
            ops.post_operate_on_ext_out_port(cu, topo, id, sg_ops)?;
        }
    }
    for &sg_id in &cmd.sg_ids {
        if topo.subgraph(sg_id).is_some() {
            ops.post_operate_on_subgraph(cu, topo, sg_id, sg_ops, sg_state)?;
        }
    }

    if sg_ops.intersects(SgOps::START | SgOps::STOP | SgOps::SUSPEND) {
        cu.events.set(FwkEvent::SG_STATE_CHANGE);
        if cu.refresh_started(topo) {
            cu.events.set(FwkEvent::CNTR_RUN_STATE_CHANGE);
        }
    } else if sg_ops.intersects(SgOps::CLOSE) {
        cu.events.set(FwkEvent::PORT_STATE_CHANGE);
    } else if sg_ops.intersects(SgOps::PREPARE) && !only_ctrl {
        handle_prepare(cu, topo, cmd)?;
    }
    Ok(())
}

fn resolve_ext_inputs(cu: &CuBase, addrs: &[PortAddr]) -> Vec<InPortId> {
    addrs
        .iter()
        .filter_map(|&a| {
            let id = cu.ext.input_by_addr(a);
            if id.is_none() {
                info!(
                    log_id = cu.log_id,
                    miid = a.module,
                    port = a.port,
                    "cu: external input not found, skipped"
                );
            }
            id
        })
        .collect()
}

fn resolve_ext_outputs(cu: &CuBase, addrs: &[PortAddr]) -> Vec<OutPortId> {
    addrs
        .iter()
        .filter_map(|&a| {
            let id = cu.ext.output_by_addr(a);
            if id.is_none() {
                info!(
                    log_id = cu.log_id,
                    miid = a.module,
                    port = a.port,
                    "cu: external output not found, skipped"
                );
            }
            id
        })
        .collect()
}

fn resolve_ext_ctrl_ports(cu: &CuBase, addrs: &[PortAddr]) -> Vec<CtrlPortId> {
    addrs
        .iter()
        .filter_map(|&a| {
            let id = cu.ext.ctrl_by_addr(a);
            if id.is_none() {
                info!(
                    log_id = cu.log_id,
                    miid = a.module,
                    port = a.port,
                    "cu: external control port not found, skipped"
                );
            }
            id
        })
        .collect()
}

/// Forces STOP, DISCONNECT and CLOSE, in that order, on both ends of an
/// internal link. The ports stay with their modules.
fn close_data_link(cu: &CuBase, topo: &mut Topology, link: &DataLink) -> CuResult<()> {
    let out = topo.find_output(link.src.module, link.src.port);
    let inp = topo.find_input(link.dst.module, link.dst.port);
    if out.is_none() && inp.is_none() {
        info!(
            log_id = cu.log_id,
            src = link.src.module,
            dst = link.dst.module,
            "cu: data link not found, skipped"
        );
        return Ok(());
    }
    for op in [SgOps::STOP, SgOps::DISCONNECT, SgOps::CLOSE] {
        if let Some(i) = inp {
            operate_on_int_in_port(topo, i, op);
        }
        if let Some(o) = out {
            operate_on_int_out_port(topo, o, op)?;
        }
    }
    debug!(
        log_id = cu.log_id,
        src = link.src.module,
        dst = link.dst.module,
        "cu: data link closed"
    );
    Ok(())
}

fn operate_on_int_in_port(topo: &mut Topology, i: InPortId, op: SgOps) {
    if op.intersects(SgOps::STOP) {
        if let Some(p) = topo.input_mut(i) {
            p.common.buf.drop_data();
            p.common.state = TopoState::Stopped;
        }
    }
}

fn operate_on_int_out_port(topo: &mut Topology, o: OutPortId, op: SgOps) -> CuResult<()> {
    if op.intersects(SgOps::STOP) {
        if let Some(p) = topo.output_mut(o) {
            p.common.buf.drop_data();
            p.common.state = TopoState::Stopped;
        }
    }
    if op.intersects(SgOps::DISCONNECT) && topo.output(o).is_some_and(|p| p.conn_in.is_some()) {
        topo.disconnect(o)?;
    }
    Ok(())
}

/// Control link counterpart of [`close_data_link`]. Both ends are marked
/// closing and dropped with the next teardown pass.
fn close_ctrl_link(cu: &CuBase, topo: &mut Topology, link: &CtrlLink) -> CuResult<()> {
    let ends = [
        topo.find_ctrl_port(link.peer_1.module, link.peer_1.port),
        topo.find_ctrl_port(link.peer_2.module, link.peer_2.port),
    ];
    if ends.iter().all(Option::is_none) {
        info!(
            log_id = cu.log_id,
            peer_1 = link.peer_1.module,
            peer_2 = link.peer_2.module,
            "cu: control link not found, skipped"
        );
        return Ok(());
    }
    for op in [SgOps::STOP, SgOps::DISCONNECT, SgOps::CLOSE] {
        for c in ends.into_iter().flatten() {
            operate_on_int_ctrl_port(topo, c, op)?;
        }
    }
    debug!(
        log_id = cu.log_id,
        peer_1 = link.peer_1.module,
        peer_2 = link.peer_2.module,
        "cu: control link closed"
    );
    Ok(())
}

fn operate_on_int_ctrl_port(topo: &mut Topology, c: CtrlPortId, op: SgOps) -> CuResult<()> {
    if op.intersects(SgOps::STOP) {
        if let Some(p) = topo.ctrl_port_mut(c) {
            p.state = TopoState::Stopped;
        }
    }
    if op.intersects(SgOps::DISCONNECT) && topo.ctrl_port(c).is_some_and(|p| p.peer.is_some()) {
        topo.disconnect_ctrl(c)?;
    }
    if op.intersects(SgOps::CLOSE) {
        if let Some(p) = topo.ctrl_port_mut(c) {
            p.gu_status = spf_core::GuStatus::Closing;
        }
    }
    Ok(())
}

/// PREPARE hook: external outputs named by the command, or owned by a named
/// subgraph, recompute their buffering toward the peer.
pub fn handle_prepare(cu: &mut CuBase, topo: &Topology, cmd: &GraphMgmtCmd) -> CuResult<()> {
    let targets: Vec<OutPortId> = cu
        .ext
        .outputs
        .values()
        .filter(|p| cmd.names_sg(p.sg_id) || cmd.ext_outputs.contains(&p.addr))
        .filter(|p| p.downstream.is_some())
        .map(|p| p.id)
        .collect();
    for id in targets {
        if let Err(e) = peer::determine_ext_out_buffering(cu, topo, id) {
            warn!(log_id = cu.log_id, error = %e, "cu: buffering determination failed");
            return Err(e);
        }
        if let Some(p) = cu.ext.outputs.get_mut(&id) {
            p.icb.recreate_pending = false;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_container, graph_cmd_all};
    use crate::generic::GenericOps;
    use crate::pm::NullPowerManager;
    use spf_config::GraphDescription;

    const LINKED: &str = r#"
[container]
id = 0x4000
frame_size_us = 1000

[[subgraphs]]
id = 1

[[modules]]
instance_id = 0x10
subgraph = 1
inputs = [2]
outputs = [1]
ctrl_ports = [5, 6]

[[modules]]
instance_id = 0x11
subgraph = 1
inputs = [2]
outputs = [1]
ctrl_ports = [5]

[[links]]
from = { module = 0x10, port = 1 }
to = { module = 0x11, port = 2 }

[[ctrl_links]]
peer_1 = { module = 0x10, port = 5 }
peer_2 = { module = 0x11, port = 5 }

[[external_ctrl_ports]]
module = 0x10
port = 6
"#;

    fn addr(module: u32, port: u32) -> PortAddr {
        PortAddr { module, port }
    }

    fn started() -> (Container<GenericOps>, GraphDescription) {
        let d = GraphDescription::from_toml(LINKED).unwrap();
        let mut c = build_container(&d, Box::new(NullPowerManager::default()), GenericOps).unwrap();
        c.graph_mgmt(SgOps::PREPARE, &graph_cmd_all(&d)).unwrap();
        c.graph_mgmt(SgOps::START, &graph_cmd_all(&d)).unwrap();
        (c, d)
    }

    #[test]
    fn ops_map_to_states() {
        assert_eq!(sg_state_for(SgOps::CLOSE), TopoState::Stopped);
        assert_eq!(sg_state_for(SgOps::PREPARE), TopoState::Prepared);
        assert_eq!(sg_state_for(SgOps::START), TopoState::Started);
        assert_eq!(sg_state_for(SgOps::SUSPEND), TopoState::Suspended);
        assert_eq!(sg_state_for(SgOps::STOP | SgOps::FLUSH), TopoState::Stopped);
        assert_eq!(sg_state_for(SgOps::FLUSH), TopoState::Invalid);
        assert_eq!(sg_state_for(SgOps::DISCONNECT), TopoState::Invalid);
    }

    #[test]
    fn close_data_link_stops_and_unlinks_both_ends() {
        let (mut c, _) = started();
        let out = c.topo.find_output(0x10, 1).unwrap();
        let inp = c.topo.find_input(0x11, 2).unwrap();
        c.topo.output_mut(out).unwrap().common.buf.data = vec![0; 8];
        let cmd = GraphMgmtCmd {
            data_links: vec![DataLink {
                src: addr(0x10, 1),
                dst: addr(0x11, 2),
            }],
            ..GraphMgmtCmd::default()
        };
        c.graph_mgmt(SgOps::CLOSE, &cmd).unwrap();
        let o = c.topo.output(out).unwrap();
        assert!(o.conn_in.is_none());
        assert!(o.common.buf.data.is_empty());
        assert_eq!(o.common.state, TopoState::Stopped);
        assert!(c.topo.input(inp).unwrap().conn_out.is_none());
        assert_eq!(c.topo.sg_state(1), TopoState::Started);
    }

    #[test]
    fn close_ctrl_link_unlinks_both_ends() {
        let (mut c, _) = started();
        let a = c.topo.find_ctrl_port(0x10, 5).unwrap();
        let b = c.topo.find_ctrl_port(0x11, 5).unwrap();
        assert_eq!(c.topo.ctrl_port(a).unwrap().peer, Some(b));
        assert_eq!(c.topo.ctrl_port(a).unwrap().state, TopoState::Started);

        let cmd = GraphMgmtCmd {
            ctrl_links: vec![CtrlLink {
                peer_1: addr(0x10, 5),
                peer_2: addr(0x11, 5),
            }],
            ..GraphMgmtCmd::default()
        };
        assert!(!cmd.touches_data_ports());
        c.graph_mgmt(SgOps::CLOSE, &cmd).unwrap();
        assert!(c.topo.ctrl_port(a).unwrap().peer.is_none());
        assert!(c.topo.ctrl_port(b).unwrap().peer.is_none());
        // the data link is untouched by a control-only command
        let out = c.topo.find_output(0x10, 1).unwrap();
        assert!(c.topo.output(out).unwrap().conn_in.is_some());
        let snap = c.snapshot();
        assert!(!snap.ctrl_port(addr(0x11, 5)).unwrap().is_linked);
    }

    #[test]
    fn unknown_ctrl_link_is_skipped() {
        let (mut c, _) = started();
        let cmd = GraphMgmtCmd {
            ctrl_links: vec![CtrlLink {
                peer_1: addr(0x77, 5),
                peer_2: addr(0x78, 5),
            }],
            ..GraphMgmtCmd::default()
        };
        c.graph_mgmt(SgOps::CLOSE, &cmd).unwrap();
        let a = c.topo.find_ctrl_port(0x10, 5).unwrap();
        assert!(c.topo.ctrl_port(a).unwrap().peer.is_some());
    }

    #[test]
    fn ext_ctrl_port_polls_while_started() {
        let (mut c, d) = started();
        let e = c.cu.ext.ctrl_by_addr(addr(0x10, 6)).unwrap();
        assert!(c.cu.ext.ctrl[&e].inited);
        assert!(c.cu.ext.ctrl[&e].is_polling);
        c.graph_mgmt(SgOps::STOP, &graph_cmd_all(&d)).unwrap();
        assert!(!c.cu.ext.ctrl[&e].is_polling);
        assert_eq!(c.topo.ctrl_port(e).unwrap().state, TopoState::Stopped);
    }

    #[test]
    fn ext_ctrl_port_follows_connected_state() {
        let (mut c, _) = started();
        let e = c.cu.ext.ctrl_by_addr(addr(0x10, 6)).unwrap();
        // only the peer side stops, the own subgraph keeps running
        let cmd = GraphMgmtCmd {
            ext_ctrl_ports: vec![addr(0x10, 6)],
            ..GraphMgmtCmd::default()
        };
        c.graph_mgmt(SgOps::STOP, &cmd).unwrap();
        assert_eq!(c.cu.ext.ctrl[&e].connected_state, TopoState::Stopped);
        assert!(!c.cu.ext.ctrl[&e].is_polling);
        assert_eq!(c.topo.sg_state(1), TopoState::Started);
        assert_eq!(c.topo.ctrl_port(e).unwrap().state, TopoState::Stopped);
    }

    #[test]
    fn ext_ctrl_disconnect_drops_peer_and_close_removes_port() {
        let (mut c, _) = started();
        let e = c.cu.ext.ctrl_by_addr(addr(0x10, 6)).unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        {
            let p = c.cu.ext.ctrl.get_mut(&e).unwrap();
            p.peer = Some(crate::msg::PeerHandle {
                cntr_id: 0x5000,
                tx,
                port: addr(0x20, 6),
            });
            p.peer_domain_id = 2;
        }
        let cmd = GraphMgmtCmd {
            ext_ctrl_ports: vec![addr(0x10, 6)],
            ..GraphMgmtCmd::default()
        };
        c.graph_mgmt(SgOps::STOP | SgOps::DISCONNECT, &cmd).unwrap();
        assert!(c.cu.ext.ctrl[&e].peer.is_none());
        assert_eq!(c.cu.ext.ctrl[&e].peer_domain_id, 0);

        c.graph_mgmt(SgOps::CLOSE, &cmd).unwrap();
        assert!(c.cu.ext.ctrl_by_addr(addr(0x10, 6)).is_none());
    }
}
