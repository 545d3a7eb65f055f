//! Port state recompute.
//!
//! Runs after every graph command and whenever a peer propagates a state.
//! Pass one downgrades each output against what is downstream of it, sets
//! every input to its own subgraph state and downgrades each control port
//! against its peer. Pass two lets boundary
//! modules carry downstream states backward. Pass three hands the final
//! states to the container variant, changed or not.

use spf_core::{CtrlPortId, InPortId, OutPortId, TopoState, Topology};
use tracing::debug;

use crate::base::CuBase;
use crate::error::CuResult;
use crate::ops::ContainerOps;
use spf_core::capi::{MODULE_ID_RD_SHARED_MEM_EP, MODULE_ID_WR_SHARED_MEM_EP};

/// Recomputes and applies the states of every port.
pub fn update_all_sg_port_states<O: ContainerOps + ?Sized>(
    cu: &mut CuBase,
    topo: &mut Topology,
    ops: &mut O,
) -> CuResult<()> {
    debug!(log_id = cu.log_id, "cu: updating all subgraph port states");
    for sg_id in topo.subgraph_ids() {
        update_sg_port_states(cu, topo, sg_id);
    }
    topo.propagate_boundary_modules_port_state();
    apply_downgraded_port_states(cu, topo, ops)
}

fn update_sg_port_states(cu: &mut CuBase, topo: &mut Topology, sg_id: u32) {
    let self_state = topo.sg_state(sg_id);
    let Some(sg) = topo.subgraph(sg_id) else {
        return;
    };
    for mid in sg.modules.clone() {
        let Some(m) = topo.module(mid) else { continue };
        let (module_id, outputs, inputs) = (m.module_id, m.outputs.clone(), m.inputs.clone());
        let ctrl_ports = m.ctrl_ports.clone();

        for o in outputs {
            let ds = match cu.ext.outputs.get_mut(&o) {
                Some(ext) => {
                    if module_id == MODULE_ID_RD_SHARED_MEM_EP {
                        ext.connected_state = self_state;
                        ext.propagated_state = self_state;
                    }
                    let ds = ext.evaluate_ds_state();
                    ext.downgraded_state = ds;
                    ds
                }
                None => internal_ds_state(topo, o, sg_id, self_state),
            };
            let downgraded = self_state.downgrade(ds);
            if downgraded != TopoState::Invalid {
                if let Some(p) = topo.output_mut(o) {
                    p.common.state = downgraded;
                }
            }
        }

        for i in inputs {
            if module_id == MODULE_ID_WR_SHARED_MEM_EP {
                if let Some(ext) = cu.ext.inputs.get_mut(&i) {
                    ext.connected_state = self_state;
                }
            }
            if let Some(p) = topo.input_mut(i) {
                p.common.state = self_state;
            }
        }

        for c in ctrl_ports {
            let peer_state = match cu.ext.ctrl.get(&c) {
                Some(ext) => ext.connected_state,
                None => internal_ctrl_peer_state(topo, c, sg_id, self_state),
            };
            let downgraded = self_state.downgrade(peer_state);
            if downgraded != TopoState::Invalid {
                if let Some(p) = topo.ctrl_port_mut(c) {
                    p.state = downgraded;
                }
            }
        }
    }
}

/// State of the peer of an internal control port: its subgraph state when
/// the link crosses subgraphs, the own state otherwise.
fn internal_ctrl_peer_state(
    topo: &Topology,
    c: CtrlPortId,
    sg_id: u32,
    self_state: TopoState,
) -> TopoState {
    let peer_sg = topo
        .ctrl_port(c)
        .and_then(|p| p.peer)
        .and_then(|p| topo.ctrl_port(p))
        .and_then(|p| topo.module(p.module))
        .map(|m| m.sg_id);
    match peer_sg {
        Some(id) if id != sg_id => topo.sg_state(id),
        _ => self_state,
    }
}

/// State downstream of an internal output: the peer's subgraph state when
/// the link crosses subgraphs, stopped when the port dangles.
fn internal_ds_state(topo: &Topology, o: OutPortId, sg_id: u32, self_state: TopoState) -> TopoState {
    let Some(peer) = topo.output(o).and_then(|p| p.conn_in) else {
        return TopoState::Stopped;
    };
    let peer_sg = topo
        .input(peer)
        .and_then(|p| topo.module(p.module))
        .map(|m| m.sg_id);
    match peer_sg {
        Some(id) if id != sg_id => topo.sg_state(id),
        Some(_) => self_state,
        None => TopoState::Stopped,
    }
}

fn apply_downgraded_port_states<O: ContainerOps + ?Sized>(
    cu: &mut CuBase,
    topo: &mut Topology,
    ops: &mut O,
) -> CuResult<()> {
    for sg_id in topo.subgraph_ids() {
        // stopped and suspended subgraphs were handled when operated on
        if topo.sg_state(sg_id).is_stopped_or_suspended() {
            continue;
        }
        let Some(sg) = topo.subgraph(sg_id) else {
            continue;
        };
        let modules = sg.modules.clone();

        for &mid in &modules {
            let outputs = topo.module(mid).map(|m| m.outputs.clone()).unwrap_or_default();
            for o in outputs {
                if let Some(p) = topo.output_mut(o) {
                    let state = p.common.state;
                    if let Some(att) = p.attached.as_mut() {
                        att.state = state;
                    }
                }
            }
        }

        for &mid in &modules {
            let Some(m) = topo.module(mid) else { continue };
            let (inputs, outputs): (Vec<InPortId>, Vec<OutPortId>) =
                (m.inputs.clone(), m.outputs.clone());
            for i in inputs {
                let state = topo.input(i).map_or(TopoState::Invalid, |p| p.common.state);
                if let Some(ext) = cu.ext.inputs.get_mut(&i) {
                    ext.downgraded_state = state;
                }
                if state != TopoState::Invalid {
                    ops.apply_downgraded_state_on_input_port(cu, topo, i, state)?;
                }
            }
            for o in outputs {
                let state = topo.output(o).map_or(TopoState::Invalid, |p| p.common.state);
                if state != TopoState::Invalid {
                    ops.apply_downgraded_state_on_output_port(cu, topo, o, state)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::GenericOps;
    use crate::pm::NullPowerManager;
    use spf_core::{ModuleCaps, ModuleSpec};

    fn spec(instance_id: u32, module_id: u32, ins: u32, outs: u32) -> ModuleSpec {
        ModuleSpec {
            instance_id,
            module_id,
            serial_num: 0,
            max_inputs: ins,
            max_outputs: outs,
            min_outputs: outs.min(1),
            caps: ModuleCaps::default(),
        }
    }

    /// sg1: a -> sg2: b, plus an external output on b.
    fn two_sg_chain() -> (CuBase, Topology, OutPortId, InPortId, OutPortId) {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 0).unwrap();
        t.add_subgraph(2, 0).unwrap();
        let a = t.add_module(1, &spec(0x10, 0x0700_2000, 0, 1), None).unwrap();
        let b = t.add_module(2, &spec(0x20, 0x0700_2000, 1, 1), None).unwrap();
        let ao = t.add_output_port(a, 1).unwrap();
        let bi = t.add_input_port(b, 2).unwrap();
        let bo = t.add_output_port(b, 1).unwrap();
        t.connect(ao, bi).unwrap();
        t.set_ext_output(bo).unwrap();
        t.sort().unwrap();
        let mut cu = CuBase::new(0x4000, 1, Box::new(NullPowerManager::default()));
        cu.ext.add_output(&t, bo).unwrap();
        (cu, t, ao, bi, bo)
    }

    // --- cross-subgraph downgrade ---

    #[test]
    fn output_downgrades_to_peer_subgraph() {
        let (mut cu, mut t, ao, bi, _) = two_sg_chain();
        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        t.subgraph_mut(2).unwrap().state = TopoState::Prepared;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.output(ao).unwrap().common.state, TopoState::Prepared);
        assert_eq!(t.input(bi).unwrap().common.state, TopoState::Prepared);
    }

    #[test]
    fn ext_output_downgrades_to_connected_state() {
        let (mut cu, mut t, _, _, bo) = two_sg_chain();
        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        t.subgraph_mut(2).unwrap().state = TopoState::Started;
        cu.ext.outputs.get_mut(&bo).unwrap().connected_state = TopoState::Prepared;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.output(bo).unwrap().common.state, TopoState::Prepared);
        assert_eq!(cu.ext.outputs[&bo].downgraded_state, TopoState::Prepared);

        cu.ext.outputs.get_mut(&bo).unwrap().connected_state = TopoState::Started;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.output(bo).unwrap().common.state, TopoState::Started);
    }

    #[test]
    fn dangling_output_is_stopped() {
        let (mut cu, mut t, ao, bi, _) = two_sg_chain();
        t.disconnect(ao).unwrap();
        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        t.subgraph_mut(2).unwrap().state = TopoState::Started;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.output(ao).unwrap().common.state, TopoState::Stopped);
        assert_eq!(t.input(bi).unwrap().common.state, TopoState::Started);
    }

    #[test]
    fn shmem_endpoint_follows_own_subgraph() {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 0).unwrap();
        let m = t
            .add_module(1, &spec(0x10, MODULE_ID_RD_SHARED_MEM_EP, 0, 1), None)
            .unwrap();
        let o = t.add_output_port(m, 1).unwrap();
        t.set_ext_output(o).unwrap();
        t.sort().unwrap();
        let mut cu = CuBase::new(0x4000, 1, Box::new(NullPowerManager::default()));
        cu.ext.add_output(&t, o).unwrap();
        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(cu.ext.outputs[&o].connected_state, TopoState::Started);
        assert_eq!(t.output(o).unwrap().common.state, TopoState::Started);
    }

    // --- control ports ---

    #[test]
    fn ctrl_ports_downgrade_to_peer() {
        let (mut cu, mut t, ao, bi, _) = two_sg_chain();
        let a = t.output(ao).unwrap().module;
        let b = t.input(bi).unwrap().module;
        let ca = t.add_ctrl_port(a, 5).unwrap();
        let cb = t.add_ctrl_port(b, 5).unwrap();
        let ce = t.add_ctrl_port(b, 6).unwrap();
        t.connect_ctrl(ca, cb).unwrap();
        t.set_ext_ctrl_port(ce).unwrap();
        cu.ext.add_ctrl(&t, ce).unwrap();
        cu.ext.ctrl.get_mut(&ce).unwrap().connected_state = TopoState::Prepared;

        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        t.subgraph_mut(2).unwrap().state = TopoState::Suspended;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.ctrl_port(ca).unwrap().state, TopoState::Suspended);
        assert_eq!(t.ctrl_port(cb).unwrap().state, TopoState::Suspended);
        assert_eq!(t.ctrl_port(ce).unwrap().state, TopoState::Suspended);

        t.subgraph_mut(2).unwrap().state = TopoState::Started;
        update_all_sg_port_states(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(t.ctrl_port(ca).unwrap().state, TopoState::Started);
        assert_eq!(t.ctrl_port(ce).unwrap().state, TopoState::Prepared);
    }
}
