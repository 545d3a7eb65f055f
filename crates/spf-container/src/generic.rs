//! Container variants.
//!
//! [`GenericOps`] runs a processing cycle whenever data arrives on an
//! external input. [`SignalOps`] buffers arriving data and runs once per
//! general purpose signal, evaluating every module against the trigger
//! policy so nothing blocks mid cycle.

use spf_core::{
    CtrlPortId, InPortId, ModuleId, OutPortId, SgOps, TopoState, Topology, TriggerNeed,
};
use tracing::debug;

use crate::base::CuBase;
use crate::error::CuResult;
use crate::msg::GraphMgmtCmd;
use crate::ops::ContainerOps;
use crate::process::handle_topo_events;

/// Data driven container.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericOps;

/// Signal triggered container.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalOps;

/// Subgraph handling shared by both variants.
fn operate_on_subgraph<O: ContainerOps + ?Sized>(
    variant: &mut O,
    cu: &mut CuBase,
    topo: &mut Topology,
    sg_id: u32,
    ops: SgOps,
    sg_state: TopoState,
) -> CuResult<()> {
    let ext_ins: Vec<InPortId> = cu
        .ext
        .inputs
        .values()
        .filter(|p| p.sg_id == sg_id)
        .map(|p| p.id)
        .collect();
    let ext_outs: Vec<OutPortId> = cu
        .ext
        .outputs
        .values()
        .filter(|p| p.sg_id == sg_id)
        .map(|p| p.id)
        .collect();
    for i in ext_ins {
        variant.operate_on_ext_in_port(cu, topo, i, ops, true)?;
    }
    for o in ext_outs {
        variant.operate_on_ext_out_port(cu, topo, o, ops, true)?;
    }
    let ext_ctrl: Vec<CtrlPortId> = cu
        .ext
        .ctrl
        .values()
        .filter(|p| p.sg_id == sg_id)
        .map(|p| p.id)
        .collect();
    for c in ext_ctrl {
        variant.operate_on_ext_ctrl_port(cu, topo, c, ops, true)?;
    }

    let modules = topo
        .subgraph(sg_id)
        .map(|sg| sg.modules.clone())
        .unwrap_or_default();
    if ops.intersects(SgOps::STOP | SgOps::FLUSH) {
        for &mid in &modules {
            let Some(m) = topo.module(mid) else { continue };
            let (inputs, outputs) = (m.inputs.clone(), m.outputs.clone());
            for i in inputs {
                if let Some(p) = topo.input_mut(i) {
                    p.common.buf.drop_data();
                    p.flushing_eos = false;
                }
            }
            for o in outputs {
                if let Some(p) = topo.output_mut(o) {
                    p.common.buf.drop_data();
                    p.pending_eof = false;
                    p.flushing_eos = false;
                }
            }
        }
    }

    if let Some(sg) = topo.subgraph_mut(sg_id) {
        if ops.intersects(SgOps::CLOSE) {
            sg.gu_status = spf_core::GuStatus::Closing;
        }
        if sg_state != TopoState::Invalid {
            sg.state = sg_state;
        }
    }
    debug!(
        log_id = cu.log_id,
        sg_id,
        ?sg_state,
        modules = modules.len(),
        "cntr: operated on subgraph"
    );

    if ops.intersects(SgOps::PREPARE) {
        handle_topo_events(cu, topo, variant, false)?;
    }
    Ok(())
}

/// Tells the module owning an input or output about its new state.
fn notify_module(topo: &mut Topology, mid: ModuleId, is_input: bool, index: u32, state: TopoState) {
    if let Some(capi) = topo.module_mut(mid).and_then(|m| m.capi.as_mut()) {
        capi.set_port_state(is_input, index, state);
    }
}

/// An external output the peer has not drained yet while the module feeding
/// it still wants to write. The peer drains without telling us, so the next
/// data arrival is the only point to retry.
fn ext_output_held_back(cu: &CuBase, topo: &Topology) -> bool {
    cu.ext.outputs.keys().any(|&o| {
        topo.ext_out_is_full(o, &cu.ext)
            && topo.out_port_needs_trigger(o, &cu.ext) != TriggerNeed::NotNeeded
    })
}

/// Whether a started external input should be listened on.
fn wants_data(topo: &Topology, id: InPortId, held_back: bool) -> bool {
    held_back || topo.in_port_needs_data(id) != TriggerNeed::NotNeeded
}

/// Listens on external inputs only while the topology waits for data there.
fn refresh_data_listen(cu: &mut CuBase, topo: &Topology) {
    let held_back = ext_output_held_back(cu, topo);
    let bits: Vec<(u32, bool)> = cu
        .ext
        .inputs
        .iter()
        .filter_map(|(&i, p)| {
            let started = topo
                .input(i)
                .is_some_and(|p| p.common.state == TopoState::Started);
            Some((p.bit?, started && wants_data(topo, i, held_back)))
        })
        .collect();
    for (bit, listen) in bits {
        if listen {
            cu.start_listen(bit);
        } else {
            cu.stop_listen(bit);
        }
    }
}

fn apply_input_state(
    cu: &mut CuBase,
    topo: &mut Topology,
    id: InPortId,
    state: TopoState,
    listen_on_data: bool,
) {
    if let Some(bit) = cu.ext.inputs.get(&id).and_then(|p| p.bit) {
        let listen = state == TopoState::Started
            && listen_on_data
            && wants_data(topo, id, ext_output_held_back(cu, topo));
        if listen {
            cu.start_listen(bit);
        } else {
            cu.stop_listen(bit);
        }
    }
    let Some(p) = topo.input(id) else { return };
    let (mid, index) = (p.module, p.common.index);
    notify_module(topo, mid, true, index, state);
}

fn apply_output_state(topo: &mut Topology, id: OutPortId, state: TopoState) {
    let Some(p) = topo.output_mut(id) else { return };
    if state == TopoState::Stopped {
        p.common.buf.drop_data();
    }
    let (mid, index) = (p.module, p.common.index);
    notify_module(topo, mid, false, index, state);
}

impl ContainerOps for GenericOps {
    fn name(&self) -> &'static str {
        "gen_cntr"
    }

    fn operate_on_subgraph(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        sg_id: u32,
        ops: SgOps,
        sg_state: TopoState,
        _cmd: &GraphMgmtCmd,
    ) -> CuResult<()> {
        operate_on_subgraph(self, cu, topo, sg_id, ops, sg_state)
    }

    fn apply_downgraded_state_on_input_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: InPortId,
        state: TopoState,
    ) -> CuResult<()> {
        apply_input_state(cu, topo, id, state, true);
        Ok(())
    }

    fn post_process_cycle(&mut self, cu: &mut CuBase, topo: &mut Topology) {
        refresh_data_listen(cu, topo);
    }

    fn apply_downgraded_state_on_output_port(
        &mut self,
        _cu: &mut CuBase,
        topo: &mut Topology,
        id: OutPortId,
        state: TopoState,
    ) -> CuResult<()> {
        apply_output_state(topo, id, state);
        Ok(())
    }

    /// Every input must hold its trigger and every output must have room.
    fn module_can_run(&mut self, cu: &CuBase, topo: &mut Topology, mid: ModuleId) -> bool {
        let Some(m) = topo.module(mid) else {
            return false;
        };
        let (inputs, outputs) = (m.inputs.clone(), m.outputs.clone());
        inputs.iter().all(|&i| topo.in_port_trigger_eval(i))
            && outputs
                .iter()
                .all(|&o| !topo.out_port_is_trigger_blocked(o, &cu.ext))
    }

    fn process_on_data(&self) -> bool {
        true
    }

    fn process_on_signal(&self) -> bool {
        false
    }
}

impl ContainerOps for SignalOps {
    fn name(&self) -> &'static str {
        "spl_cntr"
    }

    fn operate_on_subgraph(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        sg_id: u32,
        ops: SgOps,
        sg_state: TopoState,
        _cmd: &GraphMgmtCmd,
    ) -> CuResult<()> {
        operate_on_subgraph(self, cu, topo, sg_id, ops, sg_state)
    }

    fn apply_downgraded_state_on_input_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: InPortId,
        state: TopoState,
    ) -> CuResult<()> {
        // input is drained on the signal, never on arrival
        apply_input_state(cu, topo, id, state, false);
        Ok(())
    }

    fn apply_downgraded_state_on_output_port(
        &mut self,
        _cu: &mut CuBase,
        topo: &mut Topology,
        id: OutPortId,
        state: TopoState,
    ) -> CuResult<()> {
        apply_output_state(topo, id, state);
        Ok(())
    }

    /// A module runs when some input holds its trigger (or it is a source)
    /// and no output is blocked. Blocked inputs are skipped, not waited on.
    fn module_can_run(&mut self, cu: &CuBase, topo: &mut Topology, mid: ModuleId) -> bool {
        let Some(m) = topo.module(mid) else {
            return false;
        };
        let (inputs, outputs) = (m.inputs.clone(), m.outputs.clone());
        let has_input = inputs.is_empty()
            || inputs.iter().any(|&i| topo.in_port_trigger_eval(i));
        has_input
            && outputs
                .iter()
                .all(|&o| !topo.out_port_is_trigger_blocked(o, &cu.ext))
    }

    fn process_on_data(&self) -> bool {
        false
    }

    fn process_on_signal(&self) -> bool {
        true
    }
}
