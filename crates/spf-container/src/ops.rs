//! Container variant hooks.
//!
//! The control plane in this crate is shared by every container. What a
//! variant does differently (how it operates on a subgraph, what applying a
//! port state means for its channels, when a module may run) sits behind
//! [`ContainerOps`]. Hooks receive the base and the topology explicitly so a
//! variant never owns either.

use spf_core::{CtrlPortId, InPortId, ModuleId, OutPortId, SgOps, TopoState, Topology};

use crate::base::CuBase;
use crate::error::CuResult;
use crate::ext_port;
use crate::msg::GraphMgmtCmd;

/// Behavior of one container variant.
pub trait ContainerOps: Send + 'static {
    /// Short variant name used in logs and thread names.
    fn name(&self) -> &'static str;

    /// Applies graph operations to a subgraph named by a command.
    fn operate_on_subgraph(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        sg_id: u32,
        ops: SgOps,
        sg_state: TopoState,
        cmd: &GraphMgmtCmd,
    ) -> CuResult<()>;

    /// Applies graph operations to an external input named by a command
    /// whose subgraph is not part of the command.
    fn operate_on_ext_in_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: InPortId,
        ops: SgOps,
        sg_in_cmd: bool,
    ) -> CuResult<()> {
        ext_port::operate_on_ext_in_port(cu, topo, id, ops, sg_in_cmd)
    }

    /// Same as [`ContainerOps::operate_on_ext_in_port`] for outputs.
    fn operate_on_ext_out_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: OutPortId,
        ops: SgOps,
        sg_in_cmd: bool,
    ) -> CuResult<()> {
        ext_port::operate_on_ext_out_port(cu, topo, id, ops, sg_in_cmd)
    }

    /// Same as [`ContainerOps::operate_on_ext_in_port`] for control ports.
    fn operate_on_ext_ctrl_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: CtrlPortId,
        ops: SgOps,
        sg_in_cmd: bool,
    ) -> CuResult<()> {
        ext_port::operate_on_ext_ctrl_port(cu, topo, id, ops, sg_in_cmd)
    }

    /// Runs after port states were recomputed, once per named subgraph.
    fn post_operate_on_subgraph(
        &mut self,
        _cu: &mut CuBase,
        _topo: &mut Topology,
        _sg_id: u32,
        _ops: SgOps,
        _sg_state: TopoState,
    ) -> CuResult<()> {
        Ok(())
    }

    /// Runs after port states were recomputed, once per named external input.
    fn post_operate_on_ext_in_port(
        &mut self,
        _cu: &mut CuBase,
        _topo: &mut Topology,
        _id: InPortId,
        _ops: SgOps,
    ) -> CuResult<()> {
        Ok(())
    }

    /// Runs after port states were recomputed, once per named external output.
    fn post_operate_on_ext_out_port(
        &mut self,
        _cu: &mut CuBase,
        _topo: &mut Topology,
        _id: OutPortId,
        _ops: SgOps,
    ) -> CuResult<()> {
        Ok(())
    }

    /// Applies the final state of an input port. Called on every port of every
    /// running subgraph after each state recompute, changed or not.
    fn apply_downgraded_state_on_input_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: InPortId,
        state: TopoState,
    ) -> CuResult<()>;

    /// Output counterpart of [`ContainerOps::apply_downgraded_state_on_input_port`].
    fn apply_downgraded_state_on_output_port(
        &mut self,
        cu: &mut CuBase,
        topo: &mut Topology,
        id: OutPortId,
        state: TopoState,
    ) -> CuResult<()>;

    /// Variant specific init of a new external input.
    fn init_ext_in_port(&mut self, _cu: &mut CuBase, _topo: &mut Topology, _id: InPortId) -> CuResult<()> {
        Ok(())
    }

    /// Variant specific init of a new external output.
    fn init_ext_out_port(
        &mut self,
        _cu: &mut CuBase,
        _topo: &mut Topology,
        _id: OutPortId,
    ) -> CuResult<()> {
        Ok(())
    }

    /// Variant specific teardown of an external input.
    fn deinit_ext_in_port(&mut self, _cu: &mut CuBase, _topo: &mut Topology, _id: InPortId) {}

    /// Variant specific teardown of an external output.
    fn deinit_ext_out_port(&mut self, _cu: &mut CuBase, _topo: &mut Topology, _id: OutPortId) {}

    /// The processing duration changed.
    fn handle_proc_duration_change(&mut self, cu: &mut CuBase, topo: &mut Topology) -> CuResult<()> {
        let (is_rt, is_voice) = (cu.is_rt(topo), CuBase::is_voice(topo));
        cu.vote_latency(false, is_rt, is_voice)
    }

    /// Port thresholds were recomputed.
    fn port_data_thresh_change(&mut self, _cu: &mut CuBase, _topo: &mut Topology) -> CuResult<()> {
        Ok(())
    }

    /// Runs at the end of every processing cycle.
    fn post_process_cycle(&mut self, _cu: &mut CuBase, _topo: &mut Topology) {}

    /// True when `mid` may run in the current processing cycle.
    fn module_can_run(&mut self, cu: &CuBase, topo: &mut Topology, mid: ModuleId) -> bool;

    /// Run a processing cycle each time data arrives on an external input.
    fn process_on_data(&self) -> bool;

    /// Run a processing cycle on the general purpose signal.
    fn process_on_signal(&self) -> bool;
}
