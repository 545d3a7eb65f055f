//! Port property propagation: real-time flags, data buffering requirements
//! and downstream port states.
//!
//! Upstream real-time (a real-time source somewhere upstream) flows forward
//! from sources. Downstream real-time and the data buffering requirement flow
//! backward from sinks. A property stops at a stopped or suspended subgraph
//! and is handed to the container when it reaches an external port.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::capi::{
    MODULE_ID_RD_SHARED_MEM_CLIENT, MODULE_ID_RD_SHARED_MEM_EP, MODULE_ID_WR_SHARED_MEM_CLIENT,
    MODULE_ID_WR_SHARED_MEM_EP,
};
use crate::error::{SpfError, SpfResult};
use crate::state::TopoState;

use super::graph::Topology;
use super::node::{InPortId, ModuleId, OutPortId};

/// Recursion limit of the property walk.
const PROP_MAX_DEPTH: u32 = 128;

/// A propagated port property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProperty {
    /// A real-time source exists upstream.
    IsUpstreamRt,
    /// A real-time sink exists downstream.
    IsDownstreamRt,
    /// Some downstream module needs whole buffers.
    RequiresDataBuffering,
}

/// Container callbacks reached when a property arrives at an external port.
pub trait TopoToCntr {
    /// A property value reached external output `out`.
    fn set_propagated_prop_on_ext_output(&mut self, out: OutPortId, prop: PortProperty, value: bool) {
        let _ = (out, prop, value);
    }

    /// A property value reached external input `inp`.
    fn set_propagated_prop_on_ext_input(&mut self, inp: InPortId, prop: PortProperty, value: bool) {
        let _ = (inp, prop, value);
    }
}

impl TopoToCntr for () {}

impl Topology {
    /// Propagates `prop` through the whole topology.
    pub fn propagate_port_props(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        prop: PortProperty,
    ) -> SpfResult<()> {
        match prop {
            PortProperty::IsUpstreamRt => self.propagate_us_rt(cntr),
            PortProperty::IsDownstreamRt => self.propagate_ds_rt(cntr),
            PortProperty::RequiresDataBuffering => {
                self.propagate_requires_data_buffering(cntr);
                Ok(())
            }
        }
    }

    // --- upstream real-time, forward ---

    fn propagate_us_rt(&mut self, cntr: &mut dyn TopoToCntr) -> SpfResult<()> {
        let sorted = self.sorted().to_vec();
        for mid in sorted {
            let Some(value) = self.us_rt_seed(mid) else {
                continue;
            };
            let (_, outputs) = self.module_ports(mid);
            for o in outputs {
                self.set_us_rt_on_output(cntr, o, value, 0)?;
            }
        }
        Ok(())
    }

    /// Value a module injects into its outputs, `None` if it does not seed.
    fn us_rt_seed(&self, mid: ModuleId) -> Option<bool> {
        let m = self.module(mid)?;
        let signal_source =
            self.flags.is_signal_triggered && m.is_source() && !m.caps.data_trigger_in_st;
        if m.caps.need_stm_extn || signal_source {
            return Some(true);
        }
        match m.module_id {
            MODULE_ID_WR_SHARED_MEM_EP => {
                let i = *m.inputs.first()?;
                return Some(self.input(i)?.common.flags.is_upstream_rt);
            }
            MODULE_ID_RD_SHARED_MEM_CLIENT => {
                let o = *m.outputs.first()?;
                return Some(self.output(o)?.common.flags.is_upstream_rt);
            }
            _ => {}
        }
        if m.flags.is_ds_at_sg_or_cntr_boundary || m.caps.supports_prop_is_rt {
            return self.us_rt_across(mid);
        }
        None
    }

    /// Whether upstream real-time may cross `mid`, and with which value.
    fn us_rt_across(&self, mid: ModuleId) -> Option<bool> {
        let m = self.module(mid)?;
        if m.caps.supports_prop_is_rt {
            return Some(true);
        }
        if m.caps.need_stm_extn || m.caps.need_mp_buf_extn || m.outputs.is_empty() {
            return None;
        }
        Some(
            m.inputs
                .iter()
                .any(|&i| self.input(i).is_some_and(|p| p.common.flags.is_upstream_rt)),
        )
    }

    fn set_us_rt_on_output(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        o: OutPortId,
        value: bool,
        depth: u32,
    ) -> SpfResult<()> {
        check_depth(depth)?;
        let at_sg_boundary = self.is_output_at_sg_boundary(o);
        let Some(out) = self.output(o) else {
            return Ok(());
        };
        let mid = out.module;
        let (is_ext, conn_in) = (out.is_ext, out.conn_in);
        let Some(m) = self.module(mid) else {
            return Ok(());
        };
        let (supports, data_trigger) = (m.caps.supports_prop_is_rt, m.caps.data_trigger_in_st);
        let own_sg_idle = self.is_module_sg_stopped_or_suspended(mid);
        let peer = conn_in.and_then(|i| self.input(i)).map(|p| p.module);
        let peer_sg_idle = peer.is_some_and(|p| self.is_module_sg_stopped_or_suspended(p));
        let signal_triggered = self.flags.is_signal_triggered;

        let Some(out) = self.output_mut(o) else {
            return Ok(());
        };
        let flags = &mut out.common.flags;
        let mut value = value;
        let mut cont;
        if supports {
            value = flags.is_upstream_rt;
            cont = core::mem::take(&mut flags.port_prop_is_rt_change);
        } else {
            cont = flags.is_upstream_rt != value;
            flags.is_upstream_rt = value;
        }
        if is_ext && signal_triggered && !value && !data_trigger {
            value = true;
            flags.is_upstream_rt = true;
            cont = true;
        }
        if at_sg_boundary {
            if own_sg_idle {
                value = false;
                flags.is_upstream_rt = false;
            }
            cont = !peer_sg_idle;
        }
        if !cont {
            return Ok(());
        }
        if is_ext {
            cntr.set_propagated_prop_on_ext_output(o, PortProperty::IsUpstreamRt, value);
            return Ok(());
        }
        match conn_in {
            Some(i) if !peer_sg_idle => self.set_us_rt_on_input(cntr, i, value, depth + 1),
            _ => Ok(()),
        }
    }

    fn set_us_rt_on_input(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        i: InPortId,
        value: bool,
        depth: u32,
    ) -> SpfResult<()> {
        check_depth(depth)?;
        let Some(inp) = self.input_mut(i) else {
            return Ok(());
        };
        let changed = inp.common.flags.is_upstream_rt != value;
        inp.common.flags.is_upstream_rt = value;
        let (mid, index) = (inp.module, inp.common.index);
        if !changed {
            return Ok(());
        }
        self.notify_capi_is_rt(mid, true, index, value);
        let Some(v) = self.us_rt_across(mid) else {
            return Ok(());
        };
        let (_, outputs) = self.module_ports(mid);
        for o in outputs {
            self.set_us_rt_on_output(cntr, o, v, depth + 1)?;
        }
        Ok(())
    }

    /// Tells a propagation-aware module about a port's new RT flag and stores
    /// its answer on the ports of the other side.
    fn notify_capi_is_rt(&mut self, mid: ModuleId, is_input: bool, index: u32, value: bool) {
        let Some(m) = self.module_mut(mid) else {
            return;
        };
        if !m.caps.supports_prop_is_rt {
            return;
        }
        let Some(answer) = m.capi.as_mut().and_then(|c| c.propagate_is_rt(is_input, index, value))
        else {
            return;
        };
        let (inputs, outputs) = self.module_ports(mid);
        if is_input {
            for o in outputs {
                if let Some(p) = self.output_mut(o) {
                    let f = &mut p.common.flags;
                    if f.is_upstream_rt != answer {
                        f.is_upstream_rt = answer;
                        f.port_prop_is_rt_change = true;
                    }
                }
            }
        } else {
            for i in inputs {
                if let Some(p) = self.input_mut(i) {
                    let f = &mut p.common.flags;
                    if f.is_downstream_rt != answer {
                        f.is_downstream_rt = answer;
                        f.port_prop_is_rt_change = true;
                    }
                }
            }
        }
    }

    // --- downstream real-time, backward ---

    fn propagate_ds_rt(&mut self, cntr: &mut dyn TopoToCntr) -> SpfResult<()> {
        let sorted = self.sorted().to_vec();
        for mid in sorted.into_iter().rev() {
            let Some(value) = self.ds_rt_seed(mid) else {
                continue;
            };
            let (inputs, _) = self.module_ports(mid);
            for i in inputs {
                self.set_ds_rt_on_input(cntr, i, value, 0)?;
            }
        }
        Ok(())
    }

    fn ds_rt_seed(&self, mid: ModuleId) -> Option<bool> {
        let m = self.module(mid)?;
        let signal_sink = self.flags.is_signal_triggered && m.is_sink() && !m.caps.data_trigger_in_st;
        if m.caps.need_stm_extn || signal_sink {
            return Some(true);
        }
        match m.module_id {
            MODULE_ID_RD_SHARED_MEM_EP => {
                let o = *m.outputs.first()?;
                return Some(self.output(o)?.common.flags.is_downstream_rt);
            }
            MODULE_ID_WR_SHARED_MEM_CLIENT => {
                let i = *m.inputs.first()?;
                return Some(self.input(i)?.common.flags.is_downstream_rt);
            }
            _ => {}
        }
        if m.flags.is_us_at_sg_or_cntr_boundary || m.caps.supports_prop_is_rt {
            return self.ds_rt_across(mid);
        }
        None
    }

    fn ds_rt_across(&self, mid: ModuleId) -> Option<bool> {
        let m = self.module(mid)?;
        if m.caps.supports_prop_is_rt {
            return Some(true);
        }
        if m.caps.need_stm_extn || m.caps.need_mp_buf_extn || m.inputs.is_empty() {
            return None;
        }
        Some(
            m.outputs
                .iter()
                .any(|&o| self.output(o).is_some_and(|p| p.common.flags.is_downstream_rt)),
        )
    }

    fn set_ds_rt_on_input(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        i: InPortId,
        value: bool,
        depth: u32,
    ) -> SpfResult<()> {
        check_depth(depth)?;
        let at_sg_boundary = self.is_input_at_sg_boundary(i);
        let Some(inp) = self.input(i) else {
            return Ok(());
        };
        let mid = inp.module;
        let (is_ext, conn_out) = (inp.is_ext, inp.conn_out);
        let Some(m) = self.module(mid) else {
            return Ok(());
        };
        let (supports, data_trigger) = (m.caps.supports_prop_is_rt, m.caps.data_trigger_in_st);
        let own_sg_idle = self.is_module_sg_stopped_or_suspended(mid);
        let peer = conn_out.and_then(|o| self.output(o)).map(|p| p.module);
        let peer_sg_idle = peer.is_some_and(|p| self.is_module_sg_stopped_or_suspended(p));
        let signal_triggered = self.flags.is_signal_triggered;

        let Some(inp) = self.input_mut(i) else {
            return Ok(());
        };
        let flags = &mut inp.common.flags;
        let mut value = value;
        let mut cont;
        if supports {
            value = flags.is_downstream_rt;
            cont = core::mem::take(&mut flags.port_prop_is_rt_change);
        } else {
            cont = flags.is_downstream_rt != value;
            flags.is_downstream_rt = value;
        }
        if is_ext && signal_triggered && !value && !data_trigger {
            value = true;
            flags.is_downstream_rt = true;
            cont = true;
        }
        if at_sg_boundary {
            if own_sg_idle {
                value = false;
                flags.is_downstream_rt = false;
            }
            cont = !peer_sg_idle;
        }
        if !cont {
            return Ok(());
        }
        if is_ext {
            cntr.set_propagated_prop_on_ext_input(i, PortProperty::IsDownstreamRt, value);
            return Ok(());
        }
        match conn_out {
            Some(o) if !peer_sg_idle => self.set_ds_rt_on_output(cntr, o, value, depth + 1),
            _ => Ok(()),
        }
    }

    fn set_ds_rt_on_output(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        o: OutPortId,
        value: bool,
        depth: u32,
    ) -> SpfResult<()> {
        check_depth(depth)?;
        let Some(out) = self.output_mut(o) else {
            return Ok(());
        };
        let changed = out.common.flags.is_downstream_rt != value;
        out.common.flags.is_downstream_rt = value;
        let (mid, index) = (out.module, out.common.index);
        if !changed {
            return Ok(());
        }
        self.notify_capi_is_rt(mid, false, index, value);
        let Some(v) = self.ds_rt_across(mid) else {
            return Ok(());
        };
        let (inputs, _) = self.module_ports(mid);
        for i in inputs {
            self.set_ds_rt_on_input(cntr, i, v, depth + 1)?;
        }
        Ok(())
    }

    // --- data buffering requirement, backward ---

    /// Marks every port upstream of a buffer-requiring module, crossing only
    /// in-place modules.
    pub fn propagate_requires_data_buffering(&mut self, cntr: &mut dyn TopoToCntr) {
        let ids: Vec<InPortId> = self.inputs().map(|p| p.id).collect();
        for i in ids {
            if let Some(p) = self.input_mut(i) {
                p.common.flags.downstream_req_data_buffering = false;
            }
        }
        let ids: Vec<OutPortId> = self.outputs().map(|p| p.id).collect();
        for o in ids {
            if let Some(p) = self.output_mut(o) {
                p.common.flags.downstream_req_data_buffering = false;
            }
        }

        let sorted = self.sorted().to_vec();
        for mid in sorted.into_iter().rev() {
            if !self.module(mid).is_some_and(|m| m.caps.requires_data_buf) {
                continue;
            }
            let (inputs, _) = self.module_ports(mid);
            for i in inputs {
                self.set_req_data_buf_on_input(cntr, i, true, 0);
            }
        }
    }

    fn set_req_data_buf_on_input(
        &mut self,
        cntr: &mut dyn TopoToCntr,
        i: InPortId,
        value: bool,
        depth: u32,
    ) {
        if depth > PROP_MAX_DEPTH {
            return;
        }
        let Some(inp) = self.input_mut(i) else {
            return;
        };
        inp.common.flags.downstream_req_data_buffering = value;
        if inp.is_ext {
            cntr.set_propagated_prop_on_ext_input(i, PortProperty::RequiresDataBuffering, value);
            return;
        }
        let Some(o) = inp.conn_out else {
            return;
        };
        let Some(out) = self.output_mut(o) else {
            return;
        };
        out.common.flags.downstream_req_data_buffering |= value;
        let prev = out.module;
        if !self.module(prev).is_some_and(|m| m.flags.inplace) {
            return;
        }
        let (inputs, _) = self.module_ports(prev);
        for pi in inputs {
            self.set_req_data_buf_on_input(cntr, pi, value, depth + 1);
        }
    }

    // --- port state at subgraph boundaries ---

    /// Propagates the downstream state of stopped or suspended peers backward
    /// so upstream ports stop producing into them.
    ///
    /// Ports receive the downgrade of their own state and the downstream
    /// state, so a port never moves to a higher state through this path.
    pub fn propagate_boundary_modules_port_state(&mut self) {
        let sorted = self.sorted().to_vec();
        for mid in sorted.into_iter().rev() {
            if self.is_module_sg_stopped_or_suspended(mid) {
                continue;
            }
            let Some(m) = self.module(mid) else {
                continue;
            };
            let supports_ds = m.caps.supports_ds_state;
            if !supports_ds
                && (m.caps.need_stm_extn || m.caps.need_mp_buf_extn || m.min_outputs == 0)
            {
                continue;
            }
            let is_sink = m.is_sink();
            let sg_state = self.module_sg_state(mid);
            let (inputs, outputs) = self.module_ports(mid);

            let mut cont = false;
            let mut state = TopoState::Stopped;
            let mut module_answer = None;
            if outputs.is_empty() && !is_sink {
                cont = true;
            } else {
                let (mut started, mut suspended) = (false, false);
                for &o in &outputs {
                    let Some(p) = self.output_mut(o) else { continue };
                    let blocked = p.common.flags.is_state_prop_blocked;
                    if blocked {
                        p.common.state = sg_state;
                    }
                    started |= p.common.state == TopoState::Started;
                    suspended |= p.common.state == TopoState::Suspended;
                    cont |= p.common.flags.is_upstream_rt && !blocked;
                    let (index, st) = (p.common.index, p.common.state);
                    if supports_ds {
                        if let Some(capi) = self.module_mut(mid).and_then(|m| m.capi.as_mut()) {
                            module_answer = capi.propagate_ds_state(index, st).or(module_answer);
                        }
                    }
                }
                state = if started {
                    TopoState::Started
                } else if suspended {
                    TopoState::Suspended
                } else {
                    TopoState::Stopped
                };
            }
            if !cont {
                continue;
            }
            if let Some(s) = module_answer {
                state = s;
            }

            for &i in &inputs {
                let Some(p) = self.input_mut(i) else { continue };
                if !p.common.flags.is_upstream_rt {
                    continue;
                }
                if supports_ds {
                    if p.common.state != state {
                        p.common.state = state;
                        p.common.flags.port_prop_state_change = true;
                    }
                } else {
                    let new = p.common.state.downgrade(state);
                    if new != TopoState::Invalid && new != p.common.state {
                        p.common.state = new;
                    }
                }
                let Some(o) = p.conn_out else { continue };
                self.downgrade_upstream_output(o, state);
            }
        }
    }

    fn downgrade_upstream_output(&mut self, o: OutPortId, state: TopoState) {
        let Some(out) = self.output(o) else {
            return;
        };
        if self.is_module_sg_stopped_or_suspended(out.module) {
            return;
        }
        let f = out.common.flags;
        if !f.is_upstream_rt || f.is_state_prop_blocked {
            return;
        }
        let Some(out) = self.output_mut(o) else {
            return;
        };
        let new = out.common.state.downgrade(state);
        if new != TopoState::Invalid {
            out.common.state = new;
        }
    }
}

fn check_depth(depth: u32) -> SpfResult<()> {
    if depth > PROP_MAX_DEPTH {
        #[cfg(feature = "tracing")]
        tracing::error!(depth, "port_prop: propagation too deep");
        return Err(SpfError::Failed);
    }
    Ok(())
}
