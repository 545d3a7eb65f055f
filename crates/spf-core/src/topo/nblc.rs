//! Non-buffering linear chains (NBLC).
//!
//! A chain is a run of ports that data crosses without being held. Every
//! port records the first and last port of the chain it belongs to, so the
//! container can size and account buffers once per chain instead of once per
//! link. A chain ends at a module that keeps data: one with several ports,
//! one that buffers through an extension, or a port with a threshold.

use crate::error::{SpfError, SpfResult};

use super::graph::Topology;
use super::node::{InPortId, ModuleId, OutPortId};

/// Recursion limit of the chain walk.
pub const NBLC_MAX_DEPTH: u32 = 50;

impl Topology {
    /// True when data stops at `module` (or at its port `port`).
    pub fn is_port_at_nblc_end(&self, module: ModuleId, port: Option<PortSide>) -> bool {
        let Some(m) = self.module(module) else {
            return true;
        };
        if m.is_mimo() || m.caps.need_mp_buf_extn || m.caps.need_trigger_policy_extn {
            return true;
        }
        let has_threshold = match port {
            Some(PortSide::Input(i)) => self
                .input(i)
                .is_some_and(|p| p.common.flags.port_has_threshold),
            Some(PortSide::Output(o)) => self
                .output(o)
                .is_some_and(|p| p.common.flags.port_has_threshold),
            None => return false,
        };
        m.caps.requires_data_buf || has_threshold
    }

    /// Recomputes the chain start and end of every port.
    pub fn assign_non_buf_lin_chains(&mut self) -> SpfResult<()> {
        let sorted = self.sorted().to_vec();
        for mid in sorted {
            let (inputs, outputs) = self.module_ports(mid);
            let out_boundary =
                outputs.is_empty() || outputs.iter().any(|&o| self.output(o).is_some_and(|p| p.is_ext));
            let in_boundary =
                inputs.is_empty() || inputs.iter().any(|&i| self.input(i).is_some_and(|p| p.is_ext));
            if !out_boundary && !in_boundary {
                continue;
            }
            if let Some(m) = self.module_mut(mid) {
                m.flags.is_nblc_boundary = true;
            }

            if out_boundary {
                for &i in &inputs {
                    if let Some(p) = self.input_mut(i) {
                        p.nblc_end = None;
                    }
                    let end = self
                        .is_port_at_nblc_end(mid, Some(PortSide::Input(i)))
                        .then_some(i);
                    let start = self.assign_input_chain(i, end, None, 0)?;
                    if let Some(p) = self.input_mut(i) {
                        p.nblc_start = start;
                    }
                }
            }
            if in_boundary {
                for &o in &outputs {
                    self.assign_output_chain(o, Some(o), 0)?;
                }
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, "nblc: chains assigned");
        Ok(())
    }

    /// Walks upstream from input `i`, returning the chain start.
    fn assign_input_chain(
        &mut self,
        i: InPortId,
        nblc_end: Option<InPortId>,
        mut start: Option<InPortId>,
        depth: u32,
    ) -> SpfResult<Option<InPortId>> {
        if depth > NBLC_MAX_DEPTH {
            #[cfg(feature = "tracing")]
            tracing::error!(log_id = self.log_id, "nblc: chain walk too deep");
            return Err(SpfError::Failed);
        }
        let Some(conn_out) = self.input(i).and_then(|p| p.conn_out) else {
            if let Some(p) = self.input_mut(i) {
                p.nblc_end = nblc_end;
            }
            return Ok(Some(i));
        };
        let Some(prev) = self.output(conn_out).map(|p| p.module) else {
            return Ok(start);
        };
        let (prev_inputs, _) = self.module_ports(prev);
        for prev_in in prev_inputs {
            if let Some(p) = self.input_mut(i) {
                p.nblc_end = None;
            }
            if self.is_port_at_nblc_end(prev, Some(PortSide::Input(prev_in))) {
                if let Some(m) = self.module_mut(prev) {
                    m.flags.is_nblc_boundary = true;
                }
                if let Some(p) = self.input_mut(i) {
                    p.nblc_end = nblc_end;
                }
                start = Some(i);
                let s = self.assign_input_chain(prev_in, Some(prev_in), None, depth + 1)?;
                if let Some(p) = self.input_mut(prev_in) {
                    p.nblc_start = s;
                    p.nblc_end = Some(prev_in);
                }
            } else {
                start = self.assign_input_chain(prev_in, nblc_end, start, depth + 1)?;
                if let Some(p) = self.input_mut(prev_in) {
                    p.nblc_start = start;
                    p.nblc_end = nblc_end;
                }
            }
        }
        Ok(start)
    }

    /// Walks downstream from output `o` whose chain starts at `start`.
    fn assign_output_chain(
        &mut self,
        o: OutPortId,
        start: Option<OutPortId>,
        depth: u32,
    ) -> SpfResult<()> {
        if depth > NBLC_MAX_DEPTH {
            #[cfg(feature = "tracing")]
            tracing::error!(log_id = self.log_id, "nblc: chain walk too deep");
            return Err(SpfError::Failed);
        }
        let Some(out) = self.output_mut(o) else {
            return Ok(());
        };
        out.nblc_start = start;
        let next_in = if out.is_ext { None } else { out.conn_in };
        let Some(next_in) = next_in else {
            if let Some(s) = start.and_then(|s| self.output_mut(s)) {
                s.nblc_end = Some(o);
            }
            return Ok(());
        };
        let Some(next) = self.input(next_in).map(|p| p.module) else {
            return Ok(());
        };
        let (_, next_outputs) = self.module_ports(next);

        let mut start = start;
        if next_outputs.is_empty() || self.is_port_at_nblc_end(next, Some(PortSide::Input(next_in))) {
            if let Some(m) = self.module_mut(next) {
                m.flags.is_nblc_boundary = true;
            }
            if let Some(s) = start.and_then(|s| self.output_mut(s)) {
                s.nblc_end = Some(o);
            }
            start = None;
        }
        for next_out in next_outputs {
            let s = start.unwrap_or(next_out);
            self.assign_output_chain(next_out, Some(s), depth + 1)?;
            let end = self.output(s).and_then(|p| p.nblc_end);
            if let Some(p) = self.output_mut(next_out) {
                p.nblc_end = end;
            }
        }
        Ok(())
    }
}

/// One port of a module, for queries that accept either side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSide {
    /// An input.
    Input(InPortId),
    /// An output.
    Output(OutPortId),
}
