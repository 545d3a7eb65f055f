#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::state::{DataFlowState, TopoState};
use crate::topo::threshold::frame_bytes_at;
use crate::topo::{InPortId, NontriggerPolicy, OutPortId, OutputPort, Topology, TriggerEval};

/// Container-side view of external output buffers.
pub trait ExtPortView {
    /// The external output currently holds a buffer to write into.
    fn ext_out_has_buf(&self, out: OutPortId) -> bool;

    /// The downstream peer holds as many undelivered buffers as it was sized for.
    fn ext_out_is_full(&self, out: OutPortId) -> bool;
}

/// View for topologies evaluated without a container.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoExtPorts;

impl ExtPortView for NoExtPorts {
    fn ext_out_has_buf(&self, _out: OutPortId) -> bool {
        true
    }

    fn ext_out_is_full(&self, _out: OutPortId) -> bool {
        false
    }
}

/// Whether the container should listen for a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerNeed {
    /// Port is satisfied or blocked.
    NotNeeded,
    /// Module cannot run without it.
    Needed,
    /// Serving it helps, but the module may run without it.
    NeededOptionally,
}

/// A threshold of zero accepts any non-empty length.
#[inline]
pub fn length_meets_threshold(len: u32, threshold: u32) -> bool {
    if threshold == 0 {
        len != 0
    } else {
        len >= threshold
    }
}

impl Topology {
    /// Clears every cached trigger evaluation. Call once per process cycle.
    pub fn reset_trigger_eval_cache(&mut self) {
        let ins: Vec<InPortId> = self.inputs().map(|p| p.id).collect();
        for i in ins {
            if let Some(p) = self.input_mut(i) {
                p.common.trigger_eval = TriggerEval::NotEvaluated;
            }
        }
        let outs: Vec<OutPortId> = self.outputs().map(|p| p.id).collect();
        for o in outs {
            if let Some(p) = self.output_mut(o) {
                p.common.trigger_eval = TriggerEval::NotEvaluated;
            }
        }
    }

    /// Whether input `i` holds enough to let its module run.
    pub fn in_port_is_trigger_present(&self, i: InPortId) -> bool {
        let Some(inp) = self.input(i) else {
            return false;
        };
        let c = &inp.common;
        if !c.flags.is_mf_valid {
            return false;
        }
        if inp.flushing_eos {
            return true;
        }
        let Some(m) = self.module(inp.module) else {
            return false;
        };
        let actual = c.buf.actual_len();
        if m.caps.dm_fixed_output && m.dm_required_samples != 0 {
            let required = c.media_fmt.bytes_for_samples_all_ch(m.dm_required_samples);
            return actual >= required;
        }
        if c.flags.port_has_threshold {
            return length_meets_threshold(actual, c.threshold);
        }
        if m.caps.need_sync_extn {
            let required = frame_bytes_at(&c.media_fmt, &self.cntr_frame);
            return length_meets_threshold(actual, required);
        }
        actual != 0 || c.metadata_count != 0
    }

    /// Whether output `o` has room for a full module call.
    pub fn out_port_is_trigger_present(&self, o: OutPortId, ext: &dyn ExtPortView) -> bool {
        let Some(out) = self.output(o) else {
            return false;
        };
        let c = &out.common;
        if !c.flags.is_mf_valid {
            return false;
        }
        if out.is_ext {
            if !ext.ext_out_has_buf(o) {
                return false;
            }
        } else if out.pending_out_media_fmt {
            return false;
        }
        // new data may follow an end of frame only while the stream is flushing
        if out.pending_eof && !self.has_flushing_eos(out) {
            return false;
        }
        if self.num_data_tpm != 0 && self.nblc_end_is_satisfied(o, ext) {
            return false;
        }

        let Some(m) = self.module(out.module) else {
            return false;
        };
        let free = c.buf.free_len();
        if c.flags.port_has_threshold {
            return free >= c.threshold;
        }
        if m.caps.need_sync_extn {
            let required = frame_bytes_at(&c.media_fmt, &self.cntr_frame);
            return length_meets_threshold(free, required);
        }
        if out.is_ext {
            return !self.ext_out_is_full(o, ext);
        }
        free != 0
    }

    /// A flushing end of stream sits on the output or on the input it feeds.
    fn has_flushing_eos(&self, out: &OutputPort) -> bool {
        out.flushing_eos
            || out
                .conn_in
                .and_then(|i| self.input(i))
                .is_some_and(|p| p.flushing_eos)
    }

    /// External output `o` cannot take more data this cycle: its port buffer
    /// reached capacity, or the peer side is saturated.
    pub fn ext_out_is_full(&self, o: OutPortId, ext: &dyn ExtPortView) -> bool {
        let Some(out) = self.output(o) else {
            return false;
        };
        let buf = &out.common.buf;
        (buf.max_len != 0 && buf.free_len() == 0) || ext.ext_out_is_full(o)
    }

    /// True when nothing past the chain end of `o` wants more data.
    fn nblc_end_is_satisfied(&self, o: OutPortId, ext: &dyn ExtPortView) -> bool {
        let end = self.output(o).and_then(|p| p.nblc_end).unwrap_or(o);
        let Some(end_port) = self.output(end) else {
            return false;
        };
        if end_port.is_ext {
            return self.ext_out_is_full(end, ext);
        }
        end_port
            .conn_in
            .is_some_and(|i| self.in_port_is_trigger_present(i))
    }

    /// Input blocked by state or by its nontrigger policy.
    pub fn in_port_is_trigger_blocked(&self, i: InPortId) -> bool {
        self.input(i).is_none_or(|p| {
            p.common.state != TopoState::Started
                || p.common.nontrigger_policy == NontriggerPolicy::Blocked
        })
    }

    /// Output blocked by any of: invalid format, no buffer, pending format or
    /// EOS hazard, nontrigger policy, missing trigger. Cached per cycle.
    pub fn out_port_is_trigger_blocked(&mut self, o: OutPortId, ext: &dyn ExtPortView) -> bool {
        let Some(out) = self.output(o) else {
            return true;
        };
        match out.common.trigger_eval {
            TriggerEval::Present => return false,
            TriggerEval::NotPresent => return true,
            TriggerEval::NotEvaluated => {}
        }
        let blocked = out.common.state != TopoState::Started
            || out.common.nontrigger_policy == NontriggerPolicy::Blocked
            || !self.out_port_is_trigger_present(o, ext);
        if let Some(out) = self.output_mut(o) {
            out.common.trigger_eval = if blocked {
                TriggerEval::NotPresent
            } else {
                TriggerEval::Present
            };
        }
        blocked
    }

    /// Input side of the cached evaluation.
    pub fn in_port_trigger_eval(&mut self, i: InPortId) -> bool {
        let Some(inp) = self.input(i) else {
            return false;
        };
        match inp.common.trigger_eval {
            TriggerEval::Present => return true,
            TriggerEval::NotPresent => return false,
            TriggerEval::NotEvaluated => {}
        }
        let present = !self.in_port_is_trigger_blocked(i) && self.in_port_is_trigger_present(i);
        if let Some(inp) = self.input_mut(i) {
            inp.common.trigger_eval = if present {
                TriggerEval::Present
            } else {
                TriggerEval::NotPresent
            };
        }
        present
    }

    /// Whether the container should wait for data on input `i`.
    pub fn in_port_needs_data(&self, i: InPortId) -> TriggerNeed {
        if self.in_port_is_trigger_blocked(i) || self.in_port_is_trigger_present(i) {
            return TriggerNeed::NotNeeded;
        }
        // Data enters the chain at its start; that port decides.
        let port = self
            .input(i)
            .and_then(|p| p.nblc_start)
            .filter(|&s| s != i)
            .unwrap_or(i);
        if port != i
            && (self.in_port_is_trigger_blocked(port) || self.in_port_is_trigger_present(port))
        {
            return TriggerNeed::NotNeeded;
        }
        let Some(p) = self.input(port) else {
            return TriggerNeed::NotNeeded;
        };
        need_level(p.common.data_flow, p.common.nontrigger_policy)
    }

    /// Whether the container should wait for buffer space on output `o`.
    pub fn out_port_needs_trigger(&self, o: OutPortId, ext: &dyn ExtPortView) -> TriggerNeed {
        let blocked = |o: OutPortId| {
            self.output(o).is_none_or(|p| {
                p.common.state != TopoState::Started
                    || p.common.nontrigger_policy == NontriggerPolicy::Blocked
            })
        };
        if blocked(o) || self.out_port_is_trigger_present(o, ext) {
            return TriggerNeed::NotNeeded;
        }
        let port = self
            .output(o)
            .and_then(|p| p.nblc_end)
            .filter(|&e| e != o)
            .unwrap_or(o);
        if port != o && (blocked(port) || self.out_port_is_trigger_present(port, ext)) {
            return TriggerNeed::NotNeeded;
        }
        let Some(p) = self.output(port) else {
            return TriggerNeed::NotNeeded;
        };
        need_level(p.common.data_flow, p.common.nontrigger_policy)
    }
}

fn need_level(flow: DataFlowState, policy: NontriggerPolicy) -> TriggerNeed {
    if flow != DataFlowState::Flowing || policy == NontriggerPolicy::Optional {
        TriggerNeed::NeededOptionally
    } else {
        TriggerNeed::Needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_format::MediaFormat;
    use crate::topo::{ModuleCaps, ModuleSpec};

    fn threshold_module(threshold: u32) -> (Topology, InPortId, OutPortId) {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 1).unwrap();
        let spec = ModuleSpec {
            instance_id: 10,
            module_id: 0x0700_2000,
            serial_num: 1,
            max_inputs: 1,
            max_outputs: 1,
            min_outputs: 1,
            caps: ModuleCaps::default(),
        };
        let m = t.add_module(1, &spec, None).unwrap();
        let i = t.add_input_port(m, 2).unwrap();
        let o = t.add_output_port(m, 1).unwrap();
        prime(&mut t.input_mut(i).unwrap().common, threshold);
        prime(&mut t.output_mut(o).unwrap().common, threshold);
        (t, i, o)
    }

    fn prime(c: &mut crate::topo::CommonPort, threshold: u32) {
        c.media_fmt = MediaFormat::pcm(48000, 16, 2);
        c.flags.is_mf_valid = true;
        c.threshold = threshold;
        c.flags.port_has_threshold = threshold != 0;
        c.state = TopoState::Started;
        c.buf.max_len = 4096;
    }

    #[test]
    fn threshold_zero_needs_any_byte() {
        assert!(!length_meets_threshold(0, 0));
        assert!(length_meets_threshold(1, 0));
        assert!(!length_meets_threshold(9, 10));
        assert!(length_meets_threshold(10, 10));
    }

    #[test]
    fn input_presence_at_threshold_boundary() {
        let (mut t, i, _) = threshold_module(192);
        t.input_mut(i).unwrap().common.buf.data = vec![0; 188];
        assert!(!t.in_port_is_trigger_present(i));
        t.input_mut(i).unwrap().common.buf.data = vec![0; 192];
        assert!(t.in_port_is_trigger_present(i));
    }

    #[test]
    fn threshold_is_met_per_channel() {
        // 48 samples of 16 bit per channel
        let per_ch = 96;
        for ch in [1, 2, 6, 8] {
            let (mut t, i, o) = threshold_module(per_ch * ch);
            t.input_mut(i).unwrap().common.media_fmt = MediaFormat::pcm(48000, 16, ch);
            t.output_mut(o).unwrap().common.media_fmt = MediaFormat::pcm(48000, 16, ch);
            let fmt = t.input(i).unwrap().common.media_fmt.clone();
            assert_eq!(fmt.bytes_for_samples_all_ch(48), per_ch * ch);

            t.input_mut(i).unwrap().common.buf.data = vec![0; ((per_ch - 1) * ch) as usize];
            assert!(!t.in_port_is_trigger_present(i), "{ch} channels, one byte short");
            t.input_mut(i).unwrap().common.buf.data = vec![0; (per_ch * ch) as usize];
            assert!(t.in_port_is_trigger_present(i), "{ch} channels, full threshold");

            let max = t.output(o).unwrap().common.buf.max_len as usize;
            t.output_mut(o).unwrap().common.buf.data = vec![0; max - ((per_ch - 1) * ch) as usize];
            assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
            t.output_mut(o).unwrap().common.buf.data = vec![0; max - (per_ch * ch) as usize];
            assert!(t.out_port_is_trigger_present(o, &NoExtPorts));
        }
    }

    #[test]
    fn missing_format_is_never_present() {
        let (mut t, i, o) = threshold_module(0);
        t.input_mut(i).unwrap().common.flags.is_mf_valid = false;
        t.input_mut(i).unwrap().flushing_eos = true;
        assert!(!t.in_port_is_trigger_present(i));
        t.output_mut(o).unwrap().common.flags.is_mf_valid = false;
        assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
    }

    #[test]
    fn flushing_eos_counts_as_data() {
        let (mut t, i, _) = threshold_module(192);
        t.input_mut(i).unwrap().flushing_eos = true;
        assert!(t.in_port_is_trigger_present(i));
    }

    #[test]
    fn output_needs_threshold_worth_of_space() {
        let (mut t, _, o) = threshold_module(192);
        t.output_mut(o).unwrap().common.buf.data = vec![0; 4096 - 191];
        assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
        t.output_mut(o).unwrap().common.buf.data = vec![0; 4096 - 192];
        assert!(t.out_port_is_trigger_present(o, &NoExtPorts));
    }

    #[test]
    fn pending_output_format_blocks_output() {
        let (mut t, _, o) = threshold_module(0);
        t.output_mut(o).unwrap().pending_out_media_fmt = true;
        assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
    }

    #[test]
    fn pending_eof_blocks_output_unless_eos_is_flushing() {
        let (mut t, _, o) = threshold_module(0);
        t.output_mut(o).unwrap().pending_eof = true;
        assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
        t.output_mut(o).unwrap().flushing_eos = true;
        assert!(t.out_port_is_trigger_present(o, &NoExtPorts));
    }

    #[test]
    fn pending_eof_passes_when_connected_input_is_flushing() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 1).unwrap();
        let spec = |iid| ModuleSpec {
            instance_id: iid,
            module_id: 0x0700_2000,
            serial_num: iid,
            max_inputs: 1,
            max_outputs: 1,
            min_outputs: 1,
            caps: ModuleCaps::default(),
        };
        let a = t.add_module(1, &spec(10), None).unwrap();
        let b = t.add_module(1, &spec(11), None).unwrap();
        let o = t.add_output_port(a, 1).unwrap();
        let i = t.add_input_port(b, 2).unwrap();
        t.connect(o, i).unwrap();
        prime(&mut t.output_mut(o).unwrap().common, 0);
        t.output_mut(o).unwrap().pending_eof = true;
        assert!(!t.out_port_is_trigger_present(o, &NoExtPorts));
        t.input_mut(i).unwrap().flushing_eos = true;
        assert!(t.out_port_is_trigger_present(o, &NoExtPorts));
    }

    #[test]
    fn blocked_evaluation_is_cached_until_reset() {
        let (mut t, _, o) = threshold_module(0);
        t.output_mut(o).unwrap().common.buf.max_len = 0;
        assert!(t.out_port_is_trigger_blocked(o, &NoExtPorts));
        t.output_mut(o).unwrap().common.buf.max_len = 4096;
        assert!(t.out_port_is_trigger_blocked(o, &NoExtPorts));
        t.reset_trigger_eval_cache();
        assert!(!t.out_port_is_trigger_blocked(o, &NoExtPorts));
    }

    #[test]
    fn need_downgraded_when_not_flowing_or_optional() {
        let (mut t, i, _) = threshold_module(192);
        assert_eq!(t.in_port_needs_data(i), TriggerNeed::NeededOptionally);
        t.input_mut(i).unwrap().common.data_flow = DataFlowState::Flowing;
        assert_eq!(t.in_port_needs_data(i), TriggerNeed::Needed);
        t.input_mut(i).unwrap().common.nontrigger_policy = NontriggerPolicy::Optional;
        assert_eq!(t.in_port_needs_data(i), TriggerNeed::NeededOptionally);
        t.input_mut(i).unwrap().common.state = TopoState::Stopped;
        assert_eq!(t.in_port_needs_data(i), TriggerNeed::NotNeeded);
    }
}
