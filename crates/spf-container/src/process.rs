//! Data path.
//!
//! A processing cycle walks the sorted module list once. Each module that
//! may run gets the bytes buffered on its inputs, and what it produces moves
//! straight to the connected input. External outputs are flushed to their
//! peers at the end of the cycle.

use spf_core::{InPortId, ModuleId, TopoState, Topology};
use tracing::{debug, warn};

use crate::base::{CuBase, GP_BIT};
use crate::container::{Container, Wake};
use crate::error::CuResult;
use crate::frame_len::frame_len_changed;
use crate::msg::DataMsg;
use crate::ops::ContainerOps;

/// Drains work the topology raised: media format propagation, thresholds,
/// the container frame length, chain assignment and scratch memory.
///
/// `is_data_path` selects the propagation policy of
/// [`Topology::propagate_media_fmt`].
pub fn handle_topo_events<O: ContainerOps + ?Sized>(
    cu: &mut CuBase,
    topo: &mut Topology,
    ops: &mut O,
    is_data_path: bool,
) -> CuResult<()> {
    let mut thresh_changed = topo.events.port_thresh || topo.events.media_fmt_event;
    if topo.events.media_fmt_event {
        topo.propagate_media_fmt(is_data_path)?;
    }
    if topo.events.port_thresh {
        topo.determine_port_thresholds();
    }

    let fm = cu.derive_frame_len(topo);
    if cu.cntr_frame_len.is_zero() || frame_len_changed(&cu.cntr_frame_len, &fm) {
        cu.handle_frame_len_change(topo, fm, fm.frame_len_us);
        topo.cntr_frame = cu.cntr_frame_len;
        topo.determine_port_thresholds();
        thresh_changed = true;
    }

    if thresh_changed {
        ops.port_data_thresh_change(cu, topo)?;
        topo.assign_non_buf_lin_chains()?;
    }
    if topo.events.realloc_scratch_mem {
        topo.check_n_realloc_scratch_memory()?;
    }
    Ok(())
}

/// Runs every started module that can run, once, in sorted order.
///
/// Returns how many modules ran.
pub fn process_cycle<O: ContainerOps + ?Sized>(
    cu: &mut CuBase,
    topo: &mut Topology,
    ops: &mut O,
) -> CuResult<u32> {
    if topo.events.media_fmt_event || topo.events.port_thresh {
        handle_topo_events(cu, topo, ops, true)?;
    }
    topo.reset_trigger_eval_cache();

    let order = topo.sorted().to_vec();
    let mut ran = 0;
    for mid in order {
        if topo.module_sg_state(mid) != TopoState::Started {
            continue;
        }
        if !ops.module_can_run(cu, topo, mid) {
            continue;
        }
        run_module(topo, mid)?;
        ran += 1;
    }
    deliver_ext_outputs(cu, topo);
    ops.post_process_cycle(cu, topo);
    Ok(ran)
}

fn take_input(topo: &mut Topology, i: InPortId) -> Vec<u8> {
    topo.input_mut(i)
        .map(|p| std::mem::take(&mut p.common.buf.data))
        .unwrap_or_default()
}

/// Moves the first input into the first output. A module without outputs
/// consumes everything.
fn pass_through(inputs: &mut [Vec<u8>], outputs: &mut [Vec<u8>]) {
    if outputs.is_empty() {
        inputs.iter_mut().for_each(Vec::clear);
        return;
    }
    if let (Some(inp), Some(out)) = (inputs.first_mut(), outputs.first_mut()) {
        out.append(inp);
    }
}

fn run_module(topo: &mut Topology, mid: ModuleId) -> CuResult<()> {
    let Some(m) = topo.module(mid) else {
        return Ok(());
    };
    let (inputs, outputs) = (m.inputs.clone(), m.outputs.clone());

    let eos = inputs
        .iter()
        .any(|&i| topo.input(i).is_some_and(|p| p.flushing_eos));
    let mut in_bufs: Vec<Vec<u8>> = inputs.iter().map(|&i| take_input(topo, i)).collect();
    let mut out_bufs: Vec<Vec<u8>> = outputs
        .iter()
        .map(|&o| {
            topo.output_mut(o)
                .map(|p| std::mem::take(&mut p.common.buf.data))
                .unwrap_or_default()
        })
        .collect();

    let result = match topo.module_mut(mid) {
        Some(m) if m.bypass.is_none() && !m.flags.disabled => match m.capi.as_mut() {
            Some(capi) => capi.process(&mut in_bufs, &mut out_bufs),
            None => {
                pass_through(&mut in_bufs, &mut out_bufs);
                Ok(())
            }
        },
        _ => {
            pass_through(&mut in_bufs, &mut out_bufs);
            Ok(())
        }
    };

    // leftovers stay on the ports even when the module failed
    for (&i, data) in inputs.iter().zip(in_bufs) {
        if let Some(p) = topo.input_mut(i) {
            if eos && data.is_empty() {
                p.flushing_eos = false;
            }
            p.common.buf.data = data;
        }
    }
    for (&o, data) in outputs.iter().zip(out_bufs) {
        if let Some(p) = topo.output_mut(o) {
            p.common.buf.data = data;
        }
    }
    result?;

    for &o in &outputs {
        let Some(p) = topo.output_mut(o) else { continue };
        if p.is_ext {
            p.pending_eof |= eos;
            p.flushing_eos |= eos;
            continue;
        }
        let data = std::mem::take(&mut p.common.buf.data);
        match p.conn_in {
            Some(i) => {
                if let Some(peer) = topo.input_mut(i) {
                    peer.common.buf.data.extend_from_slice(&data);
                    peer.flushing_eos |= eos;
                }
            }
            None => {
                if !data.is_empty() {
                    debug!(log_id = topo.log_id, bytes = data.len(), "process: dangling output dropped data");
                }
            }
        }
    }
    Ok(())
}

/// Sends what external outputs hold to their peers. A format the peer has
/// not seen yet travels with the data.
fn deliver_ext_outputs(cu: &mut CuBase, topo: &mut Topology) {
    let (log_id, ids) = (cu.log_id, &cu.ids);
    for (&o, ext) in &mut cu.ext.outputs {
        let Some(p) = topo.output_mut(o) else { continue };
        if p.common.state != TopoState::Started {
            continue;
        }
        if p.common.buf.data.is_empty() && !p.pending_eof {
            continue;
        }
        let Some(tx) = ext.data_tx.as_ref() else {
            p.common.buf.drop_data();
            p.pending_eof = false;
            p.flushing_eos = false;
            continue;
        };
        let media_fmt = (!ext.media_fmt_sent || ext.media_fmt != p.common.media_fmt)
            .then(|| p.common.media_fmt.clone());
        let bytes = std::mem::take(&mut p.common.buf.data);
        let len = bytes.len() as u64;
        let msg = DataMsg {
            buf_id: ids.next_id(),
            bytes,
            media_fmt: media_fmt.clone(),
            eos: p.pending_eof,
        };
        p.pending_eof = false;
        p.flushing_eos = false;
        if tx.send(msg).is_err() {
            warn!(log_id, miid = ext.addr.module, "process: downstream peer gone, data dropped");
            continue;
        }
        if let Some(fmt) = media_fmt {
            ext.media_fmt = fmt;
            ext.media_fmt_sent = true;
        }
        ext.delivered += len;
    }
}

/// Stores a buffer received on an external input.
pub fn accept_ext_data(
    cu: &mut CuBase,
    topo: &mut Topology,
    id: InPortId,
    msg: DataMsg,
) -> CuResult<()> {
    if let Some(fmt) = msg.media_fmt {
        let changed = topo
            .input(id)
            .is_none_or(|p| !p.media_fmt_received || p.common.media_fmt.has_changed(&fmt));
        if changed {
            debug!(log_id = cu.log_id, sample_rate = fmt.pcm.sample_rate, "process: new format on external input");
            topo.set_ext_in_media_fmt(id, fmt.clone())?;
            if let Some(ext) = cu.ext.inputs.get_mut(&id) {
                ext.media_fmt = fmt;
            }
        }
    }
    if let Some(p) = topo.input_mut(id) {
        p.common.buf.data.extend_from_slice(&msg.bytes);
        p.flushing_eos |= msg.eos;
    }
    Ok(())
}

impl<O: ContainerOps> Container<O> {
    /// One processing cycle followed by event handling when it raised any.
    pub fn run_cycle(&mut self) -> CuResult<u32> {
        let (cu, topo, ops) = self.parts();
        let ran = process_cycle(cu, topo, ops)?;
        if !self.cu.events.reconcile().is_empty() || self.topo.events.kpps_bw_change {
            self.handle_fwk_events()?;
        }
        Ok(ran)
    }

    pub(crate) fn handle_data_wake(&mut self, bit: u32, wake: Wake) -> CuResult<()> {
        let Some(id) = self.cu.ext.input_by_bit(bit) else {
            self.cu.stop_listen(bit);
            return Ok(());
        };
        match wake {
            Wake::Data(msg) => {
                let (cu, topo, ops) = self.parts();
                accept_ext_data(cu, topo, id, msg)?;
                if topo.events.media_fmt_event {
                    handle_topo_events(cu, topo, ops, true)?;
                }
                if self.ops.process_on_data() {
                    self.run_cycle()?;
                }
            }
            Wake::Closed => {
                warn!(log_id = self.cu.log_id, bit, "cu: upstream data queue closed");
                if let Some(p) = self.cu.ext.inputs.get_mut(&id) {
                    p.data_rx = None;
                    p.bit = None;
                }
                self.cu.release_bit(bit);
                if let Some(slot) = self.handlers.get_mut(bit as usize) {
                    *slot = None;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn handle_gp_wake(&mut self, _bit: u32, wake: Wake) -> CuResult<()> {
        if !matches!(wake, Wake::Gp) {
            return Ok(());
        }
        if !self.cu.is_listening(GP_BIT) {
            return Ok(());
        }
        // signal containers pick their input up on the tick
        let queued: Vec<(InPortId, Vec<DataMsg>)> = self
            .cu
            .ext
            .inputs
            .values()
            .filter(|p| self.topo.input(p.id).is_some_and(|i| i.common.state == TopoState::Started))
            .filter_map(|p| p.data_rx.as_ref().map(|rx| (p.id, rx.try_iter().collect())))
            .collect();
        for (id, msgs) in queued {
            for msg in msgs {
                accept_ext_data(&mut self.cu, &mut self.topo, id, msg)?;
            }
        }
        if self.topo.events.media_fmt_event {
            let (cu, topo, ops) = self.parts();
            handle_topo_events(cu, topo, ops, true)?;
        }
        if self.ops.process_on_signal() {
            self.run_cycle()?;
        }
        Ok(())
    }

    pub(crate) fn handle_async_wake(&mut self, _bit: u32, _wake: Wake) -> CuResult<()> {
        self.run_handle_rest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::GenericOps;
    use crate::pm::NullPowerManager;
    use spf_core::{MediaFormat, ModuleCaps, ModuleSpec, OutPortId};

    fn spec(instance_id: u32, ins: u32, outs: u32) -> ModuleSpec {
        ModuleSpec {
            instance_id,
            module_id: 0x0700_2000,
            serial_num: 0,
            max_inputs: ins,
            max_outputs: outs,
            min_outputs: outs.min(1),
            caps: ModuleCaps::default(),
        }
    }

    /// ext in -> a -> b -> ext out, one started subgraph.
    fn chain() -> (CuBase, Topology, InPortId, OutPortId) {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 0).unwrap();
        let a = t.add_module(1, &spec(0x10, 1, 1), None).unwrap();
        let b = t.add_module(1, &spec(0x20, 1, 1), None).unwrap();
        let ai = t.add_input_port(a, 2).unwrap();
        let ao = t.add_output_port(a, 1).unwrap();
        let bi = t.add_input_port(b, 2).unwrap();
        let bo = t.add_output_port(b, 1).unwrap();
        t.connect(ao, bi).unwrap();
        t.set_ext_input(ai).unwrap();
        t.set_ext_output(bo).unwrap();
        t.sort().unwrap();
        t.subgraph_mut(1).unwrap().state = TopoState::Started;
        let mut cu = CuBase::new(0x4000, 1, Box::new(NullPowerManager::default()));
        cu.ext.add_input(&t, ai).unwrap();
        cu.ext.add_output(&t, bo).unwrap();
        cu.ext.outputs.get_mut(&bo).unwrap().connected_state = TopoState::Started;
        (cu, t, ai, bo)
    }

    // --- pass through ---

    #[test]
    fn sink_without_outputs_consumes() {
        let mut ins = vec![vec![1u8, 2]];
        pass_through(&mut ins, &mut []);
        assert!(ins[0].is_empty());
    }

    #[test]
    fn first_input_appends_to_first_output() {
        let mut ins = vec![vec![3u8, 4], vec![9u8]];
        let mut outs = vec![vec![1u8, 2], Vec::new()];
        pass_through(&mut ins, &mut outs);
        assert_eq!(outs[0], [1, 2, 3, 4]);
        assert!(outs[1].is_empty());
        assert!(ins[0].is_empty());
        assert_eq!(ins[1], [9]);
    }

    // --- topology events ---

    #[test]
    fn first_event_pass_sets_frame_len() {
        let (mut cu, mut t, ai, _) = chain();
        t.set_ext_in_media_fmt(ai, MediaFormat::pcm(48000, 16, 2)).unwrap();
        handle_topo_events(&mut cu, &mut t, &mut GenericOps::default(), false).unwrap();
        assert!(!cu.cntr_frame_len.is_zero());
        assert_eq!(t.cntr_frame, cu.cntr_frame_len);
        assert!(!t.events.media_fmt_event);
    }

    // --- cycle ---

    #[test]
    fn data_flows_to_ext_output() {
        let (mut cu, mut t, ai, bo) = chain();
        let (tx, rx) = crossbeam_channel::unbounded();
        cu.ext.outputs.get_mut(&bo).unwrap().data_tx = Some(tx);
        let mut ops = GenericOps::default();
        accept_ext_data(
            &mut cu,
            &mut t,
            ai,
            DataMsg {
                bytes: vec![0u8; 192],
                media_fmt: Some(MediaFormat::pcm(48000, 16, 2)),
                ..DataMsg::default()
            },
        )
        .unwrap();
        crate::port_state::update_all_sg_port_states(&mut cu, &mut t, &mut ops).unwrap();
        handle_topo_events(&mut cu, &mut t, &mut ops, true).unwrap();

        let ran = process_cycle(&mut cu, &mut t, &mut ops).unwrap();
        assert_eq!(ran, 2);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.bytes.len(), 192);
        assert_eq!(msg.media_fmt.unwrap().pcm.sample_rate, 48000);
        assert_eq!(cu.ext.outputs[&bo].delivered, 192);
    }

    #[test]
    fn stopped_subgraph_does_not_run() {
        let (mut cu, mut t, ai, _) = chain();
        t.subgraph_mut(1).unwrap().state = TopoState::Stopped;
        t.input_mut(ai).unwrap().common.buf.data = vec![1; 16];
        let ran = process_cycle(&mut cu, &mut t, &mut GenericOps::default()).unwrap();
        assert_eq!(ran, 0);
        assert_eq!(t.input(ai).unwrap().common.buf.actual_len(), 16);
    }
}
