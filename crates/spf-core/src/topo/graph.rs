//! Topology arenas, mutation API and sorted module order.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, collections::BTreeSet, vec, vec::Vec};
#[cfg(feature = "std")]
use std::collections::BTreeSet;

use crate::capi::CapiModule;
use crate::error::{SpfError, SpfResult};
use crate::icb::FrameLength;
use crate::rtm::RtmPacket;
use crate::state::{GuStatus, TopoState};

use super::node::{
    AttachedModule, CommonPort, CtrlPort, InPortId, InputPort, Module, ModuleFlags, ModuleId, ModuleSpec,
    OutPortId, OutputPort, Subgraph,
};
use super::scratch::ScratchMem;

/// Topology-wide static flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopoFlags {
    /// Container runs off a hardware signal or timer.
    pub is_signal_triggered: bool,
    /// Port media formats are dumped to the real-time monitor.
    pub port_mf_rtm_dump_enable: bool,
}

/// Work raised during a command or a process cycle, drained by the container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct TopoEvents {
    /// Some port carries a pending media format.
    pub media_fmt_event: bool,
    /// Port thresholds need to be recomputed.
    pub port_thresh: bool,
    /// A module toggled in-place processing.
    pub dynamic_inplace_change: bool,
    /// Scratch memory must be checked against the new maxima.
    pub realloc_scratch_mem: bool,
    /// Module processing load or bandwidth changed.
    pub kpps_bw_change: bool,
}

/// Modules, ports and subgraphs of one container.
#[derive(Debug)]
pub struct Topology {
    modules: Vec<Option<Module>>,
    inputs: Vec<Option<InputPort>>,
    outputs: Vec<Option<OutputPort>>,
    pub(super) ctrl_ports: Vec<Option<CtrlPort>>,
    subgraphs: Vec<Subgraph>,
    sorted: Vec<ModuleId>,
    /// Owning container instance id.
    pub container_instance_id: u32,
    /// Log id carried by every message of this topology.
    pub log_id: u32,
    /// Static flags.
    pub flags: TopoFlags,
    /// Pending work.
    pub events: TopoEvents,
    /// Shared scratch area.
    pub scratch: ScratchMem,
    /// Modules with a data trigger policy.
    pub num_data_tpm: u32,
    /// Sequence number of the next real-time monitor packet.
    pub rtm_seq_num: u32,
    /// Nominal container frame.
    pub cntr_frame: FrameLength,
    /// Committed real-time monitor packets not collected yet.
    pub(crate) rtm_log: Vec<RtmPacket>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new(container_instance_id: u32, log_id: u32) -> Self {
        Self {
            modules: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            ctrl_ports: Vec::new(),
            subgraphs: Vec::new(),
            sorted: Vec::new(),
            container_instance_id,
            log_id,
            flags: TopoFlags::default(),
            events: TopoEvents::default(),
            scratch: ScratchMem::default(),
            num_data_tpm: 0,
            rtm_seq_num: 0,
            cntr_frame: FrameLength::default(),
            rtm_log: Vec::new(),
        }
    }

    // --- Subgraphs ---

    /// Adds a subgraph in STOPPED state.
    pub fn add_subgraph(&mut self, id: u32, sid: u32) -> SpfResult<()> {
        if self.subgraph(id).is_some() {
            return Err(SpfError::BadParam);
        }
        self.subgraphs.push(Subgraph {
            id,
            sid,
            state: TopoState::Stopped,
            gu_status: GuStatus::New,
            modules: Vec::new(),
        });
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, sg_id = id, "topo: subgraph added");
        Ok(())
    }

    /// Looks a subgraph up by id.
    pub fn subgraph(&self, id: u32) -> Option<&Subgraph> {
        self.subgraphs.iter().find(|sg| sg.id == id)
    }

    /// Mutable subgraph lookup.
    pub fn subgraph_mut(&mut self, id: u32) -> Option<&mut Subgraph> {
        self.subgraphs.iter_mut().find(|sg| sg.id == id)
    }

    /// Subgraphs in creation order.
    pub fn subgraphs(&self) -> &[Subgraph] {
        &self.subgraphs
    }

    /// Subgraph ids in creation order.
    pub fn subgraph_ids(&self) -> Vec<u32> {
        self.subgraphs.iter().map(|sg| sg.id).collect()
    }

    /// State of a subgraph, INVALID when absent.
    pub fn sg_state(&self, id: u32) -> TopoState {
        self.subgraph(id).map_or(TopoState::Invalid, |sg| sg.state)
    }

    /// State of the subgraph owning `module`.
    pub fn module_sg_state(&self, module: ModuleId) -> TopoState {
        self.module(module)
            .map_or(TopoState::Invalid, |m| self.sg_state(m.sg_id))
    }

    /// True when the module's subgraph is STOPPED or SUSPENDED.
    pub fn is_module_sg_stopped_or_suspended(&self, module: ModuleId) -> bool {
        self.module_sg_state(module).is_stopped_or_suspended()
    }

    /// Destroys a subgraph and all its modules.
    pub fn remove_subgraph(&mut self, id: u32) -> SpfResult<()> {
        let pos = self
            .subgraphs
            .iter()
            .position(|sg| sg.id == id)
            .ok_or(SpfError::NotFound)?;
        let modules = self.subgraphs[pos].modules.clone();
        for m in modules {
            self.destroy_module(m)?;
        }
        self.subgraphs.remove(pos);
        self.sort()?;
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, sg_id = id, "topo: subgraph removed");
        Ok(())
    }

    // --- Modules ---

    /// Creates a module inside a subgraph. Ports are added separately.
    pub fn add_module(
        &mut self,
        sg_id: u32,
        spec: &ModuleSpec,
        capi: Option<Box<dyn CapiModule + Send>>,
    ) -> SpfResult<ModuleId> {
        if self.subgraph(sg_id).is_none() {
            return Err(SpfError::NotFound);
        }
        if self.module_by_instance(spec.instance_id).is_some() {
            return Err(SpfError::BadParam);
        }
        let id = ModuleId(self.modules.len() as u32);
        let mut module = Module {
            id,
            instance_id: spec.instance_id,
            module_id: spec.module_id,
            sg_id,
            serial_num: spec.serial_num,
            capi,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ctrl_ports: Vec::new(),
            max_inputs: spec.max_inputs,
            max_outputs: spec.max_outputs,
            min_outputs: spec.min_outputs,
            caps: spec.caps,
            flags: ModuleFlags {
                inplace: spec.caps.inplace,
                ..ModuleFlags::default()
            },
            bypass: None,
            kpps: 0,
            bw: 0,
            dm_required_samples: 0,
            gu_status: GuStatus::New,
        };
        if let Some(capi) = module.capi.as_ref() {
            module.kpps = capi.kpps();
            module.bw = capi.bandwidth();
        }
        if spec.caps.need_trigger_policy_extn {
            self.num_data_tpm += 1;
        }
        self.modules.push(Some(module));
        if let Some(sg) = self.subgraph_mut(sg_id) {
            sg.modules.push(id);
        }
        self.events.kpps_bw_change = true;
        self.sorted.push(id);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            log_id = self.log_id,
            miid = spec.instance_id,
            sg_id,
            "topo: module added"
        );
        Ok(id)
    }

    /// Looks a module up.
    #[inline]
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.slot()).and_then(Option::as_ref)
    }

    /// Mutable module lookup.
    #[inline]
    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Finds a module by instance id.
    pub fn module_by_instance(&self, instance_id: u32) -> Option<ModuleId> {
        self.modules
            .iter()
            .flatten()
            .find(|m| m.instance_id == instance_id)
            .map(|m| m.id)
    }

    /// Live modules in arena order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter().flatten()
    }

    /// Number of live modules.
    pub fn module_count(&self) -> usize {
        self.modules.iter().flatten().count()
    }

    /// Ends a module's plugin, detaches and frees its ports.
    pub fn destroy_module(&mut self, id: ModuleId) -> SpfResult<()> {
        let mut module = self
            .modules
            .get_mut(id.slot())
            .and_then(Option::take)
            .ok_or(SpfError::NotFound)?;
        for &inp in &module.inputs {
            if let Some(port) = self.inputs.get_mut(inp.slot()).and_then(Option::take) {
                if let Some(out) = port.conn_out.and_then(|o| self.output_mut(o)) {
                    out.conn_in = None;
                }
            }
        }
        for &o in &module.outputs {
            if let Some(mut port) = self.outputs.get_mut(o.slot()).and_then(Option::take) {
                if let Some(inp) = port.conn_in.and_then(|i| self.input_mut(i)) {
                    inp.conn_out = None;
                }
                if let Some(att) = port.attached.as_mut() {
                    att.capi.end();
                }
            }
        }
        for &c in &module.ctrl_ports {
            if let Some(port) = self.ctrl_ports.get_mut(c.slot()).and_then(Option::take) {
                if let Some(peer) = port.peer.and_then(|p| self.ctrl_port_mut(p)) {
                    peer.peer = None;
                }
            }
        }
        if let Some(capi) = module.capi.as_mut() {
            capi.end();
        }
        if module.caps.need_trigger_policy_extn {
            self.num_data_tpm = self.num_data_tpm.saturating_sub(1);
        }
        if let Some(sg) = self.subgraph_mut(module.sg_id) {
            sg.modules.retain(|&m| m != id);
        }
        self.sorted.retain(|&m| m != id);
        self.events.kpps_bw_change = true;
        self.events.realloc_scratch_mem = true;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            log_id = self.log_id,
            miid = module.instance_id,
            "topo: module destroyed"
        );
        Ok(())
    }

    // --- Ports ---

    /// Adds an input port to a module.
    pub fn add_input_port(&mut self, module: ModuleId, port_id: u32) -> SpfResult<InPortId> {
        let id = InPortId(self.inputs.len() as u32);
        let m = self.module_mut(module).ok_or(SpfError::NotFound)?;
        if m.inputs.len() as u32 >= m.max_inputs {
            return Err(SpfError::BadParam);
        }
        let index = m.inputs.len() as u32;
        m.inputs.push(id);
        self.inputs.push(Some(InputPort {
            id,
            module,
            conn_out: None,
            is_ext: false,
            common: CommonPort {
                port_id,
                index,
                ..CommonPort::default()
            },
            media_fmt_received: false,
            nblc_start: None,
            nblc_end: None,
            pending_zeros: 0,
            flushing_eos: false,
            pending_eof: false,
            gu_status: GuStatus::New,
        }));
        self.events.realloc_scratch_mem = true;
        Ok(id)
    }

    /// Adds an output port to a module.
    pub fn add_output_port(&mut self, module: ModuleId, port_id: u32) -> SpfResult<OutPortId> {
        let id = OutPortId(self.outputs.len() as u32);
        let m = self.module_mut(module).ok_or(SpfError::NotFound)?;
        if m.outputs.len() as u32 >= m.max_outputs {
            return Err(SpfError::BadParam);
        }
        let index = m.outputs.len() as u32;
        m.outputs.push(id);
        self.outputs.push(Some(OutputPort {
            id,
            module,
            conn_in: None,
            is_ext: false,
            common: CommonPort {
                port_id,
                index,
                ..CommonPort::default()
            },
            nblc_start: None,
            nblc_end: None,
            pending_out_media_fmt: false,
            pending_eof: false,
            flushing_eos: false,
            gu_status: GuStatus::New,
            attached: None,
        }));
        self.events.realloc_scratch_mem = true;
        Ok(id)
    }

    /// Looks an input port up.
    #[inline]
    pub fn input(&self, id: InPortId) -> Option<&InputPort> {
        self.inputs.get(id.slot()).and_then(Option::as_ref)
    }

    /// Mutable input port lookup.
    #[inline]
    pub fn input_mut(&mut self, id: InPortId) -> Option<&mut InputPort> {
        self.inputs.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Looks an output port up.
    #[inline]
    pub fn output(&self, id: OutPortId) -> Option<&OutputPort> {
        self.outputs.get(id.slot()).and_then(Option::as_ref)
    }

    /// Mutable output port lookup.
    #[inline]
    pub fn output_mut(&mut self, id: OutPortId) -> Option<&mut OutputPort> {
        self.outputs.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Live input ports.
    pub fn inputs(&self) -> impl Iterator<Item = &InputPort> {
        self.inputs.iter().flatten()
    }

    /// Live output ports.
    pub fn outputs(&self) -> impl Iterator<Item = &OutputPort> {
        self.outputs.iter().flatten()
    }

    /// Finds an input port by module instance id and port id.
    pub fn find_input(&self, instance_id: u32, port_id: u32) -> Option<InPortId> {
        let m = self.module(self.module_by_instance(instance_id)?)?;
        m.inputs
            .iter()
            .copied()
            .find(|&i| self.input(i).is_some_and(|p| p.common.port_id == port_id))
    }

    /// Finds an output port by module instance id and port id.
    pub fn find_output(&self, instance_id: u32, port_id: u32) -> Option<OutPortId> {
        let m = self.module(self.module_by_instance(instance_id)?)?;
        m.outputs
            .iter()
            .copied()
            .find(|&o| self.output(o).is_some_and(|p| p.common.port_id == port_id))
    }

    /// Links an output to an input of another module in this container.
    pub fn connect(&mut self, from: OutPortId, to: InPortId) -> SpfResult<()> {
        let out = self.output(from).ok_or(SpfError::NotFound)?;
        let inp = self.input(to).ok_or(SpfError::NotFound)?;
        if out.conn_in.is_some() || out.is_ext || inp.conn_out.is_some() || inp.is_ext {
            return Err(SpfError::BadParam);
        }
        let (src, dst) = (out.module, inp.module);
        if src == dst || self.can_reach(dst, src) {
            return Err(SpfError::BadParam);
        }
        if let Some(o) = self.output_mut(from) {
            o.conn_in = Some(to);
        }
        if let Some(i) = self.input_mut(to) {
            i.conn_out = Some(from);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, "topo: connect {from} -> {to}");
        self.sort()
    }

    /// Drops the link leaving `from`, if any.
    pub fn disconnect(&mut self, from: OutPortId) -> SpfResult<()> {
        let to = self
            .output_mut(from)
            .ok_or(SpfError::NotFound)?
            .conn_in
            .take();
        if let Some(i) = to.and_then(|t| self.input_mut(t)) {
            i.conn_out = None;
        }
        self.sort()
    }

    /// Marks an input as fed by another container.
    pub fn set_ext_input(&mut self, id: InPortId) -> SpfResult<()> {
        let port = self.input_mut(id).ok_or(SpfError::NotFound)?;
        if port.conn_out.is_some() {
            return Err(SpfError::BadParam);
        }
        port.is_ext = true;
        self.update_boundary_flags();
        Ok(())
    }

    /// Marks an output as feeding another container.
    pub fn set_ext_output(&mut self, id: OutPortId) -> SpfResult<()> {
        let port = self.output_mut(id).ok_or(SpfError::NotFound)?;
        if port.conn_in.is_some() {
            return Err(SpfError::BadParam);
        }
        port.is_ext = true;
        self.update_boundary_flags();
        Ok(())
    }

    /// Attaches a module to an output port.
    pub fn attach_module(&mut self, host: OutPortId, attached: AttachedModule) -> SpfResult<()> {
        let port = self.output_mut(host).ok_or(SpfError::NotFound)?;
        if port.attached.is_some() {
            return Err(SpfError::BadParam);
        }
        port.attached = Some(attached);
        Ok(())
    }

    /// Input and output ports of a module, cloned out of the arena.
    pub(crate) fn module_ports(&self, id: ModuleId) -> (Vec<InPortId>, Vec<OutPortId>) {
        self.module(id)
            .map(|m| (m.inputs.clone(), m.outputs.clone()))
            .unwrap_or_default()
    }

    /// True when the input's peer lives in another subgraph.
    pub fn is_input_at_sg_boundary(&self, id: InPortId) -> bool {
        let Some(inp) = self.input(id) else {
            return false;
        };
        let Some(peer) = inp.conn_out.and_then(|o| self.output(o)) else {
            return false;
        };
        match (self.module(inp.module), self.module(peer.module)) {
            (Some(a), Some(b)) => a.sg_id != b.sg_id,
            _ => false,
        }
    }

    /// True when the output's peer lives in another subgraph.
    pub fn is_output_at_sg_boundary(&self, id: OutPortId) -> bool {
        let Some(out) = self.output(id) else {
            return false;
        };
        let Some(peer) = out.conn_in.and_then(|i| self.input(i)) else {
            return false;
        };
        match (self.module(out.module), self.module(peer.module)) {
            (Some(a), Some(b)) => a.sg_id != b.sg_id,
            _ => false,
        }
    }

    // --- Sorting ---

    /// Modules in processing order.
    pub fn sorted(&self) -> &[ModuleId] {
        &self.sorted
    }

    /// Recomputes the processing order with Kahn's algorithm.
    ///
    /// Among ready modules the lowest serial number goes first, so the order is
    /// deterministic for a given graph.
    pub fn sort(&mut self) -> SpfResult<()> {
        let n = self.modules.len();
        let mut in_degree = vec![0u32; n];
        let mut active = 0usize;
        for m in self.modules.iter().flatten() {
            active += 1;
            in_degree[m.id.slot()] = m
                .inputs
                .iter()
                .filter(|&&i| self.input(i).is_some_and(|p| p.conn_out.is_some()))
                .count() as u32;
        }

        let mut ready: BTreeSet<(u32, u32)> = self
            .modules
            .iter()
            .flatten()
            .filter(|m| in_degree[m.id.slot()] == 0)
            .map(|m| (m.serial_num, m.id.0))
            .collect();

        let mut sorted = Vec::with_capacity(active);
        while let Some(first) = ready.pop_first() {
            let id = ModuleId(first.1);
            sorted.push(id);
            let Some(m) = self.module(id) else {
                continue;
            };
            for &o in &m.outputs {
                let Some(next) = self
                    .output(o)
                    .and_then(|p| p.conn_in)
                    .and_then(|i| self.input(i))
                    .map(|p| p.module)
                else {
                    continue;
                };
                let d = &mut in_degree[next.slot()];
                *d = d.saturating_sub(1);
                if *d == 0 {
                    if let Some(nm) = self.module(next) {
                        ready.insert((nm.serial_num, nm.id.0));
                    }
                }
            }
        }

        if sorted.len() != active {
            #[cfg(feature = "tracing")]
            tracing::error!(log_id = self.log_id, "topo: cycle in module graph");
            return Err(SpfError::Failed);
        }
        self.sorted = sorted;
        self.update_boundary_flags();
        Ok(())
    }

    /// Refreshes the subgraph/container boundary flags of every module.
    fn update_boundary_flags(&mut self) {
        let mut flags = Vec::with_capacity(self.modules.len());
        for m in self.modules.iter().flatten() {
            let ds = m.outputs.iter().any(|&o| {
                self.output(o).is_some_and(|p| p.is_ext) || self.is_output_at_sg_boundary(o)
            });
            let us = m.inputs.iter().any(|&i| {
                self.input(i).is_some_and(|p| p.is_ext) || self.is_input_at_sg_boundary(i)
            });
            flags.push((m.id, ds, us));
        }
        for (id, ds, us) in flags {
            if let Some(m) = self.module_mut(id) {
                m.flags.is_ds_at_sg_or_cntr_boundary = ds;
                m.flags.is_us_at_sg_or_cntr_boundary = us;
            }
        }
    }

    /// DFS reachability over internal links.
    fn can_reach(&self, from: ModuleId, to: ModuleId) -> bool {
        let mut visited = vec![false; self.modules.len()];
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if core::mem::replace(&mut visited[current.slot()], true) {
                continue;
            }
            let Some(m) = self.module(current) else {
                continue;
            };
            for &o in &m.outputs {
                if let Some(next) = self
                    .output(o)
                    .and_then(|p| p.conn_in)
                    .and_then(|i| self.input(i))
                {
                    stack.push(next.module);
                }
            }
        }
        false
    }

    /// Clears graph-utility statuses after a command completed.
    pub fn clear_gu_status(&mut self) {
        for m in self.modules.iter_mut().flatten() {
            m.gu_status = GuStatus::Default;
        }
        for p in self.inputs.iter_mut().flatten() {
            p.gu_status = GuStatus::Default;
        }
        for p in self.outputs.iter_mut().flatten() {
            p.gu_status = GuStatus::Default;
        }
        for p in self.ctrl_ports.iter_mut().flatten() {
            p.gu_status = GuStatus::Default;
        }
        for sg in &mut self.subgraphs {
            sg.gu_status = GuStatus::Default;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::node::ModuleCaps;

    fn spec(iid: u32, ins: u32, outs: u32) -> ModuleSpec {
        ModuleSpec {
            instance_id: iid,
            module_id: 0x0700_2000,
            serial_num: iid,
            max_inputs: ins,
            max_outputs: outs,
            min_outputs: outs.min(1),
            caps: ModuleCaps::default(),
        }
    }

    fn chain(n: u32) -> (Topology, Vec<ModuleId>) {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        let mut ids = Vec::new();
        for i in 0..n {
            let ins = u32::from(i != 0);
            let outs = u32::from(i + 1 != n);
            ids.push(t.add_module(1, &spec(i + 10, ins, outs), None).unwrap());
        }
        for w in ids.windows(2) {
            let o = t.add_output_port(w[0], 1).unwrap();
            let i = t.add_input_port(w[1], 2).unwrap();
            t.connect(o, i).unwrap();
        }
        (t, ids)
    }

    #[test]
    fn test_sorted_follows_links() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        // Serial numbers deliberately inverted against data order.
        let sink = t.add_module(1, &spec(1, 1, 0), None).unwrap();
        let src = t.add_module(1, &spec(2, 0, 1), None).unwrap();
        let o = t.add_output_port(src, 1).unwrap();
        let i = t.add_input_port(sink, 2).unwrap();
        t.connect(o, i).unwrap();
        assert_eq!(t.sorted(), &[src, sink]);
    }

    #[test]
    fn test_serial_breaks_ties() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        let b = t.add_module(1, &spec(5, 0, 0), None).unwrap();
        let a = t.add_module(1, &spec(3, 0, 0), None).unwrap();
        t.sort().unwrap();
        assert_eq!(t.sorted(), &[a, b]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        let a = t.add_module(1, &spec(1, 1, 1), None).unwrap();
        let b = t.add_module(1, &spec(2, 1, 1), None).unwrap();
        let ao = t.add_output_port(a, 1).unwrap();
        let bi = t.add_input_port(b, 2).unwrap();
        t.connect(ao, bi).unwrap();
        let bo = t.add_output_port(b, 1).unwrap();
        let ai = t.add_input_port(a, 2).unwrap();
        assert_eq!(t.connect(bo, ai), Err(SpfError::BadParam));
    }

    #[test]
    fn test_port_limits() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        let src = t.add_module(1, &spec(1, 0, 1), None).unwrap();
        assert_eq!(t.add_input_port(src, 2), Err(SpfError::BadParam));
        t.add_output_port(src, 1).unwrap();
        assert_eq!(t.add_output_port(src, 3), Err(SpfError::BadParam));
    }

    #[test]
    fn test_unknown_subgraph_and_duplicates() {
        let mut t = Topology::new(0x100, 1);
        assert_eq!(t.add_module(9, &spec(1, 0, 0), None), Err(SpfError::NotFound));
        t.add_subgraph(1, 0).unwrap();
        assert_eq!(t.add_subgraph(1, 0), Err(SpfError::BadParam));
        t.add_module(1, &spec(1, 0, 0), None).unwrap();
        assert_eq!(t.add_module(1, &spec(1, 0, 0), None), Err(SpfError::BadParam));
    }

    #[test]
    fn test_destroy_module_unlinks_peer() {
        let (mut t, ids) = chain(3);
        t.destroy_module(ids[1]).unwrap();
        assert_eq!(t.module_count(), 2);
        let first_out = t.module(ids[0]).unwrap().outputs[0];
        assert!(t.output(first_out).unwrap().conn_in.is_none());
        let last_in = t.module(ids[2]).unwrap().inputs[0];
        assert!(t.input(last_in).unwrap().conn_out.is_none());
        assert!(!t.sorted().contains(&ids[1]));
    }

    #[test]
    fn test_remove_subgraph() {
        let (mut t, _) = chain(3);
        t.remove_subgraph(1).unwrap();
        assert_eq!(t.module_count(), 0);
        assert!(t.subgraph(1).is_none());
        assert_eq!(t.remove_subgraph(1), Err(SpfError::NotFound));
    }

    #[test]
    fn test_sg_boundary_flags() {
        let mut t = Topology::new(0x100, 1);
        t.add_subgraph(1, 0).unwrap();
        t.add_subgraph(2, 0).unwrap();
        let a = t.add_module(1, &spec(1, 0, 1), None).unwrap();
        let b = t.add_module(2, &spec(2, 1, 0), None).unwrap();
        let o = t.add_output_port(a, 1).unwrap();
        let i = t.add_input_port(b, 2).unwrap();
        t.connect(o, i).unwrap();
        assert!(t.is_output_at_sg_boundary(o));
        assert!(t.module(a).unwrap().flags.is_ds_at_sg_or_cntr_boundary);
        assert!(t.module(b).unwrap().flags.is_us_at_sg_or_cntr_boundary);
    }

    #[test]
    fn test_find_ports() {
        let (t, ids) = chain(2);
        let o = t.module(ids[0]).unwrap().outputs[0];
        assert_eq!(t.find_output(10, 1), Some(o));
        assert_eq!(t.find_input(11, 2), Some(t.module(ids[1]).unwrap().inputs[0]));
        assert_eq!(t.find_input(11, 7), None);
    }
}
