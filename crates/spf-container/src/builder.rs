//! Containers built from a [`GraphDescription`].
//!
//! Every described module is backed by a [`DescribedModule`]: a plugin that
//! accepts any format except the one it is told to reject, optionally
//! announces a different output rate, reports its threshold and load, and
//! moves input bytes to its first output.

use std::collections::BTreeMap;

use spf_config::{ContainerKind, GraphDescription, ModuleDesc, PortAddr};
use spf_core::{
    CapiModule, GlobalShmem, InPortId, MediaFormat, ModuleCaps, ModuleSpec, OutPortId, SpfError,
    SpfResult, Topology,
};
use tracing::{debug, info};

use crate::base::{CuBase, DEFAULT_STACK_SIZE};
use crate::container::Container;
use crate::error::CuResult;
use crate::generic::{GenericOps, SignalOps};
use crate::msg::GraphMgmtCmd;
use crate::ops::ContainerOps;
use crate::pm::PowerManager;
use crate::thread::{ContainerHandle, launch};

/// Plugin standing in for a described module.
#[derive(Debug, Default)]
pub struct DescribedModule {
    miid: u32,
    threshold: u32,
    kpps: u32,
    output_sample_rate: Option<u32>,
    rejects_sample_rate: Option<u32>,
    input_fmt: Option<MediaFormat>,
    params: BTreeMap<u32, Vec<u8>>,
    shmem: Vec<GlobalShmem>,
}

impl DescribedModule {
    /// Plugin for `desc`.
    pub fn new(desc: &ModuleDesc) -> Self {
        Self {
            miid: desc.instance_id,
            threshold: desc.threshold,
            kpps: desc.kpps,
            output_sample_rate: desc.output_sample_rate,
            rejects_sample_rate: desc.rejects_sample_rate,
            ..Self::default()
        }
    }

    /// Global shared memory messages received so far.
    pub fn shmem(&self) -> &[GlobalShmem] {
        &self.shmem
    }
}

impl CapiModule for DescribedModule {
    fn set_input_media_format(&mut self, _port_index: u32, fmt: &MediaFormat) -> SpfResult<()> {
        if fmt.is_pcm() && self.rejects_sample_rate == Some(fmt.pcm.sample_rate) {
            return Err(SpfError::Unsupported);
        }
        self.input_fmt = Some(fmt.clone());
        Ok(())
    }

    fn output_media_format(&self, _port_index: u32) -> Option<MediaFormat> {
        let mut fmt = self.input_fmt.clone()?;
        if let Some(sr) = self.output_sample_rate {
            fmt.pcm.sample_rate = sr;
        }
        Some(fmt)
    }

    fn port_threshold(&self, _is_input: bool, _port_index: u32) -> Option<u32> {
        (self.threshold > 1).then_some(self.threshold)
    }

    fn set_param(&mut self, param_id: u32, payload: &[u8]) -> SpfResult<()> {
        self.params.insert(param_id, payload.to_vec());
        Ok(())
    }

    fn get_param(&mut self, param_id: u32, out: &mut Vec<u8>) -> SpfResult<()> {
        let p = self.params.get(&param_id).ok_or(SpfError::NotFound)?;
        out.extend_from_slice(p);
        Ok(())
    }

    fn kpps(&self) -> u32 {
        self.kpps
    }

    fn handle_global_shmem(&mut self, msg: &GlobalShmem) -> SpfResult<()> {
        debug!(miid = self.miid, shmem_id = msg.shmem_id, "module: global shmem received");
        self.shmem.push(*msg);
        Ok(())
    }

    /// Sinks consume everything. Other modules gather all inputs on output 0.
    fn process(&mut self, inputs: &mut [Vec<u8>], outputs: &mut [Vec<u8>]) -> SpfResult<()> {
        match outputs.first_mut() {
            Some(out) => {
                for inp in inputs.iter_mut() {
                    out.append(inp);
                }
            }
            None => inputs.iter_mut().for_each(Vec::clear),
        }
        Ok(())
    }
}

fn module_spec(index: usize, m: &ModuleDesc) -> ModuleSpec {
    ModuleSpec {
        instance_id: m.instance_id,
        module_id: m.module_id,
        serial_num: index as u32,
        max_inputs: m.inputs.len() as u32,
        max_outputs: m.outputs.len() as u32,
        min_outputs: 0,
        caps: ModuleCaps {
            inplace: m.inplace,
            requires_data_buf: m.requires_data_buffering,
            dynamic_inplace: m.dynamic_inplace,
            global_shmem: m.global_shmem,
            ..ModuleCaps::default()
        },
    }
}

/// Builds the topology of `desc`, sorted, with external data and control
/// ports marked.
///
/// Returns the external inputs (with the format they announce) and the
/// external outputs alongside.
pub fn build_topology(
    desc: &GraphDescription,
) -> CuResult<(Topology, Vec<(InPortId, Option<MediaFormat>)>, Vec<OutPortId>)> {
    let id = desc.container.id;
    let mut topo = Topology::new(id, id);
    topo.flags.is_signal_triggered = desc.container.kind == ContainerKind::Signal;

    for sg in &desc.subgraphs {
        topo.add_subgraph(sg.id, sg.sid)?;
    }
    let mut disabled = Vec::new();
    for (index, m) in desc.modules.iter().enumerate() {
        let capi = Box::new(DescribedModule::new(m));
        let mid = topo.add_module(m.subgraph, &module_spec(index, m), Some(capi))?;
        for &p in &m.inputs {
            topo.add_input_port(mid, p)?;
        }
        for &p in &m.outputs {
            topo.add_output_port(mid, p)?;
        }
        for &p in &m.ctrl_ports {
            topo.add_ctrl_port(mid, p)?;
        }
        if m.disabled {
            disabled.push(mid);
        }
    }
    for l in &desc.links {
        let out = topo
            .find_output(l.from.module, l.from.port)
            .ok_or(SpfError::NotFound)?;
        let inp = topo.find_input(l.to.module, l.to.port).ok_or(SpfError::NotFound)?;
        topo.connect(out, inp)?;
    }
    for l in &desc.ctrl_links {
        let a = topo
            .find_ctrl_port(l.peer_1.module, l.peer_1.port)
            .ok_or(SpfError::NotFound)?;
        let b = topo
            .find_ctrl_port(l.peer_2.module, l.peer_2.port)
            .ok_or(SpfError::NotFound)?;
        topo.connect_ctrl(a, b)?;
    }
    for &PortAddr { module, port } in &desc.external_ctrl_ports {
        let c = topo.find_ctrl_port(module, port).ok_or(SpfError::NotFound)?;
        topo.set_ext_ctrl_port(c)?;
    }

    let mut ext_ins = Vec::new();
    for e in &desc.external_inputs {
        let i = topo.find_input(e.module, e.port).ok_or(SpfError::NotFound)?;
        topo.set_ext_input(i)?;
        ext_ins.push((i, e.format.map(|f| f.to_media_format())));
    }
    let mut ext_outs = Vec::new();
    for &PortAddr { module, port } in &desc.external_outputs {
        let o = topo.find_output(module, port).ok_or(SpfError::NotFound)?;
        topo.set_ext_output(o)?;
        ext_outs.push(o);
    }
    topo.sort()?;
    for mid in disabled {
        topo.set_module_disabled(mid, true)?;
    }
    Ok((topo, ext_ins, ext_outs))
}

/// Builds a container for `desc` without starting a worker.
pub fn build_container<O: ContainerOps>(
    desc: &GraphDescription,
    power: Box<dyn PowerManager>,
    ops: O,
) -> CuResult<Container<O>> {
    let (mut topo, ext_ins, ext_outs) = build_topology(desc)?;
    let id = desc.container.id;
    let mut cu = CuBase::new(id, id, power);
    cu.cfg = desc.container_config();
    cu.thread.stack_size = match cu.cfg.stack_size {
        Some(s) if s != 0 => s,
        _ => DEFAULT_STACK_SIZE,
    };
    if let Some(p) = cu.cfg.thread_priority {
        cu.thread.priority = p;
    }

    for (i, fmt) in ext_ins {
        cu.ext.add_input(&topo, i)?;
        if let Some(fmt) = fmt {
            topo.set_ext_in_media_fmt(i, fmt.clone())?;
            if let Some(p) = cu.ext.inputs.get_mut(&i) {
                p.media_fmt = fmt;
            }
        }
    }
    for o in ext_outs {
        cu.ext.add_output(&topo, o)?;
    }
    let ext_ctrl: Vec<_> = topo.ctrl_ports().filter(|p| p.is_ext).map(|p| p.id).collect();
    for c in ext_ctrl {
        cu.ext.add_ctrl(&topo, c)?;
    }
    info!(
        log_id = id,
        variant = ops.name(),
        modules = topo.module_count(),
        subgraphs = desc.subgraphs.len(),
        "cu: container built"
    );
    Container::new(cu, topo, ops)
}

/// Command naming every subgraph, external data port and external control
/// port of `desc`.
pub fn graph_cmd_all(desc: &GraphDescription) -> GraphMgmtCmd {
    GraphMgmtCmd {
        sg_ids: desc.subgraphs.iter().map(|sg| sg.id).collect(),
        ext_inputs: desc.external_inputs.iter().map(|e| e.addr()).collect(),
        ext_outputs: desc.external_outputs.clone(),
        ext_ctrl_ports: desc.external_ctrl_ports.clone(),
        ..GraphMgmtCmd::default()
    }
}

/// Builds and launches the container variant `desc` asks for.
pub fn launch_described(
    desc: &GraphDescription,
    power: Box<dyn PowerManager>,
) -> CuResult<ContainerHandle> {
    match desc.container.kind {
        ContainerKind::Generic => launch(build_container(desc, power, GenericOps)?),
        ContainerKind::Signal => launch(build_container(desc, power, SignalOps)?),
    }
}
