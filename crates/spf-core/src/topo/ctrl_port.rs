//! Control ports and the links between them.
//!
//! Control ports carry no data and take no part in sorting or chain
//! detection. Each one has at most one peer, either a control port of
//! another module in this container or, when `is_ext` is set, a port of
//! another container.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::error::{SpfError, SpfResult};
use crate::state::{GuStatus, TopoState};

use super::graph::Topology;
use super::node::{CtrlPort, CtrlPortId, ModuleId};

impl Topology {
    /// Adds a control port to a module.
    pub fn add_ctrl_port(&mut self, module: ModuleId, port_id: u32) -> SpfResult<CtrlPortId> {
        let id = CtrlPortId(self.ctrl_ports.len() as u32);
        let m = self.module(module).ok_or(SpfError::NotFound)?;
        if m.ctrl_ports
            .iter()
            .any(|&c| self.ctrl_port(c).is_some_and(|p| p.port_id == port_id))
        {
            return Err(SpfError::BadParam);
        }
        let m = self.module_mut(module).ok_or(SpfError::NotFound)?;
        m.ctrl_ports.push(id);
        self.ctrl_ports.push(Some(CtrlPort {
            id,
            module,
            port_id,
            peer: None,
            is_ext: false,
            state: TopoState::Stopped,
            gu_status: GuStatus::New,
        }));
        Ok(id)
    }

    /// Looks a control port up.
    #[inline]
    pub fn ctrl_port(&self, id: CtrlPortId) -> Option<&CtrlPort> {
        self.ctrl_ports.get(id.slot()).and_then(Option::as_ref)
    }

    /// Mutable control port lookup.
    #[inline]
    pub fn ctrl_port_mut(&mut self, id: CtrlPortId) -> Option<&mut CtrlPort> {
        self.ctrl_ports.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Live control ports.
    pub fn ctrl_ports(&self) -> impl Iterator<Item = &CtrlPort> {
        self.ctrl_ports.iter().flatten()
    }

    /// Finds a control port by module instance id and port id.
    pub fn find_ctrl_port(&self, instance_id: u32, port_id: u32) -> Option<CtrlPortId> {
        let m = self.module(self.module_by_instance(instance_id)?)?;
        m.ctrl_ports
            .iter()
            .copied()
            .find(|&c| self.ctrl_port(c).is_some_and(|p| p.port_id == port_id))
    }

    /// Links two control ports of different modules in this container.
    pub fn connect_ctrl(&mut self, a: CtrlPortId, b: CtrlPortId) -> SpfResult<()> {
        let pa = self.ctrl_port(a).ok_or(SpfError::NotFound)?;
        let pb = self.ctrl_port(b).ok_or(SpfError::NotFound)?;
        if pa.module == pb.module
            || pa.peer.is_some()
            || pb.peer.is_some()
            || pa.is_ext
            || pb.is_ext
        {
            return Err(SpfError::BadParam);
        }
        if let Some(p) = self.ctrl_port_mut(a) {
            p.peer = Some(b);
        }
        if let Some(p) = self.ctrl_port_mut(b) {
            p.peer = Some(a);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, "topo: ctrl link {a} <-> {b}");
        Ok(())
    }

    /// Drops the link of `id` on both ends, if any.
    pub fn disconnect_ctrl(&mut self, id: CtrlPortId) -> SpfResult<()> {
        let peer = self.ctrl_port_mut(id).ok_or(SpfError::NotFound)?.peer.take();
        if let Some(p) = peer.and_then(|p| self.ctrl_port_mut(p)) {
            p.peer = None;
        }
        Ok(())
    }

    /// Marks a control port as linked to another container.
    pub fn set_ext_ctrl_port(&mut self, id: CtrlPortId) -> SpfResult<()> {
        let port = self.ctrl_port_mut(id).ok_or(SpfError::NotFound)?;
        if port.peer.is_some() {
            return Err(SpfError::BadParam);
        }
        port.is_ext = true;
        Ok(())
    }

    /// True when the peer of an internal control port lives in another subgraph.
    pub fn is_ctrl_port_at_sg_boundary(&self, id: CtrlPortId) -> bool {
        let Some(port) = self.ctrl_port(id) else {
            return false;
        };
        let Some(peer) = port.peer.and_then(|p| self.ctrl_port(p)) else {
            return false;
        };
        match (self.module(port.module), self.module(peer.module)) {
            (Some(a), Some(b)) => a.sg_id != b.sg_id,
            _ => false,
        }
    }

    /// Control ports of a module, cloned out of the arena.
    pub fn module_ctrl_ports(&self, id: ModuleId) -> Vec<CtrlPortId> {
        self.module(id).map(|m| m.ctrl_ports.clone()).unwrap_or_default()
    }
}
