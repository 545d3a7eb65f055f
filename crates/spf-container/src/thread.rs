//! Worker thread and the handle other threads talk to a container through.
//!
//! The worker owns the container. It blocks on every channel whose bit is set
//! in the listen mask and dispatches each wake-up to the handler of that bit.
//! A configuration that changes the stack size hands the container over to a
//! freshly spawned worker; the old one exits right after the handoff and is
//! joined by its successor.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Select, Sender, bounded, unbounded};
use parking_lot::Mutex;
use spf_config::PortAddr;
use spf_core::{SgOps, SpfError, SpfResult};
use tracing::{debug, error, info, warn};

use crate::base::{ASYNC_BIT, CMD_BIT, GP_BIT};
use crate::container::{Container, Wake};
use crate::error::{CuError, CuResult};
use crate::msg::{CntrMsg, ContainerSnapshot, DataMsg, GraphMgmtCmd, PeerHandle};
use crate::ops::ContainerOps;

type Handoff<O> = (Box<Container<O>>, Option<JoinHandle<()>>);

/// Starts the worker thread of `c`.
pub fn launch<O: ContainerOps>(c: Container<O>) -> CuResult<ContainerHandle> {
    let handle = ContainerHandle {
        cntr_id: c.cu.cntr_id,
        tx: c.chans.cmd_tx.clone(),
        gp_tx: c.chans.gp_tx.clone(),
        join: Arc::clone(&c.join_slot),
    };
    spawn_worker(Box::new(c)).map_err(|(_, e)| e)?;
    Ok(handle)
}

/// Spawns a worker and hands `c` to it. On failure the container comes back
/// with its thread bookkeeping restored.
fn spawn_worker<O: ContainerOps>(mut c: Box<Container<O>>) -> Result<(), (Box<Container<O>>, CuError)> {
    let prev_id = c.cu.thread.thread_id;
    let was_launched = c.cu.thread.launched;
    c.cu.thread.thread_id = prev_id.wrapping_add(1);
    c.cu.thread.thread_id_to_exit = was_launched.then_some(prev_id);

    let name = c.cu.thread.name.clone();
    let stack = c.cu.thread.spawn_stack_size();
    let (hand_tx, hand_rx) = bounded::<Handoff<O>>(1);
    let spawned = thread::Builder::new()
        .name(name.clone())
        .stack_size(stack)
        .spawn(move || {
            if let Ok((c, prev)) = hand_rx.recv() {
                worker_entry(c, prev);
            }
        });

    match spawned {
        Ok(handle) => {
            let t = &mut c.cu.thread;
            t.actual_stack_size = t.stack_size;
            t.actual_root_stack_size = t.root_stack_size;
            t.launched = true;
            info!(
                log_id = c.cu.log_id,
                thread = %name,
                thread_id = t.thread_id,
                stack,
                "cu: worker launched"
            );
            let prev = c.join_slot.lock().replace(handle);
            // the receiver only goes away if the new thread died before reading
            let _ = hand_tx.send((c, prev));
            Ok(())
        }
        Err(source) => {
            c.cu.thread.thread_id = prev_id;
            c.cu.thread.thread_id_to_exit = None;
            error!(log_id = c.cu.log_id, thread = %name, error = %source, "cu: worker spawn failed");
            Err((c, CuError::Spawn { name, source }))
        }
    }
}

fn worker_entry<O: ContainerOps>(mut c: Box<Container<O>>, prev: Option<JoinHandle<()>>) {
    if let Some(prev) = prev {
        if prev.join().is_err() {
            warn!(log_id = c.cu.log_id, "cu: previous worker panicked");
        }
    }
    if let Some(old) = c.cu.thread.thread_id_to_exit.take() {
        debug!(log_id = c.cu.log_id, old, "cu: previous worker exited");
    }
    worker_main(c);
}

enum Source {
    Cmd(Receiver<CntrMsg>),
    Signal(u32, Receiver<()>),
    Data(u32, Receiver<DataMsg>),
}

fn sources<O: ContainerOps>(c: &Container<O>) -> Vec<Source> {
    let mut out = Vec::new();
    if c.cu.is_listening(CMD_BIT) {
        out.push(Source::Cmd(c.chans.cmd_rx.clone()));
    }
    if c.cu.is_listening(ASYNC_BIT) {
        out.push(Source::Signal(ASYNC_BIT, c.chans.async_rx.clone()));
    }
    if c.cu.is_listening(GP_BIT) {
        out.push(Source::Signal(GP_BIT, c.chans.gp_rx.clone()));
    }
    for p in c.cu.ext.inputs.values() {
        if let (Some(bit), Some(rx)) = (p.bit, &p.data_rx) {
            if c.cu.is_listening(bit) {
                out.push(Source::Data(bit, rx.clone()));
            }
        }
    }
    out
}

fn wait(srcs: &[Source]) -> (u32, Wake) {
    let mut sel = Select::new();
    for s in srcs {
        match s {
            Source::Cmd(rx) => sel.recv(rx),
            Source::Signal(_, rx) => sel.recv(rx),
            Source::Data(_, rx) => sel.recv(rx),
        };
    }
    let oper = sel.select();
    match &srcs[oper.index()] {
        Source::Cmd(rx) => (CMD_BIT, oper.recv(rx).map_or(Wake::Closed, Wake::Cmd)),
        Source::Signal(bit, rx) => {
            let wake = match oper.recv(rx) {
                Err(_) => Wake::Closed,
                Ok(()) if *bit == ASYNC_BIT => Wake::Async,
                Ok(()) => Wake::Gp,
            };
            (*bit, wake)
        }
        Source::Data(bit, rx) => (*bit, oper.recv(rx).map_or(Wake::Closed, Wake::Data)),
    }
}

fn worker_main<O: ContainerOps>(mut c: Box<Container<O>>) {
    debug!(log_id = c.cu.log_id, variant = c.ops.name(), "cu: worker running");
    while !c.exit {
        let srcs = sources(&c);
        if srcs.is_empty() {
            warn!(log_id = c.cu.log_id, "cu: nothing to listen on, exiting");
            break;
        }
        let (bit, wake) = wait(&srcs);
        if let Err(e) = c.dispatch(bit, wake) {
            warn!(log_id = c.cu.log_id, bit, error = %e, "cu: handler failed");
        }

        let Some(ack) = c.relaunch_ack.take() else {
            continue;
        };
        let done = ack.clone();
        c.set_handle_rest(Box::new(move |c: &mut Container<O>| {
            info!(log_id = c.cu.log_id, thread_id = c.cu.thread.thread_id, "cu: relaunched worker resumed");
            let _ = done.send(Ok(()));
            Ok(())
        }));
        match spawn_worker(c) {
            Ok(()) => return,
            Err((mut back, e)) => {
                back.handle_rest = None;
                back.cu.stop_listen(ASYNC_BIT);
                while back.chans.async_rx.try_recv().is_ok() {}
                let _ = ack.send(Err(e.to_spf()));
                c = back;
            }
        }
    }
    info!(log_id = c.cu.log_id, "cu: worker exiting");
}

/// Cloneable handle to a running container.
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    cntr_id: u32,
    tx: Sender<CntrMsg>,
    gp_tx: Sender<()>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ContainerHandle {
    /// Container id.
    pub fn cntr_id(&self) -> u32 {
        self.cntr_id
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> CntrMsg) -> CuResult<T> {
        let (tx, rx) = bounded(1);
        self.tx
            .send(make(tx))
            .map_err(|_| CuError::NotRunning(self.cntr_id))?;
        rx.recv().map_err(|_| CuError::NotRunning(self.cntr_id))
    }

    fn acked(&self, make: impl FnOnce(Sender<SpfResult<()>>) -> CntrMsg) -> CuResult<()> {
        Ok(self.request(make)??)
    }

    /// Runs a graph management command.
    pub fn graph_mgmt(&self, ops: SgOps, cmd: GraphMgmtCmd) -> CuResult<()> {
        self.acked(|ack| CntrMsg::GraphMgmt { ops, cmd, ack })
    }

    /// Sets a container parameter.
    pub fn set_cntr_param(&self, param_id: u32, payload: Vec<u8>) -> CuResult<()> {
        self.acked(|ack| CntrMsg::SetCntrParam {
            param_id,
            payload,
            ack,
        })
    }

    /// Sets a module parameter.
    pub fn set_cfg(&self, miid: u32, param_id: u32, payload: Vec<u8>) -> CuResult<()> {
        self.acked(|ack| CntrMsg::SetCfg {
            miid,
            param_id,
            payload,
            ack,
        })
    }

    /// Reads a module parameter.
    pub fn get_cfg(&self, miid: u32, param_id: u32) -> CuResult<Vec<u8>> {
        Ok(self.request(|ack| CntrMsg::GetCfg {
            miid,
            param_id,
            ack,
        })??)
    }

    /// Applies a container configuration payload. Returns once a relaunched
    /// worker, if one was needed, is running.
    pub fn container_cfg(&self, payload: Vec<u8>) -> CuResult<()> {
        self.acked(|ack| CntrMsg::ContainerCfg { payload, ack })
    }

    /// Sends a global shared memory message.
    ///
    /// Blocks for the ack, so only use it when the payload asks for one.
    pub fn global_shmem(&self, dst: u32, payload: Vec<u8>) -> CuResult<()> {
        self.acked(|ack| CntrMsg::GlobalShmem { dst, payload, ack })
    }

    /// Point-in-time view.
    pub fn snapshot(&self) -> CuResult<ContainerSnapshot> {
        self.request(|ack| CntrMsg::Snapshot { ack })
    }

    /// Raises the general purpose signal.
    pub fn gp_signal(&self) -> CuResult<()> {
        self.gp_tx
            .send(())
            .map_err(|_| CuError::NotRunning(self.cntr_id))
    }

    /// Attaches a data source to the external input `port`.
    pub fn attach_source(&self, port: PortAddr) -> CuResult<Sender<DataMsg>> {
        let (data_tx, data_rx) = unbounded();
        self.acked(|ack| CntrMsg::ConnectExtIn {
            port,
            peer: None,
            data_rx,
            ack,
        })?;
        Ok(data_tx)
    }

    /// Attaches a data sink to the external output `port`.
    pub fn attach_sink(&self, port: PortAddr) -> CuResult<Receiver<DataMsg>> {
        let (data_tx, data_rx) = unbounded();
        self.acked(|ack| CntrMsg::ConnectExtOut {
            port,
            peer: None,
            data_tx,
            ack,
        })?;
        Ok(data_rx)
    }

    /// Stops the worker and waits for it.
    pub fn destroy(&self) -> CuResult<()> {
        let r = self.acked(|ack| CntrMsg::Destroy { ack });
        let handle = self.join.lock().take();
        if let Some(h) = handle {
            if h.join().is_err() {
                return Err(SpfError::Failed.into());
            }
        }
        r
    }
}

/// Links the external output `out` of `up` to the external input `inp` of
/// `down`.
pub fn connect(
    up: &ContainerHandle,
    out: PortAddr,
    down: &ContainerHandle,
    inp: PortAddr,
) -> CuResult<()> {
    let (data_tx, data_rx) = unbounded();
    up.acked(|ack| CntrMsg::ConnectExtOut {
        port: out,
        peer: Some(PeerHandle {
            cntr_id: down.cntr_id,
            tx: down.tx.clone(),
            port: inp,
        }),
        data_tx,
        ack,
    })?;
    down.acked(|ack| CntrMsg::ConnectExtIn {
        port: inp,
        peer: Some(PeerHandle {
            cntr_id: up.cntr_id,
            tx: up.tx.clone(),
            port: out,
        }),
        data_rx,
        ack,
    })
}

/// Links the external control port `a_port` of `a` to `b_port` of `b`.
/// Both containers must live in the same processor domain.
pub fn connect_ctrl(
    a: &ContainerHandle,
    a_port: PortAddr,
    b: &ContainerHandle,
    b_port: PortAddr,
) -> CuResult<()> {
    a.acked(|ack| CntrMsg::ConnectExtCtrl {
        port: a_port,
        peer: PeerHandle {
            cntr_id: b.cntr_id,
            tx: b.tx.clone(),
            port: b_port,
        },
        peer_domain_id: 0,
        ack,
    })?;
    b.acked(|ack| CntrMsg::ConnectExtCtrl {
        port: b_port,
        peer: PeerHandle {
            cntr_id: a.cntr_id,
            tx: a.tx.clone(),
            port: a_port,
        },
        peer_domain_id: 0,
        ack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{CuBase, DEFAULT_STACK_SIZE};
    use crate::generic::GenericOps;
    use crate::pm::NullPowerManager;
    use spf_config::{CfgWriter, PROP_ID_STACK_SIZE};
    use spf_core::Topology;

    fn launched() -> ContainerHandle {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 0).unwrap();
        let cu = CuBase::new(0x4000, 1, Box::new(NullPowerManager::default()));
        launch(Container::new(cu, t, GenericOps).unwrap()).unwrap()
    }

    #[test]
    fn snapshot_round_trips_through_worker() {
        let h = launched();
        let snap = h.snapshot().unwrap();
        assert_eq!(snap.cntr_id, 0x4000);
        assert_eq!(snap.sg_state(1), Some(spf_core::TopoState::Stopped));
        h.destroy().unwrap();
    }

    #[test]
    fn destroyed_container_is_not_running() {
        let h = launched();
        h.destroy().unwrap();
        assert!(matches!(h.snapshot(), Err(CuError::NotRunning(0x4000))));
    }

    #[test]
    fn stack_change_relaunches_worker() {
        let h = launched();
        let mut w = CfgWriter::new(0x4000);
        w.prop(PROP_ID_STACK_SIZE, &[DEFAULT_STACK_SIZE * 2]);
        h.container_cfg(w.finish()).unwrap();
        // the relaunched worker still answers
        assert_eq!(h.snapshot().unwrap().cntr_id, 0x4000);
        h.destroy().unwrap();
    }

    #[test]
    fn same_stack_keeps_worker() {
        let h = launched();
        let mut w = CfgWriter::new(0x4000);
        w.prop(PROP_ID_STACK_SIZE, &[DEFAULT_STACK_SIZE]);
        h.container_cfg(w.finish()).unwrap();
        h.destroy().unwrap();
    }

    fn with_ext_ctrl(cntr_id: u32, miid: u32) -> ContainerHandle {
        let mut t = Topology::new(cntr_id, 1);
        t.add_subgraph(1, 0).unwrap();
        let spec = spf_core::ModuleSpec {
            instance_id: miid,
            module_id: 0x0700_2000,
            serial_num: 0,
            max_inputs: 0,
            max_outputs: 0,
            min_outputs: 0,
            caps: spf_core::ModuleCaps::default(),
        };
        let m = t.add_module(1, &spec, None).unwrap();
        let c = t.add_ctrl_port(m, 4).unwrap();
        t.set_ext_ctrl_port(c).unwrap();
        let mut cu = CuBase::new(cntr_id, 1, Box::new(NullPowerManager::default()));
        cu.ext.add_ctrl(&t, c).unwrap();
        launch(Container::new(cu, t, GenericOps).unwrap()).unwrap()
    }

    #[test]
    fn connect_ctrl_links_both_containers() {
        let a = with_ext_ctrl(0x4000, 0x10);
        let b = with_ext_ctrl(0x5000, 0x20);
        let pa = PortAddr { module: 0x10, port: 4 };
        let pb = PortAddr { module: 0x20, port: 4 };
        connect_ctrl(&a, pa, &b, pb).unwrap();
        assert!(a.snapshot().unwrap().ctrl_port(pa).unwrap().is_linked);
        assert!(b.snapshot().unwrap().ctrl_port(pb).unwrap().is_linked);
        let missing = PortAddr { module: 0x10, port: 9 };
        assert!(connect_ctrl(&a, missing, &b, pb).is_err());
        a.destroy().unwrap();
        b.destroy().unwrap();
    }
}
