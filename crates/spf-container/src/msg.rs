//! Messages a container thread receives.
//!
//! Everything that reaches a container goes through its command queue or
//! one of its external input data queues. Commands that expect an answer
//! carry the sender half of a reply channel.

use crossbeam_channel::{Receiver, Sender};
use spf_config::PortAddr;
use spf_core::{DownstreamInfo, FrameLength, IcbBuffering, MediaFormat, RtmPacket, SgOps};
use spf_core::{SpfResult, TopoState};

use crate::event_flags::FwkEvent;

/// Reply channel for commands acknowledged with a result code.
pub type Ack = Sender<SpfResult<()>>;

/// A data link named by a CLOSE command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataLink {
    /// Producer side.
    pub src: PortAddr,
    /// Consumer side.
    pub dst: PortAddr,
}

/// A control link named by a CLOSE command. Both ends live in this container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtrlLink {
    /// One end.
    pub peer_1: PortAddr,
    /// The other end.
    pub peer_2: PortAddr,
}

/// Payload of a graph management command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphMgmtCmd {
    /// Subgraphs to operate on.
    pub sg_ids: Vec<u32>,
    /// External inputs to operate on.
    pub ext_inputs: Vec<PortAddr>,
    /// External outputs to operate on.
    pub ext_outputs: Vec<PortAddr>,
    /// Links to tear down (CLOSE only).
    pub data_links: Vec<DataLink>,
    /// External control ports to operate on.
    pub ext_ctrl_ports: Vec<PortAddr>,
    /// Control links to tear down (CLOSE only).
    pub ctrl_links: Vec<CtrlLink>,
}

impl GraphMgmtCmd {
    /// Command naming only subgraphs.
    pub fn for_subgraphs(sg_ids: &[u32]) -> Self {
        Self {
            sg_ids: sg_ids.to_vec(),
            ..Self::default()
        }
    }

    /// True if the command names a subgraph.
    pub fn names_sg(&self, sg_id: u32) -> bool {
        self.sg_ids.contains(&sg_id)
    }

    /// True if the command names any subgraph, data port or data link.
    /// A command that only names control ports and control links leaves the
    /// data path alone.
    pub fn touches_data_ports(&self) -> bool {
        !self.sg_ids.is_empty()
            || !self.ext_inputs.is_empty()
            || !self.ext_outputs.is_empty()
            || !self.data_links.is_empty()
    }
}

/// Buffer travelling over an external data link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataMsg {
    /// Buffer id from the sender's allocator, 0 from plain sources.
    pub buf_id: u32,
    /// Payload bytes, all channels.
    pub bytes: Vec<u8>,
    /// Format announced ahead of the payload.
    pub media_fmt: Option<MediaFormat>,
    /// Last buffer of the stream.
    pub eos: bool,
}

/// A port property exchanged between peer containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerProperty {
    /// Sent downstream: a real-time source exists upstream.
    IsUpstreamRt(bool),
    /// Sent upstream: a real-time sink exists downstream.
    IsDownstreamRt(bool),
    /// Sent upstream: state of the downstream port.
    State(TopoState),
}

/// The far end of an external link.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// Peer container id.
    pub cntr_id: u32,
    /// Peer command queue.
    pub tx: Sender<CntrMsg>,
    /// Peer port.
    pub port: PortAddr,
}

/// Port state as reported by a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSnapshot {
    /// Port address.
    pub addr: PortAddr,
    /// Downgraded port state.
    pub state: TopoState,
    /// Connected to another container.
    pub is_ext: bool,
    /// Bytes buffered on the port.
    pub buffered: u32,
    /// Sample rate of the port format, zero when unknown.
    pub sample_rate: u32,
    /// Channel count of the port format, zero when unknown.
    pub channels: u32,
    /// Upstream real-time flag.
    pub is_upstream_rt: bool,
    /// Downstream real-time flag.
    pub is_downstream_rt: bool,
    /// Bytes delivered to the peer, external outputs only.
    pub delivered: u64,
}

/// Control port state as reported by a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtrlPortSnapshot {
    /// Port address.
    pub addr: PortAddr,
    /// Downgraded port state.
    pub state: TopoState,
    /// Linked to another container.
    pub is_ext: bool,
    /// Linked to a peer, inside or outside the container.
    pub is_linked: bool,
}

/// Point-in-time view of a container.
#[derive(Clone, Debug, Default)]
pub struct ContainerSnapshot {
    /// Container id.
    pub cntr_id: u32,
    /// Any subgraph is started.
    pub is_started: bool,
    /// Subgraph ids with their states.
    pub subgraphs: Vec<(u32, TopoState)>,
    /// Input ports.
    pub inputs: Vec<PortSnapshot>,
    /// Output ports.
    pub outputs: Vec<PortSnapshot>,
    /// Control ports.
    pub ctrl_ports: Vec<CtrlPortSnapshot>,
    /// Buffering chosen for each external output.
    pub ext_out_buffering: Vec<(PortAddr, IcbBuffering)>,
    /// Container frame length.
    pub frame_len: FrameLength,
    /// Trigger period in microseconds.
    pub period_us: u32,
    /// Processing duration in microseconds.
    pub proc_duration_us: u32,
    /// Framework events the last command raised.
    pub events: FwkEvent,
    /// Channels the worker currently waits on.
    pub curr_chan_mask: u32,
    /// Real-time monitor packets collected since the last snapshot.
    pub rtm: Vec<RtmPacket>,
}

impl ContainerSnapshot {
    /// State of the input `addr`.
    pub fn input_state(&self, addr: PortAddr) -> Option<TopoState> {
        self.inputs.iter().find(|p| p.addr == addr).map(|p| p.state)
    }

    /// State of the output `addr`.
    pub fn output_state(&self, addr: PortAddr) -> Option<TopoState> {
        self.outputs.iter().find(|p| p.addr == addr).map(|p| p.state)
    }

    /// Control port `addr`.
    pub fn ctrl_port(&self, addr: PortAddr) -> Option<&CtrlPortSnapshot> {
        self.ctrl_ports.iter().find(|p| p.addr == addr)
    }

    /// State of subgraph `id`.
    pub fn sg_state(&self, id: u32) -> Option<TopoState> {
        self.subgraphs
            .iter()
            .find(|(sg, _)| *sg == id)
            .map(|&(_, s)| s)
    }
}

/// Message on a container's command queue.
#[derive(Debug)]
pub enum CntrMsg {
    /// Graph management operation.
    GraphMgmt {
        /// Operations to apply.
        ops: SgOps,
        /// Entities named by the command.
        cmd: GraphMgmtCmd,
        /// Reply.
        ack: Ack,
    },
    /// Container parameter.
    SetCntrParam {
        /// Parameter id.
        param_id: u32,
        /// Payload.
        payload: Vec<u8>,
        /// Reply.
        ack: Ack,
    },
    /// Module parameter, routed to the module untouched.
    SetCfg {
        /// Module instance id.
        miid: u32,
        /// Parameter id.
        param_id: u32,
        /// Payload.
        payload: Vec<u8>,
        /// Reply.
        ack: Ack,
    },
    /// Module parameter query.
    GetCfg {
        /// Module instance id.
        miid: u32,
        /// Parameter id.
        param_id: u32,
        /// Reply with the payload.
        ack: Sender<SpfResult<Vec<u8>>>,
    },
    /// Container configuration property chain.
    ContainerCfg {
        /// Raw payload.
        payload: Vec<u8>,
        /// Reply.
        ack: Ack,
    },
    /// Attach a downstream peer to an external output.
    ConnectExtOut {
        /// Own port.
        port: PortAddr,
        /// Downstream peer, `None` for a plain data sink.
        peer: Option<PeerHandle>,
        /// Data queue into the peer.
        data_tx: Sender<DataMsg>,
        /// Reply.
        ack: Ack,
    },
    /// Attach an upstream peer to an external input.
    ConnectExtIn {
        /// Own port.
        port: PortAddr,
        /// Upstream peer, `None` for a plain data source.
        peer: Option<PeerHandle>,
        /// Data queue from the peer.
        data_rx: Receiver<DataMsg>,
        /// Reply.
        ack: Ack,
    },
    /// Link an external control port to a port of another container.
    ConnectExtCtrl {
        /// Own port.
        port: PortAddr,
        /// Peer container and port.
        peer: PeerHandle,
        /// Processor domain of the peer, 0 when it is local.
        peer_domain_id: u32,
        /// Reply.
        ack: Ack,
    },
    /// Downstream peer announces its frame length and flags.
    IcbInfoFromDownstream {
        /// Own external output.
        port: PortAddr,
        /// Downstream description.
        info: DownstreamInfo,
    },
    /// Peer announces a port property.
    PeerProperty {
        /// Own external port the property arrives on.
        port: PortAddr,
        /// Property.
        prop: PeerProperty,
    },
    /// Global shared memory announcement or release.
    GlobalShmem {
        /// Destination container id.
        dst: u32,
        /// 20-byte payload.
        payload: Vec<u8>,
        /// Reply, not sent when the payload says no ack is required.
        ack: Ack,
    },
    /// State query.
    Snapshot {
        /// Reply.
        ack: Sender<ContainerSnapshot>,
    },
    /// Stop the worker.
    Destroy {
        /// Reply.
        ack: Ack,
    },
}
