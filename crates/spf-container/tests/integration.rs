//! Integration tests for spf-container.
//!
//! Launches containers on their worker threads and drives them through the
//! command queue only: subgraph lifecycle with power votes, buffering
//! negotiated between two linked containers, data moving across a link,
//! signal triggered processing and the parameter paths.

use std::time::Duration;

use spf_config::{
    CfgWriter, ContainerKind, ExtInputDesc, GraphDescription, LinkDesc, ModuleDesc, PROP_ID_FRAME_SIZE,
    PcmDesc, PortAddr, SubgraphDesc,
};
use spf_container::{
    CNTR_PARAM_ID_PROC_DURATION, ContainerHandle, CuError, DataMsg, FwkEvent, NullPowerManager,
    PmRequest, RecordingPowerManager, connect, graph_cmd_all, launch_described,
};
use spf_core::{MediaFormat, SgOps, SpfError, TopoState};

const TIMEOUT: Duration = Duration::from_secs(5);

const FIRST_IN: PortAddr = PortAddr { module: 0x10, port: 2 };
const FIRST_OUT: PortAddr = PortAddr { module: 0x10, port: 1 };
const SECOND_IN: PortAddr = PortAddr { module: 0x11, port: 2 };
const SECOND_OUT: PortAddr = PortAddr { module: 0x11, port: 1 };

/// Two SISO modules in one subgraph, external on both ends.
fn chain(id: u32, kind: ContainerKind, frame_us: u32, format: Option<PcmDesc>) -> GraphDescription {
    let mut g = GraphDescription::default();
    g.container.id = id;
    g.container.kind = kind;
    g.container.frame_size_us = Some(frame_us);
    g.subgraphs.push(SubgraphDesc { id: 1, sid: 0 });
    for miid in [0x10, 0x11] {
        g.modules.push(ModuleDesc {
            instance_id: miid,
            module_id: 0x0700_2000,
            subgraph: 1,
            inputs: vec![2],
            outputs: vec![1],
            kpps: 5000,
            global_shmem: miid == 0x11,
            ..ModuleDesc::default()
        });
    }
    g.links.push(LinkDesc {
        from: FIRST_OUT,
        to: SECOND_IN,
    });
    g.external_inputs.push(ExtInputDesc {
        module: FIRST_IN.module,
        port: FIRST_IN.port,
        format,
    });
    g.external_outputs.push(SECOND_OUT);
    g
}

fn stereo_48k() -> Option<PcmDesc> {
    Some(PcmDesc {
        sample_rate: 48000,
        bits_per_sample: 16,
        channels: 2,
    })
}

fn start(h: &ContainerHandle, g: &GraphDescription) {
    h.graph_mgmt(SgOps::PREPARE, graph_cmd_all(g)).unwrap();
    h.graph_mgmt(SgOps::START, graph_cmd_all(g)).unwrap();
}

// ============================================================================
// Subgraph lifecycle
// ============================================================================

#[test]
fn test_prepare_start_stop() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let (pm, log) = RecordingPowerManager::new();
    let h = launch_described(&g, Box::new(pm)).unwrap();

    h.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&g)).unwrap();
    let snap = h.snapshot().unwrap();
    assert_eq!(snap.sg_state(1), Some(TopoState::Prepared));
    assert!(!snap.is_started);
    assert_eq!(snap.frame_len.frame_len_us, 1000);

    h.graph_mgmt(SgOps::START, graph_cmd_all(&g)).unwrap();
    let snap = h.snapshot().unwrap();
    assert!(snap.is_started);
    assert!(snap.events.intersects(FwkEvent::CNTR_RUN_STATE_CHANGE));
    assert_eq!(snap.output_state(FIRST_OUT), Some(TopoState::Started));
    assert_eq!(snap.input_state(SECOND_IN), Some(TopoState::Started));
    assert!(log.lock().iter().any(|r| matches!(
        r,
        PmRequest::Clock { vote, blocking: false } if vote.kpps == 10
    )));

    h.graph_mgmt(SgOps::STOP, graph_cmd_all(&g)).unwrap();
    let snap = h.snapshot().unwrap();
    assert!(!snap.is_started);
    assert!(snap.events.intersects(FwkEvent::CNTR_RUN_STATE_CHANGE));
    assert_eq!(snap.sg_state(1), Some(TopoState::Stopped));
    assert_eq!(snap.input_state(SECOND_IN), Some(TopoState::Stopped));
    assert!(log.lock().iter().any(|r| matches!(r, PmRequest::ClockRelease { .. })));

    h.destroy().unwrap();
}

#[test]
fn test_close_removes_subgraph() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    start(&h, &g);
    h.graph_mgmt(SgOps::STOP, graph_cmd_all(&g)).unwrap();
    h.graph_mgmt(SgOps::CLOSE, graph_cmd_all(&g)).unwrap();
    let snap = h.snapshot().unwrap();
    assert!(snap.subgraphs.is_empty());
    assert!(snap.inputs.is_empty());
    assert!(snap.ext_out_buffering.is_empty());
    h.destroy().unwrap();
}

#[test]
fn test_unknown_subgraph_is_skipped() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    let mut cmd = graph_cmd_all(&g);
    cmd.sg_ids.push(99);
    h.graph_mgmt(SgOps::PREPARE, cmd).unwrap();
    assert_eq!(h.snapshot().unwrap().sg_state(1), Some(TopoState::Prepared));
    h.destroy().unwrap();
}

// ============================================================================
// Linked containers
// ============================================================================

#[test]
fn test_icb_five_ms_into_one_ms_signal() {
    let up_desc = chain(0x4000, ContainerKind::Generic, 5000, stereo_48k());
    let down_desc = chain(0x4001, ContainerKind::Signal, 1000, None);
    let up = launch_described(&up_desc, Box::new(NullPowerManager::default())).unwrap();
    let down = launch_described(&down_desc, Box::new(NullPowerManager::default())).unwrap();
    connect(&up, SECOND_OUT, &down, FIRST_IN).unwrap();

    // downstream learns its frame length first and tells upstream
    down.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&down_desc)).unwrap();
    up.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&up_desc)).unwrap();

    let snap = up.snapshot().unwrap();
    let (_, b) = snap
        .ext_out_buffering
        .iter()
        .find(|(addr, _)| *addr == SECOND_OUT)
        .copied()
        .unwrap();
    assert_eq!(b.num_reg_bufs, 5);
    assert_eq!(b.num_reg_prebufs, 0);

    up.destroy().unwrap();
    down.destroy().unwrap();
}

#[test]
fn test_data_crosses_link() {
    let up_desc = chain(0x4000, ContainerKind::Generic, 1000, None);
    let down_desc = chain(0x4001, ContainerKind::Generic, 1000, None);
    let up = launch_described(&up_desc, Box::new(NullPowerManager::default())).unwrap();
    let down = launch_described(&down_desc, Box::new(NullPowerManager::default())).unwrap();
    connect(&up, SECOND_OUT, &down, FIRST_IN).unwrap();
    let source = up.attach_source(FIRST_IN).unwrap();
    let sink = down.attach_sink(SECOND_OUT).unwrap();
    start(&down, &down_desc);
    start(&up, &up_desc);

    source
        .send(DataMsg {
            bytes: vec![7u8; 192],
            media_fmt: Some(MediaFormat::pcm(48000, 16, 2)),
            ..DataMsg::default()
        })
        .unwrap();
    let out = sink.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(out.bytes, vec![7u8; 192]);
    assert_eq!(out.media_fmt.map(|f| f.pcm.sample_rate), Some(48000));
    assert_ne!(out.buf_id, 0);

    let snap = up.snapshot().unwrap();
    let delivered = snap.outputs.iter().find(|p| p.addr == SECOND_OUT).unwrap().delivered;
    assert_eq!(delivered, 192);

    up.destroy().unwrap();
    down.destroy().unwrap();
}

#[test]
fn test_signal_container_runs_on_tick() {
    let g = chain(0x4000, ContainerKind::Signal, 1000, None);
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    let source = h.attach_source(FIRST_IN).unwrap();
    let sink = h.attach_sink(SECOND_OUT).unwrap();
    start(&h, &g);

    source
        .send(DataMsg {
            bytes: vec![1u8; 192],
            media_fmt: Some(MediaFormat::pcm(48000, 16, 2)),
            ..DataMsg::default()
        })
        .unwrap();
    // buffered until the tick
    assert!(sink.recv_timeout(Duration::from_millis(50)).is_err());
    h.gp_signal().unwrap();
    let out = sink.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(out.bytes.len(), 192);
    h.destroy().unwrap();
}

// ============================================================================
// Parameters and configuration
// ============================================================================

#[test]
fn test_module_params_round_trip() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    h.set_cfg(0x10, 0x0800_1008, vec![1, 2, 3, 4]).unwrap();
    assert_eq!(h.get_cfg(0x10, 0x0800_1008).unwrap(), [1, 2, 3, 4]);
    assert!(matches!(
        h.get_cfg(0x10, 0x0800_1007),
        Err(CuError::Spf(SpfError::NotFound))
    ));
    h.destroy().unwrap();
}

#[test]
fn test_container_cfg_changes_frame_len() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    h.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&g)).unwrap();
    let mut w = CfgWriter::new(0x4000);
    w.prop(PROP_ID_FRAME_SIZE, &[1, 2000]);
    h.container_cfg(w.finish()).unwrap();
    let snap = h.snapshot().unwrap();
    assert_eq!(snap.frame_len.frame_len_us, 2000);
    assert_eq!(snap.period_us, 2000);
    h.destroy().unwrap();
}

#[test]
fn test_proc_duration_param() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    let payload: Vec<u8> = [600u32, 50].iter().flat_map(|w| w.to_le_bytes()).collect();
    h.set_cntr_param(CNTR_PARAM_ID_PROC_DURATION, payload).unwrap();
    assert_eq!(h.snapshot().unwrap().proc_duration_us, 600);
    // a later frame length change leaves it alone
    h.graph_mgmt(SgOps::PREPARE, graph_cmd_all(&g)).unwrap();
    assert_eq!(h.snapshot().unwrap().proc_duration_us, 600);
    h.destroy().unwrap();
}

#[test]
fn test_global_shmem_routing() {
    let g = chain(0x4000, ContainerKind::Generic, 1000, stereo_48k());
    let h = launch_described(&g, Box::new(NullPowerManager::default())).unwrap();
    let payload: Vec<u8> = [3u32, 0, 0x1000, 0, 4096]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    h.global_shmem(0x11, payload.clone()).unwrap();
    assert!(matches!(
        h.global_shmem(0x10, payload.clone()),
        Err(CuError::Spf(SpfError::Unsupported))
    ));
    assert!(matches!(
        h.global_shmem(0x4000, payload),
        Err(CuError::Spf(SpfError::Unsupported))
    ));
    assert!(matches!(
        h.global_shmem(0x11, vec![0; 8]),
        Err(CuError::Spf(SpfError::BadParam))
    ));
    h.destroy().unwrap();
}
