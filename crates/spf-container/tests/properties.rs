//! Property-based tests for spf-container.
//!
//! Runs containers in-process (no worker thread) against generated inputs:
//! arbitrary configuration payloads, arbitrary graph command sequences and
//! the id allocator near its wrap point. A few fixed lifecycle sequences
//! close the file.

use crossbeam_channel::bounded;
use proptest::prelude::*;
use spf_config::GraphDescription;
use spf_config::PortAddr;
use spf_container::{
    CntrMsg, Container, CuError, FwkEvent, GenericOps, GraphMgmtCmd, NullPowerManager,
    UniqueIdAllocator, build_container, graph_cmd_all,
};
use spf_core::{SgOps, TopoState};

const CHAIN: &str = r#"
[container]
id = 0x4000
frame_size_us = 1000

[[subgraphs]]
id = 1

[[modules]]
instance_id = 0x10
module_id = 0x07002000
subgraph = 1
inputs = [2]
outputs = [1]
kpps = 2000

[[modules]]
instance_id = 0x11
module_id = 0x07002000
subgraph = 1
inputs = [2]
outputs = [1]
kpps = 3000

[[links]]
from = { module = 0x10, port = 1 }
to = { module = 0x11, port = 2 }
"#;

fn chain() -> (GraphDescription, Container<GenericOps>) {
    build(CHAIN)
}

fn build(toml: &str) -> (GraphDescription, Container<GenericOps>) {
    let desc = GraphDescription::from_toml(toml).unwrap();
    let c = build_container(&desc, Box::new(NullPowerManager::default()), GenericOps).unwrap();
    (desc, c)
}

fn sg_op() -> impl Strategy<Value = SgOps> {
    prop_oneof![
        Just(SgOps::PREPARE),
        Just(SgOps::START),
        Just(SgOps::STOP),
        Just(SgOps::SUSPEND),
        Just(SgOps::FLUSH),
    ]
}

fn event() -> impl Strategy<Value = FwkEvent> {
    (0u32..13).prop_map(|b| FwkEvent::from_bits(1 << b))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Every configuration payload is answered, whatever its bytes.
    #[test]
    fn container_cfg_always_acks(payload in proptest::collection::vec(any::<u8>(), 0..96)) {
        let (_, mut c) = chain();
        let (tx, rx) = bounded(1);
        c.handle_msg(CntrMsg::ContainerCfg { payload, ack: tx });
        prop_assert!(rx.try_recv().is_ok());
    }

    /// The container counts as started exactly when its subgraph is.
    #[test]
    fn started_tracks_subgraph_state(ops in proptest::collection::vec(sg_op(), 1..12)) {
        let (desc, mut c) = chain();
        let cmd = graph_cmd_all(&desc);
        for op in ops {
            let r = c.graph_mgmt(op, &cmd);
            prop_assert!(r.is_ok(), "{:?} failed: {:?}", op, r);
            let snap = c.snapshot();
            prop_assert_eq!(
                snap.is_started,
                snap.sg_state(1) == Some(TopoState::Started)
            );
            prop_assert!(!c.cu.flags.apm_cmd_context);
        }
    }

    /// Sending the same operation twice leaves the state where the first left it.
    #[test]
    fn repeated_op_is_idempotent(
        prefix in proptest::collection::vec(sg_op(), 0..6),
        op in sg_op(),
    ) {
        let (desc, mut c) = chain();
        let cmd = graph_cmd_all(&desc);
        for p in prefix {
            prop_assert!(c.graph_mgmt(p, &cmd).is_ok());
        }
        prop_assert!(c.graph_mgmt(op, &cmd).is_ok());
        let once = c.snapshot();
        prop_assert!(c.graph_mgmt(op, &cmd).is_ok());
        let twice = c.snapshot();
        prop_assert_eq!(once.subgraphs, twice.subgraphs);
        prop_assert_eq!(once.is_started, twice.is_started);
        let states = |s: &[spf_container::PortSnapshot]| s.iter().map(|p| p.state).collect::<Vec<_>>();
        prop_assert_eq!(states(&once.inputs), states(&twice.inputs));
        prop_assert_eq!(states(&once.outputs), states(&twice.outputs));
    }

    /// Ids are never zero, including across the wrap.
    #[test]
    fn unique_ids_skip_zero(offset in 0u32..64, draws in 1usize..128) {
        let ids = UniqueIdAllocator::starting_at(u32::MAX - offset);
        for _ in 0..draws {
            prop_assert_ne!(ids.next_id(), 0);
        }
    }

    /// Event sets hold exactly the bits that were raised into them.
    #[test]
    fn events_accumulate(evs in proptest::collection::vec(event(), 0..16)) {
        let mut acc = FwkEvent::NONE;
        let mut bits = 0u32;
        for &ev in &evs {
            acc |= ev;
            bits |= ev.bits();
        }
        prop_assert_eq!(acc.bits(), bits);
        prop_assert_eq!(acc.is_empty(), evs.is_empty());
        for b in 0..13 {
            let ev = FwkEvent::from_bits(1 << b);
            prop_assert_eq!(acc.intersects(ev), evs.contains(&ev));
        }
    }
}

const CHAIN_WITH_EXT_OUT: &str = r#"
[container]
id = 0x4000
frame_size_us = 1000

[[subgraphs]]
id = 1

[[modules]]
instance_id = 0x10
module_id = 0x07002000
subgraph = 1
inputs = [2]
outputs = [1]

[[modules]]
instance_id = 0x11
module_id = 0x07002000
subgraph = 1
inputs = [2]
outputs = [1]

[[links]]
from = { module = 0x10, port = 1 }
to = { module = 0x11, port = 2 }

[[external_outputs]]
module = 0x11
port = 1
"#;

#[test]
fn double_stop_is_harmless() {
    let (desc, mut c) = chain();
    let cmd = graph_cmd_all(&desc);
    c.graph_mgmt(SgOps::PREPARE, &cmd).unwrap();
    c.graph_mgmt(SgOps::START, &cmd).unwrap();
    c.graph_mgmt(SgOps::STOP, &cmd).unwrap();
    c.graph_mgmt(SgOps::STOP, &cmd).unwrap();
    let snap = c.snapshot();
    assert_eq!(snap.sg_state(1), Some(TopoState::Stopped));
    assert!(!snap.is_started);
    assert!(snap.inputs.iter().all(|p| p.state == TopoState::Stopped));
}

#[test]
fn close_after_stop_tears_everything_down() {
    let (desc, mut c) = chain();
    let cmd = graph_cmd_all(&desc);
    c.graph_mgmt(SgOps::PREPARE, &cmd).unwrap();
    c.graph_mgmt(SgOps::START, &cmd).unwrap();
    c.graph_mgmt(SgOps::STOP, &cmd).unwrap();
    c.graph_mgmt(SgOps::CLOSE, &cmd).unwrap();
    let snap = c.snapshot();
    assert_eq!(snap.sg_state(1), None);
    assert!(snap.inputs.is_empty());
    assert!(snap.outputs.is_empty());
    assert!(!snap.is_started);
}

#[test]
fn disconnect_while_started_is_refused() {
    let (desc, mut c) = build(CHAIN_WITH_EXT_OUT);
    let all = graph_cmd_all(&desc);
    c.graph_mgmt(SgOps::PREPARE, &all).unwrap();
    c.graph_mgmt(SgOps::START, &all).unwrap();

    let port_only = GraphMgmtCmd {
        ext_outputs: vec![PortAddr { module: 0x11, port: 1 }],
        ..GraphMgmtCmd::default()
    };
    let err = c.graph_mgmt(SgOps::DISCONNECT, &port_only).unwrap_err();
    assert!(matches!(
        err,
        CuError::DisconnectStarted { miid: 0x11, port_id: 1 }
    ));
    assert_eq!(c.snapshot().sg_state(1), Some(TopoState::Started));
    assert!(!c.cu.flags.apm_cmd_context);

    c.graph_mgmt(SgOps::STOP, &all).unwrap();
    c.graph_mgmt(SgOps::DISCONNECT, &port_only).unwrap();
}
