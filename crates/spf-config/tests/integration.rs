//! Integration tests for spf-config.
//!
//! These tests verify file-backed loading and the path from a graph
//! description to the binary container configuration.

use spf_config::{
    ConfigError, ContainerConfig, ContainerKind, FrameSizeCfg, GraphDescription, HeapKind,
    ModuleDesc, SubgraphDesc,
};
use tempfile::TempDir;

fn sample() -> GraphDescription {
    let mut g = GraphDescription::default();
    g.container.id = 0x4000;
    g.container.kind = ContainerKind::Signal;
    g.container.frame_size_samples = Some(480);
    g.container.heap = HeapKind::LowPower;
    g.container.stack_size = Some(8192);
    g.subgraphs.push(SubgraphDesc { id: 1, sid: 3 });
    g.modules.push(ModuleDesc {
        instance_id: 0x1001,
        module_id: 0x0700_2000,
        subgraph: 1,
        inputs: vec![2],
        outputs: vec![1],
        ..ModuleDesc::default()
    });
    g
}

/// Save to disk, load it back.
#[test]
fn test_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.toml");
    let g = sample();
    g.save(&path).unwrap();
    let loaded = GraphDescription::load(&path).unwrap();
    assert_eq!(loaded, g);
}

/// Missing files report the path.
#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = GraphDescription::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

/// Invalid TOML on disk is a parse error.
#[test]
fn test_malformed_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[container\nid = ").unwrap();
    assert!(matches!(
        GraphDescription::load(&path),
        Err(ConfigError::TomlParse(_))
    ));
}

/// The container table becomes a binary config that parses to the same values.
#[test]
fn test_description_to_binary_config() {
    let g = sample();
    let cfg = g.container_config();
    let parsed = ContainerConfig::parse(&cfg.to_bytes()).unwrap();
    assert_eq!(parsed, cfg);
    assert_eq!(parsed.frame_size, Some(FrameSizeCfg::Samples(480)));
    assert!(parsed.is_island());
    assert_eq!(parsed.stack_size, Some(8192));
}
