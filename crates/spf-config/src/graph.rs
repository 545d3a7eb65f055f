//! TOML description of one container's graph.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use spf_core::MediaFormat;

use crate::container_cfg::{
    CONTAINER_TYPE_GC, CONTAINER_TYPE_SC, ContainerConfig, FrameSizeCfg, HEAP_DEFAULT,
    HEAP_LOW_POWER,
};
use crate::error::ConfigError;

/// A container, its subgraphs, modules and links.
///
/// # TOML Format
///
/// ```toml
/// [container]
/// id = 0x4000
/// kind = "generic"
/// frame_size_us = 1000
///
/// [[subgraphs]]
/// id = 1
/// sid = 1
///
/// [[modules]]
/// instance_id = 0x1001
/// module_id = 0x07002000
/// subgraph = 1
/// inputs = [2]
/// outputs = [1]
/// ctrl_ports = [3]
/// inplace = true
///
/// [[external_inputs]]
/// module = 0x1001
/// port = 2
/// format = { sample_rate = 48000, bits_per_sample = 16, channels = 2 }
///
/// [[external_outputs]]
/// module = 0x1001
/// port = 1
///
/// [[external_ctrl_ports]]
/// module = 0x1001
/// port = 3
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphDescription {
    /// Container properties.
    #[serde(default)]
    pub container: ContainerSection,

    /// Subgraphs hosted by the container.
    #[serde(default)]
    pub subgraphs: Vec<SubgraphDesc>,

    /// Modules, each in one subgraph.
    #[serde(default)]
    pub modules: Vec<ModuleDesc>,

    /// Data links between modules of this container.
    #[serde(default)]
    pub links: Vec<LinkDesc>,

    /// Ports fed by upstream containers.
    #[serde(default)]
    pub external_inputs: Vec<ExtInputDesc>,

    /// Ports feeding downstream containers.
    #[serde(default)]
    pub external_outputs: Vec<PortAddr>,

    /// Control links between modules of this container.
    #[serde(default)]
    pub ctrl_links: Vec<CtrlLinkDesc>,

    /// Control ports linked to other containers.
    #[serde(default)]
    pub external_ctrl_ports: Vec<PortAddr>,
}

/// Container kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Generic container, data driven.
    #[default]
    Generic,
    /// Specialized container, signal triggered.
    Signal,
}

/// Heap selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeapKind {
    /// Regular heap.
    #[default]
    Default,
    /// Low power island heap.
    LowPower,
}

/// `[container]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerSection {
    /// Container instance id.
    pub id: u32,
    /// Container kind.
    pub kind: ContainerKind,
    /// Frame size in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size_us: Option<u32>,
    /// Frame size in samples. Ignored when `frame_size_us` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size_samples: Option<u32>,
    /// Stack size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<u32>,
    /// Heap.
    pub heap: HeapKind,
    /// Graph position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// Thread priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_priority: Option<i32>,
    /// Parent container for offloaded containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_container_id: Option<u32>,
}

/// `[[subgraphs]]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubgraphDesc {
    /// Subgraph id.
    pub id: u32,
    /// Scenario id.
    #[serde(default)]
    pub sid: u32,
}

/// `[[modules]]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModuleDesc {
    /// Instance id, unique in the graph.
    pub instance_id: u32,
    /// Module type id.
    pub module_id: u32,
    /// Owning subgraph.
    pub subgraph: u32,
    /// Input port ids.
    pub inputs: Vec<u32>,
    /// Output port ids.
    pub outputs: Vec<u32>,
    /// Control port ids.
    pub ctrl_ports: Vec<u32>,
    /// Can run in place.
    pub inplace: bool,
    /// Needs buffered data on its inputs.
    pub requires_data_buffering: bool,
    /// Toggles in-place with its format.
    pub dynamic_inplace: bool,
    /// Port threshold in bytes, 0 for none.
    pub threshold: u32,
    /// Processing load.
    pub kpps: u32,
    /// Rate the module converts to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sample_rate: Option<u32>,
    /// Rate the module refuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejects_sample_rate: Option<u32>,
    /// Starts disabled.
    pub disabled: bool,
    /// Accepts global shared memory messages.
    pub global_shmem: bool,
}

/// A module port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAddr {
    /// Module instance id.
    pub module: u32,
    /// Port id.
    pub port: u32,
}

/// `[[links]]` entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkDesc {
    /// Output side.
    pub from: PortAddr,
    /// Input side.
    pub to: PortAddr,
}

/// `[[ctrl_links]]` entry. Control links have no direction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CtrlLinkDesc {
    /// One end.
    pub peer_1: PortAddr,
    /// The other end.
    pub peer_2: PortAddr,
}

/// PCM format of an external input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcmDesc {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample.
    pub bits_per_sample: u32,
    /// Channel count.
    pub channels: u32,
}

impl PcmDesc {
    /// Builds the media format.
    pub fn to_media_format(&self) -> MediaFormat {
        MediaFormat::pcm(self.sample_rate, self.bits_per_sample, self.channels)
    }
}

/// `[[external_inputs]]` entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtInputDesc {
    /// Module instance id.
    pub module: u32,
    /// Port id.
    pub port: u32,
    /// Format the upstream container announces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<PcmDesc>,
}

impl ExtInputDesc {
    /// Address of the port.
    pub fn addr(&self) -> PortAddr {
        PortAddr {
            module: self.module,
            port: self.port,
        }
    }
}

impl GraphDescription {
    /// Load a description from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let desc = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.display(),
            modules = desc.modules.len(),
            "graph description loaded"
        );
        Ok(desc)
    }

    /// Parse and validate a description from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let desc: GraphDescription = toml::from_str(toml_str)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Save the description to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Convert the description to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Looks up a module by instance id.
    pub fn module(&self, instance_id: u32) -> Option<&ModuleDesc> {
        self.modules.iter().find(|m| m.instance_id == instance_id)
    }

    /// Checks ids and references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut sgs = HashSet::new();
        for sg in &self.subgraphs {
            if !sgs.insert(sg.id) {
                return Err(ConfigError::Duplicate(sg.id));
            }
        }
        let mut iids = HashSet::new();
        for m in &self.modules {
            if !iids.insert(m.instance_id) {
                return Err(ConfigError::Duplicate(m.instance_id));
            }
            if !sgs.contains(&m.subgraph) {
                return Err(ConfigError::UnknownSubgraph(m.subgraph));
            }
        }
        for l in &self.links {
            self.check_port(l.from, false)?;
            self.check_port(l.to, true)?;
        }
        for e in &self.external_inputs {
            self.check_port(e.addr(), true)?;
        }
        for &e in &self.external_outputs {
            self.check_port(e, false)?;
        }
        let mut linked = HashSet::new();
        for l in &self.ctrl_links {
            for end in [l.peer_1, l.peer_2] {
                self.check_ctrl_port(end)?;
                if !linked.insert((end.module, end.port)) {
                    return Err(ConfigError::Duplicate(end.port));
                }
            }
        }
        for &e in &self.external_ctrl_ports {
            self.check_ctrl_port(e)?;
            if !linked.insert((e.module, e.port)) {
                return Err(ConfigError::Duplicate(e.port));
            }
        }
        Ok(())
    }

    fn check_ctrl_port(&self, addr: PortAddr) -> Result<(), ConfigError> {
        let m = self
            .module(addr.module)
            .ok_or(ConfigError::UnknownModule(addr.module))?;
        if m.ctrl_ports.contains(&addr.port) {
            Ok(())
        } else {
            Err(ConfigError::UnknownPort {
                module: addr.module,
                side: "control",
                port: addr.port,
            })
        }
    }

    fn check_port(&self, addr: PortAddr, is_input: bool) -> Result<(), ConfigError> {
        let m = self
            .module(addr.module)
            .ok_or(ConfigError::UnknownModule(addr.module))?;
        let ports = if is_input { &m.inputs } else { &m.outputs };
        if ports.contains(&addr.port) {
            Ok(())
        } else {
            Err(ConfigError::UnknownPort {
                module: addr.module,
                side: if is_input { "input" } else { "output" },
                port: addr.port,
            })
        }
    }

    /// Typed container configuration for the `[container]` table.
    pub fn container_config(&self) -> ContainerConfig {
        let c = &self.container;
        let frame_size = match (c.frame_size_us, c.frame_size_samples) {
            (Some(us), _) => Some(FrameSizeCfg::Time(us)),
            (None, Some(n)) => Some(FrameSizeCfg::Samples(n)),
            (None, None) => None,
        };
        let container_type = match c.kind {
            ContainerKind::Generic => CONTAINER_TYPE_GC,
            ContainerKind::Signal => CONTAINER_TYPE_SC,
        };
        let heap_id = match c.heap {
            HeapKind::Default => HEAP_DEFAULT,
            HeapKind::LowPower => HEAP_LOW_POWER,
        };
        ContainerConfig {
            container_id: c.id,
            frame_size,
            container_type: Some(container_type),
            graph_pos: c.position,
            stack_size: c.stack_size,
            heap_id: Some(heap_id),
            parent_container_id: c.parent_container_id,
            thread_priority: c.thread_priority,
            ..ContainerConfig::default()
        }
    }
}
