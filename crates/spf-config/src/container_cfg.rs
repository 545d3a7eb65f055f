//! Binary container configuration.
//!
//! The payload is a `{container_id, num_prop}` header followed by `num_prop`
//! property entries. Each entry is a `{prop_id, prop_size}` header and
//! `prop_size` payload bytes. All words are little endian `u32`.
//!
//! ```text
//! container_id | num_prop | prop_id | prop_size | payload ... | prop_id | ...
//! ```
//!
//! Unknown property ids are skipped. A known property whose payload is
//! smaller than its layout fails the whole parse.

use crate::error::ConfigError;

/// Frame size of the container, see [`FrameSizeCfg`].
pub const PROP_ID_FRAME_SIZE: u32 = 0x0800_1A9B;
/// Container type, `{version = 1, type}`.
pub const PROP_ID_CONTAINER_TYPE: u32 = 0x0800_1011;
/// Graph position.
pub const PROP_ID_GRAPH_POS: u32 = 0x0800_1012;
/// Worker thread stack size.
pub const PROP_ID_STACK_SIZE: u32 = 0x0800_1013;
/// Processor domain.
pub const PROP_ID_PROC_DOMAIN: u32 = 0x0800_1014;
/// Heap the container allocates from.
pub const PROP_ID_HEAP_ID: u32 = 0x0800_1174;
/// Parent container of an offloaded (satellite) container.
pub const PROP_ID_PARENT_CONTAINER_ID: u32 = 0x0800_10CB;
/// Worker thread priority.
pub const PROP_ID_THREAD_PRIORITY: u32 = 0x0800_1A9E;
/// Worker thread scheduling policy.
pub const PROP_ID_THREAD_SCHED_POLICY: u32 = 0x0800_1A9F;
/// Worker thread core affinity mask.
pub const PROP_ID_THREAD_CORE_AFFINITY: u32 = 0x0800_1AA0;

/// Value meaning "let the runtime decide".
pub const PROP_ID_DONT_CARE: u32 = 0xFFFF_FFFF;

/// Regular heap.
pub const HEAP_DEFAULT: u32 = 1;
/// Low power (island) heap.
pub const HEAP_LOW_POWER: u32 = 2;

/// Specialized low-latency container type.
pub const CONTAINER_TYPE_SC: u32 = 0x0B00_1000;
/// Generic container type.
pub const CONTAINER_TYPE_GC: u32 = 0x0B00_1001;

/// Graph positions.
pub const GRAPH_POS_STREAM: u32 = 1;
/// Per-stream per-device leg.
pub const GRAPH_POS_PER_STR_PER_DEV: u32 = 2;
/// Stream-device leg.
pub const GRAPH_POS_STR_DEV: u32 = 3;
/// Global device leg.
pub const GRAPH_POS_GLOBAL_DEV: u32 = 4;

const FRAME_SIZE_MODE_DEFAULT: u32 = 0;
const FRAME_SIZE_MODE_TIME: u32 = 1;
const FRAME_SIZE_MODE_SAMPLES: u32 = 2;

const HEADER_SIZE: usize = 8;
const PROP_HEADER_SIZE: usize = 8;

/// Configured container frame size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSizeCfg {
    /// Container derives the frame size itself.
    Default,
    /// Fixed duration in microseconds.
    Time(u32),
    /// Fixed sample count at the container's operating rate.
    Samples(u32),
}

/// Typed view of one container configuration payload.
///
/// A property absent from the payload stays `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Container instance id.
    pub container_id: u32,
    /// Frame size.
    pub frame_size: Option<FrameSizeCfg>,
    /// Container type id.
    pub container_type: Option<u32>,
    /// Graph position.
    pub graph_pos: Option<u32>,
    /// Stack size in bytes; 0 when the runtime decides.
    pub stack_size: Option<u32>,
    /// Processor domain; [`PROP_ID_DONT_CARE`] accepted.
    pub proc_domain: Option<u32>,
    /// Heap id.
    pub heap_id: Option<u32>,
    /// Parent container id of an offloaded container.
    pub parent_container_id: Option<u32>,
    /// Thread priority.
    pub thread_priority: Option<i32>,
    /// Scheduling policy.
    pub sched_policy: Option<u32>,
    /// Core affinity mask.
    pub core_affinity: Option<u32>,
    /// Property ids that were skipped.
    pub unknown_props: Vec<u32>,
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, ConfigError> {
    buf.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| ConfigError::truncated(at, 4, buf.len().saturating_sub(at)))
}

fn need(prop_id: u32, size: u32, needed: u32) -> Result<(), ConfigError> {
    if size < needed {
        return Err(ConfigError::PropertyTooSmall {
            prop_id,
            size,
            needed,
        });
    }
    Ok(())
}

impl ContainerConfig {
    /// Parses a configuration payload.
    pub fn parse(buf: &[u8]) -> Result<Self, ConfigError> {
        if buf.len() < HEADER_SIZE {
            return Err(ConfigError::truncated(0, HEADER_SIZE, buf.len()));
        }
        let mut cfg = ContainerConfig {
            container_id: read_u32(buf, 0)?,
            ..Self::default()
        };
        let num_prop = read_u32(buf, 4)?;

        let mut at = HEADER_SIZE;
        for _ in 0..num_prop {
            let avail = buf.len().saturating_sub(at);
            if avail < PROP_HEADER_SIZE {
                return Err(ConfigError::truncated(at, PROP_HEADER_SIZE, avail));
            }
            let prop_id = read_u32(buf, at)?;
            let size = read_u32(buf, at + 4)?;
            let start = at + PROP_HEADER_SIZE;
            let avail = buf.len() - start;
            if (size as usize) > avail {
                return Err(ConfigError::truncated(start, size as usize, avail));
            }
            let payload = &buf[start..start + size as usize];
            cfg.apply_property(prop_id, payload)?;
            at = start + size as usize;
        }
        tracing::debug!(
            container_id = cfg.container_id,
            num_prop,
            skipped = cfg.unknown_props.len(),
            "container config parsed"
        );
        Ok(cfg)
    }

    fn apply_property(&mut self, prop_id: u32, p: &[u8]) -> Result<(), ConfigError> {
        let size = p.len() as u32;
        match prop_id {
            PROP_ID_FRAME_SIZE => {
                need(prop_id, size, 4)?;
                let mode = read_u32(p, 0)?;
                self.frame_size = Some(match mode {
                    FRAME_SIZE_MODE_TIME => {
                        need(prop_id, size, 8)?;
                        FrameSizeCfg::Time(read_u32(p, 4)?)
                    }
                    FRAME_SIZE_MODE_SAMPLES => {
                        need(prop_id, size, 8)?;
                        FrameSizeCfg::Samples(read_u32(p, 4)?)
                    }
                    _ => FrameSizeCfg::Default,
                });
            }
            PROP_ID_CONTAINER_TYPE => {
                need(prop_id, size, 8)?;
                let version = read_u32(p, 0)?;
                if version != 1 {
                    return Err(ConfigError::InvalidProperty {
                        prop_id,
                        value: version,
                    });
                }
                self.container_type = Some(read_u32(p, 4)?);
            }
            PROP_ID_GRAPH_POS => {
                need(prop_id, size, 4)?;
                self.graph_pos = Some(read_u32(p, 0)?);
            }
            PROP_ID_STACK_SIZE => {
                need(prop_id, size, 4)?;
                let v = read_u32(p, 0)?;
                self.stack_size = Some(if v == PROP_ID_DONT_CARE { 0 } else { v });
            }
            PROP_ID_PROC_DOMAIN => {
                need(prop_id, size, 4)?;
                self.proc_domain = Some(read_u32(p, 0)?);
            }
            PROP_ID_HEAP_ID => {
                need(prop_id, size, 4)?;
                let heap = read_u32(p, 0)?;
                tracing::debug!(island = heap == HEAP_LOW_POWER, "heap id configured");
                self.heap_id = Some(heap);
            }
            PROP_ID_PARENT_CONTAINER_ID => {
                need(prop_id, size, 4)?;
                let parent = read_u32(p, 0)?;
                if parent == 0 || parent == PROP_ID_DONT_CARE {
                    tracing::info!(parent, "invalid parent container id, ignored");
                } else {
                    self.parent_container_id = Some(parent);
                }
            }
            PROP_ID_THREAD_PRIORITY => {
                need(prop_id, size, 4)?;
                self.thread_priority = Some(read_u32(p, 0)? as i32);
            }
            PROP_ID_THREAD_SCHED_POLICY => {
                need(prop_id, size, 4)?;
                self.sched_policy = Some(read_u32(p, 0)?);
            }
            PROP_ID_THREAD_CORE_AFFINITY => {
                need(prop_id, size, 4)?;
                self.core_affinity = Some(read_u32(p, 0)?);
            }
            _ => {
                tracing::warn!(
                    prop_id = format_args!("0x{prop_id:08X}"),
                    "unsupported container property, ignoring"
                );
                self.unknown_props.push(prop_id);
            }
        }
        Ok(())
    }

    /// True when the container runs from the low power heap.
    pub fn is_island(&self) -> bool {
        self.heap_id == Some(HEAP_LOW_POWER)
    }

    /// True when the container is a satellite of a container in another domain.
    pub fn is_offload(&self) -> bool {
        self.parent_container_id.is_some()
    }

    /// Checks the processor domain against the host.
    pub fn verify_proc_domain(&self, host_domain: u32) -> Result<(), ConfigError> {
        match self.proc_domain {
            Some(d) if d != host_domain && d != PROP_ID_DONT_CARE => {
                Err(ConfigError::InvalidProperty {
                    prop_id: PROP_ID_PROC_DOMAIN,
                    value: d,
                })
            }
            _ => Ok(()),
        }
    }

    /// Encodes this configuration back into a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = CfgWriter::new(self.container_id);
        if let Some(fs) = self.frame_size {
            match fs {
                FrameSizeCfg::Default => w.prop(PROP_ID_FRAME_SIZE, &[FRAME_SIZE_MODE_DEFAULT]),
                FrameSizeCfg::Time(us) => w.prop(PROP_ID_FRAME_SIZE, &[FRAME_SIZE_MODE_TIME, us]),
                FrameSizeCfg::Samples(n) => {
                    w.prop(PROP_ID_FRAME_SIZE, &[FRAME_SIZE_MODE_SAMPLES, n])
                }
            }
        }
        if let Some(t) = self.container_type {
            w.prop(PROP_ID_CONTAINER_TYPE, &[1, t]);
        }
        let singles = [
            (PROP_ID_GRAPH_POS, self.graph_pos),
            (PROP_ID_STACK_SIZE, self.stack_size),
            (PROP_ID_PROC_DOMAIN, self.proc_domain),
            (PROP_ID_HEAP_ID, self.heap_id),
            (PROP_ID_PARENT_CONTAINER_ID, self.parent_container_id),
            (PROP_ID_THREAD_PRIORITY, self.thread_priority.map(|p| p as u32)),
            (PROP_ID_THREAD_SCHED_POLICY, self.sched_policy),
            (PROP_ID_THREAD_CORE_AFFINITY, self.core_affinity),
        ];
        for (id, v) in singles {
            if let Some(v) = v {
                w.prop(id, &[v]);
            }
        }
        w.finish()
    }
}

/// Incremental writer for configuration payloads.
#[derive(Debug)]
pub struct CfgWriter {
    buf: Vec<u8>,
    num_prop: u32,
}

impl CfgWriter {
    /// Starts a payload for `container_id`.
    pub fn new(container_id: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&container_id.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        Self { buf, num_prop: 0 }
    }

    /// Appends a property made of whole words.
    pub fn prop(&mut self, prop_id: u32, words: &[u32]) {
        self.buf.extend_from_slice(&prop_id.to_le_bytes());
        self.buf
            .extend_from_slice(&((words.len() * 4) as u32).to_le_bytes());
        for w in words {
            self.buf.extend_from_slice(&w.to_le_bytes());
        }
        self.num_prop += 1;
    }

    /// Appends a property with a raw payload.
    pub fn raw(&mut self, prop_id: u32, payload: &[u8]) {
        self.buf.extend_from_slice(&prop_id.to_le_bytes());
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        self.num_prop += 1;
    }

    /// Patches the property count and returns the payload.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[4..8].copy_from_slice(&self.num_prop.to_le_bytes());
        self.buf
    }
}

/// Assigns `given` to a zero `current`, otherwise requires them to match.
pub fn assign_if_zero_else_verify(
    field: &'static str,
    current: &mut u32,
    given: u32,
) -> Result<(), ConfigError> {
    if *current == 0 {
        *current = given;
        Ok(())
    } else if *current == given {
        Ok(())
    } else {
        Err(ConfigError::Mismatch {
            field,
            current: *current,
            given,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain() {
        let cfg = ContainerConfig::parse(&CfgWriter::new(0x4000).finish()).unwrap();
        assert_eq!(cfg.container_id, 0x4000);
        assert_eq!(cfg.frame_size, None);
        assert!(!cfg.is_island());
    }

    #[test]
    fn test_all_properties() {
        let mut w = CfgWriter::new(0x4001);
        w.prop(PROP_ID_FRAME_SIZE, &[FRAME_SIZE_MODE_TIME, 5000]);
        w.prop(PROP_ID_CONTAINER_TYPE, &[1, CONTAINER_TYPE_GC]);
        w.prop(PROP_ID_GRAPH_POS, &[GRAPH_POS_STREAM]);
        w.prop(PROP_ID_STACK_SIZE, &[PROP_ID_DONT_CARE]);
        w.prop(PROP_ID_PROC_DOMAIN, &[PROP_ID_DONT_CARE]);
        w.prop(PROP_ID_HEAP_ID, &[HEAP_LOW_POWER]);
        w.prop(PROP_ID_PARENT_CONTAINER_ID, &[0x4100]);
        w.prop(PROP_ID_THREAD_PRIORITY, &[(-3i32) as u32]);
        w.prop(PROP_ID_THREAD_SCHED_POLICY, &[2]);
        w.prop(PROP_ID_THREAD_CORE_AFFINITY, &[0b1010]);
        let cfg = ContainerConfig::parse(&w.finish()).unwrap();

        assert_eq!(cfg.frame_size, Some(FrameSizeCfg::Time(5000)));
        assert_eq!(cfg.container_type, Some(CONTAINER_TYPE_GC));
        assert_eq!(cfg.graph_pos, Some(GRAPH_POS_STREAM));
        assert_eq!(cfg.stack_size, Some(0));
        assert!(cfg.verify_proc_domain(7).is_ok());
        assert!(cfg.is_island());
        assert!(cfg.is_offload());
        assert_eq!(cfg.thread_priority, Some(-3));
        assert_eq!(cfg.sched_policy, Some(2));
        assert_eq!(cfg.core_affinity, Some(0b1010));
    }

    #[test]
    fn test_unknown_property_skipped() {
        let mut w = CfgWriter::new(1);
        w.raw(0x0800_FFFF, &[1, 2, 3]);
        w.prop(PROP_ID_GRAPH_POS, &[GRAPH_POS_GLOBAL_DEV]);
        let cfg = ContainerConfig::parse(&w.finish()).unwrap();
        assert_eq!(cfg.unknown_props, vec![0x0800_FFFF]);
        assert_eq!(cfg.graph_pos, Some(GRAPH_POS_GLOBAL_DEV));
    }

    #[test]
    fn test_short_payload_rejected() {
        let mut w = CfgWriter::new(1);
        w.prop(PROP_ID_FRAME_SIZE, &[FRAME_SIZE_MODE_SAMPLES]);
        let err = ContainerConfig::parse(&w.finish()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PropertyTooSmall {
                prop_id: PROP_ID_FRAME_SIZE,
                size: 4,
                needed: 8
            }
        ));
    }

    #[test]
    fn test_truncated_chain() {
        let mut bytes = {
            let mut w = CfgWriter::new(1);
            w.prop(PROP_ID_HEAP_ID, &[HEAP_DEFAULT]);
            w.finish()
        };
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            ContainerConfig::parse(&bytes),
            Err(ConfigError::Truncated { .. })
        ));
    }

    #[test]
    fn test_container_type_version() {
        let mut w = CfgWriter::new(1);
        w.prop(PROP_ID_CONTAINER_TYPE, &[2, CONTAINER_TYPE_SC]);
        assert!(matches!(
            ContainerConfig::parse(&w.finish()),
            Err(ConfigError::InvalidProperty { value: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_parent_ignored() {
        let mut w = CfgWriter::new(1);
        w.prop(PROP_ID_PARENT_CONTAINER_ID, &[PROP_ID_DONT_CARE]);
        let cfg = ContainerConfig::parse(&w.finish()).unwrap();
        assert!(!cfg.is_offload());
    }

    #[test]
    fn test_proc_domain_mismatch() {
        let cfg = ContainerConfig {
            proc_domain: Some(3),
            ..ContainerConfig::default()
        };
        assert!(cfg.verify_proc_domain(3).is_ok());
        assert!(cfg.verify_proc_domain(1).is_err());
    }

    #[test]
    fn test_encode_matches_parse() {
        let cfg = ContainerConfig {
            container_id: 0x4002,
            frame_size: Some(FrameSizeCfg::Samples(480)),
            heap_id: Some(HEAP_DEFAULT),
            stack_size: Some(16384),
            ..ContainerConfig::default()
        };
        assert_eq!(ContainerConfig::parse(&cfg.to_bytes()).unwrap(), cfg);
    }

    #[test]
    fn test_assign_if_zero_else_verify() {
        let mut pos = 0;
        assign_if_zero_else_verify("graph position", &mut pos, 2).unwrap();
        assert_eq!(pos, 2);
        assign_if_zero_else_verify("graph position", &mut pos, 2).unwrap();
        assert!(assign_if_zero_else_verify("graph position", &mut pos, 3).is_err());
    }
}
