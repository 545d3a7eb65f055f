//! Shared scratch memory sized for the widest module in the topology.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::error::{SpfError, SpfResult};
use crate::media_format::MAX_CHANNELS;

use super::graph::Topology;

/// Bytes of per-channel buffer descriptor space per port.
const DESC_BYTES_PER_CH: usize = 16;

/// Scratch area shared by all modules of a topology.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScratchMem {
    /// Largest input port count of any module.
    pub max_in_ports: u32,
    /// Largest output port count of any module.
    pub max_out_ports: u32,
    /// Largest channel count of any port.
    pub max_channels: u32,
    /// Times the blob was reallocated.
    pub realloc_count: u32,
    blob: Vec<u8>,
}

impl ScratchMem {
    /// Current blob size in bytes.
    pub fn len(&self) -> usize {
        self.blob.len()
    }

    /// True before the first allocation.
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

impl Topology {
    /// Recomputes the scratch maxima over every module and grows the blob
    /// when any maximum grew.
    pub fn check_n_realloc_scratch_memory(&mut self) -> SpfResult<()> {
        let mut max_in = 0u32;
        let mut max_out = 0u32;
        let mut max_ch = 0u32;
        for m in self.modules() {
            max_in = max_in.max(m.inputs.len() as u32);
            max_out = max_out.max(m.outputs.len() as u32);
            for &i in &m.inputs {
                if let Some(p) = self.input(i).filter(|p| p.common.flags.is_mf_valid) {
                    max_ch = max_ch.max(p.common.media_fmt.channels());
                }
            }
            for &o in &m.outputs {
                if let Some(p) = self.output(o).filter(|p| p.common.flags.is_mf_valid) {
                    max_ch = max_ch.max(p.common.media_fmt.channels());
                }
            }
        }
        let max_ch = max_ch.clamp(1, MAX_CHANNELS);
        self.events.realloc_scratch_mem = false;

        let s = &mut self.scratch;
        let grew = max_in > s.max_in_ports || max_out > s.max_out_ports || max_ch > s.max_channels;
        if !grew {
            return Ok(());
        }
        s.max_in_ports = s.max_in_ports.max(max_in);
        s.max_out_ports = s.max_out_ports.max(max_out);
        s.max_channels = s.max_channels.max(max_ch);

        let ports = s.max_in_ports.max(s.max_out_ports) as usize;
        let size = ports * s.max_channels as usize * DESC_BYTES_PER_CH;
        if size == 0 {
            return Ok(());
        }
        let mut blob = Vec::new();
        blob.try_reserve_exact(size).map_err(|_| SpfError::NoMemory)?;
        blob.resize(size, 0);
        s.blob = blob;
        s.realloc_count += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            log_id = self.log_id,
            max_in,
            max_out,
            max_ch,
            size,
            "scratch: reallocated"
        );
        Ok(())
    }
}
