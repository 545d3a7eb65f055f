//! Module plugin seam.
//!
//! The topology never looks inside a processing module. Everything it needs
//! goes through [`CapiModule`]: media format negotiation, thresholds, opaque
//! parameters, port properties and the process call. Default methods describe
//! a module that accepts anything and has no opinion, so simple modules only
//! override what they care about.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::error::{SpfError, SpfResult};
use crate::media_format::MediaFormat;
use crate::state::TopoState;

/// Writer shared-memory endpoint (host to DSP source).
pub const MODULE_ID_WR_SHARED_MEM_EP: u32 = 0x0700_1000;
/// Reader shared-memory endpoint (DSP to host sink).
pub const MODULE_ID_RD_SHARED_MEM_EP: u32 = 0x0700_1001;
/// Placeholder encoder, replaced by a real encoder at runtime.
pub const MODULE_ID_PLACEHOLDER_ENCODER: u32 = 0x0700_1008;
/// Placeholder decoder, replaced by a real decoder at runtime.
pub const MODULE_ID_PLACEHOLDER_DECODER: u32 = 0x0700_1009;
/// Writer shared-memory client on an offload satellite.
pub const MODULE_ID_WR_SHARED_MEM_CLIENT: u32 = 0x0700_100A;
/// Reader shared-memory client on an offload satellite.
pub const MODULE_ID_RD_SHARED_MEM_CLIENT: u32 = 0x0700_100B;

/// Instance id reserved for the graph manager itself.
pub const APM_MODULE_INSTANCE_ID: u32 = 0x0000_0001;

/// Reader endpoint configuration.
pub const PARAM_ID_RD_SH_MEM_CFG: u32 = 0x0800_1007;
/// PCM output format configuration of reader endpoints.
pub const PARAM_ID_PCM_OUTPUT_FORMAT_CFG: u32 = 0x0800_1008;
/// Peer client property configuration of shared-memory clients.
pub const PARAM_ID_SH_MEM_PEER_CLIENT_PROPERTY_CONFIG: u32 = 0x0800_1A6F;

/// True for the placeholder encoder/decoder module ids.
pub fn is_placeholder(module_id: u32) -> bool {
    module_id == MODULE_ID_PLACEHOLDER_ENCODER || module_id == MODULE_ID_PLACEHOLDER_DECODER
}

/// Decoded global shared-memory announcement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalShmem {
    /// Shared memory id.
    pub shmem_id: u32,
    /// Raw property flags.
    pub property_flag: u32,
    /// Address, low word.
    pub addr_lsw: u32,
    /// Address, high word.
    pub addr_msw: u32,
    /// Size in bytes.
    pub size: u32,
}

impl GlobalShmem {
    /// Wire size of the payload.
    pub const WIRE_SIZE: usize = 20;

    /// Decodes the little-endian wire payload.
    pub fn decode(payload: &[u8]) -> SpfResult<Self> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(SpfError::BadParam);
        }
        let word = |i: usize| {
            u32::from_le_bytes([
                payload[i * 4],
                payload[i * 4 + 1],
                payload[i * 4 + 2],
                payload[i * 4 + 3],
            ])
        };
        Ok(Self {
            shmem_id: word(0),
            property_flag: word(1),
            addr_lsw: word(2),
            addr_msw: word(3),
            size: word(4),
        })
    }

    /// Sender does not want an acknowledgement.
    pub fn is_ack_not_required(&self) -> bool {
        self.property_flag & 0x1 != 0
    }

    /// Memory is being released rather than announced.
    pub fn is_release(&self) -> bool {
        self.property_flag & 0x2 != 0
    }

    /// Full 64-bit address.
    pub fn addr(&self) -> u64 {
        (u64::from(self.addr_msw) << 32) | u64::from(self.addr_lsw)
    }
}

/// A processing module instance as seen by the topology.
pub trait CapiModule {
    /// Applies a new input media format. An error means the module rejects it.
    fn set_input_media_format(&mut self, port_index: u32, fmt: &MediaFormat) -> SpfResult<()> {
        let _ = (port_index, fmt);
        Ok(())
    }

    /// Output media format the module computed, `None` if not known yet.
    fn output_media_format(&self, port_index: u32) -> Option<MediaFormat> {
        let _ = port_index;
        None
    }

    /// Port threshold in bytes for all channels. `None` or `Some(1)` means none.
    fn port_threshold(&self, is_input: bool, port_index: u32) -> Option<u32> {
        let _ = (is_input, port_index);
        None
    }

    /// Opaque set-param.
    fn set_param(&mut self, param_id: u32, payload: &[u8]) -> SpfResult<()> {
        let _ = (param_id, payload);
        Err(SpfError::Unsupported)
    }

    /// Opaque get-param, appends the payload to `out`.
    fn get_param(&mut self, param_id: u32, out: &mut Vec<u8>) -> SpfResult<()> {
        let _ = (param_id, out);
        Err(SpfError::Unsupported)
    }

    /// Processing load in kilo packets per second.
    fn kpps(&self) -> u32 {
        0
    }

    /// Bus bandwidth in bytes per second.
    fn bandwidth(&self) -> u32 {
        0
    }

    /// Informs the module of a port state change.
    fn set_port_state(&mut self, is_input: bool, port_index: u32, state: TopoState) {
        let _ = (is_input, port_index, state);
    }

    /// Informs a module supporting RT propagation of a port's RT flag.
    ///
    /// Returns the value the module wants propagated out of its other side,
    /// or `None` to stop propagation through this module.
    fn propagate_is_rt(&mut self, is_input: bool, port_index: u32, is_rt: bool) -> Option<bool> {
        let _ = (is_input, port_index);
        Some(is_rt)
    }

    /// Informs a module supporting downstream state of an output's state.
    ///
    /// Returns the state to apply on its inputs, `None` to leave them as is.
    fn propagate_ds_state(&mut self, out_index: u32, state: TopoState) -> Option<TopoState> {
        let _ = out_index;
        Some(state)
    }

    /// Handles a global shared-memory announcement or release.
    fn handle_global_shmem(&mut self, msg: &GlobalShmem) -> SpfResult<()> {
        let _ = msg;
        Err(SpfError::Unsupported)
    }

    /// Consumes input bytes and produces output bytes.
    ///
    /// `inputs[i]` holds the bytes available on input `i`. The module drains
    /// what it consumes from the front and appends to `outputs[j]`.
    fn process(&mut self, inputs: &mut [Vec<u8>], outputs: &mut [Vec<u8>]) -> SpfResult<()> {
        if let (Some(inp), Some(out)) = (inputs.first_mut(), outputs.first_mut()) {
            out.append(inp);
        }
        Ok(())
    }

    /// Releases module resources. Called once before the module is dropped.
    fn end(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_shmem_decode() {
        let mut payload = Vec::new();
        for w in [7u32, 0x3, 0x1000, 0x2, 4096] {
            payload.extend_from_slice(&w.to_le_bytes());
        }
        let msg = GlobalShmem::decode(&payload).unwrap();
        assert_eq!(msg.shmem_id, 7);
        assert!(msg.is_ack_not_required());
        assert!(msg.is_release());
        assert_eq!(msg.addr(), 0x2_0000_1000);
        assert_eq!(msg.size, 4096);
    }

    #[test]
    fn global_shmem_short_payload() {
        assert_eq!(GlobalShmem::decode(&[0u8; 19]), Err(SpfError::BadParam));
    }

    #[test]
    fn placeholder_ids() {
        assert!(is_placeholder(MODULE_ID_PLACEHOLDER_DECODER));
        assert!(!is_placeholder(MODULE_ID_RD_SHARED_MEM_EP));
    }

    struct Passthrough;
    impl CapiModule for Passthrough {}

    #[test]
    fn default_process_moves_bytes() {
        let mut m = Passthrough;
        let mut inputs = vec![vec![1u8, 2, 3]];
        let mut outputs = vec![Vec::new()];
        m.process(&mut inputs, &mut outputs).unwrap();
        assert!(inputs[0].is_empty());
        assert_eq!(outputs[0], vec![1, 2, 3]);
    }
}
