//! Bypass shim for disabled or format-rejecting modules.
//!
//! A bypassed single-input/single-output module stops calling its plugin's
//! process function. Its input media format is mirrored straight to the
//! output and data is moved through in place. The shim keeps what the module
//! reported before so that disabling the bypass restores it exactly.

use crate::error::{SpfError, SpfResult};
use crate::media_format::MediaFormat;

use super::graph::Topology;
use super::node::ModuleId;

/// State saved while a module is bypassed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BypassShim {
    /// Processing load before the bypass.
    pub kpps: u32,
    /// Bandwidth before the bypass.
    pub bw: u32,
    /// In-place decision before the bypass.
    pub inplace: bool,
    /// Output format before the bypass.
    pub media_fmt: MediaFormat,
}

/// Processing load of copying one second of `fmt`.
pub fn memcpy_kpps(fmt: &MediaFormat) -> u32 {
    if !fmt.is_pcm() {
        return 0;
    }
    let bytes = u64::from(fmt.pcm.bits_per_sample / 8)
        * u64::from(fmt.pcm.num_channels)
        * u64::from(fmt.pcm.sample_rate);
    (bytes / 4000) as u32
}

impl Topology {
    /// Puts a module into bypass. A no-op if already bypassed.
    ///
    /// Only modules with at most one input and one output can be bypassed.
    pub fn create_bypass(&mut self, id: ModuleId) -> SpfResult<()> {
        let (inputs, outputs) = self.module_ports(id);
        let m = self.module_mut(id).ok_or(SpfError::NotFound)?;
        if m.bypass.is_some() {
            return Ok(());
        }
        if m.max_inputs > 1 || m.max_outputs > 1 || inputs.len() > 1 || outputs.len() > 1 {
            #[cfg(feature = "tracing")]
            tracing::warn!(miid = m.instance_id, "bypass: only SISO modules can be bypassed");
            return Err(SpfError::Unsupported);
        }
        let saved_fmt = outputs
            .first()
            .and_then(|&o| self.output(o))
            .map(|p| p.common.media_fmt.clone())
            .unwrap_or_default();
        let Some(m) = self.module_mut(id) else {
            return Err(SpfError::NotFound);
        };
        m.bypass = Some(BypassShim {
            kpps: m.kpps,
            bw: m.bw,
            inplace: m.flags.inplace,
            media_fmt: saved_fmt,
        });
        m.kpps = 0;
        m.bw = 0;
        m.flags.inplace = true;
        #[cfg(feature = "tracing")]
        tracing::warn!(miid = m.instance_id, "bypass: module bypassed");

        self.bypass_copy_media_fmt(id);
        self.events.kpps_bw_change = true;
        self.events.dynamic_inplace_change = true;
        Ok(())
    }

    /// Takes a module out of bypass. A no-op if not bypassed.
    pub fn destroy_bypass(&mut self, id: ModuleId) -> SpfResult<()> {
        let (_, outputs) = self.module_ports(id);
        let m = self.module_mut(id).ok_or(SpfError::NotFound)?;
        let Some(shim) = m.bypass.take() else {
            return Ok(());
        };
        m.kpps = shim.kpps;
        m.bw = shim.bw;
        m.flags.inplace = shim.inplace;
        if let Some(capi) = m.capi.as_ref() {
            m.kpps = capi.kpps();
            m.bw = capi.bandwidth();
        }
        #[cfg(feature = "tracing")]
        tracing::info!(miid = m.instance_id, "bypass: module enabled");

        // The plugin decides the output format again once it is live.
        let computed = outputs.first().and_then(|&o| {
            let idx = self.output(o)?.common.index;
            self.module(id)?.capi.as_ref()?.output_media_format(idx)
        });
        let restore = computed.unwrap_or(shim.media_fmt);
        if let Some(&o) = outputs.first() {
            self.set_output_media_fmt(o, restore);
        }
        self.events.kpps_bw_change = true;
        self.events.dynamic_inplace_change = true;
        self.events.port_thresh = true;
        Ok(())
    }

    /// Enables or disables a module; disabled modules run as a bypass shim.
    pub fn set_module_disabled(&mut self, id: ModuleId, disabled: bool) -> SpfResult<()> {
        let m = self.module_mut(id).ok_or(SpfError::NotFound)?;
        if m.flags.disabled == disabled {
            return Ok(());
        }
        m.flags.disabled = disabled;
        if disabled {
            self.create_bypass(id)
        } else if self.module(id).is_some_and(|m| !m.flags.module_rejected_mf) {
            self.destroy_bypass(id)
        } else {
            Ok(())
        }
    }

    /// Mirrors a bypassed module's input format to its output.
    ///
    /// Returns true when the output format changed.
    pub(crate) fn bypass_copy_media_fmt(&mut self, id: ModuleId) -> bool {
        let (inputs, outputs) = self.module_ports(id);
        let (Some(&i), Some(&o)) = (inputs.first(), outputs.first()) else {
            return false;
        };
        let Some(inp) = self.input(i) else {
            return false;
        };
        if !inp.common.flags.is_mf_valid {
            return false;
        }
        let fmt = inp.common.media_fmt.clone();
        let changed = self
            .output(o)
            .is_some_and(|p| !p.common.flags.is_mf_valid || p.common.media_fmt.has_changed(&fmt));
        if changed {
            if self.output(o).is_some_and(|p| p.common.has_pending_data()) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    log_id = self.log_id,
                    "bypass: output holds data of the previous format"
                );
            }
            self.set_output_media_fmt(o, fmt);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memcpy_kpps_scales_with_rate() {
        let f = MediaFormat::pcm(48000, 16, 2);
        assert_eq!(memcpy_kpps(&f), 48);
        assert_eq!(memcpy_kpps(&MediaFormat::raw_compressed(1)), 0);
    }
}
