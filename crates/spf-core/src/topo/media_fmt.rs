//! Media format propagation through the sorted module list.
//!
//! An output carrying a pending format event hands the format to its peer
//! input, the input applies it to its module, and the module's outputs pick
//! up whatever the module computes. Every change on a port requests a
//! threshold recompute; thresholds are never derived any other way.

use crate::capi::is_placeholder;
use crate::error::{SpfError, SpfResult};
use crate::media_format::MediaFormat;
use crate::rtm::PortRef;
use crate::state::TopoState;

use super::bypass::memcpy_kpps;
use super::graph::Topology;
use super::node::{InPortId, ModuleId, OutPortId};

/// Whether a pending format could cross a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Crossing {
    /// Nothing pending on the link.
    Idle,
    /// Format copied to the input.
    Done,
    /// Left pending for a later attempt.
    Deferred,
}

impl Topology {
    /// Propagates pending formats through every module in sorted order.
    ///
    /// `is_data_path` selects the data-path policy: only STARTED inputs
    /// accept a format, and real-time inputs drop buffered data rather than
    /// wait for it to drain. On the control path a link with buffered data is
    /// left pending and retried on the next call.
    pub fn propagate_media_fmt(&mut self, is_data_path: bool) -> SpfResult<()> {
        let sorted = self.sorted().to_vec();
        let mut deferred = false;
        for mid in sorted {
            deferred |= self.propagate_media_fmt_from_module(mid, is_data_path)?;
        }
        self.events.realloc_scratch_mem = true;
        self.events.media_fmt_event = deferred;
        if self.events.port_thresh {
            self.determine_port_thresholds();
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            log_id = self.log_id,
            is_data_path,
            deferred,
            "media_fmt: propagation done"
        );
        Ok(())
    }

    /// Propagates into one module and out of it. Returns true if some input
    /// link had to be deferred.
    pub fn propagate_media_fmt_from_module(
        &mut self,
        mid: ModuleId,
        is_data_path: bool,
    ) -> SpfResult<bool> {
        if self.module(mid).is_none() {
            return Err(SpfError::NotFound);
        }
        let (inputs, outputs) = self.module_ports(mid);
        let mut deferred = false;
        let mut any_in_changed = false;

        for &i in &inputs {
            if self.receive_media_fmt(i, is_data_path) == Crossing::Deferred {
                deferred = true;
            }
            if self
                .input(i)
                .is_some_and(|p| p.common.flags.media_fmt_event)
            {
                any_in_changed = true;
                self.apply_input_media_fmt(mid, i)?;
            }
        }
        if let Some(m) = self.module_mut(mid) {
            m.flags.input_mf_changed = any_in_changed;
        }

        self.update_output_media_fmts(mid, &outputs, any_in_changed);
        self.check_dynamic_inplace(mid);
        Ok(deferred)
    }

    /// Copies a pending format across the link ending at input `i`.
    fn receive_media_fmt(&mut self, i: InPortId, is_data_path: bool) -> Crossing {
        let Some(inp) = self.input(i) else {
            return Crossing::Idle;
        };
        let Some(o) = inp.conn_out else {
            return Crossing::Idle;
        };
        let Some(out) = self.output(o) else {
            return Crossing::Idle;
        };
        let forced = !inp.media_fmt_received && out.common.flags.is_mf_valid;
        if !out.common.flags.media_fmt_event && !forced {
            return Crossing::Idle;
        }

        let module = inp.module;
        let started = inp.common.state == TopoState::Started;
        let pending = inp.common.has_pending_data() || inp.pending_zeros != 0;
        let is_rt = inp.common.flags.is_upstream_rt || inp.common.flags.is_downstream_rt;
        let out_holds_data = out.common.has_pending_data();
        if is_data_path {
            if !started {
                return Crossing::Deferred;
            }
            if out_holds_data {
                if let Some(out) = self.output_mut(o) {
                    out.pending_out_media_fmt = true;
                }
                return Crossing::Deferred;
            }
            if pending {
                if !is_rt {
                    return Crossing::Deferred;
                }
                if let Some(inp) = self.input_mut(i) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        bytes = inp.common.buf.actual_len(),
                        zeros = inp.pending_zeros,
                        "media_fmt: dropping data on real-time input"
                    );
                    inp.common.buf.drop_data();
                    inp.common.metadata_count = 0;
                    inp.pending_zeros = 0;
                }
            }
        } else if pending {
            return Crossing::Deferred;
        }

        let supports_v2 = self
            .module(module)
            .is_some_and(|m| m.caps.supports_deintlvd_unpacked_v2);
        let Some(out) = self.output_mut(o) else {
            return Crossing::Idle;
        };
        let fmt = out.common.media_fmt.adjusted_for_receiver(supports_v2);
        let valid = out.common.flags.is_mf_valid;
        out.common.flags.media_fmt_event = false;
        out.pending_out_media_fmt = false;

        let Some(inp) = self.input_mut(i) else {
            return Crossing::Idle;
        };
        inp.common.media_fmt = fmt;
        inp.common.flags.media_fmt_event = true;
        inp.common.flags.is_mf_valid = valid;
        inp.media_fmt_received = true;
        Crossing::Done
    }

    /// Hands an input's new format to its module.
    ///
    /// A rejected format puts the module in bypass. Fails when the module
    /// cannot be bypassed or taken out of bypass.
    fn apply_input_media_fmt(&mut self, mid: ModuleId, i: InPortId) -> SpfResult<()> {
        let Some(inp) = self.input_mut(i) else {
            return Ok(());
        };
        inp.common.flags.media_fmt_event = false;
        let fmt = inp.common.media_fmt.clone();
        let index = inp.common.index;
        self.events.port_thresh = true;
        if self.flags.port_mf_rtm_dump_enable {
            self.rtm_dump_change_in_port_mf(PortRef::Input(i));
        }

        let Some(m) = self.module_mut(mid) else {
            return Ok(());
        };
        let Some(capi) = m.capi.as_mut() else {
            return Ok(());
        };
        match capi.set_input_media_format(index, &fmt) {
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    miid = m.instance_id,
                    port_index = index,
                    error = %_err,
                    "media_fmt: module rejected format, bypassing"
                );
                m.flags.module_rejected_mf = true;
                if let Err(err) = self.create_bypass(mid) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %err, "media_fmt: bypass not possible");
                    return Err(err);
                }
            }
            Ok(()) => {
                if m.flags.module_rejected_mf {
                    m.flags.module_rejected_mf = false;
                    if !m.flags.disabled && m.bypass.is_some() {
                        self.destroy_bypass(mid)?;
                    }
                }
            }
        }

        let Some(m) = self.module_mut(mid) else {
            return Ok(());
        };
        if m.bypass.is_some() {
            let kpps = memcpy_kpps(&fmt);
            if m.kpps != kpps {
                m.kpps = kpps;
                self.events.kpps_bw_change = true;
            }
        } else if let Some(capi) = m.capi.as_ref() {
            let (kpps, bw) = (capi.kpps(), capi.bandwidth());
            if (kpps, bw) != (m.kpps, m.bw) {
                m.kpps = kpps;
                m.bw = bw;
                self.events.kpps_bw_change = true;
            }
        }
        Ok(())
    }

    /// Refreshes the module's output formats after its inputs changed.
    fn update_output_media_fmts(&mut self, mid: ModuleId, outputs: &[OutPortId], any_in: bool) {
        let Some(m) = self.module(mid) else {
            return;
        };
        let mirrors = m.bypass.is_some() || (m.is_framework() && !is_placeholder(m.module_id));
        if mirrors {
            if m.bypass.is_some() {
                self.bypass_copy_media_fmt(mid);
                return;
            }
            let src = m
                .inputs
                .first()
                .and_then(|&i| self.input(i))
                .filter(|p| p.common.flags.is_mf_valid)
                .map(|p| p.common.media_fmt.clone());
            let Some(src) = src else {
                return;
            };
            for &o in outputs {
                let changed = self.output(o).is_some_and(|p| {
                    !p.common.flags.is_mf_valid || p.common.media_fmt.has_changed(&src)
                });
                if changed {
                    self.set_output_media_fmt(o, src.clone());
                }
            }
            return;
        }

        for &o in outputs {
            let Some(out) = self.output(o) else {
                continue;
            };
            if !any_in && out.common.flags.is_mf_valid {
                continue;
            }
            let index = out.common.index;
            let was_valid = out.common.flags.is_mf_valid;
            let computed = self
                .module(mid)
                .and_then(|m| m.capi.as_ref())
                .and_then(|c| c.output_media_format(index));
            let Some(fmt) = computed.filter(MediaFormat::is_known) else {
                continue;
            };
            let changed = self
                .output(o)
                .is_some_and(|p| !was_valid || p.common.media_fmt.has_changed(&fmt));
            if changed {
                self.set_output_media_fmt(o, fmt);
            }
        }
    }

    /// Installs a new format on an output and raises the related events.
    pub(crate) fn set_output_media_fmt(&mut self, o: OutPortId, fmt: MediaFormat) {
        let Some(out) = self.output_mut(o) else {
            return;
        };
        out.common.flags.is_mf_valid = fmt.is_known();
        out.common.flags.media_fmt_event = true;
        if out.common.has_pending_data() {
            out.pending_out_media_fmt = true;
        }
        out.common.media_fmt = fmt;
        self.events.media_fmt_event = true;
        self.events.port_thresh = true;
        self.set_media_fmt_to_attached(o);
        if self.flags.port_mf_rtm_dump_enable {
            self.rtm_dump_change_in_port_mf(PortRef::Output(o));
        }
    }

    /// Stores a format received from an upstream container on an external input.
    pub fn set_ext_in_media_fmt(&mut self, i: InPortId, fmt: MediaFormat) -> SpfResult<()> {
        let inp = self.input_mut(i).ok_or(SpfError::NotFound)?;
        if !inp.is_ext {
            return Err(SpfError::BadParam);
        }
        inp.common.flags.is_mf_valid = fmt.is_known();
        inp.common.media_fmt = fmt;
        inp.common.flags.media_fmt_event = true;
        inp.media_fmt_received = true;
        self.events.media_fmt_event = true;
        Ok(())
    }

    /// Feeds the host output's format to its attached module.
    fn set_media_fmt_to_attached(&mut self, o: OutPortId) {
        let Some(out) = self.output_mut(o) else {
            return;
        };
        let fmt = out.common.media_fmt.clone();
        let Some(att) = out.attached.as_mut() else {
            return;
        };
        match att.capi.set_input_media_format(0, &fmt) {
            Ok(()) => att.media_fmt = fmt,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    miid = att.instance_id,
                    error = %_err,
                    "media_fmt: attached module rejected host format"
                );
            }
        }
    }

    /// Re-evaluates in-place for modules that toggle it with their format.
    ///
    /// In-place requires one input, one output, the same format on both and
    /// the same threshold on both.
    pub(crate) fn check_dynamic_inplace(&mut self, mid: ModuleId) {
        let Some(m) = self.module(mid) else {
            return;
        };
        if !m.caps.dynamic_inplace || m.bypass.is_some() {
            return;
        }
        let want = if m.is_siso() {
            match (self.input(m.inputs[0]), self.output(m.outputs[0])) {
                (Some(i), Some(o)) => {
                    let both_valid = i.common.flags.is_mf_valid && o.common.flags.is_mf_valid;
                    let same_fmt = !both_valid || !i.common.media_fmt.has_changed(&o.common.media_fmt);
                    same_fmt && i.common.threshold == o.common.threshold
                }
                _ => false,
            }
        } else {
            false
        };
        let Some(m) = self.module_mut(mid) else {
            return;
        };
        if m.flags.inplace != want {
            m.flags.inplace = want;
            #[cfg(feature = "tracing")]
            tracing::debug!(miid = m.instance_id, inplace = want, "media_fmt: dynamic in-place");
            self.events.dynamic_inplace_change = true;
        }
    }
}
