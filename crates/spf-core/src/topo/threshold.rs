//! Port thresholds, buffer sizing and the static in-place decision.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::icb::FrameLength;
use crate::media_format::MediaFormat;

use super::graph::Topology;
use super::node::ModuleId;

/// Buffer size used when neither a threshold nor a container frame is known.
pub const DEFAULT_PORT_BUF_LEN: u32 = 4096;

impl Topology {
    /// Queries every module for its port thresholds and resizes port buffers.
    ///
    /// A threshold of 0 or 1 means the port accepts any amount of data. A
    /// module that declares a threshold on any port cannot run in place.
    pub fn determine_port_thresholds(&mut self) {
        let ids: Vec<ModuleId> = self.sorted().to_vec();
        for mid in ids {
            self.determine_module_thresholds(mid);
            self.check_dynamic_inplace(mid);
        }
        self.events.port_thresh = false;
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, "threshold: port thresholds updated");
    }

    fn determine_module_thresholds(&mut self, mid: ModuleId) {
        let (inputs, outputs) = self.module_ports(mid);
        let frame = self.cntr_frame;
        let mut any = false;

        for &i in &inputs {
            let Some(p) = self.input(i) else { continue };
            let thr = self.query_threshold(mid, true, p.common.index);
            let frame_bytes = frame_bytes_at(&p.common.media_fmt, &frame);
            if let Some(p) = self.input_mut(i) {
                apply_threshold(&mut p.common, thr, frame_bytes);
                any |= p.common.flags.port_has_threshold;
            }
        }
        for &o in &outputs {
            let Some(p) = self.output(o) else { continue };
            let thr = self.query_threshold(mid, false, p.common.index);
            let frame_bytes = frame_bytes_at(&p.common.media_fmt, &frame);
            if let Some(p) = self.output_mut(o) {
                apply_threshold(&mut p.common, thr, frame_bytes);
                any |= p.common.flags.port_has_threshold;
            }
        }

        let Some(m) = self.module_mut(mid) else {
            return;
        };
        if m.caps.dynamic_inplace || m.bypass.is_some() {
            return;
        }
        let inplace = !any && m.caps.inplace;
        if m.flags.inplace != inplace {
            m.flags.inplace = inplace;
            self.events.dynamic_inplace_change = true;
        }
    }

    fn query_threshold(&self, mid: ModuleId, is_input: bool, index: u32) -> u32 {
        let Some(m) = self.module(mid) else {
            return 0;
        };
        if m.bypass.is_some() {
            return 0;
        }
        m.capi
            .as_ref()
            .and_then(|c| c.port_threshold(is_input, index))
            .unwrap_or(0)
    }
}

/// Bytes of one container frame in `fmt`, 0 when either is unknown.
pub fn frame_bytes_at(fmt: &MediaFormat, frame: &FrameLength) -> u32 {
    if !fmt.is_pcm() || fmt.pcm.sample_rate == 0 {
        return 0;
    }
    let samples = if frame.sample_rate == fmt.pcm.sample_rate && frame.frame_len_samples != 0 {
        u64::from(frame.frame_len_samples)
    } else {
        frame.to_us() * u64::from(fmt.pcm.sample_rate) / 1_000_000
    };
    fmt.bytes_for_samples_all_ch(samples as u32)
}

fn apply_threshold(port: &mut super::node::CommonPort, thr: u32, frame_bytes: u32) {
    let threshold = if thr > 1 { thr } else { 0 };
    port.threshold = threshold;
    port.flags.port_has_threshold = threshold != 0;
    let len = threshold.max(frame_bytes);
    port.buf.max_len = if len == 0 { DEFAULT_PORT_BUF_LEN } else { len };
}
