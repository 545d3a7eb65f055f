//! Inter-container buffering (ICB) negotiation.
//!
//! Given what an upstream container produces per trigger and what the
//! downstream container consumes, [`determine_buffering`] decides how many
//! regular buffers, regular pre-buffers and what one-time pre-buffer the
//! upstream external output must hold so that neither side starves.
//!
//! Frame lengths are compared in samples when both sides run at the same
//! non-zero sample rate and express their frames in samples, otherwise in
//! microseconds.

/// Scenario id of playback subgraphs.
pub const SID_PLAYBACK: u32 = 1;
/// Scenario id of record subgraphs.
pub const SID_RECORD: u32 = 2;
/// Scenario id of voice call subgraphs. Disables extra buffering.
pub const SID_VOICE_CALL: u32 = 3;

/// A frame length expressed as samples at a rate, or directly in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameLength {
    /// Samples per frame, valid with a non-zero `sample_rate`.
    pub frame_len_samples: u32,
    /// Sample rate of `frame_len_samples`.
    pub sample_rate: u32,
    /// Frame length in microseconds.
    pub frame_len_us: u32,
}

impl FrameLength {
    /// Frame length given in samples.
    pub fn samples(frame_len_samples: u32, sample_rate: u32) -> Self {
        let frame_len_us = if sample_rate == 0 {
            0
        } else {
            (u64::from(frame_len_samples) * 1_000_000 / u64::from(sample_rate)) as u32
        };
        Self {
            frame_len_samples,
            sample_rate,
            frame_len_us,
        }
    }

    /// Frame length given in microseconds.
    pub fn micros(frame_len_us: u32) -> Self {
        Self {
            frame_len_us,
            ..Self::default()
        }
    }

    /// True when nothing is known about the frame.
    pub fn is_zero(&self) -> bool {
        self.frame_len_samples == 0 && self.sample_rate == 0 && self.frame_len_us == 0
    }

    /// Length in microseconds, derived from samples when not given directly.
    pub fn to_us(&self) -> u64 {
        if self.frame_len_us != 0 {
            u64::from(self.frame_len_us)
        } else if self.sample_rate != 0 {
            u64::from(self.frame_len_samples) * 1_000_000 / u64::from(self.sample_rate)
        } else {
            0
        }
    }
}

/// Per-side behavior flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbFlags {
    /// Side consumes variable sized input.
    pub variable_input: bool,
    /// Side produces variable sized output.
    pub variable_output: bool,
    /// Side is driven by a real-time trigger.
    pub is_real_time: bool,
    /// Side asks for single buffering.
    pub is_default_single_buffering_mode: bool,
}

impl IcbFlags {
    /// True when no flag is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What the producing container reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpstreamInfo {
    /// Frame produced per trigger.
    pub len: FrameLength,
    /// Trigger period.
    pub period_us: u32,
    /// Flags of the producer.
    pub flags: IcbFlags,
    /// Scenario id of the producer's subgraph.
    pub sid: u32,
    /// Producer explicitly refuses a one-time pre-buffer.
    pub disable_otp: bool,
}

/// What the consuming container reported back to the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownstreamInfo {
    /// Frame consumed per trigger.
    pub len: FrameLength,
    /// Trigger period.
    pub period_us: u32,
    /// Flags of the consumer.
    pub flags: IcbFlags,
    /// Scenario id of the consumer's subgraph.
    pub sid: u32,
}

impl DownstreamInfo {
    /// True when downstream has not informed anything yet.
    pub fn is_unknown(&self) -> bool {
        self.len.is_zero() && self.period_us == 0 && self.flags.is_empty() && self.sid == 0
    }
}

/// Buffering decision for one external output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbBuffering {
    /// Regular buffers, each one upstream frame.
    pub num_reg_bufs: u32,
    /// Regular buffers pre-filled with zeros at start.
    pub num_reg_prebufs: u32,
    /// One-time pre-buffer length, zero when none.
    pub otp: FrameLength,
    /// Double buffering was ruled out.
    pub double_buf_disabled: bool,
    /// One-time pre-buffer was ruled out.
    pub otp_disabled: bool,
}

impl IcbBuffering {
    /// Buffering assumed before any negotiation took place.
    pub fn fallback() -> Self {
        Self {
            num_reg_bufs: 2,
            ..Self::default()
        }
    }
}

fn is_voice(sid: u32) -> bool {
    sid == SID_VOICE_CALL
}

/// Frame lengths and period in one common unit.
struct Normalized {
    us_len: u64,
    ds_len: u64,
    period: u64,
}

fn normalize(us: &UpstreamInfo, ds: &DownstreamInfo) -> Normalized {
    let same_rate = us.len.sample_rate != 0 && us.len.sample_rate == ds.len.sample_rate;
    if same_rate && us.len.frame_len_samples != 0 && ds.len.frame_len_samples != 0 {
        let sr = u64::from(us.len.sample_rate);
        Normalized {
            us_len: u64::from(us.len.frame_len_samples),
            ds_len: u64::from(ds.len.frame_len_samples),
            period: (u64::from(us.period_us) * sr).div_ceil(1_000_000),
        }
    } else {
        Normalized {
            us_len: us.len.to_us(),
            ds_len: ds.len.to_us(),
            period: u64::from(us.period_us),
        }
    }
}

/// Computes the buffering an upstream external output needs toward its peer.
///
/// Never fails. Zero-length inputs fall back to minimal buffering.
pub fn determine_buffering(us: &UpstreamInfo, ds: &DownstreamInfo) -> IcbBuffering {
    let n = normalize(us, ds);
    let voice_to_voice = is_voice(us.sid) && is_voice(ds.sid);

    let double_buf_disabled = voice_to_voice
        || !ds.flags.is_real_time
        || us.flags.is_default_single_buffering_mode
        || (n.us_len <= n.ds_len && ds.flags.is_default_single_buffering_mode);

    let otp_disabled = us.disable_otp || is_voice(us.sid) || is_voice(ds.sid);
    let reg_prebuf_disabled = is_voice(us.sid);

    let base = if double_buf_disabled { 1 } else { 2 };
    let mut count: u64 = if n.us_len == 0 || n.us_len >= n.ds_len {
        base
    } else {
        n.ds_len.div_ceil(n.us_len)
    };

    // The finer of the two frames is the unit at which buffers drain.
    let unit = match (n.us_len, n.ds_len) {
        (0, _) => 0,
        (u, 0) => u,
        (u, d) => u.min(d),
    };
    if unit != 0 && n.period > unit * count {
        count = n.period.div_ceil(unit);
    }

    let both_rt = us.flags.is_real_time && ds.flags.is_real_time;

    let mut otp = FrameLength::default();
    if both_rt && !otp_disabled {
        otp = ds.len;
        if otp.frame_len_us == 0 {
            otp.frame_len_us = ds.len.to_us() as u32;
        }
    }

    let non_multiple = n.us_len != 0
        && n.ds_len != 0
        && (n.us_len.max(n.ds_len) % n.us_len.min(n.ds_len)) != 0;
    let num_reg_prebufs = u32::from(
        ds.flags.is_real_time
            && !reg_prebuf_disabled
            && (us.flags.variable_output || ds.flags.variable_input || non_multiple),
    );

    if both_rt && n.us_len < n.ds_len && !is_voice(us.sid) && !is_voice(ds.sid) {
        count += 1;
    }

    let result = IcbBuffering {
        num_reg_bufs: count.clamp(1, u64::from(u32::MAX)) as u32,
        num_reg_prebufs,
        otp,
        double_buf_disabled,
        otp_disabled,
    };

    #[cfg(feature = "tracing")]
    tracing::debug!(
        us_len = n.us_len,
        ds_len = n.ds_len,
        period = n.period,
        num_reg_bufs = result.num_reg_bufs,
        num_reg_prebufs = result.num_reg_prebufs,
        otp_us = result.otp.frame_len_us,
        "icb: buffering determined"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(len_us: u32, period_us: u32, rt: bool) -> UpstreamInfo {
        UpstreamInfo {
            len: FrameLength::micros(len_us),
            period_us,
            flags: IcbFlags {
                is_real_time: rt,
                ..IcbFlags::default()
            },
            sid: SID_PLAYBACK,
            disable_otp: false,
        }
    }

    fn ds(len_us: u32, rt: bool) -> DownstreamInfo {
        DownstreamInfo {
            len: FrameLength::micros(len_us),
            period_us: len_us,
            flags: IcbFlags {
                is_real_time: rt,
                ..IcbFlags::default()
            },
            sid: SID_PLAYBACK,
        }
    }

    #[test]
    fn nrt_upstream_into_rt_downstream() {
        let r = determine_buffering(&us(5000, 5000, false), &ds(1000, true));
        assert_eq!(r.num_reg_bufs, 5);
        assert_eq!(r.num_reg_prebufs, 0);
        assert_eq!(r.otp, FrameLength::default());
    }

    #[test]
    fn equal_rt_frames_double_buffer_with_otp() {
        let r = determine_buffering(&us(1000, 1000, true), &ds(1000, true));
        assert_eq!(r.num_reg_bufs, 2);
        assert_eq!(r.num_reg_prebufs, 0);
        assert_eq!(r.otp.frame_len_us, 1000);
    }

    #[test]
    fn nrt_downstream_disables_double_buffering() {
        let r = determine_buffering(&us(1000, 1000, true), &ds(1000, false));
        assert!(r.double_buf_disabled);
        assert_eq!(r.num_reg_bufs, 1);
    }

    #[test]
    fn smaller_upstream_needs_ceil_and_jitter_buffer() {
        // 2 ms into 5 ms: ceil(5/2) = 3, +1 jitter, +1 regular prebuf (non-multiple).
        let r = determine_buffering(&us(2000, 2000, true), &ds(5000, true));
        assert_eq!(r.num_reg_bufs, 4);
        assert_eq!(r.num_reg_prebufs, 1);
    }

    #[test]
    fn exact_multiple_uses_quotient() {
        let r = determine_buffering(&us(1000, 1000, false), &ds(4000, true));
        assert_eq!(r.num_reg_bufs, 4);
        assert_eq!(r.num_reg_prebufs, 0);
    }

    #[test]
    fn voice_to_voice_single_buffer() {
        let mut u = us(20000, 20000, true);
        u.sid = SID_VOICE_CALL;
        let mut d = ds(20000, true);
        d.sid = SID_VOICE_CALL;
        let r = determine_buffering(&u, &d);
        assert!(r.double_buf_disabled);
        assert!(r.otp_disabled);
        assert_eq!(r.num_reg_bufs, 1);
        assert_eq!(r.num_reg_prebufs, 0);
    }

    #[test]
    fn variable_output_adds_regular_prebuffer() {
        let mut u = us(1000, 1000, true);
        u.flags.variable_output = true;
        let r = determine_buffering(&u, &ds(1000, true));
        assert_eq!(r.num_reg_prebufs, 1);
    }

    #[test]
    fn samples_preferred_with_matching_rates() {
        let u = UpstreamInfo {
            len: FrameLength::samples(480, 48000),
            period_us: 10000,
            flags: IcbFlags::default(),
            sid: SID_PLAYBACK,
            disable_otp: false,
        };
        let d = DownstreamInfo {
            len: FrameLength::samples(48, 48000),
            period_us: 1000,
            flags: IcbFlags {
                is_real_time: true,
                ..IcbFlags::default()
            },
            sid: SID_PLAYBACK,
        };
        let r = determine_buffering(&u, &d);
        assert_eq!(r.num_reg_bufs, 10);
    }

    #[test]
    fn zero_lengths_degrade_to_minimal() {
        let r = determine_buffering(&UpstreamInfo::default(), &DownstreamInfo::default());
        assert_eq!(r.num_reg_bufs, 1);
        let u = us(0, 0, true);
        let r = determine_buffering(&u, &ds(1000, true));
        assert!(r.num_reg_bufs >= 1);
    }

    #[test]
    fn downstream_unknown_detection() {
        assert!(DownstreamInfo::default().is_unknown());
        assert!(!ds(1000, false).is_unknown());
    }
}
