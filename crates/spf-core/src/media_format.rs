//! Media format carried by every data port.
//!
//! PCM formats are compared field by field to decide whether a propagated
//! format is an actual change. Anything that is not PCM is treated as changed
//! whenever it is propagated, since the payload header is opaque here.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// Maximum channels a PCM port can carry.
pub const MAX_CHANNELS: u32 = 32;

/// Data format family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataFormat {
    /// Not received yet.
    #[default]
    Unknown,
    /// Fixed point PCM.
    FixedPoint,
    /// Floating point PCM.
    FloatingPoint,
    /// Raw compressed bitstream.
    RawCompressed,
    /// IEC 61937 packetized.
    Iec61937Packetized,
    /// DSD over PCM.
    DsdDopPacketized,
    /// Compressed over PCM packetized.
    ComprOverPcmPacketized,
    /// Generic compressed.
    GenericCompressed,
    /// IEC 60958 packetized.
    Iec60958Packetized,
    /// Raw compressed split into per-channel-group buffers.
    DeinterleavedRawCompressed,
}

impl DataFormat {
    /// True for formats that carry PCM samples and a PCM header.
    pub fn is_pcm(self) -> bool {
        matches!(
            self,
            Self::FixedPoint
                | Self::FloatingPoint
                | Self::Iec61937Packetized
                | Self::DsdDopPacketized
                | Self::ComprOverPcmPacketized
                | Self::Iec60958Packetized
        )
    }

    /// True for raw compressed (interleaved or not).
    pub fn is_raw_compressed(self) -> bool {
        matches!(self, Self::RawCompressed | Self::DeinterleavedRawCompressed)
    }

    /// Public data format id reported in debug dumps.
    pub fn public_id(self) -> u32 {
        match self {
            Self::FixedPoint => 1,
            Self::Iec61937Packetized => 2,
            Self::DsdDopPacketized => 4,
            Self::GenericCompressed => 5,
            Self::RawCompressed => 6,
            _ => 0,
        }
    }
}

/// Sample layout of multichannel PCM buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Interleaving {
    /// Unset.
    #[default]
    Unknown,
    /// L R L R ...
    Interleaved,
    /// One buffer, channels back to back.
    DeinterleavedPacked,
    /// One buffer per channel, legacy buffer accounting.
    DeinterleavedUnpacked,
    /// One buffer per channel, only the first buffer carries lengths.
    DeinterleavedUnpackedV2,
}

impl Interleaving {
    /// Bit value used in capability masks and debug dumps.
    pub fn bits(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Interleaved => 1,
            Self::DeinterleavedPacked => 2,
            Self::DeinterleavedUnpacked => 4,
            Self::DeinterleavedUnpackedV2 => 8,
        }
    }

    /// True for either flavor of deinterleaved unpacked.
    pub fn is_unpacked(self) -> bool {
        matches!(self, Self::DeinterleavedUnpacked | Self::DeinterleavedUnpackedV2)
    }
}

/// Byte order of PCM samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Unset.
    #[default]
    Unknown,
    /// Little endian.
    Little,
    /// Big endian.
    Big,
}

impl Endianness {
    /// Public id reported in debug dumps.
    pub fn public_id(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Little => 1,
            Self::Big => 2,
        }
    }
}

/// PCM parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    /// Byte order.
    pub endianness: Endianness,
    /// Samples per second.
    pub sample_rate: u32,
    /// Valid bits per sample.
    pub bit_width: u32,
    /// Container bits per sample.
    pub bits_per_sample: u32,
    /// Q format of fixed point samples.
    pub q_factor: u32,
    /// Buffer layout.
    pub interleaving: Interleaving,
    /// Channel count.
    pub num_channels: u32,
    /// Channel type per channel, `num_channels` entries.
    pub chan_map: Vec<u8>,
}

/// Channel group mask of one deinterleaved raw buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask {
    /// Low word.
    pub lsw: u32,
    /// High word.
    pub msw: u32,
}

/// Media format of a data port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MediaFormat {
    /// Format family.
    pub data_format: DataFormat,
    /// Format id (PCM, MP3, ...).
    pub fmt_id: u32,
    /// PCM parameters, meaningful only when [`DataFormat::is_pcm`].
    pub pcm: PcmFormat,
    /// Buffer masks, meaningful only for deinterleaved raw compressed.
    pub deint_raw: Vec<ChannelMask>,
}

/// Format id of linear PCM.
pub const MEDIA_FMT_ID_PCM: u32 = 0x0001_0942;

impl MediaFormat {
    /// Builds a fixed-point interleaved PCM format with a default channel map.
    pub fn pcm(sample_rate: u32, bits_per_sample: u32, num_channels: u32) -> Self {
        let q_factor = match bits_per_sample {
            16 => 15,
            24 => 27,
            32 => 31,
            _ => bits_per_sample.saturating_sub(1),
        };
        Self {
            data_format: DataFormat::FixedPoint,
            fmt_id: MEDIA_FMT_ID_PCM,
            pcm: PcmFormat {
                endianness: Endianness::Little,
                sample_rate,
                bit_width: bits_per_sample,
                bits_per_sample,
                q_factor,
                interleaving: Interleaving::Interleaved,
                num_channels,
                chan_map: (1..=num_channels).map(|c| c as u8).collect(),
            },
            deint_raw: Vec::new(),
        }
    }

    /// Builds a raw compressed format.
    pub fn raw_compressed(fmt_id: u32) -> Self {
        Self {
            data_format: DataFormat::RawCompressed,
            fmt_id,
            ..Self::default()
        }
    }

    /// True once a format has been assigned.
    #[inline]
    pub fn is_known(&self) -> bool {
        self.data_format != DataFormat::Unknown
    }

    /// True if this is PCM (any PCM-carrying family).
    #[inline]
    pub fn is_pcm(&self) -> bool {
        self.data_format.is_pcm()
    }

    /// Whether `new` differs from `self` in a way modules must be told about.
    pub fn has_changed(&self, new: &Self) -> bool {
        if self.data_format != new.data_format {
            return true;
        }
        if !new.is_pcm() {
            return true;
        }
        let (a, b) = (&self.pcm, &new.pcm);
        a.endianness != b.endianness
            || a.sample_rate != b.sample_rate
            || a.bit_width != b.bit_width
            || a.bits_per_sample != b.bits_per_sample
            || a.interleaving != b.interleaving
            || a.num_channels != b.num_channels
            || self.fmt_id != new.fmt_id
            || a.q_factor != b.q_factor
            || a.chan_map != b.chan_map
    }

    /// Channel count, 1 for non-PCM formats.
    pub fn channels(&self) -> u32 {
        if self.is_pcm() {
            self.pcm.num_channels.max(1)
        } else {
            1
        }
    }

    /// Bytes per sample per channel, 1 for non-PCM formats.
    pub fn bytes_per_sample(&self) -> u32 {
        if self.is_pcm() {
            (self.pcm.bits_per_sample / 8).max(1)
        } else {
            1
        }
    }

    /// Bytes needed to hold `samples` samples on every channel.
    pub fn bytes_for_samples_all_ch(&self, samples: u32) -> u32 {
        samples
            .saturating_mul(self.bytes_per_sample())
            .saturating_mul(self.channels())
    }

    /// Bytes needed to hold `samples` samples on one channel.
    pub fn bytes_for_samples_per_ch(&self, samples: u32) -> u32 {
        samples.saturating_mul(self.bytes_per_sample())
    }

    /// Duration of `bytes_all_ch` bytes in microseconds, 0 when not PCM.
    pub fn bytes_to_us(&self, bytes_all_ch: u32) -> u64 {
        if !self.is_pcm() || self.pcm.sample_rate == 0 {
            return 0;
        }
        let per_sample = u64::from(self.bytes_per_sample()) * u64::from(self.channels());
        let samples = u64::from(bytes_all_ch) / per_sample;
        samples * 1_000_000 / u64::from(self.pcm.sample_rate)
    }

    /// Applies the unpacked interleaving rule for a receiving module.
    ///
    /// A deinterleaved-unpacked PCM format is delivered as V2 when the receiver
    /// understands V2, otherwise as the legacy V1 layout.
    pub fn adjusted_for_receiver(&self, receiver_supports_v2: bool) -> Self {
        let mut out = self.clone();
        if out.is_pcm() && out.pcm.interleaving.is_unpacked() {
            out.pcm.interleaving = if receiver_supports_v2 {
                Interleaving::DeinterleavedUnpackedV2
            } else {
                Interleaving::DeinterleavedUnpacked
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_pcm_is_not_a_change() {
        let a = MediaFormat::pcm(48000, 16, 2);
        assert!(!a.has_changed(&a.clone()));
    }

    #[test]
    fn pcm_field_differences_are_changes() {
        let a = MediaFormat::pcm(48000, 16, 2);
        let mut b = a.clone();
        b.pcm.sample_rate = 44100;
        assert!(a.has_changed(&b));

        let mut c = a.clone();
        c.pcm.chan_map[1] = 9;
        assert!(a.has_changed(&c));

        let mut d = a.clone();
        d.pcm.q_factor = 27;
        assert!(a.has_changed(&d));
    }

    #[test]
    fn non_pcm_always_changes() {
        let a = MediaFormat::raw_compressed(0x1234);
        assert!(a.has_changed(&a.clone()));
    }

    #[test]
    fn data_format_switch_is_change() {
        let a = MediaFormat::pcm(48000, 16, 2);
        let b = MediaFormat::raw_compressed(0x1234);
        assert!(a.has_changed(&b));
    }

    #[test]
    fn unpacked_adjustment() {
        let mut f = MediaFormat::pcm(48000, 16, 2);
        f.pcm.interleaving = Interleaving::DeinterleavedUnpacked;
        assert_eq!(
            f.adjusted_for_receiver(true).pcm.interleaving,
            Interleaving::DeinterleavedUnpackedV2
        );
        f.pcm.interleaving = Interleaving::DeinterleavedUnpackedV2;
        assert_eq!(
            f.adjusted_for_receiver(false).pcm.interleaving,
            Interleaving::DeinterleavedUnpacked
        );
        let packed = MediaFormat::pcm(48000, 16, 2);
        assert_eq!(
            packed.adjusted_for_receiver(false).pcm.interleaving,
            Interleaving::Interleaved
        );
    }

    #[test]
    fn byte_helpers() {
        let f = MediaFormat::pcm(48000, 16, 2);
        assert_eq!(f.bytes_for_samples_all_ch(48), 192);
        assert_eq!(f.bytes_for_samples_per_ch(48), 96);
        assert_eq!(f.bytes_to_us(192), 1000);
        assert_eq!(MediaFormat::default().channels(), 1);
    }
}
