//! Real-time monitor (RTM) dump of port media formats.
//!
//! A packet is a 28-byte header followed by one record per port:
//!
//! ```text
//! header   version u32 | miid u32, param_id u32, param_size u32, reserved u32
//!          | container_id u32, num_port_media_format u32
//! record   miid u32, port_id u32 | data_format u32, fmt_id u32, payload_size u32
//!          | payload
//! ```
//!
//! PCM payloads are 10 fixed bytes plus one channel-map byte per channel,
//! zero padded to a multiple of 4. Deinterleaved raw payloads are a buffer
//! count followed by two mask words per buffer. Other formats carry no
//! payload. All fields are little endian.
//!
//! A full dump that does not fit into [`MAX_LOG_PKT_SIZE_RTM`] bytes is split
//! across several packets, each stamped with the next sequence number.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::capi::APM_MODULE_INSTANCE_ID;
use crate::media_format::{DataFormat, MediaFormat};
use crate::topo::{InPortId, OutPortId, Topology};

/// Largest packet handed to the logging service.
pub const MAX_LOG_PKT_SIZE_RTM: usize = 3360;
/// Bytes of the packet header.
pub const RTM_HEADER_SIZE: usize = 28;
/// Header version written into every packet.
pub const RTM_HEADER_VERSION_0: u32 = 0;
/// Param id of the port media format report.
pub const APM_PARAM_ID_PORT_MEDIA_FMT_REPORT_CFG: u32 = 0x0800_1A9C;

/// Bytes of a record before its payload.
const RECORD_HEADER_SIZE: usize = 20;
/// Fixed part of a PCM payload.
const PCM_FIXED_SIZE: usize = 10;

/// A port addressed from either side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortRef {
    /// An input port.
    Input(InPortId),
    /// An output port.
    Output(OutPortId),
}

/// One committed log packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtmPacket {
    /// Running sequence number.
    pub seq: u32,
    /// Encoded packet.
    pub bytes: Vec<u8>,
}

impl RtmPacket {
    /// Number of port records, read back from the header.
    pub fn num_ports(&self) -> u32 {
        read_u32(&self.bytes, 24)
    }

    /// Container id, read back from the header.
    pub fn container_id(&self) -> u32 {
        read_u32(&self.bytes, 20)
    }
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    b.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fn put_u32(b: &mut Vec<u8>, v: u32) {
    b.extend_from_slice(&v.to_le_bytes());
}

/// Encoded size of a port record and the zero padding inside it.
pub fn port_record_size(fmt: &MediaFormat) -> (usize, usize) {
    let (payload, pad) = payload_size(fmt);
    (RECORD_HEADER_SIZE + payload, pad)
}

fn payload_size(fmt: &MediaFormat) -> (usize, usize) {
    match fmt.data_format {
        DataFormat::Unknown | DataFormat::RawCompressed => (0, 0),
        DataFormat::DeinterleavedRawCompressed => (4 + 8 * fmt.deint_raw.len(), 0),
        _ => {
            let actual = PCM_FIXED_SIZE + fmt.pcm.num_channels as usize;
            let aligned = (actual + 3) & !3;
            (aligned, aligned - actual)
        }
    }
}

fn encode_record(b: &mut Vec<u8>, miid: u32, port_id: u32, fmt: &MediaFormat) {
    let (payload, pad) = payload_size(fmt);
    put_u32(b, miid);
    put_u32(b, port_id);
    put_u32(b, fmt.data_format.public_id());
    put_u32(b, fmt.fmt_id);
    put_u32(b, payload as u32);
    match fmt.data_format {
        DataFormat::Unknown | DataFormat::RawCompressed => {}
        DataFormat::DeinterleavedRawCompressed => {
            put_u32(b, fmt.deint_raw.len() as u32);
            for m in &fmt.deint_raw {
                put_u32(b, m.lsw);
                put_u32(b, m.msw);
            }
        }
        _ => {
            let p = &fmt.pcm;
            put_u32(b, p.sample_rate);
            b.push(p.bit_width as u8);
            b.push(p.bits_per_sample as u8);
            b.push(p.q_factor as u8);
            b.push(p.num_channels as u8);
            b.push(p.interleaving.bits() as u8);
            b.push(p.endianness.public_id());
            let n = p.num_channels as usize;
            b.extend(p.chan_map.iter().copied().chain(core::iter::repeat(0)).take(n));
            b.extend(core::iter::repeat_n(0u8, pad));
        }
    }
}

fn encode_header(b: &mut Vec<u8>, container_id: u32, remaining: usize, num_ports: u32) {
    put_u32(b, RTM_HEADER_VERSION_0);
    put_u32(b, APM_MODULE_INSTANCE_ID);
    put_u32(b, APM_PARAM_ID_PORT_MEDIA_FMT_REPORT_CFG);
    put_u32(b, (8 + remaining) as u32);
    put_u32(b, 0);
    put_u32(b, container_id);
    put_u32(b, num_ports);
}

fn patch_num_ports(b: &mut [u8], n: u32) {
    if let Some(s) = b.get_mut(24..28) {
        s.copy_from_slice(&n.to_le_bytes());
    }
}

impl Topology {
    /// Enables or disables the port media format dump.
    ///
    /// Acts only on a change of the enable flag. Enabling dumps every port
    /// once; later format changes are dumped port by port.
    pub fn rtm_dump_data_port_mf_for_all_ports(&mut self, enable: bool) {
        if self.flags.port_mf_rtm_dump_enable == enable {
            return;
        }
        self.flags.port_mf_rtm_dump_enable = enable;
        if !enable {
            return;
        }

        let records = self.port_records_in_sg_order();
        let mut remaining: usize = records.iter().map(|r| port_record_size(&r.2).0).sum();
        let mut pkt: Option<(Vec<u8>, u32)> = None;
        for (miid, port_id, fmt) in records {
            let (size, _) = port_record_size(&fmt);
            let fits = pkt
                .as_ref()
                .is_some_and(|(b, _)| b.len() + size <= MAX_LOG_PKT_SIZE_RTM);
            if !fits {
                if let Some((mut b, n)) = pkt.take() {
                    patch_num_ports(&mut b, n);
                    self.rtm_commit(b);
                }
                let cap = (RTM_HEADER_SIZE + remaining).min(MAX_LOG_PKT_SIZE_RTM);
                let mut b = Vec::with_capacity(cap);
                encode_header(&mut b, self.container_instance_id, remaining, 0);
                pkt = Some((b, 0));
            }
            if let Some((b, n)) = pkt.as_mut() {
                encode_record(b, miid, port_id, &fmt);
                *n += 1;
            }
            remaining -= size;
        }
        if let Some((mut b, n)) = pkt {
            patch_num_ports(&mut b, n);
            self.rtm_commit(b);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(log_id = self.log_id, "rtm: full port media format dump");
    }

    /// Dumps the media format of a single port.
    pub(crate) fn rtm_dump_change_in_port_mf(&mut self, port: PortRef) {
        let (module, port_id, fmt) = match port {
            PortRef::Input(i) => {
                let Some(p) = self.input(i) else { return };
                (p.module, p.common.port_id, &p.common.media_fmt)
            }
            PortRef::Output(o) => {
                let Some(p) = self.output(o) else { return };
                (p.module, p.common.port_id, &p.common.media_fmt)
            }
        };
        let Some(miid) = self.module(module).map(|m| m.instance_id) else {
            return;
        };
        let (size, _) = port_record_size(fmt);
        let mut b = Vec::with_capacity(RTM_HEADER_SIZE + size);
        encode_header(&mut b, self.container_instance_id, size, 1);
        encode_record(&mut b, miid, port_id, fmt);
        self.rtm_commit(b);
    }

    /// Hands out and clears the committed packets.
    pub fn take_rtm_packets(&mut self) -> Vec<RtmPacket> {
        core::mem::take(&mut self.rtm_log)
    }

    fn rtm_commit(&mut self, bytes: Vec<u8>) {
        let seq = self.rtm_seq_num;
        self.rtm_seq_num = self.rtm_seq_num.wrapping_add(1);
        self.rtm_log.push(RtmPacket { seq, bytes });
    }

    /// Every port in subgraph, module, inputs-then-outputs order.
    fn port_records_in_sg_order(&self) -> Vec<(u32, u32, MediaFormat)> {
        let mut out = Vec::new();
        for sg in self.subgraphs() {
            for &mid in &sg.modules {
                let Some(m) = self.module(mid) else { continue };
                for p in m.inputs.iter().filter_map(|&i| self.input(i)) {
                    out.push((m.instance_id, p.common.port_id, p.common.media_fmt.clone()));
                }
                for p in m.outputs.iter().filter_map(|&o| self.output(o)) {
                    out.push((m.instance_id, p.common.port_id, p.common.media_fmt.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::{ModuleCaps, ModuleSpec};

    #[test]
    fn pcm_record_is_padded_to_four() {
        let stereo = MediaFormat::pcm(48000, 16, 2);
        assert_eq!(port_record_size(&stereo), (20 + 12, 0));
        let mono = MediaFormat::pcm(48000, 16, 1);
        assert_eq!(port_record_size(&mono), (20 + 12, 1));
        let six = MediaFormat::pcm(48000, 16, 6);
        assert_eq!(port_record_size(&six), (20 + 16, 0));
        assert_eq!(port_record_size(&MediaFormat::raw_compressed(9)).0, 20);
    }

    #[test]
    fn encoded_record_matches_size() {
        let mut b = Vec::new();
        let f = MediaFormat::pcm(44100, 24, 3);
        encode_record(&mut b, 5, 2, &f);
        assert_eq!(b.len(), port_record_size(&f).0);
        assert_eq!(read_u32(&b, 0), 5);
        assert_eq!(read_u32(&b, 20), 44100);
        assert_eq!(&b[30..33], &[1, 2, 3]);
    }

    fn topo_with_ports(n_modules: u32) -> Topology {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 1).unwrap();
        for iid in 0..n_modules {
            let spec = ModuleSpec {
                instance_id: 100 + iid,
                module_id: 0x0700_2000,
                serial_num: iid,
                max_inputs: 1,
                max_outputs: 1,
                min_outputs: 1,
                caps: ModuleCaps::default(),
            };
            let m = t.add_module(1, &spec, None).unwrap();
            let i = t.add_input_port(m, 2).unwrap();
            let o = t.add_output_port(m, 1).unwrap();
            t.input_mut(i).unwrap().common.media_fmt = MediaFormat::pcm(48000, 16, 2);
            t.output_mut(o).unwrap().common.media_fmt = MediaFormat::pcm(48000, 16, 2);
        }
        t
    }

    #[test]
    fn enable_only_acts_on_change() {
        let mut t = topo_with_ports(2);
        t.rtm_dump_data_port_mf_for_all_ports(true);
        assert_eq!(t.take_rtm_packets().len(), 1);
        t.rtm_dump_data_port_mf_for_all_ports(true);
        assert!(t.take_rtm_packets().is_empty());
        t.rtm_dump_data_port_mf_for_all_ports(false);
        assert!(t.take_rtm_packets().is_empty());
    }

    #[test]
    fn large_dump_is_split_with_running_seq() {
        // 32 bytes per port, 200 ports.
        let mut t = topo_with_ports(100);
        t.rtm_dump_data_port_mf_for_all_ports(true);
        let pkts = t.take_rtm_packets();
        assert!(pkts.len() > 1);
        let total: u32 = pkts.iter().map(RtmPacket::num_ports).sum();
        assert_eq!(total, 200);
        for (n, p) in pkts.iter().enumerate() {
            assert_eq!(p.seq, n as u32);
            assert!(p.bytes.len() <= MAX_LOG_PKT_SIZE_RTM);
            assert_eq!(p.container_id(), 0x4000);
        }
    }
}
