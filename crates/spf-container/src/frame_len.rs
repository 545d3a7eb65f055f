//! Container frame length, trigger period and processing duration.

use spf_config::FrameSizeCfg;
use spf_core::{DownstreamInfo, FrameLength, Topology};
use tracing::{debug, info, warn};

use crate::base::CuBase;
use crate::event_flags::FwkEvent;
use crate::msg::CntrMsg;

/// Frame length used when neither the configuration nor a module threshold
/// decides it.
pub const DEFAULT_FRAME_LEN_US: u32 = 1000;

/// True when `new` describes a different frame than `old`.
///
/// Two sample based lengths compare rate and count. Otherwise both are
/// compared in microseconds.
pub fn frame_len_changed(old: &FrameLength, new: &FrameLength) -> bool {
    if old.sample_rate != 0 && new.sample_rate != 0 {
        old.sample_rate != new.sample_rate || old.frame_len_samples != new.frame_len_samples
    } else {
        old.to_us() != new.to_us()
    }
}

impl CuBase {
    /// Recomputes the processing duration from the frame length and the
    /// weighted clock scale factor, unless a parameter fixed it.
    pub fn update_cntr_proc_duration(&mut self) {
        if self.flags.is_proc_dur_set_paramed {
            return;
        }
        let q4 = self.pm.weighted_kpps_scale_factor_q4.max(1);
        let dur = ((u64::from(self.cntr_frame_len.frame_len_us) << 4) / u64::from(q4)) as u32;
        if dur != self.proc_duration_us {
            self.proc_duration_us = dur;
            self.events.set(FwkEvent::PROC_DUR_CHANGE);
        }
    }

    /// Frame length the container should run with.
    ///
    /// A configured frame size wins. Without one, the first thresholded PCM
    /// port in sorted order decides, then [`DEFAULT_FRAME_LEN_US`].
    pub fn derive_frame_len(&self, topo: &Topology) -> FrameLength {
        match self.cfg.frame_size {
            Some(FrameSizeCfg::Time(us)) if us != 0 => return FrameLength::micros(us),
            Some(FrameSizeCfg::Samples(n)) if n != 0 => {
                let sr = operating_rate(topo);
                if sr != 0 {
                    return FrameLength::samples(n, sr);
                }
            }
            _ => {}
        }
        threshold_frame_len(topo).unwrap_or_else(|| FrameLength::micros(DEFAULT_FRAME_LEN_US))
    }

    /// Applies a new frame length and trigger period.
    ///
    /// Upstream peers that were never told, or that must learn about a
    /// change, get the downstream frame length and flags of this container.
    pub fn handle_frame_len_change(&mut self, topo: &Topology, fm: FrameLength, period_us: u32) {
        let period_changed = period_us != self.period_us;
        if !self.flags.is_period_set_paramed {
            self.period_us = period_us;
        }

        let mut changed = false;
        if fm.is_zero() {
            debug!(log_id = self.log_id, "icb: all fields of frame length zero");
        } else {
            changed = frame_len_changed(&self.cntr_frame_len, &fm);
            self.cntr_frame_len = fm;
            if changed {
                self.events.set(FwkEvent::FRAME_LEN_CHANGE);
            }
            self.update_cntr_proc_duration();
            info!(
                log_id = self.log_id,
                samples = fm.frame_len_samples,
                sample_rate = fm.sample_rate,
                us = fm.frame_len_us,
                period_us = self.period_us,
                proc_duration_us = self.proc_duration_us,
                changed,
                "cu: container frame length"
            );
        }

        self.inform_upstreams_of_frame_len(topo, changed || period_changed);

        if changed {
            for p in self.ext.outputs.values_mut() {
                if p.media_fmt.is_known() {
                    p.upstream_frame_len_changed = true;
                }
            }
        }
    }

    /// Sends this container's frame length to upstream peers. `force` resends
    /// to peers that were already informed.
    pub fn inform_upstreams_of_frame_len(&mut self, topo: &Topology, force: bool) {
        let (len, period_us, log_id) = (self.cntr_frame_len, self.period_us, self.log_id);
        for p in self.ext.inputs.values_mut() {
            let Some(up) = &p.upstream else { continue };
            if p.did_inform_us_of_frame_len && !force {
                continue;
            }
            let info = DownstreamInfo {
                len,
                period_us,
                flags: p.icb_flags,
                sid: topo.subgraph(p.sg_id).map_or(0, |sg| sg.sid),
            };
            let msg = CntrMsg::IcbInfoFromDownstream {
                port: up.port,
                info,
            };
            // fire and forget, waiting on the peer could deadlock
            if up.tx.send(msg).is_err() {
                warn!(log_id, peer = up.cntr_id, "icb: upstream peer gone");
                continue;
            }
            info!(
                log_id,
                miid = p.addr.module,
                port = p.addr.port,
                us = len.frame_len_us,
                period_us,
                real_time = p.icb_flags.is_real_time,
                "icb: informed upstream of frame length"
            );
            p.did_inform_us_of_frame_len = true;
        }
    }
}

/// Sample rate of the first PCM external input, else of any PCM port.
fn operating_rate(topo: &Topology) -> u32 {
    topo.inputs()
        .filter(|p| p.is_ext)
        .chain(topo.inputs())
        .map(|p| &p.common.media_fmt)
        .chain(topo.outputs().map(|p| &p.common.media_fmt))
        .find(|f| f.is_pcm() && f.pcm.sample_rate != 0)
        .map_or(0, |f| f.pcm.sample_rate)
}

fn threshold_frame_len(topo: &Topology) -> Option<FrameLength> {
    topo.sorted().iter().find_map(|&mid| {
        let m = topo.module(mid)?;
        let commons = m
            .inputs
            .iter()
            .filter_map(|&i| topo.input(i).map(|p| &p.common))
            .chain(m.outputs.iter().filter_map(|&o| topo.output(o).map(|p| &p.common)));
        commons
            .filter(|c| c.flags.port_has_threshold && c.media_fmt.is_pcm())
            .find_map(|c| {
                let per_sample = c.media_fmt.bytes_for_samples_all_ch(1);
                (per_sample != 0).then(|| {
                    FrameLength::samples(c.threshold / per_sample, c.media_fmt.pcm.sample_rate)
                })
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::NullPowerManager;
    use crossbeam_channel::unbounded;
    use spf_config::PortAddr;
    use spf_core::{ModuleCaps, ModuleSpec};

    fn base() -> CuBase {
        CuBase::new(0x4000, 1, Box::new(NullPowerManager::default()))
    }

    // --- change detection ---

    #[test]
    fn samples_compare_by_rate_and_count() {
        let a = FrameLength::samples(480, 48000);
        assert!(!frame_len_changed(&a, &FrameLength::samples(480, 48000)));
        assert!(frame_len_changed(&a, &FrameLength::samples(441, 44100)));
    }

    #[test]
    fn mixed_forms_compare_in_micros() {
        let a = FrameLength::samples(480, 48000);
        assert!(!frame_len_changed(&a, &FrameLength::micros(10_000)));
        assert!(frame_len_changed(&a, &FrameLength::micros(5000)));
    }

    // --- proc duration ---

    #[test]
    fn proc_duration_follows_frame_len() {
        let mut cu = base();
        let t = Topology::new(0x4000, 1);
        cu.handle_frame_len_change(&t, FrameLength::micros(5000), 5000);
        assert_eq!(cu.proc_duration_us, 5000);
        assert_eq!(cu.period_us, 5000);
        let ev = cu.events.take();
        assert!(ev.intersects(FwkEvent::FRAME_LEN_CHANGE));
        assert!(ev.intersects(FwkEvent::PROC_DUR_CHANGE));

        cu.handle_frame_len_change(&t, FrameLength::micros(5000), 5000);
        assert!(!cu.events.contains(FwkEvent::FRAME_LEN_CHANGE));
    }

    #[test]
    fn set_paramed_values_are_kept() {
        let mut cu = base();
        cu.flags.is_period_set_paramed = true;
        cu.flags.is_proc_dur_set_paramed = true;
        cu.period_us = 2000;
        cu.proc_duration_us = 700;
        let t = Topology::new(0x4000, 1);
        cu.handle_frame_len_change(&t, FrameLength::micros(5000), 5000);
        assert_eq!(cu.period_us, 2000);
        assert_eq!(cu.proc_duration_us, 700);
        assert_eq!(cu.cntr_frame_len.frame_len_us, 5000);
    }

    #[test]
    fn zero_frame_len_is_ignored() {
        let mut cu = base();
        let t = Topology::new(0x4000, 1);
        cu.handle_frame_len_change(&t, FrameLength::default(), 0);
        assert!(cu.events.current().is_empty());
    }

    // --- derivation ---

    #[test]
    fn configured_time_wins() {
        let mut cu = base();
        cu.cfg.frame_size = Some(FrameSizeCfg::Time(2000));
        let t = Topology::new(0x4000, 1);
        assert_eq!(cu.derive_frame_len(&t), FrameLength::micros(2000));
        cu.cfg.frame_size = Some(FrameSizeCfg::Default);
        assert_eq!(
            cu.derive_frame_len(&t),
            FrameLength::micros(DEFAULT_FRAME_LEN_US)
        );
    }

    // --- upstream info ---

    #[test]
    fn upstream_is_informed_once_then_on_change() {
        let mut t = Topology::new(0x4000, 1);
        t.add_subgraph(1, 2).unwrap();
        let spec = ModuleSpec {
            instance_id: 0x10,
            module_id: 0x0700_2000,
            serial_num: 0,
            max_inputs: 1,
            max_outputs: 0,
            min_outputs: 0,
            caps: ModuleCaps::default(),
        };
        let m = t.add_module(1, &spec, None).unwrap();
        let i = t.add_input_port(m, 2).unwrap();
        t.set_ext_input(i).unwrap();

        let mut cu = base();
        cu.ext.add_input(&t, i).unwrap();
        let (tx, rx) = unbounded();
        let peer_port = PortAddr { module: 0x99, port: 1 };
        cu.ext.inputs.get_mut(&i).unwrap().upstream = Some(crate::msg::PeerHandle {
            cntr_id: 0x5000,
            tx,
            port: peer_port,
        });

        cu.handle_frame_len_change(&t, FrameLength::micros(1000), 1000);
        cu.handle_frame_len_change(&t, FrameLength::micros(1000), 1000);
        cu.handle_frame_len_change(&t, FrameLength::micros(2000), 2000);
        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            CntrMsg::IcbInfoFromDownstream { port, info } => {
                assert_eq!(*port, peer_port);
                assert_eq!(info.len.frame_len_us, 2000);
                assert_eq!(info.sid, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
