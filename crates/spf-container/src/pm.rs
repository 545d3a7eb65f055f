//! Power manager votes.
//!
//! A container votes for a processing clock and bus bandwidth sized by the
//! aggregated load of its started modules, and for a wake-up latency sized
//! by its processing duration. Votes are only sent when they change.

use std::sync::Arc;

use parking_lot::Mutex;
use spf_core::SpfResult;
use tracing::{debug, info};

use crate::base::CuBase;
use crate::error::CuResult;
use crate::event_flags::FwkEvent;

/// Default packets-per-cycle ratio, times two, used for the floor clock.
pub const CU_PCPPX2_DEFAULT: u64 = 7;
/// Scale factor 1.0 in Q4.
pub const UNITY_Q4: u32 = 0x10;
/// Smallest latency ever voted, in microseconds.
pub const LATENCY_VOTE_MIN: u32 = 40;
/// Latency vote meaning "released".
pub const LATENCY_VOTE_MAX: u32 = u32::MAX;
/// Percentage of the processing duration voted as latency by real-time containers.
pub const LATENCY_FACTOR_RT: u32 = 3;
/// Percentage of the processing duration voted as latency by other containers.
pub const LATENCY_FACTOR_NRT: u32 = 70;

/// Kind of clock vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteType {
    /// Request clock and bandwidth.
    ReqKppsBw,
    /// Release clock and bandwidth.
    RelKppsBw,
    /// Release clock, keep bandwidth.
    RelKppsOnly,
}

/// A clock and bandwidth vote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockVote {
    /// Processing load, kilo packets per second.
    pub kpps: u32,
    /// Bus bandwidth, bytes per second.
    pub bw: u32,
    /// Floor clock, zero when no floor is needed.
    pub floor_clk: u32,
    /// Clock part is meaningful.
    pub is_mips_req: bool,
    /// Bandwidth part is meaningful.
    pub is_bw_req: bool,
}

/// Power manager client.
pub trait PowerManager: Send {
    /// Registration already happened.
    fn is_registered(&self) -> bool;

    /// Registers `client`.
    fn register(&mut self, client: u32) -> SpfResult<()>;

    /// Requests a wake-up latency.
    fn request_latency(&mut self, client: u32, us: u32, blocking: bool) -> SpfResult<()>;

    /// Releases the latency request.
    fn release_latency(&mut self, client: u32) -> SpfResult<()>;

    /// Requests clock and bandwidth.
    fn request_clock(&mut self, client: u32, vote: &ClockVote, blocking: bool) -> SpfResult<()>;

    /// Releases clock and bandwidth.
    fn release_clock(&mut self, client: u32, vote: &ClockVote, blocking: bool) -> SpfResult<()>;
}

/// Power manager that accepts and ignores everything.
#[derive(Debug, Default)]
pub struct NullPowerManager {
    registered: bool,
}

impl PowerManager for NullPowerManager {
    fn is_registered(&self) -> bool {
        self.registered
    }

    fn register(&mut self, _client: u32) -> SpfResult<()> {
        self.registered = true;
        Ok(())
    }

    fn request_latency(&mut self, _client: u32, _us: u32, _blocking: bool) -> SpfResult<()> {
        Ok(())
    }

    fn release_latency(&mut self, _client: u32) -> SpfResult<()> {
        Ok(())
    }

    fn request_clock(&mut self, _client: u32, _vote: &ClockVote, _blocking: bool) -> SpfResult<()> {
        Ok(())
    }

    fn release_clock(&mut self, _client: u32, _vote: &ClockVote, _blocking: bool) -> SpfResult<()> {
        Ok(())
    }
}

/// A request seen by [`RecordingPowerManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmRequest {
    /// Latency request.
    Latency {
        /// Latency in microseconds.
        us: u32,
        /// Blocking call.
        blocking: bool,
    },
    /// Latency release.
    LatencyRelease,
    /// Clock request.
    Clock {
        /// Vote.
        vote: ClockVote,
        /// Blocking call.
        blocking: bool,
    },
    /// Clock release.
    ClockRelease {
        /// Vote.
        vote: ClockVote,
        /// Blocking call.
        blocking: bool,
    },
}

/// Power manager that logs every request into a shared list.
#[derive(Debug, Default, Clone)]
pub struct RecordingPowerManager {
    registered: bool,
    log: Arc<Mutex<Vec<PmRequest>>>,
}

impl RecordingPowerManager {
    /// Creates a manager and returns the shared request log with it.
    pub fn new() -> (Self, Arc<Mutex<Vec<PmRequest>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                registered: false,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl PowerManager for RecordingPowerManager {
    fn is_registered(&self) -> bool {
        self.registered
    }

    fn register(&mut self, _client: u32) -> SpfResult<()> {
        self.registered = true;
        Ok(())
    }

    fn request_latency(&mut self, _client: u32, us: u32, blocking: bool) -> SpfResult<()> {
        self.log.lock().push(PmRequest::Latency { us, blocking });
        Ok(())
    }

    fn release_latency(&mut self, _client: u32) -> SpfResult<()> {
        self.log.lock().push(PmRequest::LatencyRelease);
        Ok(())
    }

    fn request_clock(&mut self, _client: u32, vote: &ClockVote, blocking: bool) -> SpfResult<()> {
        self.log.lock().push(PmRequest::Clock {
            vote: *vote,
            blocking,
        });
        Ok(())
    }

    fn release_clock(&mut self, _client: u32, vote: &ClockVote, blocking: bool) -> SpfResult<()> {
        self.log.lock().push(PmRequest::ClockRelease {
            vote: *vote,
            blocking,
        });
        Ok(())
    }
}

/// Last votes sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmInfo {
    /// Last kpps voted.
    pub prev_kpps: u32,
    /// Last bandwidth voted.
    pub prev_bw: u32,
    /// Last floor clock voted.
    pub prev_floor_clk: u32,
    /// Last latency voted, zero when never voted.
    pub prev_latency_vote: u32,
    /// Scaled over plain load, Q4.
    pub weighted_kpps_scale_factor_q4: u32,
}

impl Default for PmInfo {
    fn default() -> Self {
        Self {
            prev_kpps: 0,
            prev_bw: 0,
            prev_floor_clk: 0,
            prev_latency_vote: 0,
            weighted_kpps_scale_factor_q4: UNITY_Q4,
        }
    }
}

/// Floor clock for a scaled load, zero when nothing is scaled.
pub fn floor_clock(total_kpps: u32, scaled_kpps_q4: u32) -> u32 {
    if u64::from(scaled_kpps_q4) == u64::from(total_kpps) << 4 {
        return 0;
    }
    ((u64::from(scaled_kpps_q4) * CU_PCPPX2_DEFAULT * 1000) >> 5).min(u64::from(u32::MAX)) as u32
}

/// Latency to vote for a processing duration.
pub fn latency_vote_for(proc_duration_us: u32, is_rt: bool) -> u32 {
    let factor = if is_rt {
        LATENCY_FACTOR_RT
    } else {
        LATENCY_FACTOR_NRT
    };
    let vote = (u64::from(factor) * u64::from(proc_duration_us) / 100) as u32;
    vote.max(LATENCY_VOTE_MIN)
}

impl CuBase {
    /// Registers with the power manager once.
    pub fn pm_register(&mut self) -> CuResult<()> {
        if !self.power.is_registered() {
            self.power.register(self.cntr_id)?;
            debug!(log_id = self.log_id, "pm: registered");
        }
        Ok(())
    }

    /// Votes a wake-up latency derived from the processing duration.
    ///
    /// Island and voice containers never vote. A zero processing duration
    /// counts as a release.
    pub fn vote_latency(&mut self, is_release: bool, is_rt: bool, is_voice: bool) -> CuResult<()> {
        if self.cfg.is_island() || is_voice {
            return Ok(());
        }
        let is_release = is_release || self.proc_duration_us == 0;
        let prev = self.pm.prev_latency_vote;
        let previously_released = prev == 0 || prev == LATENCY_VOTE_MAX;
        if is_release && previously_released {
            return Ok(());
        }
        if !self.power.is_registered() {
            return Ok(());
        }
        let vote = if is_release {
            LATENCY_VOTE_MAX
        } else {
            latency_vote_for(self.proc_duration_us, is_rt)
        };
        if vote == prev {
            return Ok(());
        }
        if is_release {
            self.power.release_latency(self.cntr_id)?;
        } else {
            let blocking = !self.flags.apm_cmd_context;
            self.power.request_latency(self.cntr_id, vote, blocking)?;
        }
        info!(
            log_id = self.log_id,
            prev,
            vote,
            proc_duration_us = self.proc_duration_us,
            "pm: latency vote"
        );
        self.pm.prev_latency_vote = vote;
        Ok(())
    }

    /// Votes clock and bandwidth for the given load.
    ///
    /// `scaled_kpps_q4` is the load after scaling, in Q4. It differs from
    /// `total_kpps << 4` only when some module asks for a faster clock than
    /// its load needs, and drives both the floor clock and the weighted
    /// scale factor that shortens the processing duration.
    pub fn handle_clk_vote_change(
        &mut self,
        vote_type: VoteType,
        force: bool,
        total_kpps: u32,
        total_bw: u32,
        scaled_kpps_q4: u32,
        is_voice: bool,
    ) -> CuResult<()> {
        let floor_clk = floor_clock(total_kpps, scaled_kpps_q4);
        let pm = self.pm;
        let unchanged =
            total_kpps == pm.prev_kpps && total_bw == pm.prev_bw && floor_clk == pm.prev_floor_clk;
        if unchanged && !force {
            return Ok(());
        }
        let is_release = vote_type != VoteType::ReqKppsBw;
        if is_release && pm.prev_kpps == 0 && pm.prev_bw == 0 && pm.prev_floor_clk == 0 {
            return Ok(());
        }
        if !self.power.is_registered() {
            return Ok(());
        }

        let mut nonblocking = self.flags.apm_cmd_context;
        // a vote that only goes down can be applied lazily
        if !nonblocking
            && !force
            && total_kpps <= pm.prev_kpps
            && total_bw <= pm.prev_bw
            && floor_clk <= pm.prev_floor_clk
        {
            nonblocking = true;
        }
        let vote = ClockVote {
            kpps: total_kpps,
            bw: total_bw,
            floor_clk,
            is_mips_req: total_kpps != pm.prev_kpps || is_release || floor_clk != pm.prev_floor_clk,
            is_bw_req: total_bw != pm.prev_bw || vote_type == VoteType::RelKppsBw,
        };
        self.pm.prev_kpps = total_kpps;
        self.pm.prev_bw = total_bw;
        self.pm.prev_floor_clk = floor_clk;

        if !is_voice {
            let mut sent = vote;
            // manager takes mega packets
            sent.kpps = total_kpps / 1000;
            if is_release {
                self.power.release_clock(self.cntr_id, &sent, !nonblocking)?;
            } else {
                self.power.request_clock(self.cntr_id, &sent, !nonblocking)?;
            }
            debug!(
                log_id = self.log_id,
                kpps = total_kpps,
                bw = total_bw,
                floor_clk,
                release = is_release,
                "pm: clock vote"
            );
        }

        let mut weighted = UNITY_Q4;
        if u64::from(scaled_kpps_q4) != u64::from(total_kpps) << 4 {
            let w = if total_kpps == 0 {
                UNITY_Q4
            } else {
                scaled_kpps_q4 / total_kpps
            };
            if w != 0 {
                weighted = w;
            }
        }
        if weighted != self.pm.weighted_kpps_scale_factor_q4 {
            self.pm.weighted_kpps_scale_factor_q4 = weighted;
            self.events.set(FwkEvent::KPPS_BW_SCALE_FACTOR_CHANGE);
        }
        self.update_cntr_proc_duration();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::CuBase;

    fn base_with_log() -> (CuBase, Arc<Mutex<Vec<PmRequest>>>) {
        let (pm, log) = RecordingPowerManager::new();
        let mut cu = CuBase::new(0x4000, 1, Box::new(pm));
        cu.pm_register().unwrap();
        (cu, log)
    }

    // --- latency ---

    #[test]
    fn latency_vote_floor_and_factors() {
        assert_eq!(latency_vote_for(1000, true), LATENCY_VOTE_MIN);
        assert_eq!(latency_vote_for(10_000, true), 300);
        assert_eq!(latency_vote_for(10_000, false), 7000);
    }

    #[test]
    fn latency_vote_only_on_change() {
        let (mut cu, log) = base_with_log();
        cu.proc_duration_us = 5000;
        cu.vote_latency(false, false, false).unwrap();
        cu.vote_latency(false, false, false).unwrap();
        assert_eq!(
            log.lock().as_slice(),
            &[PmRequest::Latency {
                us: 3500,
                blocking: true
            }]
        );
        cu.vote_latency(true, false, false).unwrap();
        assert_eq!(log.lock().last(), Some(&PmRequest::LatencyRelease));
        assert_eq!(cu.pm.prev_latency_vote, LATENCY_VOTE_MAX);
        // already released
        cu.vote_latency(true, false, false).unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn latency_skipped_for_voice() {
        let (mut cu, log) = base_with_log();
        cu.proc_duration_us = 5000;
        cu.vote_latency(false, true, true).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn latency_nonblocking_in_apm_context() {
        let (mut cu, log) = base_with_log();
        cu.proc_duration_us = 10_000;
        cu.flags.apm_cmd_context = true;
        cu.vote_latency(false, true, false).unwrap();
        assert_eq!(
            log.lock().as_slice(),
            &[PmRequest::Latency {
                us: 300,
                blocking: false
            }]
        );
    }

    // --- clock ---

    #[test]
    fn floor_clock_only_when_scaled() {
        assert_eq!(floor_clock(1000, 1000 << 4), 0);
        assert_eq!(floor_clock(1000, 2000 << 4), ((2000u64 * 16 * 7 * 1000) >> 5) as u32);
    }

    #[test]
    fn clock_request_then_release() {
        let (mut cu, log) = base_with_log();
        cu.handle_clk_vote_change(VoteType::ReqKppsBw, false, 20_000, 4096, 20_000 << 4, false)
            .unwrap();
        // same load, nothing sent
        cu.handle_clk_vote_change(VoteType::ReqKppsBw, false, 20_000, 4096, 20_000 << 4, false)
            .unwrap();
        cu.handle_clk_vote_change(VoteType::RelKppsBw, false, 0, 0, 0, false)
            .unwrap();
        let log = log.lock();
        assert_eq!(log.len(), 2);
        match log[0] {
            PmRequest::Clock { vote, blocking } => {
                assert_eq!(vote.kpps, 20);
                assert_eq!(vote.bw, 4096);
                assert!(vote.is_mips_req && vote.is_bw_req);
                assert!(blocking);
            }
            other => panic!("unexpected {other:?}"),
        }
        match log[1] {
            PmRequest::ClockRelease { vote, blocking } => {
                assert!(vote.is_mips_req && vote.is_bw_req);
                // going down is never blocking
                assert!(!blocking);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn release_without_prior_vote_is_silent() {
        let (mut cu, log) = base_with_log();
        cu.handle_clk_vote_change(VoteType::RelKppsBw, true, 0, 0, 0, false)
            .unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn scale_factor_shortens_proc_duration() {
        let (mut cu, _log) = base_with_log();
        cu.cntr_frame_len = spf_core::FrameLength::micros(1000);
        cu.update_cntr_proc_duration();
        assert_eq!(cu.proc_duration_us, 1000);
        cu.handle_clk_vote_change(VoteType::ReqKppsBw, false, 1000, 0, 2000 << 4, false)
            .unwrap();
        assert_eq!(cu.pm.weighted_kpps_scale_factor_q4, 0x20);
        assert_eq!(cu.proc_duration_us, 500);
        assert!(cu.events.contains(FwkEvent::KPPS_BW_SCALE_FACTOR_CHANGE));
    }

    #[test]
    fn unregistered_manager_gets_nothing() {
        let (pm, log) = RecordingPowerManager::new();
        let mut cu = CuBase::new(0x4000, 1, Box::new(pm));
        cu.proc_duration_us = 5000;
        cu.vote_latency(false, false, false).unwrap();
        cu.handle_clk_vote_change(VoteType::ReqKppsBw, false, 10, 10, 10 << 4, false)
            .unwrap();
        assert!(log.lock().is_empty());
    }
}
