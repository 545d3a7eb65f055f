//! Property exchange with peer containers.
//!
//! Real-time flags travel downstream (upstream-RT) and upstream
//! (downstream-RT) across external links. Downstream ports also report
//! their state upstream so a producer stops feeding a stopped consumer.
//! Everything is sent as a message on the peer's command queue and never
//! waits for an answer.

use spf_core::{
    IcbFlags, OutPortId, PortProperty, SID_VOICE_CALL, TopoState, Topology, UpstreamInfo,
    determine_buffering,
};
use spf_core::IcbBuffering;
use tracing::{debug, info, warn};

use crate::base::CuBase;
use crate::error::{CuError, CuResult};
use crate::event_flags::FwkEvent;
use crate::msg::{CntrMsg, PeerProperty};
use spf_config::PortAddr;
use spf_core::{DownstreamInfo, SpfError};

/// What a received property requires from the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct PeerFollowUp {
    /// Port states must be recomputed.
    pub update_states: bool,
    /// Downstream peers must learn the new upstream-RT flags.
    pub inform_ds: bool,
    /// Upstream peers must learn the new downstream-RT flags and states.
    pub inform_us: bool,
}

/// States worth reporting upstream. Prepared tells the producer nothing.
fn need_inform(state: TopoState) -> bool {
    matches!(
        state,
        TopoState::Stopped | TopoState::Suspended | TopoState::Started
    )
}

fn is_connected_active(state: TopoState) -> bool {
    matches!(state, TopoState::Prepared | TopoState::Started)
}

/// Tells downstream peers whether a real-time source feeds them.
///
/// Sends only changes. A failed send is retried on the next call.
pub fn inform_downstream_about_us_property(cu: &mut CuBase, topo: &Topology) {
    let log_id = cu.log_id;
    for p in cu.ext.outputs.values_mut() {
        if !p.prop.is_enabled() || !is_connected_active(p.connected_state) {
            continue;
        }
        let Some(peer) = &p.downstream else { continue };
        let is_rt = topo
            .output(p.id)
            .is_some_and(|o| o.common.flags.is_upstream_rt);
        if p.prop.sent_rt == Some(is_rt) {
            continue;
        }
        let msg = CntrMsg::PeerProperty {
            port: peer.port,
            prop: PeerProperty::IsUpstreamRt(is_rt),
        };
        if peer.tx.send(msg).is_err() {
            warn!(log_id, peer = peer.cntr_id, "cu: downstream peer gone");
            continue;
        }
        debug!(
            log_id,
            miid = p.addr.module,
            port = p.addr.port,
            is_rt,
            "cu: upstream real-time sent downstream"
        );
        p.prop.sent_rt = Some(is_rt);
    }
}

/// Tells upstream peers whether a real-time sink drains them, and the state
/// of the receiving port.
pub fn inform_upstream_about_ds_property(cu: &mut CuBase, topo: &Topology) {
    let log_id = cu.log_id;
    for p in cu.ext.inputs.values_mut() {
        if !p.prop.is_enabled() || !is_connected_active(p.connected_state) {
            continue;
        }
        let Some(peer) = &p.upstream else { continue };

        if p.prop.sent_rt != Some(p.prop.is_ds_rt) {
            let msg = CntrMsg::PeerProperty {
                port: peer.port,
                prop: PeerProperty::IsDownstreamRt(p.prop.is_ds_rt),
            };
            if peer.tx.send(msg).is_ok() {
                p.prop.sent_rt = Some(p.prop.is_ds_rt);
                debug!(
                    log_id,
                    miid = p.addr.module,
                    is_rt = p.prop.is_ds_rt,
                    "cu: downstream real-time sent upstream"
                );
            } else {
                warn!(log_id, peer = peer.cntr_id, "cu: upstream peer gone");
                continue;
            }
        }

        let state = topo.input(p.id).map_or(TopoState::Invalid, |i| i.common.state);
        let sg_state = topo.sg_state(p.sg_id);
        if need_inform(state) && need_inform(sg_state) && p.prop.sent_state != Some(state) {
            let msg = CntrMsg::PeerProperty {
                port: peer.port,
                prop: PeerProperty::State(state),
            };
            if peer.tx.send(msg).is_ok() {
                p.prop.sent_state = Some(state);
                debug!(
                    log_id,
                    miid = p.addr.module,
                    ?state,
                    "cu: port state sent upstream"
                );
            }
        }
    }
}

/// Applies a property a peer sent to the external port at `port`.
pub fn process_peer_property(
    cu: &mut CuBase,
    topo: &mut Topology,
    port: PortAddr,
    prop: PeerProperty,
) -> CuResult<PeerFollowUp> {
    let mut follow = PeerFollowUp::default();
    match prop {
        PeerProperty::IsUpstreamRt(v) => {
            let Some(id) = cu.ext.input_by_addr(port) else {
                return Err(SpfError::NotFound.into());
            };
            let Some(ext) = cu.ext.inputs.get_mut(&id) else {
                return Err(SpfError::NotFound.into());
            };
            if ext.prop.is_us_rt == v {
                return Ok(follow);
            }
            ext.prop.is_us_rt = v;
            cu.events.set(FwkEvent::RT_FTRT_CHANGE);
            if let Some(i) = topo.input_mut(id) {
                i.common.flags.is_upstream_rt = v;
                i.common.flags.port_prop_is_rt_change = true;
            }
            topo.propagate_port_props(&mut cu.ext, PortProperty::IsUpstreamRt)?;
            info!(log_id = cu.log_id, miid = port.module, is_rt = v, "cu: upstream real-time changed");
            follow = PeerFollowUp {
                update_states: true,
                inform_ds: true,
                inform_us: true,
            };
        }
        PeerProperty::IsDownstreamRt(v) => {
            let Some(id) = cu.ext.output_by_addr(port) else {
                return Err(SpfError::NotFound.into());
            };
            let Some(ext) = cu.ext.outputs.get_mut(&id) else {
                return Err(SpfError::NotFound.into());
            };
            if ext.prop.is_ds_rt == v {
                return Ok(follow);
            }
            ext.prop.is_ds_rt = v;
            ext.icb.ds.flags.is_real_time = v;
            cu.events.set(FwkEvent::RT_FTRT_CHANGE);
            if let Some(o) = topo.output_mut(id) {
                o.common.flags.is_downstream_rt = v;
                o.common.flags.port_prop_is_rt_change = true;
            }
            topo.propagate_port_props(&mut cu.ext, PortProperty::IsDownstreamRt)?;
            info!(log_id = cu.log_id, miid = port.module, is_rt = v, "cu: downstream real-time changed");
            recreate_ext_out_buffering(cu, topo, id);
            follow.inform_us = true;
        }
        PeerProperty::State(s) => {
            let Some(id) = cu.ext.output_by_addr(port) else {
                return Err(SpfError::NotFound.into());
            };
            let current = topo.output(id).map_or(TopoState::Invalid, |o| o.common.state);
            let Some(ext) = cu.ext.outputs.get_mut(&id) else {
                return Err(SpfError::NotFound.into());
            };
            ext.propagated_state = s;
            let self_state = topo.sg_state(ext.sg_id);
            let downgraded = self_state.downgrade(ext.evaluate_ds_state());
            if downgraded == current || downgraded == TopoState::Prepared {
                return Ok(follow);
            }
            cu.events.set(FwkEvent::PORT_STATE_CHANGE);
            debug!(log_id = cu.log_id, miid = port.module, ?s, ?downgraded, "cu: downstream state propagated");
            follow.update_states = true;
            follow.inform_us = true;
        }
    }
    Ok(follow)
}

/// Stores what downstream reported about itself and rebuilds buffering when
/// the output's subgraph is already prepared or started.
pub fn icb_info_from_downstream(
    cu: &mut CuBase,
    topo: &Topology,
    port: PortAddr,
    info: DownstreamInfo,
) -> CuResult<()> {
    let Some(id) = cu.ext.output_by_addr(port) else {
        return Err(SpfError::NotFound.into());
    };
    let Some(ext) = cu.ext.outputs.get_mut(&id) else {
        return Err(SpfError::NotFound.into());
    };
    ext.icb.ds = info;
    info!(
        log_id = cu.log_id,
        miid = port.module,
        ds_us = info.len.frame_len_us,
        ds_samples = info.len.frame_len_samples,
        ds_period_us = info.period_us,
        ds_real_time = info.flags.is_real_time,
        "icb: downstream info received"
    );
    recreate_ext_out_buffering(cu, topo, id);
    Ok(())
}

fn recreate_ext_out_buffering(cu: &mut CuBase, topo: &Topology, id: OutPortId) {
    let Some(sg_id) = cu.ext.outputs.get(&id).map(|p| p.sg_id) else {
        return;
    };
    if matches!(topo.sg_state(sg_id), TopoState::Prepared | TopoState::Started) {
        if let Err(e) = determine_ext_out_buffering(cu, topo, id) {
            warn!(log_id = cu.log_id, error = %e, "icb: buffer recreate failed");
        }
    } else if let Some(p) = cu.ext.outputs.get_mut(&id) {
        p.icb.recreate_pending = true;
    }
}

/// Decides how many buffers the external output `id` holds toward its peer.
///
/// Fails without a downstream peer. Keeps the two-buffer fallback for
/// compressed data and while either frame length is unknown.
pub fn determine_ext_out_buffering(cu: &mut CuBase, topo: &Topology, id: OutPortId) -> CuResult<()> {
    let (frame_len, period_us, log_id) = (cu.cntr_frame_len, cu.period_us, cu.log_id);
    let Some(p) = cu.ext.outputs.get_mut(&id) else {
        return Err(SpfError::NotFound.into());
    };
    if p.downstream.is_none() {
        return Err(CuError::Spf(SpfError::Failed));
    }
    p.icb.buffering = IcbBuffering::fallback();

    let fmt = topo.output(id).map(|o| o.common.media_fmt.clone()).unwrap_or_default();
    if fmt.is_known() && !fmt.is_pcm() {
        debug!(log_id, miid = p.addr.module, "icb: compressed output keeps default buffering");
        return Ok(());
    }
    if p.icb.ds.len.is_zero() || frame_len.is_zero() {
        debug!(log_id, miid = p.addr.module, "icb: frame length not known yet");
        return Ok(());
    }

    let is_rt = topo.flags.is_signal_triggered
        || topo
            .output(id)
            .is_some_and(|o| o.common.flags.is_upstream_rt);
    let us = UpstreamInfo {
        len: frame_len,
        period_us,
        flags: IcbFlags {
            is_real_time: is_rt,
            ..IcbFlags::default()
        },
        sid: topo.subgraph(p.sg_id).map_or(0, |sg| sg.sid),
        disable_otp: p.icb.disable_otp,
    };
    p.icb.buffering = determine_buffering(&us, &p.icb.ds);
    p.icb.recreate_pending = false;
    info!(
        log_id,
        miid = p.addr.module,
        port = p.addr.port,
        num_reg_bufs = p.icb.buffering.num_reg_bufs,
        num_reg_prebufs = p.icb.buffering.num_reg_prebufs,
        otp_us = p.icb.buffering.otp.frame_len_us,
        voice = us.sid == SID_VOICE_CALL,
        "icb: buffering determined"
    );
    Ok(())
}
