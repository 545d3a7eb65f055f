//! Inter-container buffering calculator.

use clap::Args;
use serde::Serialize;
use spf_core::{
    DownstreamInfo, FrameLength, IcbBuffering, IcbFlags, SID_VOICE_CALL, UpstreamInfo,
    determine_buffering,
};

/// Compute the buffers an upstream container needs toward a downstream peer.
#[derive(Args)]
pub struct IcbArgs {
    /// Upstream frame length in microseconds
    #[arg(long, default_value = "5000")]
    pub up_us: u32,

    /// Upstream frame length in samples (overrides --up-us)
    #[arg(long)]
    pub up_samples: Option<u32>,

    /// Upstream trigger period in microseconds (defaults to the frame length)
    #[arg(long)]
    pub up_period_us: Option<u32>,

    /// Upstream is real time
    #[arg(long)]
    pub up_rt: bool,

    /// Upstream produces variable sized output
    #[arg(long)]
    pub up_variable: bool,

    /// Upstream asks for single buffering
    #[arg(long)]
    pub up_single: bool,

    /// Upstream refuses a one-time pre-buffer
    #[arg(long)]
    pub no_otp: bool,

    /// Downstream frame length in microseconds
    #[arg(long, default_value = "1000")]
    pub down_us: u32,

    /// Downstream frame length in samples (overrides --down-us)
    #[arg(long)]
    pub down_samples: Option<u32>,

    /// Downstream trigger period in microseconds (defaults to the frame length)
    #[arg(long)]
    pub down_period_us: Option<u32>,

    /// Downstream is real time
    #[arg(long)]
    pub down_rt: bool,

    /// Downstream consumes variable sized input
    #[arg(long)]
    pub down_variable: bool,

    /// Downstream asks for single buffering
    #[arg(long)]
    pub down_single: bool,

    /// Sample rate used with the --*-samples forms
    #[arg(long, default_value = "48000")]
    pub rate: u32,

    /// Both sides belong to a voice call
    #[arg(long)]
    pub voice: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct IcbReport {
    num_reg_bufs: u32,
    num_reg_prebufs: u32,
    otp_us: u64,
    double_buf_disabled: bool,
    otp_disabled: bool,
}

impl From<IcbBuffering> for IcbReport {
    fn from(b: IcbBuffering) -> Self {
        Self {
            num_reg_bufs: b.num_reg_bufs,
            num_reg_prebufs: b.num_reg_prebufs,
            otp_us: b.otp.to_us(),
            double_buf_disabled: b.double_buf_disabled,
            otp_disabled: b.otp_disabled,
        }
    }
}

fn frame(us: u32, samples: Option<u32>, rate: u32) -> FrameLength {
    match samples {
        Some(n) => FrameLength::samples(n, rate),
        None => FrameLength::micros(us),
    }
}

fn infos(args: &IcbArgs) -> (UpstreamInfo, DownstreamInfo) {
    let sid = if args.voice { SID_VOICE_CALL } else { 0 };
    let up_len = frame(args.up_us, args.up_samples, args.rate);
    let down_len = frame(args.down_us, args.down_samples, args.rate);
    let up = UpstreamInfo {
        len: up_len,
        period_us: args.up_period_us.unwrap_or(up_len.to_us() as u32),
        flags: IcbFlags {
            variable_output: args.up_variable,
            is_real_time: args.up_rt,
            is_default_single_buffering_mode: args.up_single,
            ..IcbFlags::default()
        },
        sid,
        disable_otp: args.no_otp,
    };
    let down = DownstreamInfo {
        len: down_len,
        period_us: args.down_period_us.unwrap_or(down_len.to_us() as u32),
        flags: IcbFlags {
            variable_input: args.down_variable,
            is_real_time: args.down_rt,
            is_default_single_buffering_mode: args.down_single,
            ..IcbFlags::default()
        },
        sid,
    };
    (up, down)
}

/// Run the icb command.
pub fn run(args: IcbArgs) -> anyhow::Result<()> {
    let (up, down) = infos(&args);
    let report = IcbReport::from(determine_buffering(&up, &down));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Upstream:    {} us every {} us{}",
        up.len.to_us(),
        up.period_us,
        if up.flags.is_real_time { " (RT)" } else { "" }
    );
    println!(
        "Downstream:  {} us every {} us{}",
        down.len.to_us(),
        down.period_us,
        if down.flags.is_real_time { " (RT)" } else { "" }
    );
    println!();
    println!("Regular buffers:    {}", report.num_reg_bufs);
    println!("Pre-filled buffers: {}", report.num_reg_prebufs);
    if report.otp_us > 0 {
        println!("One-time prebuffer: {} us", report.otp_us);
    }
    if report.double_buf_disabled {
        println!("Double buffering:   off");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: IcbArgs,
    }

    fn parse(argv: &[&str]) -> IcbArgs {
        Wrapper::parse_from(std::iter::once("icb").chain(argv.iter().copied())).args
    }

    #[test]
    fn test_nrt_five_ms_into_rt_one_ms() {
        let (up, down) = infos(&parse(&["--down-rt"]));
        let report = IcbReport::from(determine_buffering(&up, &down));
        assert_eq!(report.num_reg_bufs, 5);
        assert_eq!(report.num_reg_prebufs, 0);
    }

    #[test]
    fn test_period_defaults_to_frame() {
        let (up, down) = infos(&parse(&["--up-us", "2000", "--down-period-us", "500"]));
        assert_eq!(up.period_us, 2000);
        assert_eq!(down.period_us, 500);
    }

    #[test]
    fn test_samples_override_micros() {
        let (up, _) = infos(&parse(&["--up-samples", "480", "--rate", "48000"]));
        assert_eq!(up.len.frame_len_samples, 480);
        assert_eq!(up.period_us, 10_000);
    }

    #[test]
    fn test_voice_sets_sid_on_both_sides() {
        let (up, down) = infos(&parse(&["--voice"]));
        assert_eq!(up.sid, SID_VOICE_CALL);
        assert_eq!(down.sid, SID_VOICE_CALL);
    }
}
