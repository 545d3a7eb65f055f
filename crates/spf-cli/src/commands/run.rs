//! Drive a described container through graph management commands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, ValueEnum};
use crossbeam_channel::Sender;
use spf_config::{ContainerKind, ExtInputDesc, GraphDescription};
use spf_container::{
    ContainerHandle, ContainerSnapshot, DataMsg, PmRequest, RecordingPowerManager, graph_cmd_all,
};
use spf_core::SgOps;

use super::common::{launch, load_graph, port_label, state_label};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
/// Quiet time after which a sink counts as drained.
const SETTLE: Duration = Duration::from_millis(100);

/// A graph management operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Step {
    /// PREPARE all subgraphs and ports
    Prepare,
    /// START
    Start,
    /// STOP
    Stop,
    /// SUSPEND
    Suspend,
    /// FLUSH
    Flush,
    /// CLOSE everything
    Close,
}

impl Step {
    fn ops(self) -> SgOps {
        match self {
            Step::Prepare => SgOps::PREPARE,
            Step::Start => SgOps::START,
            Step::Stop => SgOps::STOP,
            Step::Suspend => SgOps::SUSPEND,
            Step::Flush => SgOps::FLUSH,
            Step::Close => SgOps::CLOSE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Step::Prepare => "PREPARE",
            Step::Start => "START",
            Step::Stop => "STOP",
            Step::Suspend => "SUSPEND",
            Step::Flush => "FLUSH",
            Step::Close => "CLOSE",
        }
    }
}

/// Run a graph description through PREPARE/START/STOP.
#[derive(Args)]
pub struct RunArgs {
    /// Graph description (TOML)
    pub graph: PathBuf,

    /// Operations to apply, in order
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [Step::Prepare, Step::Start, Step::Stop])]
    pub steps: Vec<Step>,

    /// Frames of silence pushed into every external input after START
    #[arg(long, default_value = "0")]
    pub frames: u32,

    /// Print the power votes the container cast
    #[arg(long)]
    pub votes: bool,
}

/// Run the run command.
pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let desc = load_graph(&args.graph)?;
    let (power, log) = RecordingPowerManager::new();
    let cntr = launch(&desc, Box::new(power))?;

    let result = drive(&cntr, &desc, &args);
    cntr.destroy()?;
    result?;

    if args.votes {
        println!("Power votes:");
        for req in log.lock().iter() {
            println!("  {}", vote_label(req));
        }
    }
    Ok(())
}

fn drive(cntr: &ContainerHandle, desc: &GraphDescription, args: &RunArgs) -> anyhow::Result<()> {
    let sources = if args.frames > 0 {
        desc.external_inputs
            .iter()
            .map(|e| Ok((*e, cntr.attach_source(e.addr())?)))
            .collect::<anyhow::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };
    let sinks = if args.frames > 0 {
        desc.external_outputs
            .iter()
            .map(|&addr| Ok((addr, cntr.attach_sink(addr)?)))
            .collect::<anyhow::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let cmd = graph_cmd_all(desc);
    println!(
        "Container 0x{:X} ({:?}), {} subgraph(s), {} module(s)",
        desc.container.id,
        desc.container.kind,
        desc.subgraphs.len(),
        desc.modules.len()
    );

    for &step in &args.steps {
        cntr.graph_mgmt(step.ops(), cmd.clone())
            .with_context(|| format!("{} failed", step.name()))?;
        let snap = cntr.snapshot()?;
        println!();
        println!("After {}:", step.name());
        print_snapshot(&snap);

        if step == Step::Start && args.frames > 0 {
            push_frames(cntr, desc, &sources, args.frames)?;
            for (addr, rx) in &sinks {
                let mut bytes = 0usize;
                loop {
                    let wait = if bytes == 0 { RECV_TIMEOUT } else { SETTLE };
                    let Ok(msg) = rx.recv_timeout(wait) else { break };
                    bytes += msg.bytes.len();
                }
                println!("  sink {}: {} bytes", port_label(*addr), bytes);
            }
        }
    }
    Ok(())
}

fn push_frames(
    cntr: &ContainerHandle,
    desc: &GraphDescription,
    sources: &[(ExtInputDesc, Sender<DataMsg>)],
    frames: u32,
) -> anyhow::Result<()> {
    let frame_us = desc.container.frame_size_us.unwrap_or(1000);
    for i in 0..frames {
        for (input, tx) in sources {
            let Some(fmt) = input.format.map(|f| f.to_media_format()) else {
                continue;
            };
            let samples = (u64::from(fmt.pcm.sample_rate) * u64::from(frame_us) / 1_000_000) as u32;
            let msg = DataMsg {
                bytes: vec![0u8; fmt.bytes_for_samples_all_ch(samples) as usize],
                media_fmt: (i == 0).then_some(fmt),
                ..DataMsg::default()
            };
            tx.send(msg)
                .map_err(|_| anyhow::anyhow!("container stopped accepting data"))?;
        }
        if desc.container.kind == ContainerKind::Signal {
            cntr.gp_signal()?;
        }
    }
    Ok(())
}

fn print_snapshot(snap: &ContainerSnapshot) {
    for (id, state) in &snap.subgraphs {
        println!("  subgraph {id}: {}", state_label(*state));
    }
    for p in &snap.inputs {
        println!(
            "  in  {:<10} {:<9}{}",
            port_label(p.addr),
            state_label(p.state),
            if p.is_ext { " ext" } else { "" }
        );
    }
    for p in &snap.outputs {
        println!(
            "  out {:<10} {:<9}{}",
            port_label(p.addr),
            state_label(p.state),
            if p.is_ext { " ext" } else { "" }
        );
    }
    println!(
        "  frame {} us, period {} us, proc duration {} us, started: {}",
        snap.frame_len.frame_len_us, snap.period_us, snap.proc_duration_us, snap.is_started
    );
}

fn vote_label(req: &PmRequest) -> String {
    match req {
        PmRequest::Latency { us, blocking } => format!("latency {us} us (blocking: {blocking})"),
        PmRequest::LatencyRelease => "latency release".to_string(),
        PmRequest::Clock { vote, blocking } => {
            format!("clock {} mpps, bw {} (blocking: {blocking})", vote.kpps, vote.bw)
        }
        PmRequest::ClockRelease { vote, blocking } => {
            format!("clock release, bw {} (blocking: {blocking})", vote.bw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ops() {
        assert_eq!(Step::Prepare.ops(), SgOps::PREPARE);
        assert_eq!(Step::Close.ops(), SgOps::CLOSE);
        assert_eq!(Step::Suspend.name(), "SUSPEND");
    }

    #[test]
    fn test_vote_label() {
        assert_eq!(vote_label(&PmRequest::LatencyRelease), "latency release");
        assert!(
            vote_label(&PmRequest::Latency {
                us: 40,
                blocking: true
            })
            .starts_with("latency 40 us")
        );
    }
}
