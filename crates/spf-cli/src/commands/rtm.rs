//! Real-time monitoring dump of port media formats.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use spf_config::GraphDescription;
use spf_container::{
    CNTR_PARAM_ID_DATA_PORT_MEDIA_FORMAT, ContainerHandle, NullPowerManager, graph_cmd_all,
};
use spf_core::{RtmPacket, SgOps};

use super::common::{launch, load_graph};

/// Prepare a graph and dump the port media format packets as JSON.
#[derive(Args)]
pub struct RtmArgs {
    /// Graph description (TOML)
    pub graph: PathBuf,

    /// Include packet bytes as hex
    #[arg(long)]
    pub hex: bool,
}

#[derive(Debug, Serialize)]
struct PacketReport {
    seq: u32,
    container_id: u32,
    num_ports: u32,
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    hex: Option<String>,
}

fn report(pkt: &RtmPacket, hex: bool) -> PacketReport {
    PacketReport {
        seq: pkt.seq,
        container_id: pkt.container_id(),
        num_ports: pkt.num_ports(),
        size: pkt.bytes.len(),
        hex: hex.then(|| {
            pkt.bytes.iter().fold(String::with_capacity(pkt.bytes.len() * 2), |mut s, b| {
                let _ = write!(s, "{b:02x}");
                s
            })
        }),
    }
}

fn collect(cntr: &ContainerHandle, desc: &GraphDescription) -> anyhow::Result<Vec<RtmPacket>> {
    cntr.graph_mgmt(SgOps::PREPARE, graph_cmd_all(desc))?;
    // enabling after PREPARE dumps every port with its negotiated format
    cntr.set_cntr_param(CNTR_PARAM_ID_DATA_PORT_MEDIA_FORMAT, 1u32.to_le_bytes().to_vec())?;
    Ok(cntr.snapshot()?.rtm)
}

/// Run the rtm command.
pub fn run(args: RtmArgs) -> anyhow::Result<()> {
    let desc = load_graph(&args.graph)?;
    let cntr = launch(&desc, Box::new(NullPowerManager::default()))?;

    let collected = collect(&cntr, &desc);
    cntr.destroy()?;

    let packets: Vec<PacketReport> = collected?.iter().map(|p| report(p, args.hex)).collect();
    println!("{}", serde_json::to_string_pretty(&packets)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_only_on_request() {
        let pkt = RtmPacket {
            seq: 3,
            bytes: vec![0xAB, 0x01],
        };
        assert!(report(&pkt, false).hex.is_none());
        assert_eq!(report(&pkt, true).hex.as_deref(), Some("ab01"));
        assert_eq!(report(&pkt, true).size, 2);
    }
}
