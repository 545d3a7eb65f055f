//! Criterion benchmarks for spf-core graph algorithms
//!
//! Run with: cargo bench -p spf-core
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use spf_core::icb::IcbFlags;
use spf_core::{
    DownstreamInfo, FrameLength, InPortId, MediaFormat, ModuleCaps, ModuleSpec, NoExtPorts,
    OutPortId, TopoState, Topology, UpstreamInfo, determine_buffering,
};

const CHAIN_LENGTHS: &[usize] = &[2, 8, 32];

fn build_chain(n: usize) -> (Topology, Vec<InPortId>, Vec<OutPortId>) {
    let mut topo = Topology::new(0x4000, 1);
    let _ = topo.add_subgraph(1, 1);
    let mut ins = Vec::with_capacity(n);
    let mut outs = Vec::with_capacity(n);
    for k in 0..n {
        let spec = ModuleSpec {
            instance_id: 0x100 + k as u32,
            module_id: 0x0700_2000,
            serial_num: k as u32,
            max_inputs: 1,
            max_outputs: 1,
            min_outputs: 1,
            caps: ModuleCaps {
                inplace: true,
                ..ModuleCaps::default()
            },
        };
        let m = topo.add_module(1, &spec, None).unwrap();
        ins.push(topo.add_input_port(m, 2).unwrap());
        outs.push(topo.add_output_port(m, 1).unwrap());
    }
    for k in 1..n {
        topo.connect(outs[k - 1], ins[k]).unwrap();
    }
    topo.set_ext_input(ins[0]).unwrap();
    topo.set_ext_output(outs[n - 1]).unwrap();
    for &i in &ins {
        topo.input_mut(i).unwrap().common.state = TopoState::Started;
    }
    for &o in &outs {
        topo.output_mut(o).unwrap().common.state = TopoState::Started;
    }
    (topo, ins, outs)
}

fn bench_icb(c: &mut Criterion) {
    let mut group = c.benchmark_group("ICB");

    let us = UpstreamInfo {
        len: FrameLength::micros(5000),
        period_us: 5000,
        ..UpstreamInfo::default()
    };
    let ds = DownstreamInfo {
        len: FrameLength::micros(1000),
        period_us: 1000,
        flags: IcbFlags {
            is_real_time: true,
            ..IcbFlags::default()
        },
        sid: 0,
    };
    group.bench_function("nrt_to_rt", |b| {
        b.iter(|| black_box(determine_buffering(black_box(&us), black_box(&ds))));
    });

    let us_samples = UpstreamInfo {
        len: FrameLength::samples(441, 44100),
        period_us: 10_000,
        ..UpstreamInfo::default()
    };
    let ds_samples = DownstreamInfo {
        len: FrameLength::samples(480, 44100),
        ..ds
    };
    group.bench_function("sample_based", |b| {
        b.iter(|| {
            black_box(determine_buffering(
                black_box(&us_samples),
                black_box(&ds_samples),
            ))
        });
    });

    group.finish();
}

fn bench_trigger_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("TriggerCycle");

    for &n in CHAIN_LENGTHS {
        let (mut topo, ins, outs) = build_chain(n);
        let _ = topo.set_ext_in_media_fmt(ins[0], MediaFormat::pcm(48000, 16, 2));
        let _ = topo.propagate_media_fmt(false);
        topo.input_mut(ins[0]).unwrap().common.buf.data = vec![0; 192];

        group.bench_with_input(BenchmarkId::new("evaluate", n), &n, |b, _| {
            b.iter(|| {
                topo.reset_trigger_eval_cache();
                for &i in &ins {
                    black_box(topo.in_port_needs_data(i));
                }
                for &o in &outs {
                    black_box(topo.out_port_needs_trigger(o, &NoExtPorts));
                }
            });
        });
    }

    group.finish();
}

fn bench_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("MediaFormat");

    for &n in CHAIN_LENGTHS {
        group.bench_with_input(BenchmarkId::new("propagate", n), &n, |b, &n| {
            let (mut topo, ins, _) = build_chain(n);
            let mut rate = 48000;
            b.iter(|| {
                rate = if rate == 48000 { 16000 } else { 48000 };
                let _ = topo.set_ext_in_media_fmt(ins[0], MediaFormat::pcm(rate, 16, 2));
                black_box(topo.propagate_media_fmt(false))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_icb, bench_trigger_cycle, bench_propagation);
criterion_main!(benches);
