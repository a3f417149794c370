//! Several driver instances sharing one simulated port.
//!
//! Instance i streams packets to instance i+1 around a ring while a wire
//! thread reflects everything leaving the transmit ring back into the
//! receive queue. Run with `RUST_LOG=debug` to watch attach/handoff events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ethmux::{Driver, DriverConfig, DriverStats, MacAddress, PortConfig, PortManager, SimNic};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of driver instances sharing the port (2..=8).
    #[clap(short, long, default_value_t = 3)]
    instances: usize,

    /// Packets each instance streams to its neighbor.
    #[clap(short, long, default_value_t = 50_000)]
    frames: u64,

    /// Payload bytes per packet (on top of an 8-byte header).
    #[clap(short, long, default_value_t = 64)]
    payload: usize,

    /// Hardware ring depth (also sizes the copy-out pools).
    #[clap(long, default_value_t = 256)]
    ring_depth: u16,

    /// Print each instance's counters at exit.
    #[clap(short, long)]
    verbose: bool,
}

fn print_stats(id: usize, received: u64, stats: &DriverStats) {
    println!(
        "instance {}: received {} (zero-copy {}, copied {}), sent {} direct + {} relayed, \
         pumped {}, forwarded {}, drops {}/{}/{}",
        id,
        received,
        stats.rx_zero_copy,
        stats.rx_copied,
        stats.tx_direct,
        stats.tx_relayed,
        stats.relays_pumped,
        stats.rx_forwarded,
        stats.drop_forward_full,
        stats.drop_unrouted,
        stats.drop_foreign,
    );
}

fn worker(
    mut driver: Driver,
    dst: MacAddress,
    frames: u64,
    payload: usize,
    counter: Arc<AtomicU64>,
    term: Arc<AtomicBool>,
) -> (u64, DriverStats) {
    let body = vec![0u8; payload];
    let levels = driver.highest_priority() + 1;
    let mut sent = 0u64;
    let mut received = 0u64;
    while !term.load(Ordering::SeqCst) && (sent < frames || received < frames) {
        if sent < frames {
            let header = sent.to_be_bytes();
            let priority = (sent % levels as u64) as u8;
            match driver.send(dst, &header, [&body[..]], priority) {
                Ok(()) => sent += 1,
                Err(err) if err.is_backpressure() => {}
                Err(err) => panic!("send failed: {err}"),
            }
        }
        let batch = driver.receive(32);
        if batch.len() == 0 {
            thread::yield_now();
        }
        for packet in batch {
            assert_eq!(packet.buf.len(), 8 + payload);
            received += 1;
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
    (received, driver.stats())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(
        (2..=8).contains(&args.instances),
        "instances must be within 2..=8"
    );

    println!("shared port demo:");
    println!("* instances: {}", args.instances);
    println!("* frames per instance: {}", args.frames);
    println!("* payload: {} bytes", args.payload);
    println!("* ring depth: {}", args.ring_depth);

    let nic = Arc::new(SimNic::new(MacAddress::new([
        0x98, 0x03, 0x9b, 0x3f, 0x10, 0xc4,
    ])));
    let cfg = PortConfig {
        ring_depth: args.ring_depth,
        ..PortConfig::default()
    };
    let pm = Arc::new(PortManager::new(nic.clone(), cfg)?);

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })?;
    }

    // Attach on the main thread so instance i holds queue i.
    let drivers: Vec<Driver> = (0..args.instances)
        .map(|i| {
            Driver::new(
                pm.clone(),
                DriverConfig {
                    client_id: i as u64,
                    ..DriverConfig::default()
                },
            )
        })
        .collect::<ethmux::Result<_>>()?;
    let macs: Vec<MacAddress> = drivers.iter().map(Driver::mac).collect();
    println!("* locator: {}", drivers[0].service_locator());

    // The wire: everything transmitted comes straight back in.
    let wire = {
        let nic = nic.clone();
        let term = term.clone();
        thread::spawn(move || {
            while !term.load(Ordering::SeqCst) {
                let frames = nic.drain_tx();
                if frames.is_empty() {
                    thread::yield_now();
                    continue;
                }
                for frame in frames {
                    nic.inject(0, &frame);
                }
            }
        })
    };

    let counters: Vec<Arc<AtomicU64>> = (0..args.instances)
        .map(|_| Arc::new(AtomicU64::new(0)))
        .collect();
    let ticker = {
        let counters = counters.clone();
        let term = term.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !term.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                println!("delivered pkt/sec: {}", total.saturating_sub(old_total));
                old_total = total;
            }
        })
    };

    let mut handles = Vec::new();
    for (i, driver) in drivers.into_iter().enumerate() {
        let dst = macs[(i + 1) % args.instances];
        let counter = counters[i].clone();
        let term = term.clone();
        let (frames, payload) = (args.frames, args.payload);
        handles.push(thread::spawn(move || {
            worker(driver, dst, frames, payload, counter, term)
        }));
    }

    let results: Vec<(u64, DriverStats)> = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect();
    term.store(true, Ordering::SeqCst);
    wire.join().expect("wire panicked");
    ticker.join().expect("ticker panicked");

    let delivered: u64 = results.iter().map(|(received, _)| received).sum();
    println!("done: {} packets delivered", delivered);
    if args.verbose {
        for (i, (received, stats)) in results.iter().enumerate() {
            print_stats(i, *received, stats);
        }
    }
    Ok(())
}
