// SPDX-License-Identifier: Apache-2.0

// Loopback demo: emulated guests connected in a ring, each sending packets
// to its neighbour through the backend.
//
// Usage:
// cargo run --bin netback-cli -- --guests 4 --packets 1000 --size 1500
// VERBOSE=1 - keep timestamps and targets in the log output

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use netback::emul::EmulatedHypervisor;
use netback::frontend::{Frontend, FrontendError};
use netback::protocol::NET_RX_RING_SIZE;
use netback::{
    CreditLimit, ExecutionMode, InterfaceId, Netback, NetbackConfig, Packet, XmitOutcome,
};

/// Netback loopback demo
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON backend configuration; flags below override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of partitions (0 = one per two CPUs)
    #[arg(short = 'g', long)]
    groups: Option<usize>,

    /// Run partitions on the calling thread instead of worker threads
    #[arg(long)]
    inline: bool,

    /// Backlog bound for a stopped receive queue
    #[arg(long)]
    queue_length: Option<usize>,

    /// Shuffle transmit responses
    #[arg(long)]
    permute_returns: bool,

    /// Never copy transmit pages held by the stack
    #[arg(long)]
    no_copy_skb: bool,

    /// Number of emulated guests
    #[arg(short = 'n', long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    guests: u16,

    /// Packets each guest sends
    #[arg(short = 'p', long, default_value_t = 100)]
    packets: usize,

    /// Packet size in bytes
    #[arg(short = 's', long, default_value_t = 1500, value_parser = clap::value_parser!(u16).range(14..))]
    size: u16,

    /// Guests receive by page transfer instead of copy
    #[arg(long)]
    flip: bool,

    /// Transmit credit per guest in bytes per second
    #[arg(long)]
    credit: Option<u64>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

struct Guest {
    id: InterfaceId,
    frontend: Frontend,
    sent: usize,
    completed: usize,
    received: usize,
    errors: usize,
}

fn setup_logging() {
    let mut builder =
        &mut env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if std::env::var("RUST_LOG").is_err() && std::env::var("VERBOSE").is_err() {
        // Simplify log format
        builder = builder.format_timestamp(None).format_target(false);
    }
    builder.init();

    log::debug!("Debug logging enabled");
}

fn load_config(args: &Args) -> netback::Result<NetbackConfig> {
    let mut config = match &args.config {
        Some(path) => NetbackConfig::from_file(path)?,
        None => NetbackConfig::default(),
    };
    if let Some(groups) = args.groups {
        config.groups = groups;
    }
    if args.inline {
        config.mode = ExecutionMode::Inline;
    }
    if let Some(queue_length) = args.queue_length {
        config.queue_length = queue_length;
    }
    config.permute_returns |= args.permute_returns;
    if args.no_copy_skb {
        config.copy_skb = false;
    }
    Ok(config)
}

fn payload(guest: usize, seq: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| (guest + seq + i) as u8).collect()
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let inline = config.mode == ExecutionMode::Inline;

    let hv = Arc::new(EmulatedHypervisor::new());
    let (tx, rx) = mpsc::channel::<(InterfaceId, Packet)>();
    let sink = move |from: InterfaceId, packet: Packet| {
        let _ = tx.send((from, packet));
    };
    let netback = Netback::new(config, hv.clone(), Arc::new(sink))?;
    netback.start()?;

    let credit = args.credit.map(|bytes| CreditLimit {
        bytes,
        usec: 1_000_000,
    });
    let mut guests = Vec::new();
    let mut index = HashMap::new();
    for n in 0..args.guests {
        let domid = n + 1;
        let mut frontend = Frontend::new(hv.clone(), domid, 100 + u32::from(domid), args.flip);
        let netif = netback.connect(frontend.connect_request(0, credit))?;
        frontend.post_rx_buffers(NET_RX_RING_SIZE);
        index.insert(netif.id(), guests.len());
        guests.push(Guest {
            id: netif.id(),
            frontend,
            sent: 0,
            completed: 0,
            received: 0,
            errors: 0,
        });
    }

    let expected = args.packets * guests.len();
    let mut dropped = 0;
    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout);
    loop {
        for (n, guest) in guests.iter_mut().enumerate() {
            let mut kick = false;
            while guest.sent < args.packets {
                let data = payload(n, guest.sent, args.size as usize);
                match guest.frontend.send(&data, None) {
                    Ok(notify) => {
                        kick |= notify;
                        guest.sent += 1;
                    }
                    Err(FrontendError::RingFull) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            guest.completed += guest.frontend.take_tx_responses().len();
            for packet in guest.frontend.receive() {
                match packet.error {
                    Some(_) => guest.errors += 1,
                    None => guest.received += 1,
                }
            }
            kick |= guest.frontend.post_rx_buffers(NET_RX_RING_SIZE);
            if kick {
                netback.interrupt(guest.id)?;
            }
        }

        if inline {
            netback.poll()?;
        }
        while let Ok((from, packet)) = rx.try_recv() {
            let Some(&source) = index.get(&from) else {
                continue;
            };
            let dest = guests[(source + 1) % guests.len()].id;
            if netback.start_xmit(dest, packet)? == XmitOutcome::Dropped {
                dropped += 1;
            }
        }
        if inline {
            netback.poll()?;
        }

        let delivered: usize = guests.iter().map(|g| g.received + g.errors).sum();
        let completed: usize = guests.iter().map(|g| g.completed).sum();
        if delivered + dropped >= expected && completed >= expected {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                "timed out with {} of {} packets accounted for",
                delivered + dropped,
                expected
            );
            break;
        }
        if !inline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    let elapsed = started.elapsed();

    for guest in &guests {
        if let Some(netif) = netback.interface(guest.id) {
            let stats = netif.stats().snapshot();
            println!(
                "{}: sent {} completed {} received {} errors {} | tx {} pkts {} bytes {} errs | rx {} pkts {} bytes {} dropped | copied pages {}",
                guest.id,
                guest.sent,
                guest.completed,
                guest.received,
                guest.errors,
                stats.tx_packets,
                stats.tx_bytes,
                stats.tx_errors,
                stats.rx_packets,
                stats.rx_bytes,
                stats.rx_dropped,
                stats.copied_pages,
            );
        }
    }
    let counters = hv.counters();
    println!(
        "{} packets in {:.3}s, {} dropped | hypercalls: {} map {} unmap {} multicall {} notify",
        expected,
        elapsed.as_secs_f64(),
        dropped,
        counters.map_calls,
        counters.unmap_calls,
        counters.multicalls,
        counters.notify_calls,
    );

    for guest in &guests {
        netback.disconnect(guest.id)?;
    }
    netback.stop();
    info!("done");
    Ok(())
}

fn main() {
    setup_logging();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
