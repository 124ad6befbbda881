use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use tether::{MarkingCreateInfo, MarkingService, ObjectRef};

/// Stress demo: several producer threads keep objects across simulated
/// foreign calls while a few registered markers get re-run on every pass.
#[derive(Parser, Debug)]
#[command(name = "tether")]
struct Args {
    /// Producer threads creating handles.
    #[arg(long, default_value_t = 4)]
    threads: u64,
    /// Handles kept per thread.
    #[arg(long, default_value_t = 10_000)]
    keeps: u64,
    /// Per-thread kept buffer capacity.
    #[arg(long, default_value_t = 100)]
    capacity: usize,
    /// Objects registered with a mark action.
    #[arg(long, default_value_t = 8)]
    markers: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let service = Arc::new(MarkingService::new(MarkingCreateInfo {
        buffer_capacity: Some(args.capacity),
    }));

    let marked = Arc::new(AtomicUsize::new(0));
    let owners: Vec<ObjectRef> = (0..args.markers).map(ObjectRef::new).collect();
    for owner in &owners {
        let marked = marked.clone();
        service.register_mark(owner, move |_| {
            marked.fetch_add(1, Ordering::Relaxed);
        });
    }

    let producers: Vec<_> = (0..args.threads)
        .map(|t| {
            let mut proxy = service.create_proxy();
            let keeps = args.keeps;
            thread::spawn(move || {
                for i in 0..keeps {
                    let mut call = proxy.foreign_call();
                    call.keep(ObjectRef::new(t * keeps + i));
                }
            })
        })
        .collect();
    for p in producers {
        p.join().expect("producer thread panicked");
    }

    // Give the runner a moment to drain the last hand-offs.
    thread::sleep(Duration::from_millis(100));

    log::info!(
        "kept {} objects across {} threads",
        args.threads * args.keeps,
        args.threads
    );
    println!(
        "hand-offs: {}, mark passes: {}, mark invocations: {}, live markers: {}",
        service.handoff_count(),
        service.mark_pass_count(),
        marked.load(Ordering::Relaxed),
        service.marker_count(),
    );

    service.shutdown();
}
