//! A churn driver for either engine: random allocate/free traffic over a
//! bounded id space, with periodic progress and a final audit.
//!
//! USAGE: stress [OPS] [IDS] [MAX_SIZE] [--virtual]

use multiheap_fit::{Config, MemfdPages, Multiheap, VirtualMultiheap};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

const OPS: usize = 100_000;
const IDS: usize = 1024;
const MAX_SIZE: usize = 4096;

/// The operations the driver needs, provided by both engines.
trait Engine {
    fn allocate(&mut self, id: usize, len: usize);
    fn deallocate(&mut self, id: usize);
    fn length(&self, id: usize) -> usize;
    fn using_mem(&self) -> usize;
    fn audit_ok(&self) -> bool;
}

impl Engine for Multiheap {
    fn allocate(&mut self, id: usize, len: usize) {
        Multiheap::allocate(self, id, len)
    }
    fn deallocate(&mut self, id: usize) {
        Multiheap::deallocate(self, id)
    }
    fn length(&self, id: usize) -> usize {
        Multiheap::length(self, id)
    }
    fn using_mem(&self) -> usize {
        Multiheap::using_mem(self)
    }
    fn audit_ok(&self) -> bool {
        self.audit().is_valid()
    }
}

impl Engine for VirtualMultiheap<MemfdPages> {
    fn allocate(&mut self, id: usize, len: usize) {
        VirtualMultiheap::allocate(self, id, len)
    }
    fn deallocate(&mut self, id: usize) {
        VirtualMultiheap::deallocate(self, id)
    }
    fn length(&self, id: usize) -> usize {
        VirtualMultiheap::length(self, id)
    }
    fn using_mem(&self) -> usize {
        VirtualMultiheap::using_mem(self)
    }
    fn audit_ok(&self) -> bool {
        self.audit().is_valid()
    }
}

fn run<E: Engine>(engine: &mut E, ops: usize, ids: usize, max_size: usize) {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1usize, max_size);

    let mut live = vec![false; ids];
    let mut live_count = 0usize;
    let mut live_bytes = 0usize;
    let mut peak_bytes = 0usize;

    for step in 1..=ops {
        let id = rng.gen_range(0..ids);
        if !live[id] {
            engine.allocate(id, sizes.sample(&mut rng));
            live[id] = true;
            live_count += 1;
            live_bytes += engine.length(id);
            peak_bytes = peak_bytes.max(live_bytes);
        } else {
            live_bytes -= engine.length(id);
            engine.deallocate(id);
            live[id] = false;
            live_count -= 1;
        }

        if step % (ops / 10).max(1) == 0 {
            println!(
                "step {:>8} / {}: {} live blocks, {} live bytes, {} bytes in use",
                step,
                ops,
                live_count,
                live_bytes,
                engine.using_mem(),
            );
            assert!(engine.audit_ok(), "structural audit failed at step {}", step);
        }
    }

    for id in 0..ids {
        if live[id] {
            engine.deallocate(id);
        }
    }
    assert!(engine.audit_ok());
    println!(
        "\nfinished: peak {} live bytes, {} bytes retained after drain",
        peak_bytes,
        engine.using_mem(),
    );
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [OPS] [IDS] [MAX_SIZE] [--virtual]", args[0]);
        return;
    }
    let positional: Vec<&String> = args[1..].iter().filter(|a| !a.starts_with("--")).collect();
    let ops: usize = positional
        .first()
        .and_then(|s| s.parse().ok())
        .unwrap_or(OPS);
    let ids: usize = positional
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(IDS);
    let max_size: usize = positional
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_SIZE);
    let config = Config::new(1, max_size, ids, ids * max_size);

    println!("Running {} operations over {} ids, blocks up to {} bytes.", ops, ids, max_size);
    if args.contains(&"--virtual".to_owned()) {
        println!("Engine: pseudo-pages over memfd\n");
        let mut vh = VirtualMultiheap::new(MemfdPages::new().expect("memfd"), config);
        run(&mut vh, ops, ids, max_size);
    } else {
        println!("Engine: multiheap\n");
        let mut mh = Multiheap::new(config);
        run(&mut mh, ops, ids, max_size);
    }
}
