//! A minimal tour of the page-provider seam: open the kernel module if
//! its device is present, otherwise fall back to an in-process memfd,
//! and push one block through the pseudo-page engine.

use multiheap_fit::{Config, DevicePages, MemfdPages, VirtualMultiheap};

fn main() {
    env_logger::init();

    let config = Config::new(1, 4096, 32, 256 * 1024);

    match DevicePages::open_default() {
        Ok(device) => {
            println!("Using the kernel page service.");
            let mut vh = VirtualMultiheap::new(device, config);
            roundtrip(&mut vh);
        }
        Err(err) => {
            println!("Kernel page service unavailable ({}), using memfd.", err);
            let pages = MemfdPages::new().expect("memfd_create");
            let mut vh = VirtualMultiheap::new(pages, config);
            roundtrip(&mut vh);
        }
    }
}

fn roundtrip<S: multiheap_fit::PageService>(vh: &mut VirtualMultiheap<S>) {
    vh.allocate(0, 1000);
    let (addr, len) = vh.dereference_and_length(0);
    unsafe { addr.write_bytes(0x2a, len) };
    println!(
        "block 0: {} bytes at {:p}, {} bytes in use overall",
        len,
        addr,
        vh.using_mem(),
    );
    vh.deallocate(0);
}
