//! The smallest useful tour of the API: two blocks, one relocation, one
//! intact payload.

use multiheap_fit::{Config, Multiheap};

fn main() {
    env_logger::init();

    let mut mh = Multiheap::new(Config::new(1, 2048, 16, 32 * 1024));

    mh.allocate(0, 1024);
    mh.allocate(1, 1024);

    let message = b"Hello World\0";
    unsafe {
        core::ptr::copy_nonoverlapping(message.as_ptr(), mh.dereference(1), message.len());
    }
    let before = mh.dereference(1) as usize;

    // Freeing block 0 moves block 1 into the vacated slot.
    mh.deallocate(0);

    let after = mh.dereference(1);
    let text = unsafe { core::slice::from_raw_parts(after, message.len() - 1) };
    println!("{}", String::from_utf8_lossy(text));
    println!(
        "block 1 moved from {:#x} to {:#x} ({} bytes internal, {} bytes in use)",
        before,
        after as usize,
        mh.length(1),
        mh.using_mem(),
    );
}
