use std::io::Write;
use std::thread;
use std::time::Duration;

/// Breakpoint target; the debugger resolves its address from our stdout.
#[no_mangle]
#[inline(never)]
pub extern "C" fn poke() {
    std::hint::black_box(0u64);
}

/// Invocation target: stands in for a runtime entry point.
#[no_mangle]
#[inline(never)]
pub extern "C" fn add_words(a: u64, b: u64) -> u64 {
    std::hint::black_box(a.wrapping_add(b))
}

fn main() {
    // Spin mode: park forever so interrupt tests have something to stop.
    if std::env::args().nth(1).as_deref() == Some("spin") {
        loop {
            thread::sleep(Duration::from_millis(50));
        }
    }

    // Executable scratch region standing in for the runtime's code buffer.
    let arena = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            64 * 1024,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert!(arena != libc::MAP_FAILED, "mmap failed");

    println!("POKE_ADDR=0x{:x}", poke as usize);
    println!("ADD_ADDR=0x{:x}", add_words as usize);
    println!("ARENA_ADDR=0x{:x}", arena as usize);
    eprintln!("HELLO_FROM_STDERR");
    std::io::stdout().flush().unwrap();
    std::io::stderr().flush().unwrap();

    // Hand control to the debugger with the addresses in its hands.
    unsafe {
        libc::raise(libc::SIGSTOP);
    }

    poke();
    thread::sleep(Duration::from_millis(10));
    poke();
}
