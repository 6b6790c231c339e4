use crate::spinlock::Mutex;
#[cfg(target_os = "none")]
use crate::sync::OnceLock;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

pub static PR: Pr = Pr {
    writer: Mutex::new(Writer, "pr"),
    panicked: AtomicBool::new(false),
};

// The console itself is an external driver; it hands us one
// output routine at boot. Hosted builds write to stdout.
#[cfg(target_os = "none")]
static CONSOLE: OnceLock<fn(u8)> = OnceLock::new();

#[cfg(target_os = "none")]
pub fn set_console(putc: fn(u8)) {
    let _ = CONSOLE.set(putc);
}

// lock to avoid interleaving concurrent println!'s.
// The panicked flag is outside the Mutex so panic! can still
// print on a cpu that was wedged holding the writer lock.
pub struct Pr {
    writer: Mutex<Writer>,
    panicked: AtomicBool,
}

impl Pr {
    pub fn panicked(&self) -> &AtomicBool {
        &self.panicked
    }
}

struct Writer;

impl Writer {
    #[cfg(target_os = "none")]
    fn print(&self, c: u8) {
        if let Some(putc) = CONSOLE.get() {
            putc(c)
        }
    }
}

impl fmt::Write for Writer {
    #[cfg(target_os = "none")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.print(byte);
        }
        Ok(())
    }

    #[cfg(not(target_os = "none"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use std::io::Write;
        let _ = std::io::stdout().write_all(s.as_bytes());
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;

    if !PR.panicked.load(Ordering::Relaxed) {
        PR.writer.lock().write_fmt(args).expect("_print: error");
    } else {
        // for panic!
        unsafe {
            PR.writer.get_mut().write_fmt(args).expect("_print: error");
        }
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    ($fmt:expr) => {
        $crate::print!(concat!($fmt, "\n"))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

// A panic is a broken kernel invariant: report where, then halt
// this cpu with interrupts off. Other cpus wedge on the panicked
// flag the next time they print.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::x86::intr_off();
    PR.panicked.store(true, Ordering::Relaxed);
    crate::println!("{}", info);
    loop {
        crate::x86::hlt();
    }
}
