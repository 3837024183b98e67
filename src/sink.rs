//! Process-wide output sink and logging macros.
//!
//! KBoot never links a `log`-facade crate: console/video drivers are an
//! external collaborator (see the crate root), so the core only needs a
//! narrow `write_str` contract to format diagnostics through. The concrete
//! implementation (VGA text mode, a UEFI simple-text-output protocol, a
//! serial port, a host terminal for the shell binary) is registered once at
//! startup.

use conquer_once::spin::OnceCell;
use core::fmt::Arguments;
use spin::Mutex;

/// A destination for formatted diagnostic output.
///
/// Implementations are provided by the firmware-specific front end; the
/// core never assumes a particular display technology.
pub trait Sink: Send {
    fn write_str(&mut self, s: &str);
}

static SINK: OnceCell<Mutex<&'static mut dyn Sink>> = OnceCell::uninit();

/// Registers the sink that `kb_info!`/`kb_warn!`/`kb_error!` write through.
///
/// Must be called once before any logging macro runs. Calling it twice
/// leaves the first registration in place.
pub fn init_sink(sink: &'static mut dyn Sink) {
    SINK.init_once(|| Mutex::new(sink));
}

#[doc(hidden)]
pub fn __write_fmt(args: Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        use core::fmt::Write;
        struct Adapter<'a>(spin::MutexGuard<'a, &'static mut dyn Sink>);
        impl Write for Adapter<'_> {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                self.0.write_str(s);
                Ok(())
            }
        }
        let _ = write!(Adapter(sink.lock()), "{args}");
    }
}

/// Prints an informational message, optionally prefixed by a context tag.
///
/// ```ignore
/// kb_info!("mbr", "found {} partitions", count);
/// kb_info!("loading kernel at {:#x}", phys);
/// ```
#[macro_export]
macro_rules! kb_info {
    ($ctx:literal, $($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[info] {}: ", $ctx));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
    ($($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[info] "));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
}

/// Prints a warning message, optionally prefixed by a context tag.
#[macro_export]
macro_rules! kb_warn {
    ($ctx:literal, $($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[warn] {}: ", $ctx));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
    ($($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[warn] "));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
}

/// Prints an error message, optionally prefixed by a context tag.
#[macro_export]
macro_rules! kb_error {
    ($ctx:literal, $($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[error] {}: ", $ctx));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
    ($($arg:tt)*) => {{
        $crate::sink::__write_fmt(format_args!("[error] "));
        $crate::sink::__write_fmt(format_args!($($arg)*));
        $crate::sink::__write_fmt(format_args!("\n"));
    }};
}
