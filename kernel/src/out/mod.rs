
pub mod uart;
pub mod framebuffer;
pub mod terminal;


// print! & println! implementations

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::out::__print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("\n{}", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn __print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    uart::UART_COM1.0.lock().write_fmt(args).unwrap_or_else(|_| ());

    let mut term = terminal::TERM1.lock();
    if term.framebuffer_mut().is_some() {
        let _ = term.write_fmt(args);
    }
}

// log!/debug!/warn!/err! family: prefixed, gated by the boot-config log level
// (§10.1). Each goes through println! so it lands on both live outputs.

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::out::__leveled_print($crate::cfg::LogLevel::Debug, "DEBUG", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => ($crate::out::__leveled_print($crate::cfg::LogLevel::Info, "INFO", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ($crate::out::__leveled_print($crate::cfg::LogLevel::Warn, "WARN", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => ($crate::out::__leveled_print($crate::cfg::LogLevel::Err, "ERR", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn __leveled_print(level: crate::cfg::LogLevel, tag: &str, args: core::fmt::Arguments) {
    if level >= crate::cfg::LogLevel::from_cfg() {
        __print(format_args!("\n[{}] {}", tag, args));
    }
}
