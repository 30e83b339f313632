//! Kernel print macros. In `no_std` builds these write to the serial port;
//! with the `std` feature (host tests) they forward to standard output.

#[cfg(not(feature = "std"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::serial::SerialWriter, "{}", format_args!($($arg)*));
    }};
}

#[cfg(not(feature = "std"))]
#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::serial::SerialWriter, "{}", format_args!($($arg)*));
    }};
}

#[cfg(not(feature = "std"))]
#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => { $crate::print!($($arg)*) };
}

#[cfg(not(feature = "std"))]
#[macro_export]
macro_rules! eprintln {
    () => { $crate::println!() };
    ($($arg:tt)*) => { $crate::println!($($arg)*) };
}

#[cfg(feature = "std")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => { std::print!($($arg)*) };
}

#[cfg(feature = "std")]
#[macro_export]
macro_rules! println {
    () => { std::println!() };
    ($($arg:tt)*) => { std::println!($($arg)*) };
}

#[cfg(feature = "std")]
#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => { std::eprint!($($arg)*) };
}

#[cfg(feature = "std")]
#[macro_export]
macro_rules! eprintln {
    () => { std::eprintln!() };
    ($($arg:tt)*) => { std::eprintln!($($arg)*) };
}
