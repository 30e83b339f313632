#![cfg_attr(not(feature = "std"), no_std)]

pub mod macros;
pub mod mem;
pub mod serial;
pub mod sizes;
