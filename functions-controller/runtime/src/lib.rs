#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod discovery;

pub use self::args::Args;
