pub mod gpo;

pub use gpo::*;
