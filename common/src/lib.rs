pub mod data;
pub mod helpers;
pub mod payloads;

pub use data::*;
