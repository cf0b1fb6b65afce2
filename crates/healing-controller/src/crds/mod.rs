pub mod healingaction;
pub mod healingpolicy;

pub use healingaction::*;
pub use healingpolicy::*;
