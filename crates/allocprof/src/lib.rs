pub mod cli;
pub mod collapse;
pub mod commands;
pub mod error;
pub mod stacks;

pub use error::{Error, Result};
