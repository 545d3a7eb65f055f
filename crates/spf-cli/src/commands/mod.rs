//! CLI command implementations.

pub mod common;
pub mod icb;
pub mod rtm;
pub mod run;
