//! Trigger policy layer for signal- and timer-driven containers.
//!
//! Each cycle the container asks, per port, whether the module could
//! usefully run: inputs need enough data, outputs need enough space. Answers
//! are cached per port until [`Topology::reset_trigger_eval_cache`] is called
//! at the start of the next cycle.
//!
//! [`Topology::reset_trigger_eval_cache`]: crate::topo::Topology::reset_trigger_eval_cache

mod trigger;

pub use trigger::{ExtPortView, NoExtPorts, TriggerNeed, length_meets_threshold};
