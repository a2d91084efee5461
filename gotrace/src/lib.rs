//! Function-level tracing of Go binaries through uprobes.
//!
//! [`probes`] resolves where to attach entry and return probes in a Go
//! executable; [`interpret`] turns the resulting event stream back into
//! per-call-path timing statistics.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod events;
pub mod interpret;
pub mod probes;
pub mod profile;
pub mod scanner;
pub mod symbol_table;
mod traces;
