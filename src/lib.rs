//! oxprof: a whole-system sampling profiler for Linux perf events.
//!
//! The recorder half opens one hardware counter per (event, CPU), drains the
//! kernel's ring buffers into a raw sample stream, and the converter half
//! rebuilds per-process address spaces from that stream and accumulates
//! every sample into persistent per-binary, per-counter sample files.

pub mod cli;
pub mod error;
pub mod linux;
pub mod linux_shared;
pub mod samples;
pub mod stream;
