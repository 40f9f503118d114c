//! Tooling primitives for deterministic game AI.
//!
//! This crate is intentionally lightweight and engine-agnostic. Runtimes push [`TraceEvent`]s
//! into whatever [`TraceSink`] the host installs; inspectors read them back later.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod trace;

pub use trace::{NullTraceSink, SharedTraceLog, TraceEvent, TraceLog, TraceSink, VecTraceSink};
