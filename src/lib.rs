//! Point-to-point RDMA queue-pair micro-benchmark.
//!
//! Two processes, a client and a daemon, meet over a plain TCP control
//! channel, bring one queue pair each through the verbs state machine and
//! then measure the client's submission latency over a windowed pipeline:
//!
//! * The control channel exchanges run parameters, endpoints and, when
//!   needed, registered-memory descriptions, then gates the measured loop
//!   behind ready/done barriers ([`handshake`]).
//!
//! * The client posts batches of identical work requests, never letting
//!   more than the configured ring depth stay outstanding, and samples the
//!   cycle cost of every batch ([`stats`]).
//!
//! * Transports range from reliable-connected to raw Ethernet; operations
//!   from two-sided sends to atomics and memory-window maintenance
//!   ([`transport`], [`config`]).
//!
//! The crate builds one binary; see [`run::execute`] for the whole life of
//! a run.

#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,

    clippy::all,
    clippy::pedantic,
    clippy::cargo
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc, // error conditions are described at the error type
    clippy::missing_panics_doc,
    clippy::missing_safety_doc // SAFETY comments sit on the unsafe blocks themselves
)]

/// Cycle counter and calibration
pub mod clock;
/// Completion queue wrapper
mod completion_queue;
/// Run configuration and validation
pub mod config;
/// Device context
mod context;
/// Error taxonomy
pub mod error;
/// Control channel and handshake records
pub mod handshake;
/// Registered memory region
mod memory_region;
/// Type-2 memory window
mod memory_window;
/// Work-request submission strategies
mod posting;
/// Protection domain
mod protection_domain;
/// Queue pair and state machine
mod queue_pair;
/// Run orchestration
pub mod run;
/// Shared receive queue
mod shared_receive_queue;
/// Latency accounting
pub mod stats;
/// Measured traffic loops
mod traffic;
/// Transport-kind policies
pub mod transport;
/// XRC domain
mod xrc_domain;
