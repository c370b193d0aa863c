//! yaim: a cooperative virtual-IP coordinator.
//!
//! Each peer runs one instance of this daemon. Every tick it probes a local
//! health check, advertises itself in a shared coordination store, races
//! other peers for TTL-bound per-address marker keys, and keeps the kernel's
//! labeled address set on the configured interface in sync with the marks it
//! holds, announcing takeovers via gratuitous ARP.

pub mod checker;
pub mod config;
pub mod daemon;
pub mod dcs;
pub mod error;
pub mod ip;
