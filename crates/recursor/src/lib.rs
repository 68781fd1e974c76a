//! The resolution core of a recursive DNS resolver.
//!
//! This crate walks the delegation hierarchy from the root downwards to
//! answer a question, shaping its behavior per name server from observed
//! latency and failures. It performs no I/O of its own: one upstream
//! exchange is an injected async primitive ([`transport::AskTransport`]),
//! and DNSSEC signature checking is an injected verifier
//! ([`validate::DnssecVerifier`]). Everything else — the iterative descent,
//! QName minimization, CNAME chasing, cache maintenance, throttling, EDNS
//! probing, and the deferred refresh queue — lives here.

#![warn(
    clippy::default_trait_access,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]
#![allow(
    clippy::single_component_path_imports,
    clippy::upper_case_acronyms, // can be removed on a major release boundary
)]
#![recursion_limit = "2048"]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod nsspeed;
mod recursor;
pub mod state;
pub mod task_queue;
pub mod throttle;
pub mod transport;
pub mod validate;
pub mod zones;

#[cfg(test)]
mod tests;

pub use error::{Error, ErrorKind};
pub use hickory_proto as proto;
pub use recursor::{Recursor, RecursorBuilder, ResolveOutcome};

use proto::rr::{Name, RecordType};

/// Bailiwick check: true if `name` is `zone` itself or underneath it.
pub fn is_subzone(zone: &Name, name: &Name) -> bool {
    zone.zone_of(name)
}

/// Map a record type through its wire code, folding `Unknown(code)` onto the
/// well-known variant for that code so type comparisons and cache keys agree
/// regardless of how the rdata was materialized.
pub fn normalized_rtype(rtype: RecordType) -> RecordType {
    RecordType::from(u16::from(rtype))
}

/// True for internal-only pseudo record types the resolver refuses to
/// resolve, both at the front door and on task submission.
pub fn is_unsupported_qtype(qtype: RecordType) -> bool {
    let code = u16::from(qtype);
    // 0 is reserved; 65280..=65534 is the private-use range we claim for
    // internal markers.
    code == 0 || (0xff00..=0xfffe).contains(&code)
}
