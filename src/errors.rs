//! Crate-wide error type, built with `error_chain!` in the teacher's style
//! (see `aidanhs-sccache`'s implied `errors.rs`, referenced throughout
//! `src/dist/mod.rs` as `use errors::*;`).

#![allow(deprecated)]

use error_chain::error_chain;
pub use error_chain::bail;

error_chain! {
    errors {
        /// A `Link` read/write deadline elapsed.
        Timeout(detail: String) {
            description("operation timed out")
            display("operation timed out: {}", detail)
        }
        /// The peer closed the connection unexpectedly.
        PeerGone(detail: String) {
            description("peer disconnected")
            display("peer disconnected: {}", detail)
        }
        /// A line on the wire didn't parse as an expected verb/arity.
        Protocol(detail: String) {
            description("protocol error")
            display("protocol error: {}", detail)
        }
        /// The auth chain was exhausted without a method succeeding.
        AccessDenied(detail: String) {
            description("access denied")
            display("access denied: {}", detail)
        }
        /// A task referenced a cache_name the worker has never heard of.
        CacheMiss(cache_name: String) {
            description("cache miss")
            display("cache miss: {}", cache_name)
        }
        /// A URL fetch or producer command failed to materialize an object.
        MaterializationFailed(cache_name: String, detail: String) {
            description("materialization failed")
            display("materialization of {} failed: {}", cache_name, detail)
        }
        /// A task exceeded its allocated resources.
        ResourceOverflow(detail: String) {
            description("resource overflow")
            display("resource overflow: {}", detail)
        }
        /// Local I/O error setting up a task's sandbox directory.
        SandboxError(detail: String) {
            description("sandbox error")
            display("sandbox error: {}", detail)
        }
        /// Invalid task submission (e.g. missing local input file).
        ConfigError(detail: String) {
            description("configuration error")
            display("configuration error: {}", detail)
        }
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        Reqwest(::reqwest::Error);
    }
}
