//! Supervisor-worker question answering over long documents.
//!
//! A large supervisor model writes Python that runs in a persistent sandbox.
//! That code delegates chunk-level work to a small worker model and ends the
//! run by calling `FINAL(answer)`. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (code extraction, output
//!   truncation, nudges, feature flags, chunking). No I/O.
//! - **[`io`]**: Side-effecting collaborators (model transport, the Python
//!   sandbox, delegation, run logs, config). Behind traits where tests need
//!   doubles.
//!
//! [`orchestrator`] ties them together into the iteration controller.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
