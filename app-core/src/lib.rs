// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Settlement semantics shared by the relay's projector and verifier.
//!
//! Everything here is deterministic: the same ledger and the same transaction always produce
//! the same resulting ledger, which is what lets the relay compare its speculative view with
//! what the DA layer finalized.
pub mod application;
pub mod ledger;
pub mod transaction;
