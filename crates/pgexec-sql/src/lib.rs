// SPDX-License-Identifier: Apache-2.0

//! SQL helpers shared by the query bridge.
//!
//! Only lightweight lexical analysis lives here. Statements are never parsed;
//! the server remains the authority on grammar.

pub mod transaction_control;

pub use transaction_control::is_begin_required;
