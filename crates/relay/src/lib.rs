// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! parley-relay: WebSocket relay for the parley sync engine.
//!
//! The relay holds the authoritative [`parley_core::Ledger`], answers
//! requests from sync clients and pushes subscription data to them.

pub mod server;
pub mod state;

pub use server::{run, serve};
pub use state::{Event, RelayState};
