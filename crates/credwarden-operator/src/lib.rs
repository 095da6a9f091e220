//! credwarden operator.
//!
//! Wires the core library and a resource store into one controller per
//! resource kind, plus a small probe server for `/healthz` and `/readyz`.

pub mod config;
pub mod controller;
pub mod health;
pub mod state;
