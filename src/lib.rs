//! YieldPilot: autonomous strategy agent for tokenized invoice yield vaults.
//!
//! The agent reads invoice and deposit snapshots from a ledger, scores each
//! invoice with a pure optimizer, adjusts recommendations for market
//! conditions, and (when confident enough) writes strategy decisions back,
//! streaming every step of its reasoning over WebSocket.

pub mod adjust;
pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod market;
pub mod models;
pub mod narrative;
pub mod optimizer;
pub mod regime;
