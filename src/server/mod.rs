// Message Bus Server Layer
// Wiring of the engine into a runnable gateway

//! # Server Module
//!
//! The engine pieces are independent of each other; this layer assembles
//! them. [`gateway::GatewayBuilder`] is what the `server` binary uses, and
//! what an embedding application would use too.

pub mod gateway;

pub use gateway::{Gateway, GatewayBuilder};

#[cfg(test)]
mod gateway_tests;
