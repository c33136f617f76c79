//! Example services built on the `EventRelay` event bus
//!
//! This crate provides example applications demonstrating how to publish
//! and consume events with the `EventRelay` library.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Product service example: a catalog fed by `ProductCreated` events
pub mod product_service;
