//! iRODS Integration Tests
//!
//! End-to-end tests of the connection client against an in-process mock
//! iRODS server. It is NOT published to crates.io.
//!
//! # Test Categories
//!
//! - **connection_handshake**: negotiation, encryption and every auth scheme
//! - **connection_lifecycle**: state transitions, concurrency, timeouts
//! - **reconnection**: cookie-based socket renewal
//! - **replica_tokens**: shared replica token cache under contention
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p irods-integration-tests
//!
//! # Run with logging
//! RUST_LOG=debug cargo test -p irods-integration-tests -- --nocapture
//! ```
//!
//! No external services are needed; every test starts its own server on a
//! random local port.

pub mod fixtures;
pub mod helpers;
pub mod mocks;

pub use fixtures::*;
pub use helpers::*;
