//! Common test utilities for integration tests.
//!
//! [`FakePlatform`] keeps Kubernetes objects in memory and records every
//! write; [`FakeTransport`] answers direct node calls from a script.

pub mod fake_platform;
pub mod fake_transport;
pub mod fixtures;

// Re-export common types
pub use fake_platform::*;
pub use fake_transport::*;
pub use fixtures::*;
