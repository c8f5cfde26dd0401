// Common test utilities

#[allow(dead_code)]
pub mod tracing;
