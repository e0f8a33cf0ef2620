//! Property-based tests for batching invariants

mod partition;
