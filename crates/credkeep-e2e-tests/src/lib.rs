//! End-to-end integration tests for credkeep.
//!
//! These tests exercise the crates together:
//! - Token storage through the lifecycle manager
//! - Audit trail contents and integrity
//! - Independent cleanup validation
//! - Concurrent store and clear cycles

#![cfg(test)]
