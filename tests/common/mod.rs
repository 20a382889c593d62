//! Shared test utilities for integration and scenario tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - In-memory cluster topologies and polling assertions

#![allow(dead_code)]

pub mod containers;
pub mod memory;

pub use containers::*;
pub use memory::*;
