// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker client implementations behind `connection::Backend`.

pub mod lapin;

/// In-process broker for tests, built with `cfg(test)` or the `test-support`
/// feature.
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
