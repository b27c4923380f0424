// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Parallel batch runner: one registered function applied to many items, a window at a time.

mod runner;


pub use runner::{BatchItemResult, BatchProgress, BatchResult, BatchRunner};
