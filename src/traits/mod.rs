// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod function;

pub use function::{from_async_fn, from_fn, typed, ComputeFunction, FunctionError};
