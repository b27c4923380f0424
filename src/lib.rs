// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod batch;      // parallel batch runner
pub mod config;     // config loading + validation
pub mod errors;     // error handling
pub mod observability;
pub mod pipeline;   // staged runs on top of the pool
pub mod pool;       // isolation contexts + scheduling
pub mod protocol;   // messages crossing the context boundary
pub mod traits;     // compute function abstraction
pub mod wasm;       // remote dependency loading
