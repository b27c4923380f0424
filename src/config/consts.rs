// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

/// Default per-task deadline in milliseconds (30 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Fallback context cap when the host core count cannot be detected
pub const FALLBACK_MAX_WORKERS: usize = 4;
/// Contexts brought up by `initialize()` when not configured
pub const DEFAULT_INITIAL_WORKERS: usize = 2;
/// Highest task priority
pub const MAX_PRIORITY: u8 = 10;
/// Priority used when the caller does not pick one
pub const DEFAULT_PRIORITY: u8 = 5;
/// How long an abandoned task may keep its context busy before the context is replaced (5 seconds)
pub const DEFAULT_ABANDONED_TASK_GRACE_MS: u64 = 5_000;
/// Default size of the opt-in shared memory region (64 KiB)
pub const DEFAULT_SHARED_MEMORY_BYTES: usize = 64 * 1024;
/// Consecutive contexts that may die before `ready` before queued work is failed
pub const MAX_STARTUP_FAILURES: u32 = 3;
