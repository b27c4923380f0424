// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Fixed-size byte region shared by every isolation context of one pool.
///
/// Functions coordinate access themselves; the pool gives no ordering guarantees about its
/// contents across tasks.
#[derive(Debug, Clone)]
pub struct SharedRegion {
    bytes: Arc<RwLock<Vec<u8>>>,
    size: usize,
}

impl SharedRegion {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0; size])),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_bytes() {
        let region = SharedRegion::new(8);
        let other = region.clone();

        other.write().await[3] = 42;

        assert_eq!(region.size(), 8);
        assert_eq!(region.read().await[3], 42);
        assert_eq!(region.read().await.len(), 8);
    }
}
