//! A queue with a fixed or scripted answer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use poolscale_core::Selector;

use crate::error::QueueResult;
use crate::queue::BuildQueue;

/// Returns scripted results in order, then the fallback forever.
pub struct StaticQueue {
    script: Mutex<VecDeque<QueueResult<u32>>>,
    fallback: Mutex<QueueResult<u32>>,
    latency: Duration,
}

impl StaticQueue {
    /// Always report `pending` builds.
    pub fn new(pending: u32) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(pending)),
            latency: Duration::ZERO,
        }
    }

    /// Queue up one-shot results served before the fallback.
    pub fn with_script(self, results: impl IntoIterator<Item = QueueResult<u32>>) -> Self {
        lock(&self.script).extend(results);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the fallback answer.
    pub fn set(&self, result: QueueResult<u32>) {
        *lock(&self.fallback) = result;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BuildQueue for StaticQueue {
    async fn pending(&self, _selector: &Selector) -> QueueResult<u32> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = lock(&self.script).pop_front();
        match scripted {
            Some(result) => result,
            None => lock(&self.fallback).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    #[tokio::test]
    async fn script_then_fallback() {
        let queue = StaticQueue::new(3).with_script([
            Ok(10),
            Err(QueueError::Unavailable("down".into())),
        ]);
        let selector = Selector::new();
        assert_eq!(queue.pending(&selector).await, Ok(10));
        assert!(queue.pending(&selector).await.is_err());
        assert_eq!(queue.pending(&selector).await, Ok(3));
        assert_eq!(queue.pending(&selector).await, Ok(3));

        queue.set(Ok(0));
        assert_eq!(queue.pending(&selector).await, Ok(0));
    }
}
