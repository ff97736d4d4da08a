use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Caps the number of concurrent node requests issued by one stream.
///
/// Each stream owns its own dispatcher, so a slow or failing stream cannot starve the others of
/// request slots. Slots are released when the returned [`DispatchPermit`] is dropped.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    limiter: Arc<Semaphore>,
    max_concurrent: usize,
}

/// A request slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

impl Dispatcher {
    /// Creates a dispatcher allowing `max_concurrent` requests at once, at least one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Waits until fewer than `max_concurrent` requests are in flight, then takes a slot.
    ///
    /// Fails only if the dispatcher was closed.
    pub async fn acquire(&self) -> Result<DispatchPermit, AcquireError> {
        let permit = self.limiter.clone().acquire_owned().await?;
        Ok(DispatchPermit { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of slots currently taken.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.limiter.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let dispatcher = Dispatcher::new(2);

        let first = dispatcher.acquire().await.unwrap();
        let _second = dispatcher.acquire().await.unwrap();
        assert_eq!(dispatcher.in_flight(), 2);

        drop(first);
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[tokio::test]
    async fn zero_limit_still_allows_one_request() {
        let dispatcher = Dispatcher::new(0);

        let _permit = dispatcher.acquire().await.unwrap();

        assert_eq!(dispatcher.max_concurrent(), 1);
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrent() {
        //* Given
        let dispatcher = Dispatcher::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        //* When
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let dispatcher = dispatcher.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let _permit = dispatcher.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("task should not panic");
        }

        //* Then
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
