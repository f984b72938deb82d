//! Batched page loading with a concurrency bound and inter-batch delay

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// One page of a batched load.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_offset: usize,
}

/// Tuning knobs for a batched load.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Items requested per page.
    pub batch_size: usize,
    /// Maximum pages fetched concurrently (known-total loads only).
    pub max_concurrency: usize,
    /// Pause between batches so the remote endpoint is not hammered.
    pub inter_batch_delay: Duration,
    /// Total item count when the caller already knows it.
    pub known_total: Option<usize>,
    /// Consecutive page failures tolerated before the load stops.
    pub max_consecutive_failures: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 4,
            inter_batch_delay: Duration::from_millis(100),
            known_total: None,
            max_consecutive_failures: 3,
        }
    }
}

/// Repeatedly call `fetch_page(offset, limit)` and accumulate items until
/// `has_more` is false or the known total is reached.
///
/// A failed page is logged and skipped; the load keeps going with the next
/// offset unless too many pages fail in a row. When the total is known in
/// advance, pages are fetched in concurrent waves bounded by
/// `max_concurrency`; otherwise the walk is sequential because each page
/// decides whether another follows.
pub async fn load_in_batches<T, F, Fut>(mut fetch_page: F, opts: &BatchOptions) -> Vec<T>
where
    T: Send,
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = anyhow::Result<Page<T>>>,
{
    match opts.known_total {
        Some(total) => load_known_total(fetch_page, total, opts).await,
        None => {
            let mut items = Vec::new();
            let mut offset = 0usize;
            let mut consecutive_failures = 0u32;

            loop {
                match fetch_page(offset, opts.batch_size).await {
                    Ok(page) => {
                        consecutive_failures = 0;
                        debug!(
                            "batch at offset {} returned {} items (has_more={})",
                            offset,
                            page.items.len(),
                            page.has_more
                        );
                        items.extend(page.items);
                        if !page.has_more {
                            break;
                        }
                        offset = page.next_offset;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!("batch at offset {} failed, skipping: {}", offset, e);
                        if consecutive_failures >= opts.max_consecutive_failures {
                            warn!(
                                "{} consecutive batch failures, stopping load at offset {}",
                                consecutive_failures, offset
                            );
                            break;
                        }
                        offset += opts.batch_size;
                    }
                }

                if !opts.inter_batch_delay.is_zero() {
                    tokio::time::sleep(opts.inter_batch_delay).await;
                }
            }

            items
        }
    }
}

async fn load_known_total<T, F, Fut>(mut fetch_page: F, total: usize, opts: &BatchOptions) -> Vec<T>
where
    T: Send,
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = anyhow::Result<Page<T>>>,
{
    let mut items = Vec::with_capacity(total);
    let offsets: Vec<usize> = (0..total).step_by(opts.batch_size.max(1)).collect();

    // Fetch one wave of futures at a time so at most `max_concurrency`
    // requests are in flight between delays.
    for wave in offsets.chunks(opts.max_concurrency.max(1)) {
        let futures: Vec<_> = wave
            .iter()
            .map(|&offset| fetch_page(offset, opts.batch_size))
            .collect();
        let results: Vec<_> = stream::iter(futures)
            .buffer_unordered(opts.max_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(page) => items.extend(page.items),
                Err(e) => warn!("batch failed, skipping: {}", e),
            }
        }

        if items.len() >= total {
            break;
        }
        if !opts.inter_batch_delay.is_zero() {
            tokio::time::sleep(opts.inter_batch_delay).await;
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opts() -> BatchOptions {
        BatchOptions {
            batch_size: 10,
            max_concurrency: 2,
            inter_batch_delay: Duration::ZERO,
            known_total: None,
            max_consecutive_failures: 3,
        }
    }

    #[tokio::test]
    async fn accumulates_until_has_more_is_false() {
        let items = load_in_batches(
            |offset, limit| async move {
                let end = (offset + limit).min(25);
                Ok(Page {
                    items: (offset..end).collect::<Vec<_>>(),
                    has_more: end < 25,
                    next_offset: end,
                })
            },
            &opts(),
        )
        .await;
        assert_eq!(items, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_not_fatal() {
        let calls = AtomicUsize::new(0);
        let items = load_in_batches(
            |offset, limit| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 1 {
                        return Err(anyhow!("page unavailable"));
                    }
                    let end = (offset + limit).min(30);
                    Ok(Page {
                        items: (offset..end).collect::<Vec<usize>>(),
                        has_more: end < 30,
                        next_offset: end,
                    })
                }
            },
            &opts(),
        )
        .await;
        // Page at offset 10 was lost, the rest arrived.
        assert_eq!(items.len(), 20);
        assert!(items.contains(&0) && items.contains(&29));
        assert!(!items.contains(&10));
    }

    #[tokio::test]
    async fn stops_after_consecutive_failures() {
        let calls = AtomicUsize::new(0);
        let items: Vec<usize> = load_in_batches(
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("endpoint down")) }
            },
            &opts(),
        )
        .await;
        assert!(items.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn known_total_fetches_every_offset() {
        let mut options = opts();
        options.known_total = Some(35);
        let items = load_in_batches(
            |offset, limit| async move {
                let end = (offset + limit).min(35);
                Ok(Page {
                    items: (offset..end).collect::<Vec<_>>(),
                    has_more: end < 35,
                    next_offset: end,
                })
            },
            &options,
        )
        .await;
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..35).collect::<Vec<_>>());
    }
}
