//! Integration tests for the concurrency-sensitive invariants that the
//! unit tests colocated with `scheduler::queue` and `storage` don't cover
//! from a cross-task perspective: slot admission under real concurrent
//! task contention, claim-race atomicity, and monotonic event sequencing.

use agendo_host::scheduler::SlotQueue;
use agendo_host::storage::Storage;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::test]
async fn slot_queue_admits_exactly_capacity_under_heavy_contention() {
    let queue = SlotQueue::new(3);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let queue = queue.clone();
        let in_flight = in_flight.clone();
        let max_observed = max_observed.clone();
        handles.push(tokio::spawn(async move {
            let _slot = queue.acquire().await;
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 3, "never more than capacity slots held at once");
    assert_eq!(queue.available(), 3, "all slots returned once every task finished");
}

#[tokio::test]
async fn only_one_concurrent_claimant_wins_the_session() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.claim_session("s1", &format!("worker-{i}")).await.unwrap() }));
    }

    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one concurrent claimant should win the race");

    let row = storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(row.status, "active");
    assert!(row.worker_id.is_some());
}

#[tokio::test]
async fn event_seq_allocation_is_monotonic_and_unique_under_concurrency() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.next_event_seq("s1").await.unwrap() }));
    }

    let mut seqs = Vec::new();
    for h in handles {
        seqs.push(h.await.unwrap());
    }
    seqs.sort_unstable();

    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(seqs, expected, "every allocation must be unique and contiguous, no duplicates or gaps");
}

proptest! {
    /// Monotonic-sequence invariant (§8) generalized over an arbitrary
    /// number of concurrent callers rather than a fixed 100.
    #[test]
    fn next_event_seq_is_contiguous_for_any_concurrency_level(n in 1usize..60) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let seqs = rt.block_on(async move {
            let dir = TempDir::new().unwrap();
            let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
            storage
                .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
                .await
                .unwrap();
            let mut handles = Vec::new();
            for _ in 0..n {
                let storage = storage.clone();
                handles.push(tokio::spawn(async move { storage.next_event_seq("s1").await.unwrap() }));
            }
            let mut seqs = Vec::new();
            for h in handles {
                seqs.push(h.await.unwrap());
            }
            seqs.sort_unstable();
            seqs
        });
        let expected: Vec<i64> = (1..=n as i64).collect();
        prop_assert_eq!(seqs, expected);
    }

    /// Claim-atomicity invariant (§8) generalized over an arbitrary number
    /// of concurrent claimants.
    #[test]
    fn exactly_one_claimant_wins_for_any_concurrency_level(n in 1usize..40) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let wins = rt.block_on(async move {
            let dir = TempDir::new().unwrap();
            let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
            storage
                .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
                .await
                .unwrap();
            let mut handles = Vec::new();
            for i in 0..n {
                let storage = storage.clone();
                handles.push(tokio::spawn(async move { storage.claim_session("s1", &format!("worker-{i}")).await.unwrap() }));
            }
            let mut wins = 0;
            for h in handles {
                if h.await.unwrap() {
                    wins += 1;
                }
            }
            wins
        });
        prop_assert_eq!(wins, 1);
    }

    /// §4.2's `onData` pipeline buffers an arbitrary trailing partial line
    /// and splits complete ones on `\n`; `tokio`'s `AsyncBufReadExt::lines`
    /// is what the adapters lean on for this, so the property is checked
    /// against it directly: however a byte stream carrying N NDJSON lines
    /// is chopped into chunks, the reconstructed lines must match exactly.
    #[test]
    fn ndjson_lines_reconstruct_across_arbitrary_chunk_splits(
        lines in proptest::collection::vec("[a-zA-Z0-9_: ]{0,40}", 1..12),
        chunk_size in 1usize..17,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let collected = rt.block_on({
            let lines = lines.clone();
            async move {
                let full = lines.join("\n") + "\n";
                let bytes = full.into_bytes();
                let (mut writer, reader) = tokio::io::duplex(64);
                let write_task = tokio::spawn(async move {
                    for chunk in bytes.chunks(chunk_size) {
                        let _ = writer.write_all(chunk).await;
                        tokio::task::yield_now().await;
                    }
                });
                let mut collected = Vec::new();
                let mut buf_lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = buf_lines.next_line().await {
                    collected.push(line);
                }
                let _ = write_task.await;
                collected
            }
        });
        prop_assert_eq!(collected, lines);
    }
}
