//! Scheduler invariants under live feedback and concurrent callers

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use swarmlink_core::config::{AdaptiveConfig, SchedulerConfig};
use swarmlink_core::metrics::ChunkOutcome;
use swarmlink_core::test_fixtures::peer_ids;
use swarmlink_core::{
    AdaptiveScheduler, ChunkRequest, ChunkScheduler, ChunkScheduling, PeerId,
    PeerMetricsCollector, PeerMetricsProvider,
};

fn scheduler_with(
    metrics: Arc<PeerMetricsCollector>,
    scheduler: SchedulerConfig,
    adaptive: AdaptiveConfig,
) -> AdaptiveScheduler {
    AdaptiveScheduler::new(ChunkScheduler::new(scheduler, metrics), adaptive)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_feedback_loop_keeps_weights_and_capacity_in_bounds(
        rounds in proptest::collection::vec(
            proptest::collection::vec((any::<bool>(), 1u64..4_000, 1_000u64..1_000_000), 1..6),
            1..40,
        ),
        max_in_flight in 1usize..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let metrics = Arc::new(PeerMetricsCollector::new());
        let scheduler = scheduler_with(
            metrics.clone(),
            SchedulerConfig {
                max_in_flight_per_peer: max_in_flight,
                reputation_floor: 0.0,
                ..SchedulerConfig::default()
            },
            AdaptiveConfig {
                adaptation_interval: 5,
                min_samples: 5,
                ..AdaptiveConfig::default()
            },
        );
        let peers = peer_ids(&["a", "b", "c"]);
        let mut next_chunk = 0u32;

        for round in rounds {
            let requests: Vec<ChunkRequest> = round
                .iter()
                .map(|_| {
                    next_chunk += 1;
                    ChunkRequest {
                        chunk_index: next_chunk,
                        offset: u64::from(next_chunk) * 1_000,
                        size: 1_000,
                    }
                })
                .collect();

            let assignments = runtime
                .block_on(scheduler.assign_multiple_chunks(&requests, &peers))
                .unwrap();

            let registry = scheduler.inner().registry();
            for peer in &peers {
                prop_assert!(registry.in_flight_count(peer) <= max_in_flight);
            }

            for (assignment, (success, duration, bytes)) in assignments.iter().zip(round) {
                let Some(peer) = &assignment.assigned_peer else {
                    continue;
                };
                let outcome = if success {
                    ChunkOutcome::succeeded(duration, bytes)
                } else {
                    ChunkOutcome::failed(duration)
                };
                metrics.record_chunk_completion(peer, outcome);
                runtime.block_on(scheduler.record_chunk_completion(
                    assignment.chunk_index,
                    peer,
                    success,
                    duration,
                    bytes,
                ));
            }

            let weights = scheduler.weights().as_array();
            prop_assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-6);
            prop_assert!(weights.iter().all(|w| (0.0..=1.0).contains(w)));
        }

        prop_assert!(scheduler.inner().registry().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_never_double_book_or_overfill() {
    let metrics = Arc::new(PeerMetricsCollector::new());
    let scheduler = Arc::new(scheduler_with(
        metrics,
        SchedulerConfig {
            max_in_flight_per_peer: 5,
            ..SchedulerConfig::default()
        },
        AdaptiveConfig::default(),
    ));
    let peers = peer_ids(&["P1", "P2", "P3", "P4"]);

    let mut tasks = Vec::new();
    for batch in 0..8u32 {
        let scheduler = Arc::clone(&scheduler);
        let peers = peers.clone();
        tasks.push(tokio::spawn(async move {
            let requests: Vec<ChunkRequest> = (0..4)
                .map(|i| {
                    let chunk_index = batch * 4 + i;
                    ChunkRequest {
                        chunk_index,
                        offset: u64::from(chunk_index) * 1_000,
                        size: 1_000,
                    }
                })
                .collect();
            scheduler
                .assign_multiple_chunks(&requests, &peers)
                .await
                .unwrap()
        }));
    }

    let mut placed: HashMap<PeerId, usize> = HashMap::new();
    let mut unplaced = 0;
    for task in tasks {
        for assignment in task.await.unwrap() {
            match assignment.assigned_peer {
                Some(peer) => *placed.entry(peer).or_default() += 1,
                None => unplaced += 1,
            }
        }
    }

    // 32 chunks against 4 peers x 5 slots.
    assert_eq!(placed.values().sum::<usize>(), 20);
    assert_eq!(unplaced, 12);
    assert!(placed.values().all(|&count| count == 5));

    let registry = scheduler.inner().registry();
    assert_eq!(registry.len(), 20);
    for peer in &peers {
        assert_eq!(registry.in_flight_count(peer), 5);
        assert_eq!(
            scheduler.inner().outstanding_for(peer).len(),
            registry.chunks_owned_by(peer).len()
        );
    }
}
