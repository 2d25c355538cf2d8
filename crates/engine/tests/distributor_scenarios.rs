//! End-to-end distributor scenarios against the in-process fake spawner,
//! covering the orchestrator's testable end-to-end properties.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use support::{FakeOutcome, FakeSpawner};
use swarmforge_core::{Complexity, Event, EventBus, Payload, WorkItem, WorkItemId, WorkKind};
use swarmforge_engine::{ContextStore, Distributor, DistributorConfig, PoolConfig, WorkerPool};
use swarmforge_governor::{RateGovernor, RateLimitConfig};

fn item(id: u64, deps: Vec<WorkItemId>) -> WorkItem {
    WorkItem {
        id: WorkItemId(id),
        kind: WorkKind::Task,
        parent: None,
        depends_on: deps,
        priority: 1,
        complexity: Complexity::Low,
        estimated_duration: None,
        input: Payload::default(),
        context: None,
        retries: 0,
        max_retries: 3,
        timeout: Duration::from_secs(5),
    }
}

fn wire_distributor(spawner: FakeSpawner) -> (Arc<Distributor>, Arc<EventBus>) {
    let events = Arc::new(EventBus::default());
    let pool = Arc::new(WorkerPool::new(PoolConfig::default(), Arc::new(spawner), events.clone()));
    let governor = Arc::new(RateGovernor::new(events.clone()));
    let context_store = Arc::new(ContextStore::new());
    let distributor = Arc::new(Distributor::new(
        DistributorConfig::default(),
        pool,
        governor,
        context_store,
        events.clone(),
    ));
    (distributor, events)
}

/// S1 — a linear chain of three must complete strictly in dependency order.
#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let (distributor, events) = wire_distributor(FakeSpawner::always_succeed());
    let mut rx = events.subscribe();

    let (a, b, c) = (WorkItemId(1), WorkItemId(2), WorkItemId(3));
    distributor
        .submit(vec![item(1, vec![]), item(2, vec![a]), item(3, vec![b])])
        .await;
    distributor.start();

    let mut order = Vec::new();
    while order.len() < 3 {
        if let Ok(Event::WorkCompleted { item_id }) = rx.recv().await {
            order.push(item_id);
        }
    }
    distributor.stop().await;

    assert_eq!(order, vec![a, b, c]);

    let metrics = distributor.metrics().await;
    assert_eq!(metrics.completed, 3);
    assert_eq!(metrics.failed, 0);
    assert_eq!(metrics.distributed, 3);
}

/// S3 — an item failing its first two attempts and succeeding on the third
/// must retry exactly twice and end up completed, not permanently failed.
#[tokio::test]
async fn item_retries_twice_then_succeeds() {
    let (distributor, events) = wire_distributor(FakeSpawner::new(|_, attempt| {
        if attempt < 3 {
            FakeOutcome::Failure("simulated failure".to_string())
        } else {
            FakeOutcome::Success(Payload::default())
        }
    }));
    let mut rx = events.subscribe();

    let x = WorkItemId(1);
    distributor.submit(vec![item(1, vec![])]).await;
    distributor.start();

    let mut retries = 0;
    let outcome = loop {
        match rx.recv().await.unwrap() {
            Event::WorkRetry { item_id, .. } if item_id == x => retries += 1,
            Event::WorkCompleted { item_id } if item_id == x => break "completed",
            Event::WorkFailed { item_id, .. } if item_id == x => break "failed",
            _ => {}
        }
    };
    distributor.stop().await;

    assert_eq!(outcome, "completed");
    assert_eq!(retries, 2);
}

/// A permanently-failed item must abandon its pending descendants.
#[tokio::test]
async fn permanent_failure_abandons_descendants() {
    let (distributor, events) = wire_distributor(FakeSpawner::new(|_, _| {
        FakeOutcome::Failure("always fails".to_string())
    }));
    let mut rx = events.subscribe();

    let (a, b) = (WorkItemId(1), WorkItemId(2));
    let mut a_item = item(1, vec![]);
    a_item.max_retries = 0;
    distributor.submit(vec![a_item, item(2, vec![a])]).await;
    distributor.start();

    let mut failed = std::collections::HashSet::new();
    while failed.len() < 2 {
        if let Ok(Event::WorkFailed { item_id, .. }) = rx.recv().await {
            failed.insert(item_id);
        }
    }
    distributor.stop().await;

    assert!(failed.contains(&a));
    assert!(failed.contains(&b));
}

/// S2 — fanning out twenty independent items against a five-worker ceiling
/// must never let more than five run concurrently, and all twenty must
/// still complete.
#[tokio::test(start_paused = true)]
async fn fan_out_of_twenty_respects_max_workers_cap() {
    let events = Arc::new(EventBus::default());
    let spawner = FakeSpawner::always_succeed().with_delay(Duration::from_millis(200));
    let pool = Arc::new(WorkerPool::new(
        PoolConfig { max_workers: 5, ..PoolConfig::default() },
        Arc::new(spawner),
        events.clone(),
    ));
    let governor = Arc::new(RateGovernor::new(events.clone()));
    // A generous limit so the worker count, not the rate limiter, is the
    // thing capping concurrency in this scenario.
    governor
        .configure(
            "primary-ai",
            RateLimitConfig {
                requests_per_window: 1000,
                window: Duration::from_millis(1),
                burst_allowance: 1000.0,
                max_concurrent: 20,
                ..RateLimitConfig::default()
            },
        )
        .await
        .unwrap();
    let context_store = Arc::new(ContextStore::new());
    let distributor = Arc::new(Distributor::new(
        DistributorConfig { dispatch_batch: 20, ..DistributorConfig::default() },
        pool.clone(),
        governor,
        context_store,
        events.clone(),
    ));
    let mut rx = events.subscribe();

    let items: Vec<WorkItem> = (1..=20).map(|i| item(i, vec![])).collect();
    distributor.submit(items).await;
    distributor.start();

    let mut completed = HashSet::new();
    let mut peak_busy = 0usize;
    for _ in 0..500 {
        if completed.len() == 20 {
            break;
        }
        tokio::time::advance(Duration::from_millis(20)).await;
        let stats = pool.stats().await;
        peak_busy = peak_busy.max(stats.busy);
        while let Ok(event) = rx.try_recv() {
            if let Event::WorkCompleted { item_id } = event {
                completed.insert(item_id);
            }
        }
    }
    distributor.stop().await;

    assert_eq!(completed.len(), 20, "all twenty items must complete");
    assert!(peak_busy <= 5, "never more than max_workers busy at once, saw {peak_busy}");
}

/// S4 — saturating a service's rate limit defers dispatch rather than
/// failing it; admission resumes once the window recovers.
#[tokio::test(start_paused = true)]
async fn rate_limit_saturation_defers_dispatch_until_window_recovers() {
    let events = Arc::new(EventBus::default());
    let pool = Arc::new(WorkerPool::new(
        PoolConfig::default(),
        Arc::new(FakeSpawner::always_succeed()),
        events.clone(),
    ));
    let governor = Arc::new(RateGovernor::new(events.clone()));
    governor
        .configure(
            "primary-ai",
            RateLimitConfig {
                requests_per_window: 6,
                window: Duration::from_secs(60),
                burst_allowance: 1.0,
                max_concurrent: 20,
                ..RateLimitConfig::default()
            },
        )
        .await
        .unwrap();
    let context_store = Arc::new(ContextStore::new());
    let distributor = Arc::new(Distributor::new(
        DistributorConfig { dispatch_batch: 20, ..DistributorConfig::default() },
        pool,
        governor,
        context_store,
        events.clone(),
    ));
    let mut rx = events.subscribe();

    let items: Vec<WorkItem> = (1..=12).map(|i| item(i, vec![])).collect();
    distributor.submit(items).await;
    distributor.start();

    let mut completed = HashSet::new();
    for _ in 0..400 {
        if completed.len() == 12 {
            break;
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::WorkCompleted { item_id } => {
                    completed.insert(item_id);
                }
                Event::WorkFailed { item_id, .. } => {
                    panic!("item {item_id} failed; rate limiting must defer, never fail");
                }
                _ => {}
            }
        }
    }
    distributor.stop().await;

    assert_eq!(
        completed.len(),
        12,
        "every item must eventually dispatch once the rate limit window recovers"
    );
}

/// S5 — recycling a single worker mid-stream must not lose or fail any
/// in-flight item; with context preservation on, the replacement keeps
/// serving the rest of the batch.
#[tokio::test]
async fn recycle_mid_stream_preserves_all_items() {
    let events = Arc::new(EventBus::default());
    let pool = Arc::new(WorkerPool::new(
        PoolConfig {
            max_workers: 1,
            recycle_threshold: 3,
            preserve_context: true,
            ..PoolConfig::default()
        },
        Arc::new(FakeSpawner::always_succeed()),
        events.clone(),
    ));
    let governor = Arc::new(RateGovernor::new(events.clone()));
    // This scenario is about recycling, not rate limiting; keep the
    // default limiter out of the way so items dispatch as fast as the
    // single worker allows.
    governor
        .configure(
            "primary-ai",
            RateLimitConfig {
                requests_per_window: 1000,
                window: Duration::from_millis(1),
                burst_allowance: 1000.0,
                max_concurrent: 20,
                ..RateLimitConfig::default()
            },
        )
        .await
        .unwrap();
    let context_store = Arc::new(ContextStore::new());
    let distributor = Arc::new(Distributor::new(
        DistributorConfig::default(),
        pool,
        governor,
        context_store,
        events.clone(),
    ));
    let mut rx = events.subscribe();

    let items: Vec<WorkItem> = (1..=7).map(|i| item(i, vec![])).collect();
    distributor.submit(items).await;
    distributor.start();

    let mut completed = HashSet::new();
    let mut recycles = 0u32;
    while completed.len() < 7 {
        match rx.recv().await.unwrap() {
            Event::WorkCompleted { item_id } => {
                completed.insert(item_id);
            }
            Event::WorkFailed { item_id, .. } => panic!("item {item_id} failed during recycle"),
            Event::InstanceRecycled { .. } => recycles += 1,
            _ => {}
        }
    }
    distributor.stop().await;

    assert_eq!(completed.len(), 7, "all seven items must complete across the recycle");
    assert!(recycles >= 2, "a threshold of 3 over 7 items must recycle at least twice, saw {recycles}");
}
