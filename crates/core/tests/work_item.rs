use std::time::Duration;

use swarmforge_core::{Complexity, Payload, WorkItemId, WorkKind};
use swarmforge_core::work_item::WorkItemBuilder;

#[test]
fn complexity_default_timeouts_match_spec() {
    assert_eq!(Complexity::Low.default_timeout(), Duration::from_secs(30));
    assert_eq!(Complexity::Medium.default_timeout(), Duration::from_secs(60));
    assert_eq!(Complexity::High.default_timeout(), Duration::from_secs(120));
    assert_eq!(
        Complexity::Critical.default_timeout(),
        Duration::from_secs(180)
    );
}

#[test]
fn complexity_rank_orders_critical_first() {
    let mut ranks = vec![
        Complexity::Low.rank(),
        Complexity::Critical.rank(),
        Complexity::Medium.rank(),
        Complexity::High.rank(),
    ];
    ranks.sort();
    assert_eq!(
        ranks,
        vec![
            Complexity::Critical.rank(),
            Complexity::High.rank(),
            Complexity::Medium.rank(),
            Complexity::Low.rank(),
        ]
    );
}

#[test]
fn dispatch_timeout_prefers_estimate_with_1_5x_multiplier() {
    let item = WorkItemBuilder::new(WorkItemId(1), WorkKind::Task, Payload::default(), 3)
        .complexity(Complexity::Low)
        .estimated_duration(Duration::from_secs(10))
        .build();
    assert_eq!(item.dispatch_timeout(), Duration::from_secs(15));
}

#[test]
fn dispatch_timeout_falls_back_to_complexity_default() {
    let item = WorkItemBuilder::new(WorkItemId(1), WorkKind::Task, Payload::default(), 3)
        .complexity(Complexity::High)
        .build();
    assert_eq!(item.dispatch_timeout(), Duration::from_secs(120));
}

#[test]
fn boost_priority_floors_at_one() {
    let mut item = WorkItemBuilder::new(WorkItemId(1), WorkKind::Task, Payload::default(), 3)
        .priority(1)
        .build();
    item.boost_priority();
    assert_eq!(item.priority, 1);

    item.priority = 5;
    item.boost_priority();
    assert_eq!(item.priority, 4);
}
