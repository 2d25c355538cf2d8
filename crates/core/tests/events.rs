use swarmforge_core::{Event, EventBus, WorkItemId};

#[tokio::test]
async fn publish_with_no_subscribers_is_not_an_error() {
    let bus = EventBus::new(16);
    bus.publish(Event::Initialized);
}

#[tokio::test]
async fn subscribers_receive_published_events_in_order() {
    let bus = EventBus::new(16);
    let mut rx1 = bus.subscribe();
    let mut rx2 = bus.subscribe();

    bus.publish(Event::WorkAdded {
        item_id: WorkItemId(1),
    });
    bus.publish(Event::WorkCompleted {
        item_id: WorkItemId(1),
    });

    for rx in [&mut rx1, &mut rx2] {
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::WorkAdded { item_id } if item_id == WorkItemId(1)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::WorkCompleted { item_id } if item_id == WorkItemId(1)));
    }
}
