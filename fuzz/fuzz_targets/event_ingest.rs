#![no_main]

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use taskmill_core::task::MergeSettings;
use taskmill_core::{Event, EventKind, TaskAggregator};

const TASKS: u8 = 8;

fn kind_for(tag: u8) -> EventKind {
    match tag % 5 {
        0 => EventKind::Start,
        1 => EventKind::Success,
        2 => EventKind::Error,
        3 => EventKind::Info,
        _ => EventKind::Spot,
    }
}

/// Four bytes per event: kind, task, parent (>= TASKS means none), time.
fn event_for(chunk: &[u8]) -> Event {
    let id = format!("t{}", chunk[1] % TASKS);
    let time = Utc
        .timestamp_opt(1_700_000_000 + i64::from(chunk[3]), 0)
        .single()
        .unwrap_or_else(Utc::now);
    let mut event = Event::new(id, kind_for(chunk[0]), time);
    if chunk[0] & 0x80 != 0 {
        event = event.with_name(format!("n{}", chunk[1] % TASKS));
    }
    let parent = chunk[2] % (TASKS * 2);
    if parent < TASKS {
        event = event.with_parent(format!("t{parent}"));
    }
    event
}

fuzz_target!(|data: &[u8]| {
    let mut agg = TaskAggregator::new(MergeSettings::default()).with_default_env("fuzz");

    let events: Vec<Event> = if data.first() == Some(&b'[') {
        serde_json::from_slice(data).unwrap_or_default()
    } else {
        data.chunks_exact(4).map(event_for).collect()
    };

    for event in events {
        let once = agg.ingest(event.clone());
        let twice = agg.ingest(event);
        assert_eq!(once.status, twice.status, "duplicate event changed status");

        if let Some(ms) = twice.duration_ms {
            assert!(ms >= 0);
        }
        if twice.status.is_terminal() {
            assert!(twice.date_to_delete.is_some());
        }
        if twice.orphan {
            assert!(twice.parent_id.is_some());
        }
    }

    let stats = agg.stats();
    assert!(stats.orphans <= stats.resident_tasks);
    let dirty = agg.drain_dirty();
    assert!(dirty.len() <= stats.resident_tasks);
    agg.evict_completed();
});
