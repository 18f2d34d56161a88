//! Custom test assertions for end-to-end tests

use std::path::Path;

use depot_sync::Event;

/// Drain every event already buffered on `rx`
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Number of `FileComplete` events
pub fn completed_files(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::FileComplete { .. }))
        .count()
}

/// Assert that `root/relative` holds exactly `expected`
pub fn assert_file_contents(root: &Path, relative: &str, expected: &[u8]) {
    let path = root.join(relative);
    let actual = std::fs::read(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
    assert_eq!(actual, expected, "unexpected contents in {}", path.display());
}
