//! Centralised logging metadata (event names, shared keys, etc.).

/// Canonical event names used across the service.
pub mod events {
    /// Document conversion lifecycle.
    pub const DOCUMENT_RECEIVED: &str = "document.received";
    pub const DOCUMENT_CONVERTED: &str = "document.converted";
    pub const DOCUMENT_REJECTED: &str = "document.rejected";
    pub const DOCUMENT_RETRY_SCHEDULED: &str = "document.retry_scheduled";
    pub const DOCUMENT_DEAD_LETTERED: &str = "document.dead_lettered";
    pub const DOCUMENT_MALFORMED: &str = "document.malformed";

    /// External collaborators.
    pub const STORAGE_FAILED: &str = "storage.failed";
    pub const CONVERTER_CALL: &str = "converter.call";
    pub const CONVERTER_FAILED: &str = "converter.failed";
    pub const CONVERTER_PASSTHROUGH: &str = "converter.passthrough";
    pub const STATUS_REPORTED: &str = "status.reported";
    pub const STATUS_REPORT_FAILED: &str = "status.report_failed";

    /// Queue and worker loop.
    pub const QUEUE_ENQUEUE: &str = "queue.enqueue";
    pub const QUEUE_DEQUEUE: &str = "queue.dequeue";
    pub const QUEUE_REDELIVER: &str = "queue.redeliver";
    pub const QUEUE_DEAD_LETTER: &str = "queue.dead_letter";
    pub const QUEUE_ERROR: &str = "queue.error";
    pub const WORKER_START: &str = "worker.start";
    pub const WORKER_STOP: &str = "worker.stop";
    pub const WORKER_PANIC: &str = "worker.panic";
    pub const WORKER_SIGNAL: &str = "worker.signal";
    pub const WORKER_SHUTDOWN_BEGIN: &str = "worker.shutdown_begin";

    /// All event names, for uniqueness checks.
    pub const ALL: &[&str] = &[
        DOCUMENT_RECEIVED,
        DOCUMENT_CONVERTED,
        DOCUMENT_REJECTED,
        DOCUMENT_RETRY_SCHEDULED,
        DOCUMENT_DEAD_LETTERED,
        DOCUMENT_MALFORMED,
        STORAGE_FAILED,
        CONVERTER_CALL,
        CONVERTER_FAILED,
        CONVERTER_PASSTHROUGH,
        STATUS_REPORTED,
        STATUS_REPORT_FAILED,
        QUEUE_ENQUEUE,
        QUEUE_DEQUEUE,
        QUEUE_REDELIVER,
        QUEUE_DEAD_LETTER,
        QUEUE_ERROR,
        WORKER_START,
        WORKER_STOP,
        WORKER_PANIC,
        WORKER_SIGNAL,
        WORKER_SHUTDOWN_BEGIN,
    ];
}

#[cfg(test)]
mod tests {
    use super::events;
    use std::collections::HashSet;

    #[test]
    fn test_event_names_are_unique_and_namespaced() {
        let unique: HashSet<_> = events::ALL.iter().collect();
        assert_eq!(unique.len(), events::ALL.len());
        for name in events::ALL {
            let (area, action) = name.split_once('.').unwrap();
            assert!(!area.is_empty() && !action.is_empty(), "{}", name);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '.' || c == '_'));
        }
    }
}
