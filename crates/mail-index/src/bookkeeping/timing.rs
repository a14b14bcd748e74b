//! Staleness checks for folder syncs
//!
//! Pure functions that can be tested without a database.

use chrono::{DateTime, Duration, Utc};

/// Check if enough time has elapsed since the last sync to allow a new one.
///
/// # Arguments
/// * `last_synced_at` - When the last reconciliation completed (None if never)
/// * `span` - Minimum time that must elapse between reconciliations
///
/// # Returns
/// `true` if the span has passed (or the folder was never synced)
pub fn staleness_elapsed(last_synced_at: Option<DateTime<Utc>>, span: Duration) -> bool {
    match last_synced_at {
        Some(last) => Utc::now() - last >= span,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_synced_is_stale() {
        assert!(staleness_elapsed(None, Duration::seconds(30)));
        assert!(staleness_elapsed(None, Duration::zero()));
        assert!(staleness_elapsed(None, Duration::hours(1)));
    }

    #[test]
    fn test_recent_sync_is_fresh() {
        let last = Utc::now() - Duration::seconds(10);
        assert!(!staleness_elapsed(Some(last), Duration::seconds(30)));
    }

    #[test]
    fn test_old_sync_is_stale() {
        let last = Utc::now() - Duration::seconds(60);
        assert!(staleness_elapsed(Some(last), Duration::seconds(30)));

        let last = Utc::now() - Duration::seconds(30);
        assert!(staleness_elapsed(Some(last), Duration::seconds(30)));
    }

    #[test]
    fn test_zero_span_is_always_stale() {
        assert!(staleness_elapsed(Some(Utc::now()), Duration::zero()));
    }
}
