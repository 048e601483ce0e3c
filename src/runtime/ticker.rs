//! Periodic timestamp writer.
//!
//! Appends a `timestamp:` line to the packet log on a fixed schedule until
//! shutdown. A failed append skips that tick only.

use crate::log_store::LogStore;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// strftime format of the time part of a timestamp line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// When the ticker fires.
#[derive(Debug, Clone, Copy)]
pub struct TickSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

/// Render one log line for `now`.
pub fn timestamp_line<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("timestamp:{}\n", now.format(TIMESTAMP_FORMAT))
}

/// Run until `shutdown` triggers. Returns the number of lines written.
pub async fn run(store: Arc<LogStore>, shutdown: Shutdown, schedule: TickSchedule) -> u64 {
    let mut interval = interval_at(Instant::now() + schedule.initial_delay, schedule.period);
    // Never fire two ticks closer together than one period
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut written = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = interval.tick() => {
                let line = timestamp_line(&Local::now());
                match store.append(line.as_bytes()) {
                    Ok(()) => {
                        written += 1;
                        debug!(line = line.trim_end(), "Wrote timestamp");
                    }
                    Err(e) => warn!(error = %e, "Failed to write timestamp, skipping tick"),
                }
            }
        }
    }

    debug!(written, "Timestamp ticker stopped");
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn is_timestamp_line(line: &str) -> bool {
        line.strip_prefix("timestamp:")
            .map(|rest| chrono::NaiveDateTime::parse_from_str(rest, TIMESTAMP_FORMAT).is_ok())
            .unwrap_or(false)
    }

    #[test]
    fn test_timestamp_line_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamp_line(&at), "timestamp:2024-03-09 07:05:01\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        let shutdown = Shutdown::new();
        let schedule = TickSchedule {
            initial_delay: Duration::from_secs(10),
            period: Duration::from_secs(10),
        };

        let ticker = tokio::spawn(run(Arc::clone(&store), shutdown.clone(), schedule));

        // Ticks at 10s, 20s and 30s
        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.trigger();
        assert_eq!(ticker.await.unwrap(), 3);

        let contents = String::from_utf8(store.contents().unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| is_timestamp_line(line)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        let shutdown = Shutdown::new();
        let schedule = TickSchedule {
            initial_delay: Duration::from_secs(10),
            period: Duration::from_secs(10),
        };

        let ticker = tokio::spawn(run(Arc::clone(&store), shutdown.clone(), schedule));
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.trigger();

        assert_eq!(ticker.await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.contents().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        let shutdown = Shutdown::new();
        let schedule = TickSchedule {
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(10),
        };

        store.remove().unwrap();
        let ticker = tokio::spawn(run(Arc::clone(&store), shutdown.clone(), schedule));

        // The first tick fails because the log is gone; it reappears before the second.
        tokio::time::sleep(Duration::from_secs(5)).await;
        std::fs::write(store.path(), b"").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        shutdown.trigger();
        assert_eq!(ticker.await.unwrap(), 1);
        assert_eq!(store.contents().unwrap().iter().filter(|&&b| b == b'\n').count(), 1);
    }
}
