//! Background refresh worker.
//!
//! One thread runs [`CatalogService::refresh_now`] every `interval`. The wait
//! between passes is a channel receive with a timeout, so a shutdown request
//! wakes the worker at once instead of after the current sleep.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kp_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::catalog::CatalogService;

/// Owner of the running worker; stops and joins it on drop.
#[derive(Debug)]
pub struct RefreshHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<u64>>,
}

impl RefreshHandle {
    pub(crate) fn spawn(catalog: Arc<CatalogService>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("kplot-refresh".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "refresh worker started");
                let mut passes = 0u64;
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Explicit stop, or the handle was dropped without one.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let report = catalog.refresh_now();
                    passes += 1;
                    if report.has_changes() {
                        debug!(
                            pass = passes,
                            changed = report.changed.len(),
                            records = report.records_appended,
                            "published refresh"
                        );
                    }
                }
                info!(passes, "refresh worker stopped");
                passes
            })
            .map_err(|e| Error::Worker(e.to_string()))?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker and wait for it; returns the passes it completed.
    pub fn shutdown(mut self) -> Result<u64> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<u64> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Worker("refresh worker panicked".to_string())),
            None => Ok(0),
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_join() {
            warn!(error = %err, "refresh worker did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kp_common::SourceId;
    use kp_config::CatalogConfig;
    use std::fs;
    use std::io::Write;
    use std::time::Instant;
    use tempfile::TempDir;

    const LINE: &str = r#"{"step_id":1,"timestamp":0.1,"joint_order":["hip"],"joint_angles":[0.5],"joint_velocities":[0.0]}"#;

    #[test]
    fn test_worker_picks_up_new_sessions() {
        let dir = TempDir::new().expect("tempdir");
        let config =
            CatalogConfig::new(dir.path()).with_refresh_interval(Duration::from_millis(20));
        let catalog = Arc::new(CatalogService::open(config).expect("open"));
        assert!(catalog.list_sources().is_empty());

        let handle = catalog.start().expect("start");
        assert!(handle.is_running());

        let session = dir.path().join("kbot").join("s1");
        fs::create_dir_all(&session).expect("mkdir");
        let mut f = fs::File::create(session.join("kinfer_log.ndjson")).expect("create");
        writeln!(f, "{}", LINE).expect("write");

        let started = Instant::now();
        while catalog.list_sources().is_empty() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(catalog.list_sources(), vec![SourceId::new("kbot")]);
        assert!(handle.shutdown().expect("shutdown") >= 1);
    }

    #[test]
    fn test_shutdown_is_prompt() {
        let dir = TempDir::new().expect("tempdir");
        let config = CatalogConfig::new(dir.path()).with_refresh_interval(Duration::from_secs(60));
        let catalog = Arc::new(CatalogService::open(config).expect("open"));
        let handle = catalog.start().expect("start");

        let started = Instant::now();
        assert_eq!(handle.shutdown().expect("shutdown"), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_drop_stops_worker() {
        let dir = TempDir::new().expect("tempdir");
        let config = CatalogConfig::new(dir.path()).with_refresh_interval(Duration::from_secs(60));
        let catalog = Arc::new(CatalogService::open(config).expect("open"));
        {
            let _handle = catalog.start().expect("start");
        }
        // The worker held the only other reference.
        assert_eq!(Arc::strong_count(&catalog), 1);
    }
}
