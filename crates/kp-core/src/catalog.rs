//! Query façade over the session index.
//!
//! Queries never touch the filesystem and never wait on a refresh pass: they
//! load the most recently published [`CatalogSnapshot`] through an
//! [`ArcSwap`] and answer from it. Only [`CatalogService::refresh_now`] (and
//! the background worker, which calls it) takes the index lock.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use kp_common::{Error, Result, SessionId, SessionKey, SourceId};
use kp_config::CatalogConfig;
use kp_telemetry::{
    collect_named_series, Deadline, IndexedRecord, QueryRange, SeriesPoints, SeriesSlice,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::index::{CatalogSnapshot, RefreshReport, SessionIndex, SessionSnapshot, SessionStatus};
use crate::refresh::RefreshHandle;

/// Passes `open` will run to drain logs larger than one poll budget.
const MAX_CATCH_UP_PASSES: usize = 64;

/// Listing entry for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: SessionId,
    pub label: String,
    pub record_count: usize,
    /// Log modification time.
    pub last_update_time: Option<DateTime<Utc>>,
    pub is_live: bool,
    pub status: SessionStatus,
    pub parse_errors: u64,
    pub segment_count: usize,
    /// `(first, last)` retained step ids.
    pub step_span: Option<(i64, i64)>,
    /// Records dropped by the store capacity.
    pub evicted: u64,
}

/// Series query result.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesResponse {
    pub source: SourceId,
    pub session: SessionId,
    pub label: String,
    pub status: SessionStatus,
    pub is_live: bool,
    #[serde(flatten)]
    pub slice: SeriesSlice,
}

/// Named-series query result.
#[derive(Debug, Clone, Serialize)]
pub struct NamedSeriesResponse {
    pub source: SourceId,
    pub session: SessionId,
    pub label: String,
    pub step_offset: i64,
    pub stride: u64,
    pub series: BTreeMap<String, SeriesPoints>,
}

/// One run in a multi-session overlay: which session, shifted by how many steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRun {
    pub source: SourceId,
    pub session: SessionId,
    pub step_offset: i64,
}

impl OverlayRun {
    pub fn new(
        source: impl Into<SourceId>,
        session: impl Into<SessionId>,
        step_offset: i64,
    ) -> Self {
        Self {
            source: source.into(),
            session: session.into(),
            step_offset,
        }
    }
}

/// Several sessions flattened onto one step axis.
///
/// `series` is the sorted union of series names across runs. Every entry of
/// `series_data` holds one point set per run, in run order; a run without
/// that series contributes an empty set.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayResponse {
    pub labels: Vec<String>,
    pub step_offsets: Vec<i64>,
    pub series: Vec<String>,
    pub series_data: BTreeMap<String, Vec<SeriesPoints>>,
}

/// One session matched by [`CatalogService::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionMatch {
    pub source: SourceId,
    pub session: SessionId,
    pub label: String,
    pub modified: Option<DateTime<Utc>>,
}

/// The most recently written session across every source.
#[derive(Debug, Clone, Serialize)]
pub struct LatestInfo {
    pub source: SourceId,
    pub session: SessionId,
    pub label: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
}

fn mtime_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Telemetry catalog: one index, one published snapshot.
pub struct CatalogService {
    config: CatalogConfig,
    index: Mutex<SessionIndex>,
    current: ArcSwap<CatalogSnapshot>,
}

impl std::fmt::Debug for CatalogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogService")
            .field("data_dir", &self.config.data_dir)
            .field("generation", &self.current.load().generation)
            .finish()
    }
}

impl CatalogService {
    /// Build the catalog and run the initial scan.
    ///
    /// Logs bigger than one poll budget are drained over extra passes so
    /// the first snapshot is complete.
    pub fn open(config: CatalogConfig) -> Result<Self> {
        kp_config::validate::validate(&config).map_err(|e| Error::Config(e.to_string()))?;
        info!(
            data_dir = %config.data_dir.display(),
            refresh_interval_ms = config.refresh_interval_ms,
            "opening telemetry catalog"
        );
        let service = Self {
            index: Mutex::new(SessionIndex::new(config.clone())),
            current: ArcSwap::from_pointee(CatalogSnapshot::default()),
            config,
        };
        for _ in 0..MAX_CATCH_UP_PASSES {
            if service.refresh_now().backlogged == 0 {
                break;
            }
        }
        Ok(service)
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Run one refresh pass synchronously and publish its snapshot.
    pub fn refresh_now(&self) -> RefreshReport {
        let mut index = self.index.lock();
        let report = index.refresh();
        if report.has_changes() || self.current.load().refreshed_at.is_none() {
            self.current.store(Arc::new(index.snapshot()));
        }
        report
    }

    /// Start the background refresh worker.
    pub fn start(self: &Arc<Self>) -> Result<RefreshHandle> {
        RefreshHandle::spawn(Arc::clone(self), self.config.refresh_interval())
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.query_timeout())
    }

    fn is_live(&self, session: &SessionSnapshot, now: SystemTime) -> bool {
        session.status != SessionStatus::Gone
            && session.is_live(now, self.config.recency_window())
    }

    /// Sources with at least one visible session, sorted.
    pub fn list_sources(&self) -> Vec<SourceId> {
        self.current.load().sources()
    }

    /// Visible sessions of `source`, newest first.
    pub fn list_sessions(&self, source: &SourceId) -> Result<Vec<SessionSummary>> {
        let snap = self.current.load();
        let sessions = snap.visible_sessions(source);
        if sessions.is_empty() {
            return Err(Error::SourceNotFound {
                source_id: source.to_string(),
            });
        }
        let now = SystemTime::now();
        Ok(sessions
            .iter()
            .map(|s| SessionSummary {
                session: s.key.session.clone(),
                label: s.key.label(),
                record_count: s.store.len(),
                last_update_time: s.log_modified.map(DateTime::<Utc>::from),
                is_live: self.is_live(s, now),
                status: s.status,
                parse_errors: s.parse_errors,
                segment_count: s.store.segment_count(),
                step_span: s.store.step_span(),
                evicted: s.store.evicted(),
            })
            .collect())
    }

    fn find_session(
        &self,
        source: &SourceId,
        session: &SessionId,
    ) -> Result<Arc<SessionSnapshot>> {
        let snap = self.current.load();
        let key = SessionKey {
            source: source.clone(),
            session: session.clone(),
        };
        if let Some(found) = snap.session(&key) {
            return Ok(Arc::clone(found));
        }
        if snap.knows_source(source) {
            Err(Error::SessionNotFound {
                source_id: source.to_string(),
                session_id: session.to_string(),
            })
        } else {
            Err(Error::SourceNotFound {
                source_id: source.to_string(),
            })
        }
    }

    fn respond(
        &self,
        session: &SessionSnapshot,
        range: QueryRange,
        max_points: usize,
    ) -> Result<SeriesResponse> {
        let deadline = self.deadline();
        let slice = session.store.query(range, max_points, Some(&deadline))?;
        debug!(
            source = %session.key.source,
            session = %session.key.session,
            returned = slice.records.len(),
            span = slice.span_len,
            stride = slice.stride,
            "series query"
        );
        Ok(SeriesResponse {
            source: session.key.source.clone(),
            session: session.key.session.clone(),
            label: session.key.label(),
            status: session.status,
            is_live: self.is_live(session, SystemTime::now()),
            slice,
        })
    }

    /// Decimated records of one session.
    ///
    /// Gone sessions remain queryable by name; they are only hidden from
    /// listings.
    pub fn get_series(
        &self,
        source: &SourceId,
        session: &SessionId,
        range: QueryRange,
        max_points: usize,
    ) -> Result<SeriesResponse> {
        let found = self.find_session(source, session)?;
        self.respond(&found, range, max_points)
    }

    /// Like [`get_series`](Self::get_series) on the source's latest session,
    /// resolved against the current snapshot on every call.
    pub fn get_latest(
        &self,
        source: &SourceId,
        range: QueryRange,
        max_points: usize,
    ) -> Result<SeriesResponse> {
        let latest = self.latest_session(source)?;
        self.respond(&latest, range, max_points)
    }

    /// Resolve the source's latest visible session in the current snapshot.
    fn latest_session(&self, source: &SourceId) -> Result<Arc<SessionSnapshot>> {
        let snap = self.current.load();
        match snap.latest(source) {
            Some(latest) => Ok(latest),
            None if snap.knows_source(source) => Err(Error::NoSessions {
                source_id: source.to_string(),
            }),
            None => Err(Error::SourceNotFound {
                source_id: source.to_string(),
            }),
        }
    }

    /// Records of one session flattened into named series.
    pub fn named_series(
        &self,
        source: &SourceId,
        session: &SessionId,
        range: QueryRange,
        max_points: usize,
        step_offset: i64,
    ) -> Result<NamedSeriesResponse> {
        let found = self.find_session(source, session)?;
        let response = self.respond(&found, range, max_points)?;
        Ok(NamedSeriesResponse {
            series: collect_named_series(&response.slice.records, step_offset),
            source: response.source,
            session: response.session,
            label: response.label,
            step_offset,
            stride: response.slice.stride,
        })
    }

    /// Flatten several sessions, each with its own step offset, into aligned
    /// named series.
    ///
    /// Fails on the first run that does not resolve; `range` and
    /// `max_points` apply to every run.
    pub fn named_series_multi(
        &self,
        runs: &[OverlayRun],
        range: QueryRange,
        max_points: usize,
    ) -> Result<OverlayResponse> {
        let mut labels = Vec::with_capacity(runs.len());
        let mut per_run = Vec::with_capacity(runs.len());
        for run in runs {
            let named =
                self.named_series(&run.source, &run.session, range, max_points, run.step_offset)?;
            labels.push(named.label);
            per_run.push(named.series);
        }

        let names: BTreeSet<&String> = per_run.iter().flat_map(|s| s.keys()).collect();
        let series: Vec<String> = names.into_iter().cloned().collect();
        let series_data = series
            .iter()
            .map(|name| {
                let points = per_run
                    .iter()
                    .map(|run| run.get(name).cloned().unwrap_or_default())
                    .collect();
                (name.clone(), points)
            })
            .collect();
        debug!(runs = runs.len(), series = series.len(), "overlay query");

        Ok(OverlayResponse {
            labels,
            step_offsets: runs.iter().map(|r| r.step_offset).collect(),
            series,
            series_data,
        })
    }

    /// Visible sessions whose label contains `query` (case-insensitive),
    /// most recently written first.
    pub fn search(&self, query: &str) -> Vec<SessionMatch> {
        let needle = query.trim().to_lowercase();
        let snap = self.current.load();
        let mut hits: Vec<&Arc<SessionSnapshot>> = snap
            .visible()
            .filter(|s| s.key.label().to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| {
            b.log_modified
                .cmp(&a.log_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.into_iter()
            .map(|s| SessionMatch {
                source: s.key.source.clone(),
                session: s.key.session.clone(),
                label: s.key.label(),
                modified: s.log_modified.map(DateTime::<Utc>::from),
            })
            .collect()
    }

    /// The visible session whose log was modified most recently.
    pub fn latest_overall(&self) -> Option<LatestInfo> {
        let snap = self.current.load();
        snap.visible()
            .filter_map(|s| s.log_modified.map(|m| (m, s)))
            .max_by(|(ma, a), (mb, b)| ma.cmp(mb).then_with(|| b.key.cmp(&a.key)))
            .map(|(modified, s)| LatestInfo {
                source: s.key.source.clone(),
                session: s.key.session.clone(),
                label: s.key.label(),
                path: s.log_path.clone(),
                modified: DateTime::<Utc>::from(modified),
                mtime: mtime_secs(modified),
            })
    }

    /// The last `n` records of the source's latest session.
    pub fn tail_latest(
        &self,
        source: &SourceId,
        n: usize,
    ) -> Result<(SessionKey, Vec<IndexedRecord>)> {
        let latest = self.latest_session(source)?;
        Ok((latest.key.clone(), latest.store.latest_n(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn line(step: i64) -> String {
        format!(
            "{{\"step_id\":{},\"timestamp\":{},\"joint_order\":[\"hip\"],\"joint_angles\":[{}],\"joint_velocities\":[0.0],\"joint_torques\":[1.5]}}\n",
            step,
            step as f64 * 0.02,
            step
        )
    }

    fn write_session(
        root: &std::path::Path,
        source: &str,
        session: &str,
        steps: std::ops::Range<i64>,
    ) {
        let dir = root.join(source).join(session);
        fs::create_dir_all(&dir).expect("mkdir");
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("kinfer_log.ndjson"))
            .expect("open");
        for step in steps {
            f.write_all(line(step).as_bytes()).expect("write");
        }
    }

    fn open(root: &std::path::Path) -> CatalogService {
        CatalogService::open(CatalogConfig::new(root)).expect("open")
    }

    #[test]
    fn test_list_and_query() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "session_20251013_110106", 0..10);
        write_session(dir.path(), "kbot", "session_20251013_120000", 0..4);
        write_session(dir.path(), "zbot", "run", 0..1);
        let catalog = open(dir.path());

        assert_eq!(
            catalog.list_sources(),
            vec![SourceId::new("kbot"), SourceId::new("zbot")]
        );
        let sessions = catalog.list_sessions(&SourceId::new("kbot")).expect("sessions");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session.as_str(), "session_20251013_120000");
        assert_eq!(sessions[1].record_count, 10);
        assert!(sessions[0].is_live);

        let resp = catalog
            .get_series(
                &SourceId::new("kbot"),
                &SessionId::new("session_20251013_110106"),
                QueryRange::index(2, 5),
                100,
            )
            .expect("series");
        let steps: Vec<i64> = resp.slice.records.iter().map(|r| r.record.step_id).collect();
        assert_eq!(steps, vec![2, 3, 4]);

        let latest = catalog
            .get_latest(&SourceId::new("kbot"), QueryRange::All, 100)
            .expect("latest");
        assert_eq!(latest.session.as_str(), "session_20251013_120000");
        assert_eq!(latest.slice.records.len(), 4);
    }

    #[test]
    fn test_not_found_errors_are_explicit() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 0..3);
        let catalog = open(dir.path());

        let err = catalog.list_sessions(&SourceId::new("nope")).expect_err("missing");
        assert!(matches!(err, Error::SourceNotFound { .. }));
        let err = catalog
            .get_series(&SourceId::new("kbot"), &SessionId::new("s9"), QueryRange::All, 10)
            .expect_err("missing");
        assert!(matches!(err, Error::SessionNotFound { .. }));
        let err = catalog
            .get_latest(&SourceId::new("nope"), QueryRange::All, 10)
            .expect_err("missing");
        assert!(matches!(err, Error::SourceNotFound { .. }));
        let err = catalog
            .get_series(&SourceId::new("kbot"), &SessionId::new("s1"), QueryRange::index(3, 1), 10)
            .expect_err("bad range");
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[test]
    fn test_named_series_with_offset() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 100..103);
        let catalog = open(dir.path());
        let named = catalog
            .named_series(&SourceId::new("kbot"), &SessionId::new("s1"), QueryRange::All, 100, -100)
            .expect("named");
        assert_eq!(named.series["joint_angles.hip"].x, vec![0, 1, 2]);
        assert_eq!(named.series["joint_angles.hip"].y, vec![100.0, 101.0, 102.0]);
        assert_eq!(named.series["joint_torques.hip"].y, vec![1.5, 1.5, 1.5]);
    }

    #[test]
    fn test_overlay_unions_series_across_runs() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 100..103);
        let other = dir.path().join("zbot").join("s2");
        fs::create_dir_all(&other).expect("mkdir");
        fs::write(
            other.join("kinfer_log.ndjson"),
            "{\"step_id\":5,\"timestamp\":0.0,\"joint_order\":[\"hip\"],\"joint_angles\":[7.0],\"joint_velocities\":[0.0],\"imu\":[9.8]}\n",
        )
        .expect("write");
        let catalog = open(dir.path());

        let overlay = catalog
            .named_series_multi(
                &[OverlayRun::new("kbot", "s1", -100), OverlayRun::new("zbot", "s2", 0)],
                QueryRange::All,
                100,
            )
            .expect("overlay");
        assert_eq!(overlay.labels, vec!["kbot | s1", "zbot | s2"]);
        assert_eq!(overlay.step_offsets, vec![-100, 0]);
        let mut sorted = overlay.series.clone();
        sorted.sort();
        assert_eq!(overlay.series, sorted);
        assert!(overlay.series.contains(&"imu[0]".to_string()));
        assert!(overlay.series.contains(&"joint_torques.hip".to_string()));

        let angles = &overlay.series_data["joint_angles.hip"];
        assert_eq!(angles.len(), 2);
        assert_eq!(angles[0].x, vec![0, 1, 2]);
        assert_eq!(angles[1].x, vec![5]);
        assert_eq!(angles[1].y, vec![7.0]);

        let imu = &overlay.series_data["imu[0]"];
        assert!(imu[0].x.is_empty() && imu[0].y.is_empty());
        assert_eq!(imu[1].y, vec![9.8]);
        let torques = &overlay.series_data["joint_torques.hip"];
        assert_eq!(torques[0].y, vec![1.5, 1.5, 1.5]);
        assert!(torques[1].x.is_empty());
    }

    #[test]
    fn test_overlay_reports_missing_run() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 0..2);
        let catalog = open(dir.path());
        let err = catalog
            .named_series_multi(
                &[OverlayRun::new("kbot", "s1", 0), OverlayRun::new("kbot", "nope", 0)],
                QueryRange::All,
                100,
            )
            .expect_err("missing run");
        assert!(matches!(err, Error::SessionNotFound { .. }));
        let empty = catalog
            .named_series_multi(&[], QueryRange::All, 100)
            .expect("no runs");
        assert!(empty.series.is_empty() && empty.labels.is_empty());
    }

    #[test]
    fn test_tail_latest_matches_get_latest_errors() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 0..5);
        let catalog = open(dir.path());
        let (key, records) = catalog.tail_latest(&SourceId::new("kbot"), 2).expect("tail");
        assert_eq!(key, SessionKey::new("kbot", "s1"));
        let steps: Vec<i64> = records.iter().map(|r| r.record.step_id).collect();
        assert_eq!(steps, vec![3, 4]);

        fs::remove_dir_all(dir.path().join("kbot").join("s1")).expect("rm");
        catalog.refresh_now();
        let source = SourceId::new("kbot");
        assert!(matches!(
            catalog.get_latest(&source, QueryRange::All, 10),
            Err(Error::NoSessions { .. })
        ));
        assert!(matches!(catalog.tail_latest(&source, 2), Err(Error::NoSessions { .. })));
        assert!(matches!(
            catalog.tail_latest(&SourceId::new("nope"), 2),
            Err(Error::SourceNotFound { .. })
        ));
    }

    #[test]
    fn test_search_and_latest_overall() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "KBot-01", "walk_test", 0..2);
        write_session(dir.path(), "zbot", "stand", 0..2);
        let catalog = open(dir.path());

        let hits = catalog.search("kbot");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "KBot-01 | walk_test");
        assert_eq!(catalog.search("").len(), 2);
        assert!(catalog.search("nothing").is_empty());

        let info = catalog.latest_overall().expect("latest");
        assert!(info.path.ends_with("kinfer_log.ndjson"));
        assert!(info.mtime > 0.0);
    }

    #[test]
    fn test_queries_see_only_published_passes() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 0..3);
        let catalog = open(dir.path());
        let before = catalog.snapshot();

        write_session(dir.path(), "kbot", "s1", 3..5);
        let key = SessionKey::new("kbot", "s1");
        assert_eq!(before.session(&key).expect("s1").store.len(), 3);

        catalog.refresh_now();
        assert_eq!(before.session(&key).expect("s1").store.len(), 3);
        assert_eq!(catalog.snapshot().session(&key).expect("s1").store.len(), 5);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = CatalogConfig::new(dir.path());
        config.refresh_interval_ms = 0;
        let err = CatalogService::open(config).expect_err("invalid");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_open_drains_large_logs() {
        let dir = TempDir::new().expect("tempdir");
        write_session(dir.path(), "kbot", "s1", 0..200);
        let config = CatalogConfig::new(dir.path()).with_poll_chunk_bytes(1024);
        let catalog = CatalogService::open(config).expect("open");
        let sessions = catalog.list_sessions(&SourceId::new("kbot")).expect("sessions");
        assert_eq!(sessions[0].record_count, 200);
    }
}
