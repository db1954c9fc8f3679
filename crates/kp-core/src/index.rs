//! Session discovery and incremental ingestion.
//!
//! The index owns every session's reader and store. One [`SessionIndex::refresh`]
//! pass:
//!
//! 1. scans `<data_dir>/<source>/<session>/` (hidden entries skipped),
//! 2. creates sessions for new directories holding a log file, marks sessions
//!    whose directory disappeared as `Gone` and revives ones that came back
//!    (a source or entry that cannot be listed leaves its sessions as they are),
//! 3. polls each present session's reader and appends parsed records.
//!
//! Failures stay inside the session they happened in: a bad line is counted,
//! an unreadable log marks the session `Stale`, a truncated log rebuilds only
//! that session's store.
//!
//! After a pass, [`SessionIndex::snapshot`] produces an immutable
//! [`CatalogSnapshot`] in which untouched sessions share their previous `Arc`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use kp_common::{SessionId, SessionKey, SourceId};
use kp_config::CatalogConfig;
use kp_telemetry::{parse_bytes, LogReader, ReadError, SeriesStore};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Directory present, log readable.
    Active,
    /// Directory present but the log could not be read on the last pass.
    Stale,
    /// Directory removed; data retained but hidden from listings.
    Gone,
}

/// Immutable view of one session as of the pass that produced it.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub log_path: PathBuf,
    pub status: SessionStatus,
    pub store: Arc<SeriesStore>,
    /// Lines rejected by the parser since the last rebuild.
    pub parse_errors: u64,
    pub last_error: Option<String>,
    /// Times the log was found truncated or replaced.
    pub truncations: u64,
    pub log_modified: Option<SystemTime>,
    pub dir_modified: Option<SystemTime>,
}

impl SessionSnapshot {
    pub fn is_gone(&self) -> bool {
        self.status == SessionStatus::Gone
    }

    /// Whether the log was written within `window` of `now`.
    pub fn is_live(&self, now: SystemTime, window: std::time::Duration) -> bool {
        match self.log_modified {
            Some(modified) => now
                .duration_since(modified)
                .map(|age| age <= window)
                // mtime in the future: clock skew, still being written
                .unwrap_or(true),
            None => false,
        }
    }
}

/// Newest-first ordering used for latest resolution and listings.
///
/// Compares the start time in the session name (lexical order when a name
/// carries none), then the directory modification time.
pub fn recency_cmp(a: &SessionSnapshot, b: &SessionSnapshot) -> Ordering {
    a.key
        .session
        .chronological_cmp(&b.key.session)
        .then_with(|| a.dir_modified.cmp(&b.dir_modified))
}

/// Everything queries need, frozen after one refresh pass.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// Number of passes published before this one.
    pub generation: u64,
    pub refreshed_at: Option<SystemTime>,
    sessions: BTreeMap<SessionKey, Arc<SessionSnapshot>>,
}

impl CatalogSnapshot {
    /// Sources with at least one session that is not gone, sorted.
    pub fn sources(&self) -> Vec<SourceId> {
        let mut out: Vec<SourceId> = self
            .sessions
            .values()
            .filter(|s| !s.is_gone())
            .map(|s| s.key.source.clone())
            .collect();
        out.dedup();
        out
    }

    /// Whether any session (gone or not) was ever seen under `source`.
    pub fn knows_source(&self, source: &SourceId) -> bool {
        self.sessions_of(source).next().is_some()
    }

    /// All sessions of one source, including gone ones, in key order.
    pub fn sessions_of<'a>(
        &'a self,
        source: &'a SourceId,
    ) -> impl Iterator<Item = &'a Arc<SessionSnapshot>> + 'a {
        self.sessions
            .iter()
            .filter(move |(k, _)| &k.source == source)
            .map(|(_, s)| s)
    }

    /// Visible sessions of one source, newest first.
    pub fn visible_sessions(&self, source: &SourceId) -> Vec<Arc<SessionSnapshot>> {
        let mut out: Vec<Arc<SessionSnapshot>> = self
            .sessions_of(source)
            .filter(|s| !s.is_gone())
            .cloned()
            .collect();
        out.sort_by(|a, b| recency_cmp(b, a));
        out
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Arc<SessionSnapshot>> {
        self.sessions.get(key)
    }

    /// The source's most recent visible session.
    pub fn latest(&self, source: &SourceId) -> Option<Arc<SessionSnapshot>> {
        self.sessions_of(source)
            .filter(|s| !s.is_gone())
            .max_by(|a, b| recency_cmp(a, b))
            .cloned()
    }

    /// Every visible session across all sources.
    pub fn visible(&self) -> impl Iterator<Item = &Arc<SessionSnapshot>> {
        self.sessions.values().filter(|s| !s.is_gone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Sessions whose published view changed in this pass.
    pub changed: BTreeSet<SessionKey>,
    pub discovered: usize,
    pub gone: usize,
    pub records_appended: u64,
    pub parse_errors: u64,
    pub truncations: u64,
    pub unavailable: usize,
    /// Sessions that still have unread bytes after their poll budget.
    pub backlogged: usize,
    /// Set when the data directory itself could not be listed.
    pub scan_error: Option<String>,
    /// Source directories or session entries that could not be inspected;
    /// their known sessions keep their status for this pass.
    pub listing_errors: usize,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

#[derive(Debug)]
struct SessionEntry {
    key: SessionKey,
    log_path: PathBuf,
    reader: LogReader,
    store: SeriesStore,
    status: SessionStatus,
    parse_errors: u64,
    last_error: Option<String>,
    truncations: u64,
    log_modified: Option<SystemTime>,
    dir_modified: Option<SystemTime>,
    /// Last published view; `None` forces a rebuild at the next snapshot.
    published: Option<Arc<SessionSnapshot>>,
}

impl SessionEntry {
    fn new(key: SessionKey, log_path: PathBuf, config: &CatalogConfig) -> Self {
        Self {
            reader: LogReader::new(&log_path).with_chunk_bytes(config.poll_chunk_bytes),
            store: SeriesStore::with_capacity(config.store_capacity),
            key,
            log_path,
            status: SessionStatus::Active,
            parse_errors: 0,
            last_error: None,
            truncations: 0,
            log_modified: None,
            dir_modified: None,
            published: None,
        }
    }

    fn set_status(&mut self, status: SessionStatus) -> bool {
        if self.status == status {
            return false;
        }
        debug!(
            source = %self.key.source,
            session = %self.key.session,
            from = ?self.status,
            to = ?status,
            "session status changed"
        );
        self.status = status;
        true
    }

    fn view(&mut self) -> Arc<SessionSnapshot> {
        if let Some(view) = &self.published {
            return Arc::clone(view);
        }
        let view = Arc::new(SessionSnapshot {
            key: self.key.clone(),
            log_path: self.log_path.clone(),
            status: self.status,
            store: self.store.snapshot(),
            parse_errors: self.parse_errors,
            last_error: self.last_error.clone(),
            truncations: self.truncations,
            log_modified: self.log_modified,
            dir_modified: self.dir_modified,
        });
        self.published = Some(Arc::clone(&view));
        view
    }

    /// Poll the reader once and ingest what it returned.
    ///
    /// A truncated log is rebuilt from byte 0 within the same call.
    fn ingest(&mut self, report: &mut RefreshReport) -> bool {
        let mut changed = false;
        let lines = match self.reader.poll() {
            Ok(lines) => lines,
            Err(ReadError::Truncated { .. }) => {
                info!(
                    source = %self.key.source,
                    session = %self.key.session,
                    records = self.store.len(),
                    "log truncated; rebuilding session"
                );
                self.store.reset();
                self.parse_errors = 0;
                self.last_error = None;
                self.truncations += 1;
                report.truncations += 1;
                changed = true;
                match self.reader.poll() {
                    Ok(lines) => lines,
                    Err(err) => return self.mark_unavailable(err, report) || changed,
                }
            }
            Err(err) => return self.mark_unavailable(err, report),
        };

        changed |= self.set_status(SessionStatus::Active);
        let modified = fs::metadata(&self.log_path).and_then(|m| m.modified()).ok();
        if modified != self.log_modified {
            self.log_modified = modified;
            changed = true;
        }

        let mut appended = 0u64;
        let mut rejected = 0u64;
        for line in &lines {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match parse_bytes(line) {
                Ok(record) => {
                    self.store.append(record);
                    appended += 1;
                }
                Err(err) => {
                    debug!(
                        source = %self.key.source,
                        session = %self.key.session,
                        line = self.reader.cursor().lines,
                        error = %err,
                        "skipping unparseable line"
                    );
                    self.last_error = Some(err.to_string());
                    rejected += 1;
                }
            }
        }
        if rejected > 0 {
            self.parse_errors += rejected;
            report.parse_errors += rejected;
            warn!(
                source = %self.key.source,
                session = %self.key.session,
                rejected,
                total = self.parse_errors,
                "rejected malformed telemetry lines"
            );
        }
        report.records_appended += appended;
        if self.reader.has_backlog() {
            report.backlogged += 1;
        }
        changed || appended > 0 || rejected > 0
    }

    fn mark_unavailable(&mut self, err: ReadError, report: &mut RefreshReport) -> bool {
        report.unavailable += 1;
        let message = err.to_string();
        let changed =
            self.set_status(SessionStatus::Stale) || self.last_error.as_ref() != Some(&message);
        if changed {
            warn!(
                source = %self.key.source,
                session = %self.key.session,
                error = %message,
                "log unavailable; keeping session as stale"
            );
        }
        self.last_error = Some(message);
        changed
    }
}

/// Session directory found on disk during a scan.
struct Found {
    dir_modified: Option<SystemTime>,
    has_log: bool,
}

/// Result of walking the data directory.
#[derive(Default)]
struct Scan {
    found: BTreeMap<SessionKey, Found>,
    /// Sources whose directory could not be listed or inspected.
    unlisted: BTreeSet<SourceId>,
    /// Session entries whose metadata could not be read.
    unreadable: BTreeSet<SessionKey>,
}

impl Scan {
    /// Whether absence of `key` from this scan says nothing about the disk.
    fn inconclusive(&self, key: &SessionKey) -> bool {
        self.unlisted.contains(&key.source) || self.unreadable.contains(key)
    }

    fn listing_errors(&self) -> usize {
        self.unlisted.len() + self.unreadable.len()
    }
}

/// Visible subdirectories of one directory.
#[derive(Debug, Default)]
struct Listing {
    /// `(name, path, mtime)` of each subdirectory.
    dirs: Vec<(String, PathBuf, Option<SystemTime>)>,
    /// Visible entries whose metadata could not be read.
    unreadable: Vec<String>,
}

type ListDir = fn(&Path) -> std::io::Result<Listing>;

/// Source → session map with the readers and stores behind it.
#[derive(Debug)]
pub struct SessionIndex {
    config: CatalogConfig,
    sessions: BTreeMap<SessionKey, SessionEntry>,
    generation: u64,
    list_dir: ListDir,
}

impl SessionIndex {
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
            generation: 0,
            list_dir: list_subdirs,
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn status(&self, key: &SessionKey) -> Option<SessionStatus> {
        self.sessions.get(key).map(|s| s.status)
    }

    /// Run one discovery + ingest pass.
    pub fn refresh(&mut self) -> RefreshReport {
        let started = Instant::now();
        let mut report = RefreshReport::default();

        match scan(self.list_dir, &self.config.data_dir, &self.config.log_file_name) {
            Ok(scan) => self.reconcile(scan, &mut report),
            Err(err) => {
                warn!(
                    path = %self.config.data_dir.display(),
                    error = %err,
                    "cannot list data directory; polling known sessions only"
                );
                report.scan_error = Some(err.to_string());
            }
        }

        for entry in self.sessions.values_mut() {
            if entry.status == SessionStatus::Gone {
                continue;
            }
            if entry.ingest(&mut report) {
                entry.published = None;
                report.changed.insert(entry.key.clone());
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.has_changes() || report.scan_error.is_some() || report.listing_errors > 0 {
            debug!(
                changed = report.changed.len(),
                records = report.records_appended,
                parse_errors = report.parse_errors,
                truncations = report.truncations,
                unavailable = report.unavailable,
                listing_errors = report.listing_errors,
                elapsed_ms = report.elapsed_ms,
                "refresh pass complete"
            );
        }
        report
    }

    fn reconcile(&mut self, scan: Scan, report: &mut RefreshReport) {
        report.listing_errors = scan.listing_errors();
        for (key, entry) in self.sessions.iter_mut() {
            match scan.found.get(key) {
                None if scan.inconclusive(key) => {
                    debug!(
                        source = %key.source,
                        session = %key.session,
                        status = ?entry.status,
                        "session directory not inspectable; keeping status"
                    );
                }
                None => {
                    if entry.set_status(SessionStatus::Gone) {
                        info!(
                            source = %key.source,
                            session = %key.session,
                            records = entry.store.len(),
                            "session directory gone"
                        );
                        report.gone += 1;
                        entry.published = None;
                        report.changed.insert(key.clone());
                    }
                }
                Some(dir) => {
                    if entry.status == SessionStatus::Gone {
                        info!(
                            source = %key.source,
                            session = %key.session,
                            "session directory reappeared"
                        );
                        entry.set_status(SessionStatus::Active);
                        entry.published = None;
                        report.changed.insert(key.clone());
                    }
                    if entry.dir_modified != dir.dir_modified {
                        entry.dir_modified = dir.dir_modified;
                        entry.published = None;
                        report.changed.insert(key.clone());
                    }
                }
            }
        }

        for (key, dir) in scan.found {
            if !dir.has_log || self.sessions.contains_key(&key) {
                continue;
            }
            let log_path = self
                .config
                .data_dir
                .join(key.source.as_str())
                .join(key.session.as_str())
                .join(&self.config.log_file_name);
            info!(
                source = %key.source,
                session = %key.session,
                path = %log_path.display(),
                "discovered session"
            );
            let mut entry = SessionEntry::new(key.clone(), log_path, &self.config);
            entry.dir_modified = dir.dir_modified;
            self.sessions.insert(key.clone(), entry);
            report.discovered += 1;
            report.changed.insert(key);
        }
    }

    /// Freeze the current state; untouched sessions reuse their last view.
    pub fn snapshot(&mut self) -> CatalogSnapshot {
        let sessions = self
            .sessions
            .iter_mut()
            .map(|(key, entry)| (key.clone(), entry.view()))
            .collect();
        let snapshot = CatalogSnapshot {
            generation: self.generation,
            refreshed_at: Some(SystemTime::now()),
            sessions,
        };
        self.generation += 1;
        snapshot
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Visible subdirectories of `dir`.
///
/// An error while iterating fails the whole listing; an entry whose metadata
/// cannot be read is reported by name instead of being dropped.
fn list_subdirs(dir: &Path) -> std::io::Result<Listing> {
    let mut listing = Listing::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => listing.dirs.push((name, path, meta.modified().ok())),
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot inspect directory entry");
                listing.unreadable.push(name);
            }
        }
    }
    Ok(listing)
}

/// Two-level walk of the data directory.
///
/// Every visible session directory is reported, with or without a log, so
/// that a known session whose log vanished turns stale rather than gone.
/// Sources that cannot be listed are recorded so their sessions are not
/// mistaken for removed ones.
fn scan(list_dir: ListDir, data_dir: &Path, log_file_name: &str) -> std::io::Result<Scan> {
    let top = list_dir(data_dir)?;
    let mut scan = Scan {
        unlisted: top.unreadable.into_iter().map(SourceId::new).collect(),
        ..Scan::default()
    };
    for (source, source_path, _) in top.dirs {
        let source = SourceId::new(source);
        let sessions = match list_dir(&source_path) {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(source = %source, error = %err, "cannot list source directory");
                scan.unlisted.insert(source);
                continue;
            }
        };
        for session in sessions.unreadable {
            scan.unreadable.insert(SessionKey {
                source: source.clone(),
                session: SessionId::new(session),
            });
        }
        for (session, session_path, dir_modified) in sessions.dirs {
            let has_log = session_path.join(log_file_name).is_file();
            scan.found.insert(
                SessionKey {
                    source: source.clone(),
                    session: SessionId::new(session),
                },
                Found {
                    dir_modified,
                    has_log,
                },
            );
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const LINE: &str = r#"{"step_id":1,"timestamp":0.1,"joint_order":["hip"],"joint_angles":[0.5],"joint_velocities":[0.0]}"#;

    fn write_log(root: &Path, source: &str, session: &str, body: &str) -> PathBuf {
        let dir = root.join(source).join(session);
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("kinfer_log.ndjson");
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open");
        f.write_all(body.as_bytes()).expect("write");
        path
    }

    fn index_for(root: &Path) -> SessionIndex {
        SessionIndex::new(CatalogConfig::new(root))
    }

    fn key(source: &str, session: &str) -> SessionKey {
        SessionKey::new(source, session)
    }

    #[test]
    fn test_discovers_sessions_and_skips_hidden() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "kbot-01", "run_a", &format!("{}\n", LINE));
        write_log(dir.path(), ".trash", "run_b", &format!("{}\n", LINE));
        write_log(dir.path(), "kbot-01", ".partial", &format!("{}\n", LINE));
        fs::create_dir_all(dir.path().join("kbot-01").join("no_log")).expect("mkdir");

        let mut index = index_for(dir.path());
        let report = index.refresh();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.records_appended, 1);
        assert!(report.changed.contains(&key("kbot-01", "run_a")));

        let snap = index.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.sources(), vec![SourceId::new("kbot-01")]);
    }

    #[test]
    fn test_unchanged_sessions_share_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "a", "s1", &format!("{}\n", LINE));
        let b = write_log(dir.path(), "b", "s1", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();
        let first = index.snapshot();

        let mut f = fs::OpenOptions::new().append(true).open(&b).expect("open");
        writeln!(f, "{}", LINE).expect("write");
        let report = index.refresh();
        let second = index.snapshot();

        assert!(!report.changed.contains(&key("a", "s1")));
        assert!(report.changed.contains(&key("b", "s1")));
        let a1 = first.session(&key("a", "s1")).expect("a");
        let a2 = second.session(&key("a", "s1")).expect("a");
        assert!(Arc::ptr_eq(a1, a2));
        assert_eq!(second.session(&key("b", "s1")).expect("b").store.len(), 2);
        assert_eq!(second.generation, first.generation + 1);
    }

    #[test]
    fn test_bad_line_counted_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        write_log(
            dir.path(),
            "a",
            "s1",
            &format!("{}\n{{oops\n\n{}\n", LINE, LINE),
        );
        let mut index = index_for(dir.path());
        let report = index.refresh();
        assert_eq!(report.parse_errors, 1);

        let snap = index.snapshot();
        let s = snap.session(&key("a", "s1")).expect("session");
        assert_eq!(s.store.len(), 2);
        assert_eq!(s.parse_errors, 1);
        assert!(s.last_error.as_deref().unwrap_or("").contains("malformed"));
    }

    #[test]
    fn test_removed_directory_marks_gone_and_returns() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "a", "s1", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();

        let session_dir = dir.path().join("a").join("s1");
        let parked = dir.path().join("parked");
        fs::rename(&session_dir, &parked).expect("move away");
        let report = index.refresh();
        assert_eq!(report.gone, 1);
        assert_eq!(index.status(&key("a", "s1")), Some(SessionStatus::Gone));

        let snap = index.snapshot();
        assert!(snap.sources().is_empty());
        assert!(snap.latest(&SourceId::new("a")).is_none());
        // Data is kept while gone.
        assert_eq!(snap.session(&key("a", "s1")).expect("kept").store.len(), 1);

        fs::rename(&parked, &session_dir).expect("move back");
        index.refresh();
        assert_eq!(index.status(&key("a", "s1")), Some(SessionStatus::Active));
    }

    #[test]
    fn test_missing_log_marks_stale() {
        let dir = TempDir::new().expect("tempdir");
        let log = write_log(dir.path(), "a", "s1", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();

        fs::remove_file(&log).expect("rm");
        let report = index.refresh();
        assert_eq!(report.unavailable, 1);
        assert_eq!(index.status(&key("a", "s1")), Some(SessionStatus::Stale));
        let snap = index.snapshot();
        assert_eq!(snap.session(&key("a", "s1")).expect("kept").store.len(), 1);
        assert_eq!(snap.sources().len(), 1);

        write_log(dir.path(), "a", "s1", &format!("{}\n{}\n", LINE, LINE));
        index.refresh();
        assert_eq!(index.status(&key("a", "s1")), Some(SessionStatus::Active));
        let snap = index.snapshot();
        assert_eq!(snap.session(&key("a", "s1")).expect("session").store.len(), 2);
    }

    #[test]
    fn test_truncation_rebuilds_in_same_pass() {
        let dir = TempDir::new().expect("tempdir");
        let body: String = (0..6).map(|_| format!("{}\n", LINE)).collect();
        let log = write_log(dir.path(), "a", "s1", &format!("{}{{bad\n", body));
        let mut index = index_for(dir.path());
        index.refresh();

        fs::write(&log, format!("{}\n{}\n", LINE, LINE)).expect("truncate");
        let report = index.refresh();
        assert_eq!(report.truncations, 1);

        let snap = index.snapshot();
        let s = snap.session(&key("a", "s1")).expect("session");
        assert_eq!(s.store.len(), 2);
        assert_eq!(s.parse_errors, 0);
        assert_eq!(s.truncations, 1);
    }

    #[test]
    fn test_latest_prefers_name_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "kbot", "session_20251013_120000", &format!("{}\n", LINE));
        write_log(dir.path(), "kbot", "session_20251013_110106", &format!("{}\n", LINE));
        write_log(dir.path(), "kbot", "adhoc", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();
        let snap = index.snapshot();

        let latest = snap.latest(&SourceId::new("kbot")).expect("latest");
        assert_eq!(latest.key.session.as_str(), "session_20251013_120000");
        let order: Vec<String> = snap
            .visible_sessions(&SourceId::new("kbot"))
            .iter()
            .map(|s| s.key.session.to_string())
            .collect();
        assert_eq!(
            order,
            vec!["session_20251013_120000", "session_20251013_110106", "adhoc"]
        );
    }

    fn deny_kbot(dir: &Path) -> std::io::Result<Listing> {
        if dir.ends_with("kbot") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            ));
        }
        list_subdirs(dir)
    }

    fn s1_uninspectable(dir: &Path) -> std::io::Result<Listing> {
        let mut listing = list_subdirs(dir)?;
        if let Some(pos) = listing.dirs.iter().position(|(name, _, _)| name == "s1") {
            let (name, _, _) = listing.dirs.remove(pos);
            listing.unreadable.push(name);
        }
        Ok(listing)
    }

    #[test]
    fn test_unlistable_source_keeps_sessions() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "kbot", "s1", &format!("{}\n", LINE));
        write_log(dir.path(), "kbot", "s2", &format!("{}\n", LINE));
        write_log(dir.path(), "zbot", "s1", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();

        index.list_dir = deny_kbot;
        let report = index.refresh();
        assert_eq!(report.gone, 0);
        assert_eq!(report.listing_errors, 1);
        assert_eq!(index.status(&key("kbot", "s1")), Some(SessionStatus::Active));
        assert_eq!(index.status(&key("kbot", "s2")), Some(SessionStatus::Active));
        let snap = index.snapshot();
        assert_eq!(snap.sources(), vec![SourceId::new("kbot"), SourceId::new("zbot")]);
        assert!(snap.latest(&SourceId::new("kbot")).is_some());

        // Once listing works again a real removal is still detected.
        index.list_dir = list_subdirs;
        fs::remove_dir_all(dir.path().join("kbot").join("s2")).expect("rm");
        let report = index.refresh();
        assert_eq!(report.gone, 1);
        assert_eq!(report.listing_errors, 0);
        assert_eq!(index.status(&key("kbot", "s2")), Some(SessionStatus::Gone));
    }

    #[test]
    fn test_uninspectable_entry_keeps_status() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "kbot", "s1", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();

        index.list_dir = s1_uninspectable;
        let report = index.refresh();
        assert_eq!(report.gone, 0);
        assert_eq!(report.listing_errors, 1);
        assert_eq!(index.status(&key("kbot", "s1")), Some(SessionStatus::Active));
        assert_eq!(index.snapshot().visible_sessions(&SourceId::new("kbot")).len(), 1);
    }

    #[test]
    fn test_uninspectable_source_entry_keeps_sessions() {
        let dir = TempDir::new().expect("tempdir");
        write_log(dir.path(), "s1", "run", &format!("{}\n", LINE));
        let mut index = index_for(dir.path());
        index.refresh();

        // The data-dir listing sees the source "s1" but cannot stat it.
        index.list_dir = s1_uninspectable;
        let report = index.refresh();
        assert_eq!(report.gone, 0);
        assert_eq!(index.status(&key("s1", "run")), Some(SessionStatus::Active));
    }

    #[test]
    fn test_missing_data_dir_reports_scan_error() {
        let dir = TempDir::new().expect("tempdir");
        let mut index = index_for(&dir.path().join("absent"));
        let report = index.refresh();
        assert!(report.scan_error.is_some());
        assert!(index.snapshot().is_empty());
    }
}
