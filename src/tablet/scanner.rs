//! Resumable scan sessions.
//!
//! A paged scan hands the client a session id with its first page; the
//! session records where the next page starts and which snapshot the scan
//! pinned, so every page of one scan observes the same engine state. A
//! session dies on client FIN or after sitting idle past the timeout; an
//! over-full pool evicts the longest-idle session first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errinput;
use crate::error::Result;
use crate::tablet::{ScanOptions, ScanPage, Tablet};

const MAX_SESSIONS: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct ScanSession {
    tablet: Arc<Tablet>,
    options: ScanOptions,
    /// Per-engine pinned sequences, released with the session.
    snapshot_id: u64,
    next_row: Vec<u8>,
    last_used: Instant,
}

pub struct ScanContextManager {
    sessions: Mutex<HashMap<u64, ScanSession>>,
    next_session: AtomicU64,
    idle_timeout: Duration,
}

impl Default for ScanContextManager {
    fn default() -> Self {
        Self::new(IDLE_TIMEOUT)
    }
}

impl ScanContextManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            idle_timeout,
        }
    }

    /// First page of a new scan. Returns the session id to resume with, or
    /// zero when the scan completed in one page.
    pub fn start(&self, tablet: Arc<Tablet>, options: ScanOptions) -> Result<(u64, ScanPage)> {
        // Pin a snapshot so later pages read the same state.
        let snapshot_id = u64::MAX - self.next_session.fetch_add(1, Ordering::SeqCst);
        tablet.create_snapshot(snapshot_id)?;

        let page = tablet.scan_at(&options, Some(snapshot_id))?;
        if page.complete {
            let _ = tablet.release_snapshot(snapshot_id);
            return Ok((0, page));
        }

        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session = ScanSession {
            tablet,
            options,
            snapshot_id,
            next_row: page.next_row.clone(),
            last_used: Instant::now(),
        };
        {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.len() >= MAX_SESSIONS {
                Self::evict_idle(&mut sessions);
            }
            sessions.insert(session_id, session);
        }
        Ok((session_id, page))
    }

    /// Next page of an existing session. A finished or evicted session id
    /// is an input error the client handles by restarting the scan.
    pub fn resume(&self, session_id: u64) -> Result<ScanPage> {
        let (tablet, mut options, snapshot_id, next_row) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or_else(|| errinput!("unknown scan session {}", session_id))?;
            session.last_used = Instant::now();
            (
                session.tablet.clone(),
                session.options.clone(),
                session.snapshot_id,
                session.next_row.clone(),
            )
        };

        options.start_row = next_row;
        let page = tablet.scan_at(&options, Some(snapshot_id))?;

        let mut sessions = self.sessions.lock().unwrap();
        if page.complete {
            if sessions.remove(&session_id).is_some() {
                let _ = tablet.release_snapshot(snapshot_id);
            }
        } else if let Some(session) = sessions.get_mut(&session_id) {
            session.next_row = page.next_row.clone();
        }
        Ok(page)
    }

    /// Client FIN: drop the session and its snapshot.
    pub fn finish(&self, session_id: u64) {
        let removed = self.sessions.lock().unwrap().remove(&session_id);
        if let Some(session) = removed {
            let _ = session.tablet.release_snapshot(session.snapshot_id);
        }
    }

    /// Periodic sweep of idle sessions; called by the server's scheduler.
    pub fn sweep_idle(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        let timeout = self.idle_timeout;
        let doomed: Vec<u64> = sessions
            .iter()
            .filter(|(_, s)| s.last_used.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(session) = sessions.remove(&id) {
                tracing::info!(session = id, "idle scan session evicted");
                let _ = session.tablet.release_snapshot(session.snapshot_id);
            }
        }
    }

    fn evict_idle(sessions: &mut HashMap<u64, ScanSession>) {
        if let Some(oldest) = sessions
            .iter()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(id, _)| *id)
        {
            if let Some(session) = sessions.remove(&oldest) {
                let _ = session.tablet.release_snapshot(session.snapshot_id);
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
