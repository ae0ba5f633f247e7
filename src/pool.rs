//! Per-User Thread Pool (component C).
//!
//! One long-lived native OS thread per UID, each pinned to its identity's
//! filesystem credentials for its entire life. A `Worker` struct and a
//! shared state block coordinate exit through an atomic flag and a
//! `Condvar`; idle workers are reclaimed by a TTL-based sweeper rather than
//! an idle-count threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::chroot::ChrootCapability;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// A unit of work dispatched to a worker: erases its result type by sending
/// the result over a channel captured in the closure itself.
type Job = Box<dyn FnOnce() + Send>;

/// The identity a request carries. Exactly one of `is_nobody` or a concrete
/// `uid_number` governs the result; see [`resolve_identity`].
#[derive(Debug, Clone, Default)]
pub struct UserIdentity {
    /// True for requests that explicitly carry no end-user identity.
    pub is_nobody: bool,
    /// Numeric uid, when the caller's identity resolved one.
    pub uid_number: Option<u32>,
    /// Numeric gid, when the caller's identity resolved one.
    pub gid_number: Option<u32>,
    /// Username, used only to recognize the "root" special case.
    pub username: Option<String>,
}

impl UserIdentity {
    /// The synthetic nobody identity: requests with no end-user attached
    /// are routed here, never to the process's own credentials.
    pub fn nobody() -> Self {
        UserIdentity {
            is_nobody: true,
            ..Default::default()
        }
    }

    /// An identity resolved to a concrete numeric uid/gid.
    pub fn numeric(uid: u32, gid: u32) -> Self {
        UserIdentity {
            is_nobody: false,
            uid_number: Some(uid),
            gid_number: Some(gid),
            username: None,
        }
    }
}

/// Resolve a request identity to `(uid, gid)` following the precedence
/// fixed by the pool's mapping contract: synthetic nobody first, then a
/// non-zero numeric identity, then the explicit root special case, then the
/// fixed fallback. Total and deterministic for every input.
pub fn resolve_identity(identity: &UserIdentity, config: &GatewayConfig) -> (u32, u32) {
    if identity.is_nobody {
        return (config.nobody_uid, config.nobody_gid);
    }
    if let Some(uid) = identity.uid_number {
        if uid != 0 {
            let gid = identity.gid_number.unwrap_or(uid);
            return (uid, gid);
        }
    }
    if identity.uid_number == Some(0) && identity.username.as_deref() == Some("root") {
        return (0, 0);
    }
    (1000, 1000)
}

/// A token the caller holds to request early return from [`ThreadPool::submit`]
/// without waiting for the dispatched job to finish. Cancellation is
/// caller-side only: the worker keeps running the job to completion and
/// simply drops the orphaned response.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of the startup privilege-verification probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub can_change_uid: bool,
    pub can_change_gid: bool,
}

fn current_fsuid() -> u32 {
    // Per setfsuid(2): passing an invalid fsuid value reports the current
    // value without changing it.
    (unsafe { libc::setfsuid(u32::MAX as libc::uid_t) }) as u32
}

fn current_fsgid() -> u32 {
    (unsafe { libc::setfsgid(u32::MAX as libc::gid_t) }) as u32
}

fn probe_uid_candidates(candidates: &[u32]) -> bool {
    let original = current_fsuid();
    let mut attempted = false;
    let mut all_ok = true;
    for &cand in candidates.iter().filter(|&&c| c != original) {
        attempted = true;
        unsafe { libc::setfsuid(cand as libc::uid_t) };
        let switched = current_fsuid() == cand;
        unsafe { libc::setfsuid(original as libc::uid_t) };
        let restored = current_fsuid() == original;
        if !switched || !restored {
            all_ok = false;
        }
    }
    attempted && all_ok
}

fn probe_gid_candidates(candidates: &[u32]) -> bool {
    let original = current_fsgid();
    let mut attempted = false;
    let mut all_ok = true;
    for &cand in candidates.iter().filter(|&&c| c != original) {
        attempted = true;
        unsafe { libc::setfsgid(cand as libc::gid_t) };
        let switched = current_fsgid() == cand;
        unsafe { libc::setfsgid(original as libc::gid_t) };
        let restored = current_fsgid() == original;
        if !switched || !restored {
            all_ok = false;
        }
    }
    attempted && all_ok
}

/// Probe whether the calling process can switch per-thread filesystem
/// credentials: attempts each of `{nobody_uid, 0, 65534} \ {current}`,
/// immediately restores, and verifies restoration. Partial capability is
/// non-fatal but must be logged as degraded isolation by the caller.
pub fn probe_capability(nobody_uid: u32, nobody_gid: u32) -> Capability {
    let uid_candidates = [nobody_uid, 0, 65534];
    let gid_candidates = [nobody_gid, 0, 65534];
    Capability {
        can_change_uid: probe_uid_candidates(&uid_candidates),
        can_change_gid: probe_gid_candidates(&gid_candidates),
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct WorkerEntry {
    sender: Sender<Job>,
    last_used: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

fn worker_main(uid: u32, gid: u32, rx: Receiver<Job>) {
    let original_uid = current_fsuid();
    let original_gid = current_fsgid();

    unsafe {
        libc::setfsuid(uid as libc::uid_t);
        libc::setfsgid(gid as libc::gid_t);
    }
    debug!("worker for uid {uid} started (gid {gid})");

    loop {
        match rx.recv() {
            Ok(job) => job(),
            Err(_) => break,
        }
    }

    unsafe {
        libc::setfsuid(original_uid as libc::uid_t);
        libc::setfsgid(original_gid as libc::gid_t);
    }
    debug!("worker for uid {uid} exiting, credentials restored");
}

/// One long-lived native thread per active UID, fed through unbounded
/// channels, with a background sweeper reclaiming threads idle past
/// `thread_ttl_secs`.
pub struct ThreadPool {
    chroot: Arc<ChrootCapability>,
    config: GatewayConfig,
    workers: Arc<RwLock<HashMap<u32, WorkerEntry>>>,
    capability: Capability,
    correlation_counter: AtomicU64,
    sweeper_shutdown: Arc<(Mutex<bool>, Condvar)>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Build the pool bound to `chroot`, running the startup privilege
    /// probe and starting the sweeper timer.
    pub fn new(chroot: Arc<ChrootCapability>, config: GatewayConfig) -> Self {
        let capability = probe_capability(config.nobody_uid, config.nobody_gid);
        if !capability.can_change_uid || !capability.can_change_gid {
            warn!(
                "per-user isolation degraded: can_change_uid={}, can_change_gid={}",
                capability.can_change_uid, capability.can_change_gid
            );
        }

        let pool = ThreadPool {
            chroot,
            config,
            workers: Arc::new(RwLock::new(HashMap::new())),
            capability,
            correlation_counter: AtomicU64::new(0),
            sweeper_shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            sweeper: Mutex::new(None),
        };
        pool.start_sweeper();
        pool
    }

    /// The capability established by the startup probe.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    fn start_sweeper(&self) {
        let ttl = Duration::from_secs(self.config.thread_ttl_secs);
        let period = Duration::from_secs(self.config.sweeper_period_secs.max(1));
        let shutdown = self.sweeper_shutdown.clone();
        let workers = self.workers.clone();

        let handle = thread::Builder::new()
            .name("nceph-sweeper".to_owned())
            .spawn(move || {
                let (lock, cvar) = &*shutdown;
                let mut guard = lock.lock().unwrap();
                loop {
                    let (next_guard, timeout) = cvar.wait_timeout(guard, period).unwrap();
                    guard = next_guard;
                    if *guard {
                        break;
                    }
                    if timeout.timed_out() {
                        reap_idle(&workers, ttl);
                    }
                }
            })
            .expect("failed to spawn sweeper thread");
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    fn get_or_create_worker(&self, uid: u32, gid: u32) -> (Sender<Job>, Arc<AtomicU64>) {
        {
            let workers = self.workers.read();
            if let Some(entry) = workers.get(&uid) {
                entry.last_used.store(now_epoch_secs(), Ordering::Relaxed);
                return (entry.sender.clone(), entry.last_used.clone());
            }
        }
        let mut workers = self.workers.write();
        if let Some(entry) = workers.get(&uid) {
            entry.last_used.store(now_epoch_secs(), Ordering::Relaxed);
            return (entry.sender.clone(), entry.last_used.clone());
        }
        let (tx, rx) = mpsc::channel::<Job>();
        let last_used = Arc::new(AtomicU64::new(now_epoch_secs()));
        let join = thread::Builder::new()
            .name(format!("nceph-uid-{uid}"))
            .spawn(move || worker_main(uid, gid, rx))
            .expect("failed to spawn per-user worker thread");
        info!("created worker for uid {uid}");
        workers.insert(
            uid,
            WorkerEntry {
                sender: tx.clone(),
                last_used: last_used.clone(),
                join: Some(join),
            },
        );
        (tx, last_used)
    }

    /// Dispatch `job` onto the worker owning `identity`'s resolved uid/gid,
    /// blocking until it completes or `cancel` fires first. On cancellation
    /// the job still runs to completion on its worker; only the caller's
    /// wait is short-circuited.
    pub fn submit<T, F>(&self, identity: &UserIdentity, cancel: &CancelToken, job: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChrootCapability) -> GatewayResult<T> + Send + 'static,
    {
        let (uid, gid) = resolve_identity(identity, &self.config);
        let (sender, last_used) = self.get_or_create_worker(uid, gid);
        let correlation_id = self.correlation_counter.fetch_add(1, Ordering::Relaxed);
        debug!("dispatch {correlation_id} to uid {uid} (gid {gid})");

        let (resp_tx, resp_rx) = mpsc::channel::<GatewayResult<T>>();
        let chroot = self.chroot.clone();
        let boxed: Job = Box::new(move || {
            let result = job(&chroot);
            let _ = resp_tx.send(result);
        });

        last_used.store(now_epoch_secs(), Ordering::Relaxed);
        sender.send(boxed).map_err(|_| {
            GatewayError::Unavailable(format!("worker for uid {uid} is shutting down"))
        })?;

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled(format!(
                    "request {correlation_id} cancelled before the worker responded"
                )));
            }
            match resp_rx.recv_timeout(Duration::from_millis(20)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GatewayError::internal(
                        format!("request {correlation_id}"),
                        std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "worker terminated before responding",
                        ),
                    ))
                }
            }
        }
    }

    /// Tear down every worker and the sweeper, restoring credentials on
    /// each thread before it exits.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &*self.sweeper_shutdown;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut workers = self.workers.write();
        let entries: Vec<WorkerEntry> = workers.drain().map(|(_, v)| v).collect();
        drop(workers);
        for entry in entries {
            // Drop the sender explicitly before joining: closing the
            // channel is what lets the worker's `recv()` return `Err` so it
            // can finish its in-flight job, restore credentials, and exit.
            let WorkerEntry { sender, join, .. } = entry;
            drop(sender);
            if let Some(join) = join {
                let _ = join.join();
            }
        }
        info!("thread pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reap_idle(workers: &RwLock<HashMap<u32, WorkerEntry>>, ttl: Duration) {
    let now = now_epoch_secs();
    let reaped: Vec<WorkerEntry> = {
        let mut workers = workers.write();
        let stale: Vec<u32> = workers
            .iter()
            .filter(|(_, entry)| {
                now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) >= ttl.as_secs()
            })
            .map(|(uid, _)| *uid)
            .collect();
        stale
            .into_iter()
            .filter_map(|uid| {
                info!("sweeper reclaiming idle worker for uid {uid}");
                workers.remove(&uid)
            })
            .collect()
    };
    for entry in reaped {
        // Drop the sender before joining: the worker's `recv()` only
        // returns `Err` (and the thread exits) once every sender is gone.
        let WorkerEntry { sender, join, .. } = entry;
        drop(sender);
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_pool(ttl_secs: u64, sweep_secs: u64) -> (ThreadPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chroot = Arc::new(ChrootCapability::open(dir.path()).unwrap());
        let mut cfg = GatewayConfig::for_local_mode();
        cfg.thread_ttl_secs = ttl_secs;
        cfg.sweeper_period_secs = sweep_secs;
        (ThreadPool::new(chroot, cfg), dir)
    }

    #[test]
    fn resolves_nobody_identity() {
        let cfg = GatewayConfig::default();
        let (uid, gid) = resolve_identity(&UserIdentity::nobody(), &cfg);
        assert_eq!((uid, gid), (cfg.nobody_uid, cfg.nobody_gid));
    }

    #[test]
    fn resolves_numeric_identity() {
        let cfg = GatewayConfig::default();
        let identity = UserIdentity::numeric(1001, 1001);
        assert_eq!(resolve_identity(&identity, &cfg), (1001, 1001));
    }

    #[test]
    fn resolves_explicit_root() {
        let cfg = GatewayConfig::default();
        let identity = UserIdentity {
            is_nobody: false,
            uid_number: Some(0),
            gid_number: Some(0),
            username: Some("root".to_owned()),
        };
        assert_eq!(resolve_identity(&identity, &cfg), (0, 0));
    }

    #[test]
    fn falls_back_to_default_identity() {
        let cfg = GatewayConfig::default();
        let identity = UserIdentity::default();
        assert_eq!(resolve_identity(&identity, &cfg), (1000, 1000));
    }

    #[test]
    fn submit_executes_job_and_returns_result() {
        let (pool, _dir) = test_pool(300, 60);
        let cancel = CancelToken::new();
        let identity = UserIdentity::numeric(1001, 1001);
        let result = pool
            .submit(&identity, &cancel, |_chroot| -> GatewayResult<i32> { Ok(42) })
            .unwrap();
        assert_eq!(result, 42);
        pool.shutdown();
    }

    #[test]
    fn fifo_per_worker_read_after_write() {
        let (pool, _dir) = test_pool(300, 60);
        let cancel = CancelToken::new();
        let identity = UserIdentity::numeric(1002, 1002);
        let counter = Arc::new(AtomicUsize::new(0));

        for expected in 0..5 {
            let counter = counter.clone();
            let observed = pool
                .submit(&identity, &cancel, move |_chroot| -> GatewayResult<usize> {
                    Ok(counter.fetch_add(1, Ordering::SeqCst))
                })
                .unwrap();
            assert_eq!(observed, expected);
        }
        pool.shutdown();
    }

    #[test]
    fn cancelled_token_short_circuits_before_job_runs() {
        let (pool, _dir) = test_pool(300, 60);
        let cancel = CancelToken::new();
        cancel.cancel();
        let identity = UserIdentity::numeric(1003, 1003);
        let result = pool.submit(&identity, &cancel, |_chroot| -> GatewayResult<()> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        assert!(matches!(result, Err(GatewayError::Cancelled(_))));
        pool.shutdown();
    }

    #[test]
    fn non_root_probe_reports_no_capability() {
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let cap = probe_capability(65534, 65534);
        assert!(!cap.can_change_uid);
        assert!(!cap.can_change_gid);
    }

    #[test]
    fn sweeper_reclaims_idle_workers() {
        let (pool, _dir) = test_pool(1, 1);
        let cancel = CancelToken::new();
        let identity = UserIdentity::numeric(1004, 1004);
        pool.submit(&identity, &cancel, |_chroot| -> GatewayResult<()> { Ok(()) })
            .unwrap();
        assert!(pool.workers.read().contains_key(&1004));
        std::thread::sleep(Duration::from_millis(2500));
        assert!(!pool.workers.read().contains_key(&1004));
        pool.shutdown();
    }
}
