//! Session timeout daemon.
//!
//! One dedicated thread wakes on a fixed cadence, scans the registry in
//! bounded batches and removes sessions idle past the timeout. The sleep is
//! interruptible so server shutdown does not wait out the tick.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use squill_lockfree::tran::TranSystem;

use crate::manager::Sessions;

struct ReaperShared {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

pub struct SessionReaper {
    shared: Arc<ReaperShared>,
    handle: Option<JoinHandle<()>>,
}

impl SessionReaper {
    /// Start the daemon. It claims its own transaction entry and keeps it
    /// for its lifetime.
    pub fn spawn(sessions: Arc<Sessions>, tran_system: Arc<TranSystem>) -> SessionReaper {
        let shared = Arc::new(ReaperShared {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let interval = sessions.params().session_reaper_interval;
        let handle = std::thread::Builder::new()
            .name("session-reaper".to_owned())
            .spawn(move || {
                let tran = loop {
                    match tran_system.request_entry() {
                        Ok(tran) => break tran,
                        Err(_) => std::thread::yield_now(),
                    }
                };
                loop {
                    {
                        let mut shutdown = thread_shared.shutdown.lock();
                        if !*shutdown {
                            thread_shared.wake.wait_for(&mut shutdown, interval);
                        }
                        if *shutdown {
                            return;
                        }
                    }
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let _ctx = squill_helpers::enter_panic("session reaper tick".to_owned());
                    let removed = sessions.remove_expired(&tran, now);
                    if removed > 0 {
                        log::info!("session reaper removed {removed} expired session(s)");
                    }
                }
            })
            .expect("failed to spawn session reaper");
        SessionReaper {
            shared,
            handle: Some(handle),
        }
    }

    /// Stop the daemon and join it.
    pub fn stop(mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn signal_shutdown(&self) {
        let mut shutdown = self.shared.shutdown.lock();
        *shutdown = true;
        self.shared.wake.notify_all();
    }
}

impl Drop for SessionReaper {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
