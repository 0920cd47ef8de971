//! Interrupt handling.
//!
//! Instead of asynchronous handlers, SIGINT/SIGTERM/SIGABRT are blocked and a
//! watcher thread receives them with `sigwait`. Install the guard before any
//! other thread is spawned so every thread inherits the blocked mask. On a
//! signal the watcher cancels the run; if the control thread has not finished
//! tearing down within the grace period, the process exits with
//! [`exit_codes::CANCELLED`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::sched::cancel::Cancellation;

#[cfg(unix)]
pub use unix::SignalGuard;

#[cfg(unix)]
mod unix {
    use std::sync::Arc;
    use std::sync::mpsc::{self, RecvTimeoutError, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use anyhow::{Context, Result};
    use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
    use nix::sys::signal::{SigSet, SigmaskHow, Signal};
    use tracing::{debug, error, warn};

    use crate::exit_codes;
    use crate::sched::cancel::Cancellation;

    const INTERRUPTS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGABRT];
    /// Sent to the watcher by [`SignalGuard`]'s drop to end it.
    const WAKE: Signal = Signal::SIGUSR2;

    /// Restores the previous signal mask and stops the watcher when dropped.
    pub struct SignalGuard {
        old_mask: SigSet,
        shutdown: Option<Sender<()>>,
        watcher: Option<(Pthread, JoinHandle<()>)>,
    }

    impl SignalGuard {
        pub fn install(cancellation: Arc<Cancellation>, grace: Duration) -> Result<Self> {
            let mut set = SigSet::empty();
            for sig in INTERRUPTS {
                set.add(sig);
            }
            set.add(WAKE);
            let old_mask = set
                .thread_swap_mask(SigmaskHow::SIG_BLOCK)
                .context("block interrupt signals")?;

            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let (id_tx, id_rx) = mpsc::channel::<Pthread>();
            let spawned = thread::Builder::new()
                .name("sate-signals".to_string())
                .spawn(move || {
                    let _ = id_tx.send(pthread_self());
                    watch(&set, &cancellation, grace, &shutdown_rx);
                });
            let handle = match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    let _ = old_mask.thread_set_mask();
                    return Err(err).context("spawn signal watcher");
                }
            };
            let tid = match id_rx.recv() {
                Ok(tid) => tid,
                Err(err) => {
                    let _ = old_mask.thread_set_mask();
                    return Err(err).context("signal watcher did not start");
                }
            };
            debug!("interrupt signals routed to watcher thread");
            Ok(Self {
                old_mask,
                shutdown: Some(shutdown_tx),
                watcher: Some((tid, handle)),
            })
        }
    }

    fn watch(
        set: &SigSet,
        cancellation: &Cancellation,
        grace: Duration,
        shutdown: &mpsc::Receiver<()>,
    ) {
        loop {
            let sig = match set.wait() {
                Ok(sig) => sig,
                Err(err) => {
                    error!(
                        err = %err,
                        "waiting for signals failed; interrupts are no longer handled"
                    );
                    return;
                }
            };
            if sig == WAKE {
                return;
            }
            let jobs = cancellation.cancel(&format!("received {}", sig.as_str()));
            warn!(signal = sig.as_str(), jobs, "interrupted, stopping the run");
            match shutdown.recv_timeout(grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    error!(grace_secs = grace.as_secs(), "run did not stop in time, exiting");
                    std::process::exit(exit_codes::CANCELLED);
                }
            }
        }
    }

    impl Drop for SignalGuard {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            if let Some((tid, handle)) = self.watcher.take() {
                if !handle.is_finished() {
                    let _ = pthread_kill(tid, WAKE);
                }
                if handle.join().is_err() {
                    warn!("signal watcher panicked");
                }
            }
            if let Err(err) = self.old_mask.thread_set_mask() {
                warn!(err = %err, "failed to restore signal mask");
            }
        }
    }
}

/// Without POSIX signals only the in-process cancel path exists.
#[cfg(not(unix))]
pub struct SignalGuard;

#[cfg(not(unix))]
impl SignalGuard {
    pub fn install(_cancellation: Arc<Cancellation>, _grace: Duration) -> Result<Self> {
        Ok(Self)
    }
}

/// Route interrupts to `cancellation` until the returned guard drops.
pub fn install(cancellation: Arc<Cancellation>, grace: Duration) -> Result<SignalGuard> {
    SignalGuard::install(cancellation, grace)
}
