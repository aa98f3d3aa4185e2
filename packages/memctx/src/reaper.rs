//! Background reclamation of idle top-level contexts.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::ManagerInner;

/// Owns the reaper thread of one manager.
///
/// The thread holds only a weak reference to the manager, so it never keeps the manager alive.
/// It stops when [`stop()`][Self::stop] is called, when the `Reaper` is dropped, when the manager
/// is gone or when the manager has been shut down.
#[derive(Debug)]
pub(crate) struct Reaper {
    /// Dropping the sender is the stop signal.
    stop_sender: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn start(manager: Weak<ManagerInner>, interval: Duration) -> Self {
        let (stop_sender, stop_receiver) = channel::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("memctx-reaper".to_string())
            .spawn(move || {
                debug!(?interval, "reaper thread started");
                reaper_loop(&manager, &channel::tick(interval), &stop_receiver);
                debug!("reaper thread exiting");
            })
            .expect("failed to spawn reaper thread: thread spawning failure is not supported");

        Self {
            stop_sender: Some(stop_sender),
            thread: Some(thread),
        }
    }

    /// Signals the thread to stop and waits for it to exit. No scan is running or will start
    /// once this returns.
    pub(crate) fn stop(mut self) {
        self.stop_and_join();
    }

    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (the thread never stops).
    fn stop_and_join(&mut self) {
        drop(self.stop_sender.take());

        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            // Dropped by a pool callback running on the reaper thread. Joining would deadlock
            // and the thread exits by itself once the callback returns.
            return;
        }

        // Only a pool cleaner can panic on the reaper thread.
        if thread.join().is_err() {
            warn!("reaper thread terminated by a panic in a pool callback");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn reaper_loop(manager: &Weak<ManagerInner>, ticker: &Receiver<Instant>, stop: &Receiver<()>) {
    loop {
        channel::select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                // Both channels may be ready at once; the stop signal wins.
                if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };

                match manager.reap_idle() {
                    Ok(reaped) => trace!(reaped, "reaper scan complete"),
                    Err(_) => break,
                }
            }
        }
    }
}
