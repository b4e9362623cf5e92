use std::sync::mpsc;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use crate::worker::ThreadWork;

/// A current-thread runtime with a single blocking thread. Together with [HeldWorker], this
///  allows tests to keep [ThreadWork] queued for as long as they need.
pub fn single_worker_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .max_blocking_threads(1)
        .enable_all()
        .build()
}

/// Occupies a blocking thread until it is released. Thread work spawned in the meantime waits
///  in the runtime's queue if no other blocking thread is available.
pub struct HeldWorker {
    release: mpsc::Sender<()>,
    work: ThreadWork<()>,
}

impl HeldWorker {
    pub async fn hold() -> HeldWorker {
        let (started_tx, started_rx) = oneshot::channel();
        let (release, released) = mpsc::channel();
        let work = ThreadWork::spawn(move || {
            let _ = started_tx.send(());
            let _ = released.recv();
        });
        let _ = started_rx.await;
        HeldWorker { release, work }
    }

    pub async fn release(self) {
        let _ = self.release.send(());
        self.work.await;
    }
}
