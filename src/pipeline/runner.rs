//! Background worker for one session. Status reads and interrupts stay
//! responsive while the worker holds the run slot.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, warn};

use crate::progress::{ProgressError, RunStatus, StatusSnapshot};

use super::orchestrator::{Orchestrator, PipelineError};

pub struct TranslationRunner {
    orchestrator: Arc<Orchestrator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TranslationRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            worker: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Claims the run slot before returning; the file is translated on a
    /// worker thread.
    pub fn start_file(&self, path: &str) -> Result<(), PipelineError> {
        let spec = self.orchestrator.spec(path)?;
        self.orchestrator.session().tracker().try_start()?;
        let orch = Arc::clone(&self.orchestrator);
        self.spawn(move || {
            if let Err(e) = orch.finish_file(orch.run_started_file(&spec)) {
                error!(file = %spec.path, "translation failed: {e}");
            }
        })
    }

    pub fn start_all(&self) -> Result<(), PipelineError> {
        self.orchestrator.session().tracker().try_start()?;
        let orch = Arc::clone(&self.orchestrator);
        self.spawn(move || {
            if let Err(e) = orch.run_all_started() {
                error!("batch translation failed: {e}");
            }
        })
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PipelineError> {
        // A previous worker has released the slot by now; reap it.
        self.join_finished();
        let handle = std::thread::Builder::new()
            .name("translation-worker".to_string())
            .spawn(job);
        match handle {
            Ok(h) => {
                let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(h);
                Ok(())
            }
            Err(e) => {
                let tracker = self.orchestrator.session().tracker();
                if let Err(status_err) = tracker.set_status(RunStatus::Idle, None) {
                    warn!("cannot release run slot: {status_err}");
                }
                Err(PipelineError::Io(e))
            }
        }
    }

    fn join_finished(&self) {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(h) = slot.take() {
                if h.join().is_err() {
                    warn!("translation worker panicked");
                }
            }
        }
    }

    /// Requests a cooperative stop; the worker finishes its current unit.
    pub fn interrupt(&self) -> Result<(), ProgressError> {
        self.orchestrator.session().tracker().request_interrupt()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.orchestrator.session().tracker().snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.session().tracker().status() == RunStatus::Running
    }

    /// Blocks until the current worker, if any, has exited.
    pub fn wait(&self) {
        let handle = {
            let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("translation worker panicked");
            }
        }
    }
}
