use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;

use super::{BackendStatus, JobService};
use crate::error::{GatewayError, Result};
use crate::jobdesc::JobDescription;
use crate::session::SessionContext;

/// Adaptador guionado para tests: estados de poll en cola, errores configurables.
pub(crate) struct MockJobService {
    native_id: String,
    submit_error: Mutex<Option<String>>,
    fetch_error: Mutex<Option<String>>,
    /// `Err` simula una falla de poll pasajera. Vacía => sigue Running.
    statuses: Mutex<VecDeque<std::result::Result<BackendStatus, String>>>,
    pub(crate) submitted: Mutex<Vec<(String, JobDescription)>>,
    pub(crate) polls: AtomicUsize,
    pub(crate) fetches: AtomicUsize,
    pub(crate) cancels: AtomicUsize,
}

impl MockJobService {
    pub(crate) fn new() -> Self {
        Self {
            native_id: "job-123".to_string(),
            submit_error: Mutex::new(None),
            fetch_error: Mutex::new(None),
            statuses: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_submit(&self, msg: &str) {
        *self.submit_error.lock().unwrap() = Some(msg.to_string());
    }

    pub(crate) fn fail_fetch(&self, msg: &str) {
        *self.fetch_error.lock().unwrap() = Some(msg.to_string());
    }

    pub(crate) fn push_status(&self, status: BackendStatus) {
        self.statuses.lock().unwrap().push_back(Ok(status));
    }

    pub(crate) fn push_poll_error(&self, msg: &str) {
        self.statuses.lock().unwrap().push_back(Err(msg.to_string()));
    }

    pub(crate) fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl JobService for MockJobService {
    async fn submit(
        &self,
        _session: &SessionContext,
        endpoint: &str,
        job: &JobDescription,
    ) -> Result<String> {
        if let Some(msg) = self.submit_error.lock().unwrap().clone() {
            return Err(GatewayError::Submission(msg));
        }
        self.submitted
            .lock()
            .unwrap()
            .push((endpoint.to_string(), job.clone()));
        Ok(self.native_id.clone())
    }

    async fn status(&self, _session: &SessionContext, _native_id: &str) -> Result<BackendStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.statuses.lock().unwrap().pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(msg)) => Err(GatewayError::Backend(msg)),
            None => Ok(BackendStatus::Running),
        }
    }

    async fn fetch_outputs(
        &self,
        _session: &SessionContext,
        _native_id: &str,
        _job: &JobDescription,
        _dest: &Path,
    ) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.fetch_error.lock().unwrap().clone() {
            Some(msg) => Err(GatewayError::Backend(msg)),
            None => Ok(()),
        }
    }

    async fn cancel(&self, _session: &SessionContext, _native_id: &str) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
