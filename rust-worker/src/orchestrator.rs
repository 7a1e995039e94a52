//! Job orchestration core.
//!
//! Each submitted job runs as its own task:
//!
//! 1. wait for the correlated [`MailEvent`], racing the await-mail timeout
//!    and any cancel request
//! 2. lease a browser session from the pool
//! 3. run the workflow's actions, retrying transient failures within the
//!    job's attempt budget
//! 4. check the extracted result and finalize
//!
//! Jobs that carry a session key start from the cookies the last successful
//! job with that key left behind, and save theirs on success.
//!
//! Every status change is written to the [`ResultStore`] before the job
//! moves on, so readers observe the same monotonic sequence the job went
//! through.
//!
//! The mail wait and its timeout are arbitrated by
//! [`CorrelationIndex::expire`]: whichever of `resolve` and `expire` takes
//! the index lock first wins, and the loser backs off.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{
    ActionError, Browser, BrowserSessionPool, FailureKind, PoolError, SessionLease,
    SessionStateStore,
};
use crate::correlation::CorrelationIndex;
use crate::job::{FailureReason, Job, JobFailure, JobId, JobResult, JobStatus};
use crate::mail::MailEvent;
use crate::store::ResultStore;
use crate::util::backoff;
use crate::workflow::{check_url, Action, Workflow, WorkflowError};

/// What a transient failure re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Retry only the failed action.
    Step,
    /// Start the action sequence over.
    Workflow,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub await_mail_timeout: Duration,
    pub pool_acquire_timeout: Duration,
    pub step_timeout: Duration,
    /// Workflow attempts per job, counting the first.
    pub max_attempts: u32,
    pub retry_scope: RetryScope,
    pub retry_backoff: Duration,
    /// Random pause before each action, in milliseconds.
    pub step_delay_ms: (u64, u64),
    /// How long saved cookies stay usable. Zero turns saving off.
    pub session_state_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            await_mail_timeout: Duration::from_secs(300),
            pool_acquire_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_scope: RetryScope::Step,
            retry_backoff: Duration::from_secs(1),
            step_delay_ms: (0, 0),
            session_state_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Body of a job creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub workflow: Workflow,
    #[serde(default)]
    pub correlation_hint: Option<String>,
    /// Jobs sharing a key share browser cookies.
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub job_id: JobId,
    pub correlation_key: String,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid workflow: {0}")]
    Invalid(#[from] WorkflowError),

    #[error("correlation key {0:?} is already awaiting mail")]
    Conflict(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already finished as {1}")]
    AlreadyTerminal(JobId, JobStatus),
}

struct Tracker {
    cancels: HashMap<JobId, CancellationToken>,
    tasks: JoinSet<()>,
    closed: bool,
}

pub struct Orchestrator {
    index: Arc<CorrelationIndex>,
    pool: BrowserSessionPool,
    browser: Arc<dyn Browser>,
    store: Arc<ResultStore>,
    session_state: SessionStateStore,
    settings: OrchestratorSettings,
    /// Parent of every job's cancel token.
    stopping: CancellationToken,
    tracker: Mutex<Tracker>,
}

impl Orchestrator {
    pub fn new(
        index: Arc<CorrelationIndex>,
        pool: BrowserSessionPool,
        browser: Arc<dyn Browser>,
        store: Arc<ResultStore>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            pool,
            browser,
            store,
            session_state: SessionStateStore::new(settings.session_state_ttl),
            settings,
            stopping: CancellationToken::new(),
            tracker: Mutex::new(Tracker {
                cancels: HashMap::new(),
                tasks: JoinSet::new(),
                closed: false,
            }),
        })
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn pool(&self) -> &BrowserSessionPool {
        &self.pool
    }

    pub fn session_state(&self) -> &SessionStateStore {
        &self.session_state
    }

    /// Jobs whose task has not finished yet.
    pub fn active_jobs(&self) -> usize {
        self.tracker().cancels.len()
    }

    /// Create a job, register its correlation key and start its task.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<Submitted, SubmitError> {
        self.submit_as(JobId::generate(), request).await
    }

    /// [`submit`](Self::submit) with a caller-chosen job id.
    pub async fn submit_as(
        self: &Arc<Self>,
        job_id: JobId,
        request: JobRequest,
    ) -> Result<Submitted, SubmitError> {
        request.workflow.validate()?;
        if self.tracker().closed {
            return Err(SubmitError::ShuttingDown);
        }

        let correlation_key = request
            .correlation_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| job_id.to_string());

        let mail_rx = match self.index.register(&correlation_key, job_id.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(job_id = %job_id, correlation_key = %correlation_key, error = %e, "job_correlation_conflict");
                return Err(SubmitError::Conflict(correlation_key));
            }
        };

        let mut job = Job::new(job_id.clone(), request.workflow, correlation_key.clone());
        job.session_key = request
            .session_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self.record(&job).await;
        self.transition(&mut job, JobStatus::AwaitingMail).await;

        let cancel = self.stopping.child_token();
        {
            let mut tracker = self.tracker();
            while tracker.tasks.try_join_next().is_some() {}
            tracker.cancels.insert(job_id.clone(), cancel.clone());
            let this = Arc::clone(self);
            tracker.tasks.spawn(async move {
                let id = job.id.clone();
                this.run_job(job, mail_rx, cancel).await;
                this.tracker().cancels.remove(&id);
            });
        }

        info!(job_id = %job_id, correlation_key = %correlation_key, "job_submitted");
        Ok(Submitted {
            job_id,
            correlation_key,
        })
    }

    /// Ask a job to stop. Interrupts a pending mail or pool wait at once;
    /// a running workflow stops before its next action.
    pub async fn cancel(&self, job_id: &JobId) -> Result<(), CancelError> {
        let status = match self.store.get(job_id).await {
            Ok(snapshot) => snapshot.status,
            Err(_) => return Err(CancelError::NotFound(job_id.clone())),
        };
        if status.is_terminal() {
            return Err(CancelError::AlreadyTerminal(job_id.clone(), status));
        }

        let signalled = match self.tracker().cancels.get(job_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        if !signalled {
            // The task finished between the two lookups.
            let status = self.store.get(job_id).await.map(|s| s.status).unwrap_or(status);
            return Err(CancelError::AlreadyTerminal(job_id.clone(), status));
        }
        info!(job_id = %job_id, "job_cancel_requested");
        Ok(())
    }

    /// Hand a mail event to the job waiting for it, if any.
    pub async fn dispatch(&self, event: MailEvent) -> Option<JobId> {
        let message_id = event.message_id.clone();
        match self.index.resolve(event).await {
            Ok(job_id) => {
                debug!(job_id = %job_id, message_id = %message_id, "mail_dispatched");
                Some(job_id)
            }
            Err(_) => {
                info!(message_id = %message_id, "mail_no_waiting_job");
                None
            }
        }
    }

    /// Forward every event from the watcher until the channel closes.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut events: mpsc::Receiver<MailEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.dispatch(event).await;
            }
            info!("mail_dispatcher_stopped");
        })
    }

    /// Refuse new jobs, cancel the running ones and wait up to `grace` for
    /// their tasks to finish.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = {
            let mut tracker = self.tracker();
            tracker.closed = true;
            self.stopping.cancel();
            std::mem::take(&mut tracker.tasks)
        };

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "job_shutdown_grace_elapsed");
            tasks.abort_all();
        }
        info!("orchestrator_stopped");
    }

    async fn record(&self, job: &Job) {
        self.store.put(job.snapshot()).await;
        info!(
            job_id = %job.id,
            status = %job.status,
            attempt = job.attempt,
            "job_status_changed"
        );
    }

    async fn transition(&self, job: &mut Job, next: JobStatus) {
        if !job.advance(next) {
            error!(job_id = %job.id, from = %job.status, to = %next, "job_illegal_transition");
            return;
        }
        self.record(job).await;
    }

    async fn finish_with(&self, job: &mut Job, status: JobStatus, failure: JobFailure) {
        warn!(
            job_id = %job.id,
            reason = ?failure.reason,
            error = %failure.message,
            "job_failed"
        );
        if !job.fail(status, failure) {
            error!(job_id = %job.id, from = %job.status, to = %status, "job_illegal_transition");
            return;
        }
        self.record(job).await;
    }

    async fn run_job(
        &self,
        mut job: Job,
        mail_rx: oneshot::Receiver<MailEvent>,
        cancel: CancellationToken,
    ) {
        let event = match self.await_mail(&job.id, mail_rx, &cancel).await {
            Ok(event) => event,
            Err((status, failure)) => {
                self.finish_with(&mut job, status, failure).await;
                return;
            }
        };

        info!(
            job_id = %job.id,
            message_id = %event.message_id,
            payload_len = event.payload.len(),
            "job_mail_matched"
        );
        job.attempt = 1;
        self.transition(&mut job, JobStatus::RunningWorkflow).await;

        let actions: Vec<Action> = job
            .workflow
            .actions
            .iter()
            .map(|action| action.render(&event.payload))
            .collect();

        let bad_target = actions.iter().enumerate().find_map(|(step, action)| match action {
            Action::Navigate { url } => check_url(url).err().map(|message| (step, message)),
            _ => None,
        });
        if let Some((step, message)) = bad_target {
            let failure = JobFailure::new(
                FailureReason::StepFailed,
                format!("step {} (navigate): {}", step + 1, message),
            );
            self.finish_with(&mut job, JobStatus::Failed, failure).await;
            return;
        }

        let mut lease = None;
        let outcome = self
            .run_workflow(&mut job, &actions, &mut lease, &cancel)
            .await;
        if let (Ok(_), Some(session)) = (&outcome, lease.as_ref()) {
            self.save_state(&job, session).await;
        }
        if let Some(lease) = lease.take() {
            self.pool.release(lease, true).await;
        }

        let extracted = match outcome {
            Ok(extracted) => extracted,
            Err(failure) => {
                self.finish_with(&mut job, JobStatus::Failed, failure).await;
                return;
            }
        };

        let missing: Vec<&str> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Extract { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .filter(|name| extracted.get(*name).map_or(true, |v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            let failure = JobFailure::new(
                FailureReason::ResultMissing,
                format!("extract steps returned nothing: {}", missing.join(", ")),
            );
            self.finish_with(&mut job, JobStatus::Failed, failure).await;
            return;
        }

        job.last_error = None;
        self.transition(&mut job, JobStatus::Finalizing).await;
        job.result = Some(JobResult {
            payload: event.payload,
            extracted,
        });
        self.transition(&mut job, JobStatus::Succeeded).await;
    }

    async fn await_mail(
        &self,
        job_id: &JobId,
        mut mail_rx: oneshot::Receiver<MailEvent>,
        cancel: &CancellationToken,
    ) -> Result<MailEvent, (JobStatus, JobFailure)> {
        let timeout = self.settings.await_mail_timeout;

        let lost = tokio::select! {
            biased;
            received = &mut mail_rx => {
                return received.map_err(|_| {
                    (
                        JobStatus::Failed,
                        JobFailure::new(FailureReason::Cancelled, "correlation entry dropped"),
                    )
                });
            }
            _ = sleep(timeout) => (
                JobStatus::TimedOut,
                JobFailure::new(
                    FailureReason::MailTimeout,
                    format!("no matching mail within {}s", timeout.as_secs()),
                ),
            ),
            _ = cancel.cancelled() => (
                JobStatus::Failed,
                JobFailure::new(FailureReason::Cancelled, "cancelled while awaiting mail"),
            ),
        };

        if self.index.expire(job_id).await {
            return Err(lost);
        }

        // The event was resolved before expire took the lock; it is already
        // in the channel.
        debug!(job_id = %job_id, "job_mail_won_race");
        mail_rx.await.map_err(|_| lost)
    }

    /// Lease a session unless the job is cancelled first. A session still
    /// being created when the cancel lands is kept by the pool.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<SessionLease, JobFailure> {
        let acquired = tokio::select! {
            acquired = self.pool.acquire(self.settings.pool_acquire_timeout) => acquired,
            _ = cancel.cancelled() => {
                return Err(JobFailure::new(
                    FailureReason::Cancelled,
                    "cancelled while waiting for a browser session",
                ));
            }
        };
        acquired.map_err(|e| {
            let reason = match e {
                PoolError::PoolExhausted(_) => FailureReason::PoolExhausted,
                PoolError::PoolUnavailable { .. } | PoolError::Closed => FailureReason::PoolUnavailable,
            };
            JobFailure::new(reason, e.to_string())
        })
    }

    /// Load the cookies saved under the job's session key into a fresh lease.
    async fn restore_state(&self, job: &Job, lease: &SessionLease) {
        let Some(key) = job.session_key.as_deref() else {
            return;
        };
        let Some(state) = self.session_state.load(key) else {
            debug!(job_id = %job.id, session_key = key, "job_session_state_absent");
            return;
        };
        match self.browser.import_cookies(lease.handle(), &state.cookies).await {
            Ok(()) => info!(
                job_id = %job.id,
                session_key = key,
                cookies = state.cookies.len(),
                saved_at = %state.saved_at,
                "job_session_state_restored"
            ),
            Err(e) => warn!(job_id = %job.id, session_key = key, error = %e, "job_session_state_restore_failed"),
        }
    }

    async fn save_state(&self, job: &Job, lease: &SessionLease) {
        let Some(key) = job.session_key.as_deref() else {
            return;
        };
        if !self.session_state.is_enabled() {
            return;
        }
        match self.browser.export_cookies(lease.handle()).await {
            Ok(cookies) => {
                let count = cookies.len();
                if self.session_state.save(key, cookies) {
                    info!(job_id = %job.id, session_key = key, cookies = count, "job_session_state_saved");
                }
            }
            Err(e) => warn!(job_id = %job.id, session_key = key, error = %e, "job_session_state_save_failed"),
        }
    }

    async fn run_action(&self, lease: &SessionLease, action: &Action) -> Result<Option<String>, ActionError> {
        let delay = backoff::random_delay(self.settings.step_delay_ms);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let timeout = self.settings.step_timeout;
        match tokio::time::timeout(timeout, self.browser.run_action(lease.handle(), action)).await {
            Ok(result) => result.map(|r| r.value),
            Err(_) => Err(ActionError::transient(format!(
                "{} timed out after {}ms",
                action.kind(),
                timeout.as_millis()
            ))),
        }
    }

    /// Run `actions` to completion. Any lease still held on return is
    /// healthy; broken sessions are released here as soon as they break.
    async fn run_workflow(
        &self,
        job: &mut Job,
        actions: &[Action],
        lease: &mut Option<SessionLease>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, JobFailure> {
        let mut extracted = BTreeMap::new();
        let mut step = 0;

        while step < actions.len() {
            if cancel.is_cancelled() {
                return Err(JobFailure::new(
                    FailureReason::Cancelled,
                    format!("cancelled before step {}", step + 1),
                ));
            }

            let session = match lease.take() {
                Some(session) => session,
                None => {
                    let session = self.acquire(cancel).await?;
                    self.restore_state(job, &session).await;
                    session
                }
            };

            let action = &actions[step];
            let outcome = self.run_action(&session, action).await;
            let broken = matches!(&outcome, Err(e) if e.kind == FailureKind::SessionFatal);
            if broken {
                self.pool.release(session, false).await;
            } else {
                *lease = Some(session);
            }

            let error = match outcome {
                Ok(value) => {
                    debug!(job_id = %job.id, step = step + 1, action = action.kind(), "job_step_completed");
                    if let Action::Extract { name, .. } = action {
                        extracted.insert(name.clone(), value.unwrap_or_default());
                    }
                    step += 1;
                    continue;
                }
                Err(e) => e,
            };

            warn!(
                job_id = %job.id,
                step = step + 1,
                action = action.kind(),
                kind = ?error.kind,
                attempt = job.attempt,
                error = %error.message,
                "job_step_failed"
            );

            if error.kind == FailureKind::Fatal {
                return Err(JobFailure::new(
                    FailureReason::StepFailed,
                    format!("step {} ({}): {}", step + 1, action.kind(), error.message),
                ));
            }
            if job.attempt >= self.settings.max_attempts {
                return Err(JobFailure::new(
                    FailureReason::AttemptsExhausted,
                    format!(
                        "step {} ({}) failed after {} attempts: {}",
                        step + 1,
                        action.kind(),
                        job.attempt,
                        error.message
                    ),
                ));
            }

            job.attempt += 1;
            job.last_error = Some(JobFailure::new(FailureReason::StepFailed, error.message));
            self.transition(job, JobStatus::RunningWorkflow).await;

            sleep(backoff::exponential(self.settings.retry_backoff, job.attempt - 1)).await;
            if self.settings.retry_scope == RetryScope::Workflow {
                step = 0;
                extracted.clear();
            }
        }

        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ActionResult, PoolSettings, SessionHandle};
    use crate::correlation::MatchRule;
    use async_trait::async_trait;
    use chrono::Utc;

    struct ScriptedBrowser {
        failures: Mutex<Vec<ActionError>>,
    }

    #[async_trait]
    impl Browser for ScriptedBrowser {
        async fn new_session(&self) -> Result<SessionHandle, ActionError> {
            Ok(SessionHandle::new("s"))
        }

        async fn close_session(&self, _handle: &SessionHandle) -> Result<(), ActionError> {
            Ok(())
        }

        async fn run_action(&self, _h: &SessionHandle, action: &Action) -> Result<ActionResult, ActionError> {
            if let Some(e) = self.failures.lock().unwrap().pop() {
                return Err(e);
            }
            match action {
                Action::Extract { .. } => Ok(ActionResult::value("Welcome")),
                _ => Ok(ActionResult::done()),
            }
        }
    }

    fn orchestrator(failures: Vec<ActionError>, settings: OrchestratorSettings) -> Arc<Orchestrator> {
        let browser: Arc<dyn Browser> = Arc::new(ScriptedBrowser {
            failures: Mutex::new(failures),
        });
        let pool = BrowserSessionPool::new(browser.clone(), PoolSettings::default());
        Orchestrator::new(
            Arc::new(CorrelationIndex::new(MatchRule::default())),
            pool,
            browser,
            Arc::new(ResultStore::new(Duration::from_secs(3600))),
            settings,
        )
    }

    fn request(hint: &str) -> JobRequest {
        JobRequest {
            workflow: Workflow::new(vec![
                Action::Navigate {
                    url: "https://example.com/verify?code={{payload}}".to_string(),
                },
                Action::Extract {
                    name: "banner".to_string(),
                    selector: "h1".to_string(),
                    attribute: None,
                },
            ]),
            correlation_hint: Some(hint.to_string()),
            session_key: None,
        }
    }

    fn event(subject: &str) -> MailEvent {
        MailEvent {
            message_id: "<m1@example.com>".to_string(),
            sender: "noreply@example.com".to_string(),
            recipient: "inbox@example.com".to_string(),
            subject: subject.to_string(),
            received_at: Utc::now(),
            payload: "123456".to_string(),
        }
    }

    async fn wait_terminal(orch: &Orchestrator, id: &JobId) -> crate::job::JobSnapshot {
        loop {
            if let Ok(snapshot) = orch.store().get(id).await {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_succeeds_with_extracted_result() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        let submitted = orch.submit(request("job-7")).await.unwrap();
        assert_eq!(submitted.correlation_key, "job-7");

        assert_eq!(orch.dispatch(event("job-7 confirmation")).await, Some(submitted.job_id.clone()));

        let snapshot = wait_terminal(&orch, &submitted.job_id).await;
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        let result = snapshot.result.unwrap();
        assert_eq!(result.payload, "123456");
        assert_eq!(result.extracted.get("banner").map(String::as_str), Some("Welcome"));
        assert_eq!(orch.pool().stats().leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_id_is_default_correlation_key() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        let mut req = request("");
        req.correlation_hint = None;
        let submitted = orch.submit(req).await.unwrap();
        assert_eq!(submitted.correlation_key, submitted.job_id.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_correlation_rejected() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        orch.submit(request("dup")).await.unwrap();
        let err = orch.submit(request("DUP")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_workflow_rejected() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        let err = orch
            .submit(JobRequest {
                workflow: Workflow::new(vec![]),
                correlation_hint: None,
                session_key: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(WorkflowError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_step_fails_job() {
        let orch = orchestrator(
            vec![ActionError::fatal("invalid selector")],
            OrchestratorSettings::default(),
        );
        let submitted = orch.submit(request("fatal")).await.unwrap();
        orch.dispatch(event("fatal")).await;

        let snapshot = wait_terminal(&orch, &submitted.job_id).await;
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.error.unwrap().reason, FailureReason::StepFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let failures = vec![
            ActionError::transient("navigation timeout"),
            ActionError::transient("navigation timeout"),
            ActionError::transient("navigation timeout"),
        ];
        let orch = orchestrator(failures, OrchestratorSettings::default());
        let submitted = orch.submit(request("flaky")).await.unwrap();
        orch.dispatch(event("flaky")).await;

        let snapshot = wait_terminal(&orch, &submitted.job_id).await;
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.attempt, 3);
        assert_eq!(snapshot.error.unwrap().reason, FailureReason::AttemptsExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_mail() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        let submitted = orch.submit(request("cancel-me")).await.unwrap();

        orch.cancel(&submitted.job_id).await.unwrap();
        let snapshot = wait_terminal(&orch, &submitted.job_id).await;
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.unwrap().reason, FailureReason::Cancelled);

        // The key is free again and the finished job cannot be cancelled twice.
        orch.submit(request("cancel-me")).await.unwrap();
        while orch.active_jobs() > 1 {
            sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            orch.cancel(&submitted.job_id).await,
            Err(CancelError::AlreadyTerminal(_, JobStatus::Failed))
        ));
        assert!(matches!(
            orch.cancel(&JobId::from("missing")).await,
            Err(CancelError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_mail_ignored() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        orch.submit(request("expected")).await.unwrap();
        assert_eq!(orch.dispatch(event("something else")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiting_jobs() {
        let orch = orchestrator(vec![], OrchestratorSettings::default());
        let submitted = orch.submit(request("pending")).await.unwrap();

        orch.shutdown(Duration::from_secs(5)).await;

        let snapshot = orch.store().get(&submitted.job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(matches!(
            orch.submit(request("late")).await,
            Err(SubmitError::ShuttingDown)
        ));
    }
}
