//! Compares declared requests with stored certificates and starts issuance
//! runs for the ones that drifted.
//!
//! At most one run exists per request name. A run that ends in a machine
//! failure puts the request into a cooldown; the cooldown is skipped as soon
//! as the request itself changes. A certificate that could not be written to
//! the secret store is held, and the next pass retries only the write.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::core::types::{CertificateRequest, IssuedCertificate, RequestPhase, RequestStatus};
use crate::issuance::machine::IssuanceMachine;
use crate::issuance::retry::{RetryPolicy, retry_on_kinds};
use crate::reconciler::source::{DesiredStateSource, RequestEvent};
use crate::secrets::{SecretStore, SecretStoreError};
use crate::storage::StatusStore;

/// How long before expiry a certificate is renewed.
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalThreshold {
    /// Renew once less than this much validity remains.
    Fixed(Duration),
    /// Renew once less than this share of the certificate's lifetime remains.
    Fraction(f64),
}

impl Default for RenewalThreshold {
    fn default() -> Self {
        RenewalThreshold::Fraction(1.0 / 3.0)
    }
}

impl RenewalThreshold {
    pub fn for_lifetime(&self, lifetime: chrono::Duration) -> chrono::Duration {
        match self {
            RenewalThreshold::Fixed(duration) => {
                chrono::Duration::from_std(*duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
            }
            RenewalThreshold::Fraction(fraction) => {
                let millis = lifetime.num_milliseconds() as f64 * fraction;
                chrono::Duration::milliseconds(millis.round() as i64)
            }
        }
    }
}

/// Why a request needs (or does not need) a new certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    Missing,
    DomainsChanged,
    RenewalDue,
    UpToDate,
}

/// Renewal is due once the remaining validity drops strictly below the threshold.
pub fn needs_renewal(
    certificate: &IssuedCertificate,
    threshold: &RenewalThreshold,
    now: DateTime<Utc>,
) -> bool {
    certificate.remaining(now) < threshold.for_lifetime(certificate.lifetime())
}

pub fn compute_drift(
    request: &CertificateRequest,
    current: Option<&IssuedCertificate>,
    threshold: &RenewalThreshold,
    now: DateTime<Utc>,
) -> Drift {
    let Some(current) = current else {
        return Drift::Missing;
    };
    let mut held = current.domains.clone();
    held.sort();
    held.dedup();
    if held != request.domains {
        return Drift::DomainsChanged;
    }
    if needs_renewal(current, threshold, now) {
        return Drift::RenewalDue;
    }
    Drift::UpToDate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(Drift),
    AlreadyRunning,
    UpToDate,
    CoolingDown,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct ReconcilerSettings {
    pub threshold: RenewalThreshold,
    pub check_interval: Duration,
    pub failure_backoff: Duration,
    /// Budget for secret store writes after a successful issuance.
    pub secret_retry: RetryPolicy,
    pub clock: Clock,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            threshold: RenewalThreshold::default(),
            check_interval: Duration::from_secs(3600),
            failure_backoff: Duration::from_secs(6 * 3600),
            secret_retry: RetryPolicy::default(),
            clock: Arc::new(Utc::now),
        }
    }
}

/// A reserved slot. `task` stays empty while the request is evaluated.
struct RunHandle {
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Cooldown {
    request: CertificateRequest,
    until: Instant,
}

/// Issued certificate whose secret write failed.
struct Unwritten {
    request: CertificateRequest,
    certificate: IssuedCertificate,
}

pub struct Reconciler {
    machines: HashMap<String, Arc<IssuanceMachine>>,
    secrets: Arc<dyn SecretStore>,
    status: StatusStore,
    source: Arc<dyn DesiredStateSource>,
    settings: ReconcilerSettings,
    runs: Mutex<HashMap<String, RunHandle>>,
    cooldowns: StdMutex<HashMap<String, Cooldown>>,
    unwritten: StdMutex<HashMap<String, Unwritten>>,
    generation: AtomicU64,
    /// Parent of every run's token; cancelled on shutdown.
    stopping: CancellationToken,
    followups: mpsc::UnboundedSender<String>,
    followup_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Reconciler {
    /// `machines` is keyed by issuer name.
    pub fn new(
        machines: HashMap<String, Arc<IssuanceMachine>>,
        secrets: Arc<dyn SecretStore>,
        status: StatusStore,
        source: Arc<dyn DesiredStateSource>,
        settings: ReconcilerSettings,
    ) -> Arc<Self> {
        let (followups, followup_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            machines,
            secrets,
            status,
            source,
            settings,
            runs: Mutex::new(HashMap::new()),
            cooldowns: StdMutex::new(HashMap::new()),
            unwritten: StdMutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stopping: CancellationToken::new(),
            followups,
            followup_rx: StdMutex::new(Some(followup_rx)),
        })
    }

    pub fn status(&self, name: &str) -> anyhow::Result<Option<RequestStatus>> {
        self.status.get(name)
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    /// Names of requests with a run in flight.
    pub async fn in_flight(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            if self.runs.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Reads the stored certificate for `request` and classifies it. An
    /// unreadable bundle counts as missing.
    pub async fn evaluate(&self, request: &CertificateRequest) -> ReconcileResult<Drift> {
        let current = match self.secrets.get(&request.secret_name).await {
            Ok(current) => current,
            Err(SecretStoreError::Corrupt { secret, message }) => {
                warn!("[reconciler] {}: secret '{}' unreadable, reissuing: {}", request.name, secret, message);
                None
            }
            Err(err) => return Err(err.into_read_error()),
        };
        Ok(compute_drift(
            request,
            current.as_deref(),
            &self.settings.threshold,
            (self.settings.clock)(),
        ))
    }

    /// Starts a run for `request` when it drifted and none is in flight.
    ///
    /// The request's slot is reserved before the stored certificate is read,
    /// so concurrent triggers for one name start at most one run while
    /// triggers for other names proceed.
    pub async fn trigger(self: &Arc<Self>, request: CertificateRequest) -> ReconcileResult<TriggerOutcome> {
        let name = request.name.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.stopping.child_token();
        {
            let mut runs = self.runs.lock().await;
            if self.stopping.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            if runs.contains_key(&name) {
                debug!("[reconciler] {} already has a run in flight", name);
                return Ok(TriggerOutcome::AlreadyRunning);
            }
            if self.cooling_down(&request) {
                debug!("[reconciler] {} is cooling down after a failure", name);
                return Ok(TriggerOutcome::CoolingDown);
            }
            runs.insert(
                name.clone(),
                RunHandle {
                    generation,
                    cancel: cancel.clone(),
                    task: None,
                },
            );
        }

        let drift = match self.evaluate(&request).await {
            Ok(Drift::UpToDate) => {
                self.release(&name, generation).await;
                return Ok(TriggerOutcome::UpToDate);
            }
            Ok(drift) => drift,
            Err(err) => {
                self.release(&name, generation).await;
                return Err(err);
            }
        };
        if !self.machines.contains_key(&request.issuer) {
            self.release(&name, generation).await;
            let err = ReconcileError::Configuration(format!("unknown issuer '{}'", request.issuer));
            self.record_failure(&request, RequestPhase::PermanentlyFailed, err.kind(), &err.to_string());
            return Err(err);
        }

        let mut runs = self.runs.lock().await;
        match runs.get_mut(&name) {
            Some(slot) if slot.generation == generation && !cancel.is_cancelled() => {
                info!("[reconciler] {}: {:?}, starting issuance", name, drift);
                let this = Arc::clone(self);
                slot.task = Some(tokio::spawn(async move {
                    this.execute(request, cancel, generation).await;
                }));
                Ok(TriggerOutcome::Started(drift))
            }
            _ => {
                debug!("[reconciler] {} was removed while being evaluated", name);
                Err(ReconcileError::Cancelled)
            }
        }
    }

    /// Cancels any run for `name` and forgets its status. The stored secret is left in place.
    pub async fn remove(&self, name: &str) {
        let handle = self.runs.lock().await.remove(name);
        if let Some(handle) = handle {
            info!("[reconciler] {}: request deleted, cancelling run", name);
            handle.cancel.cancel();
            if let Some(task) = handle.task {
                if let Err(err) = task.await {
                    warn!("[reconciler] {}: run task ended abnormally: {}", name, err);
                }
            }
        }
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.remove(name);
        }
        if let Ok(mut unwritten) = self.unwritten.lock() {
            unwritten.remove(name);
        }
        if let Err(err) = self.status.delete(name) {
            warn!("[reconciler] {}: failed to drop status: {:#}", name, err);
        }
    }

    fn spawn_trigger(self: &Arc<Self>, request: CertificateRequest) {
        tokio::spawn(Arc::clone(self).trigger_logged(request));
    }

    async fn trigger_logged(self: Arc<Self>, request: CertificateRequest) {
        let name = request.name.clone();
        match self.trigger(request).await {
            Ok(_) | Err(ReconcileError::Cancelled) => {}
            Err(err) => warn!("[reconciler] {}: {}", name, err),
        }
    }

    /// One full pass over the declared requests.
    pub async fn tick(self: &Arc<Self>) {
        let requests = self.source.list();
        debug!("[reconciler] tick over {} request(s)", requests.len());
        let mut triggers = JoinSet::new();
        for request in requests {
            triggers.spawn(Arc::clone(self).trigger_logged(request));
        }
        while triggers.join_next().await.is_some() {}
    }

    /// Reacts to source events and periodic ticks until `shutdown` resolves,
    /// then cancels and awaits the runs in flight.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut events = Some(self.source.watch());
        let mut followups = self
            .followup_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take());
        let mut interval = tokio::time::interval(self.settings.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "[reconciler] started; checking every {}s",
            self.settings.check_interval.as_secs()
        );
        // Nothing below awaits a run: evaluation, issuance and removal all
        // happen on their own tasks.
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => self.spawn_tick(),
                event = recv_event(&mut events) => match event {
                    Ok(RequestEvent::Upsert(request)) => self.spawn_trigger(request),
                    Ok(RequestEvent::Deleted(name)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.remove(&name).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[reconciler] missed {} source event(s), resyncing", skipped);
                        self.spawn_tick();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("[reconciler] source closed; continuing with periodic checks");
                        events = None;
                    }
                },
                Some(name) = recv_followup(&mut followups) => {
                    if let Some(request) = self.source.get(&name) {
                        self.spawn_trigger(request);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn spawn_tick(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.tick().await });
    }

    async fn shutdown(&self) {
        let handles: Vec<(String, RunHandle)> = {
            let mut runs = self.runs.lock().await;
            self.stopping.cancel();
            runs.drain().collect()
        };
        if handles.is_empty() {
            return;
        }
        info!("[reconciler] shutting down, cancelling {} run(s)", handles.len());
        for (name, handle) in handles {
            let Some(task) = handle.task else {
                continue;
            };
            if let Err(err) = task.await {
                warn!("[reconciler] {}: run task ended abnormally: {}", name, err);
            }
        }
    }

    async fn release(&self, name: &str, generation: u64) {
        let mut runs = self.runs.lock().await;
        if runs.get(name).map(|handle| handle.generation) == Some(generation) {
            runs.remove(name);
        }
    }

    fn cooling_down(&self, request: &CertificateRequest) -> bool {
        let Ok(mut cooldowns) = self.cooldowns.lock() else {
            return false;
        };
        match cooldowns.get(&request.name) {
            Some(cooldown) if cooldown.request == *request && Instant::now() < cooldown.until => true,
            Some(_) => {
                cooldowns.remove(&request.name);
                false
            }
            None => false,
        }
    }

    async fn execute(self: Arc<Self>, request: CertificateRequest, cancel: CancellationToken, generation: u64) {
        self.run_once(&request, &cancel).await;
        self.release(&request.name, generation).await;

        if cancel.is_cancelled() {
            return;
        }
        // The request changed while this run was in flight.
        if let Some(current) = self.source.get(&request.name) {
            if current != request {
                let _ = self.followups.send(request.name.clone());
            }
        }
    }

    async fn run_once(&self, request: &CertificateRequest, cancel: &CancellationToken) {
        let Some(machine) = self.machines.get(&request.issuer) else {
            return;
        };
        let previous = self.status.get(&request.name).ok().flatten();
        let previous_failures = previous
            .as_ref()
            .map(|status| status.consecutive_failures)
            .unwrap_or(0);
        self.write_status(RequestStatus {
            phase: RequestPhase::Issuing,
            consecutive_failures: previous_failures,
            ..RequestStatus::pending(&request.name)
        });

        let certificate = match self.take_unwritten(request) {
            Some(held) => {
                info!(
                    "[reconciler] {}: retrying secret write for held serial {}",
                    request.name, held.serial
                );
                held
            }
            None => match machine.run(request, cancel).await {
                Ok(outcome) => outcome.certificate,
                Err(failure) if failure.kind == ErrorKind::Cancelled => {
                    info!("[reconciler] {}: run cancelled", request.name);
                    self.restore_status(request, previous);
                    return;
                }
                Err(failure) => {
                    error!("[reconciler] {}: {}", request.name, failure);
                    self.record_failure(
                        request,
                        RequestPhase::PermanentlyFailed,
                        failure.kind,
                        &failure.message,
                    );
                    return;
                }
            },
        };

        if cancel.is_cancelled() {
            info!("[reconciler] {}: cancelled after issuance, discarding certificate", request.name);
            self.restore_status(request, previous);
            return;
        }

        let secrets = &self.secrets;
        let secret_name = request.secret_name.as_str();
        let bundle = &certificate;
        let written = retry_on_kinds(
            &self.settings.secret_retry,
            "write secret",
            &[ErrorKind::SecretStoreWriteFailure],
            || async move {
                secrets
                    .put(secret_name, bundle)
                    .await
                    .map_err(ReconcileError::from)
            },
        )
        .await;

        match written {
            Ok(()) => {
                info!(
                    "[reconciler] {}: stored serial {} in {} secret '{}' (expires {})",
                    request.name,
                    certificate.serial,
                    self.secrets.kind(),
                    secret_name,
                    certificate.not_after
                );
                if let Err(err) = self.status.record_issued(&request.name, &certificate) {
                    warn!("[reconciler] {}: failed to record inventory: {:#}", request.name, err);
                }
                if let Ok(mut cooldowns) = self.cooldowns.lock() {
                    cooldowns.remove(&request.name);
                }
                self.write_status(RequestStatus {
                    phase: RequestPhase::Ready,
                    serial: Some(certificate.serial.clone()),
                    not_after: Some(certificate.not_after),
                    ..RequestStatus::pending(&request.name)
                });
            }
            Err(err) => {
                error!("[reconciler] {}: secret write failed: {}", request.name, err);
                let mut status = self.failed_status(request, RequestPhase::Failed, err.kind(), &err.to_string());
                status.consecutive_failures = previous_failures.saturating_add(1);
                self.write_status(status);
                if let Ok(mut unwritten) = self.unwritten.lock() {
                    unwritten.insert(
                        request.name.clone(),
                        Unwritten {
                            request: request.clone(),
                            certificate,
                        },
                    );
                }
            }
        }
    }

    /// The held certificate for `request`, if it still satisfies it.
    fn take_unwritten(&self, request: &CertificateRequest) -> Option<IssuedCertificate> {
        let held = self.unwritten.lock().ok()?.remove(&request.name)?;
        let drift = compute_drift(
            request,
            Some(&held.certificate),
            &self.settings.threshold,
            (self.settings.clock)(),
        );
        if held.request == *request && drift == Drift::UpToDate {
            Some(held.certificate)
        } else {
            debug!("[reconciler] {}: held certificate no longer fits, reissuing", request.name);
            None
        }
    }

    /// Puts back the status a cancelled run overwrote, unless the request is gone.
    fn restore_status(&self, request: &CertificateRequest, previous: Option<RequestStatus>) {
        if self.source.get(&request.name).is_none() {
            return;
        }
        self.write_status(previous.unwrap_or_else(|| RequestStatus::pending(&request.name)));
    }

    fn record_failure(&self, request: &CertificateRequest, phase: RequestPhase, kind: ErrorKind, message: &str) {
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.insert(
                request.name.clone(),
                Cooldown {
                    request: request.clone(),
                    until: Instant::now() + self.settings.failure_backoff,
                },
            );
        }
        let status = self.failed_status(request, phase, kind, message);
        self.write_status(status);
    }

    fn failed_status(
        &self,
        request: &CertificateRequest,
        phase: RequestPhase,
        kind: ErrorKind,
        message: &str,
    ) -> RequestStatus {
        let previous = self.status.get(&request.name).ok().flatten();
        RequestStatus {
            phase,
            consecutive_failures: previous
                .as_ref()
                .map(|status| status.consecutive_failures)
                .unwrap_or(0)
                .saturating_add(1),
            last_error_kind: Some(kind),
            last_error: Some(message.to_string()),
            serial: previous.as_ref().and_then(|status| status.serial.clone()),
            not_after: previous.and_then(|status| status.not_after),
            ..RequestStatus::pending(&request.name)
        }
    }

    fn write_status(&self, status: RequestStatus) {
        if let Err(err) = self.status.upsert(&status) {
            warn!("[reconciler] {}: failed to store status: {:#}", status.name, err);
        }
    }
}

async fn recv_event(
    rx: &mut Option<broadcast::Receiver<RequestEvent>>,
) -> Result<RequestEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_followup(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
