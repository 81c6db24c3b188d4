//! Drives one certificate request from order creation to an issued chain.
//!
//! Each attempt walks `Requested -> OrderCreated -> ChallengesPending ->
//! ChallengesPublished -> AwaitingAuthorityValidation -> Finalizing ->
//! Issued`. Any failure ends the attempt in `Failed`; retryable kinds start
//! a new attempt from `Requested` until the order retry budget runs out.
//! Every challenge record presented during an attempt is removed when the
//! attempt ends, whatever the outcome. A cancelled attempt stops at its next
//! await point and still removes its records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::core::types::{
    CertificateRequest, ChallengeHandle, ChallengeStatus, IssuanceState, IssuedCertificate,
    Order, OrderStatus, Transition,
};
use crate::issuance::authority::CertificateAuthority;
use crate::issuance::csr::generate_csr;
use crate::issuance::retry::{RetryPolicy, retry_with_backoff};
use crate::issuance::solver::ChallengeSolver;

#[derive(Debug, Clone, PartialEq)]
pub struct IssuanceTimeouts {
    pub propagation: Duration,
    pub propagation_interval: Duration,
    pub authority_poll: Duration,
    pub authority_poll_interval: Duration,
    /// Bounds a single attempt end to end.
    pub order_deadline: Duration,
}

impl Default for IssuanceTimeouts {
    fn default() -> Self {
        Self {
            propagation: Duration::from_secs(300),
            propagation_interval: Duration::from_secs(10),
            authority_poll: Duration::from_secs(300),
            authority_poll_interval: Duration::from_secs(5),
            order_deadline: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug)]
pub struct IssuanceOutcome {
    pub certificate: IssuedCertificate,
    pub attempts: u32,
    pub history: Vec<Transition>,
}

/// Terminal failure of a request after its order attempts are spent, or
/// after a kind that is never retried.
#[derive(Debug, Error)]
#[error("issuance failed after {attempts} attempt(s) with {}: {message}", .kind.as_str())]
pub struct IssuanceFailure {
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
    pub history: Vec<Transition>,
}

pub struct IssuanceMachine {
    authority: Arc<dyn CertificateAuthority>,
    solver: Arc<ChallengeSolver>,
    timeouts: IssuanceTimeouts,
    retry: RetryPolicy,
    max_order_retries: u32,
}

struct Attempt<'a> {
    number: u32,
    cancel: &'a CancellationToken,
    history: &'a mut Vec<Transition>,
    handles: Vec<ChallengeHandle>,
    /// Domain and value of every record handed to a provider, noted before
    /// the provider call so an interrupted create can still be removed.
    intents: Vec<(String, String)>,
    order: Option<Order>,
}

impl Attempt<'_> {
    fn record(&mut self, state: IssuanceState) {
        debug!("[issuance] attempt {} -> {:?}", self.number, state);
        self.history.push(Transition {
            attempt: self.number,
            state,
            at: Utc::now(),
            error: None,
        });
    }

    /// Intents whose provider call never returned a handle.
    fn unconfirmed(&self) -> Vec<(String, String)> {
        self.intents
            .iter()
            .filter(|(domain, value)| {
                !self
                    .handles
                    .iter()
                    .any(|handle| &handle.domain == domain && &handle.value == value)
            })
            .cloned()
            .collect()
    }

    fn checkpoint(&self) -> ReconcileResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        Ok(())
    }
}

impl IssuanceMachine {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        solver: Arc<ChallengeSolver>,
        timeouts: IssuanceTimeouts,
        retry: RetryPolicy,
        max_order_retries: u32,
    ) -> Self {
        Self {
            authority,
            solver,
            timeouts,
            retry,
            max_order_retries,
        }
    }

    pub fn authority_name(&self) -> &str {
        self.authority.name()
    }

    /// Runs attempts until one issues a certificate or the failure is final.
    pub async fn run(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> Result<IssuanceOutcome, IssuanceFailure> {
        let max_attempts = self.max_order_retries.saturating_add(1);
        let mut history = Vec::new();
        let mut number = 0u32;

        loop {
            number += 1;
            info!(
                "[issuance] {}: attempt {}/{} for {:?} via {}",
                request.name,
                number,
                max_attempts,
                request.domains,
                self.authority.name()
            );
            let err = match self.attempt(request, number, cancel, &mut history).await {
                Ok(certificate) => {
                    return Ok(IssuanceOutcome {
                        certificate,
                        attempts: number,
                        history,
                    });
                }
                Err(err) => err,
            };

            let kind = err.kind();
            history.push(Transition {
                attempt: number,
                state: IssuanceState::Failed,
                at: Utc::now(),
                error: Some(kind),
            });
            warn!(
                "[issuance] {}: attempt {} failed ({}): {}",
                request.name,
                number,
                kind.as_str(),
                err
            );

            let give_up = kind == ErrorKind::Cancelled
                || !kind.is_order_retryable()
                || number >= max_attempts;
            if give_up {
                return Err(IssuanceFailure {
                    kind,
                    attempts: number,
                    message: err.to_string(),
                    history,
                });
            }

            let delay = self.retry.delay_for(number);
            debug!(
                "[issuance] {}: next attempt in {}ms",
                request.name,
                delay.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    async fn attempt(
        &self,
        request: &CertificateRequest,
        number: u32,
        cancel: &CancellationToken,
        history: &mut Vec<Transition>,
    ) -> ReconcileResult<IssuedCertificate> {
        let mut attempt = Attempt {
            number,
            cancel,
            history,
            handles: Vec::new(),
            intents: Vec::new(),
            order: None,
        };
        let deadline = self.timeouts.order_deadline;
        let result = {
            let drive = tokio::time::timeout(deadline, self.drive(request, &mut attempt));
            tokio::select! {
                outcome = drive => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::DeadlineExceeded {
                        phase: "order",
                        limit: deadline,
                    }),
                },
                _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
            }
        };
        if !attempt.handles.is_empty() {
            debug!(
                "[issuance] {}: removing {} challenge record(s)",
                request.name,
                attempt.handles.len()
            );
            self.solver.cleanup_all(&attempt.handles).await;
        }
        for (domain, value) in attempt.unconfirmed() {
            debug!(
                "[issuance] {}: withdrawing interrupted challenge for {}",
                request.name, domain
            );
            self.solver.withdraw(&domain, &value).await;
        }
        if let (Err(_), Some(order)) = (&result, attempt.order.as_ref()) {
            self.authority.abandon(order).await;
        }
        result
    }

    async fn drive(
        &self,
        request: &CertificateRequest,
        attempt: &mut Attempt<'_>,
    ) -> ReconcileResult<IssuedCertificate> {
        let authority = self.authority.as_ref();
        attempt.checkpoint()?;
        attempt.record(IssuanceState::Requested);

        let domains = request.domains.as_slice();
        let mut order = retry_with_backoff(&self.retry, "create order", || async move {
            authority.create_order(domains).await
        })
        .await?;
        attempt.order = Some(order.clone());
        attempt.record(IssuanceState::OrderCreated);
        attempt.checkpoint()?;

        let order_ref = &order;
        order.challenges = retry_with_backoff(&self.retry, "fetch challenges", || async move {
            authority.get_challenges(order_ref).await
        })
        .await?;
        attempt.record(IssuanceState::ChallengesPending);
        attempt.checkpoint()?;

        self.publish(&mut order, attempt).await?;
        attempt.record(IssuanceState::ChallengesPublished);
        attempt.checkpoint()?;

        for challenge in order
            .challenges
            .iter()
            .filter(|challenge| challenge.status == ChallengeStatus::Presented)
        {
            retry_with_backoff(&self.retry, "notify challenge ready", || async move {
                authority.notify_ready(challenge).await
            })
            .await?;
        }
        attempt.record(IssuanceState::AwaitingAuthorityValidation);
        attempt.checkpoint()?;

        order.status = self.wait_until_ready(&order).await?;
        attempt.record(IssuanceState::Finalizing);
        attempt.checkpoint()?;

        let csr = generate_csr(&request.domains, request.key_algorithm)?;
        let order_ref = &order;
        let csr_ref = &csr;
        let certificate = retry_with_backoff(&self.retry, "finalize order", || async move {
            authority.finalize(order_ref, csr_ref).await
        })
        .await?;
        attempt.record(IssuanceState::Issued);
        info!(
            "[issuance] {}: issued serial {} valid until {}",
            request.name, certificate.serial, certificate.not_after
        );
        Ok(certificate)
    }

    /// Presents every pending challenge, then waits for each to be observable.
    async fn publish(&self, order: &mut Order, attempt: &mut Attempt<'_>) -> ReconcileResult<()> {
        for challenge in order
            .challenges
            .iter_mut()
            .filter(|challenge| challenge.status == ChallengeStatus::Pending)
        {
            attempt
                .intents
                .push((challenge.domain.clone(), challenge.txt_value.clone()));
            let handle = self
                .solver
                .present(&challenge.domain, &challenge.txt_value)
                .await?;
            attempt.handles.push(handle.clone());
            challenge.handle = Some(handle);
            challenge.status = ChallengeStatus::Presented;
        }

        for challenge in order.challenges.iter_mut() {
            let Some(handle) = challenge.handle.as_ref() else {
                continue;
            };
            let visible = self
                .solver
                .wait_until_visible(
                    handle,
                    self.timeouts.propagation,
                    self.timeouts.propagation_interval,
                )
                .await;
            if let Err(err) = visible {
                challenge.status = ChallengeStatus::Invalid;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn wait_until_ready(&self, order: &Order) -> ReconcileResult<OrderStatus> {
        let authority = self.authority.as_ref();
        let started = Instant::now();
        loop {
            let status = retry_with_backoff(&self.retry, "poll order", || async move {
                authority.poll_order_status(order).await
            })
            .await?;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(status),
                OrderStatus::Invalid | OrderStatus::Expired => {
                    return Err(ReconcileError::AuthorityRejected(format!(
                        "order {} is {:?}",
                        order.id, status
                    )));
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if started.elapsed() >= self.timeouts.authority_poll {
                return Err(ReconcileError::DeadlineExceeded {
                    phase: "authority validation",
                    limit: self.timeouts.authority_poll,
                });
            }
            tokio::time::sleep(self.timeouts.authority_poll_interval).await;
        }
    }
}
