//! ACME order state machine
//!
//! One call to [`AcmeOrchestrator::issue`] is one issuance attempt:
//!
//! 1. resume the order recorded in the request journal, or create one
//! 2. check the authorization set against the requested names
//! 3. pick a challenge per pending authorization (http-01, then dns-01)
//! 4. present every challenge, tell the CA, poll until valid or invalid
//! 5. poll the order until ready and finalize with the CSR
//! 6. poll until valid and download the chain
//!
//! Every wait is bounded by the request deadline. Presented challenges
//! are always cleaned up.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tessera_common::RetryPolicy;
use tessera_config::{ControllerConfig, PendingOrder};

use super::challenge::{ChallengeRequest, ChallengeSolver};
use super::client::{
    AcmeApi, AcmeError, AuthorizationSnapshot, AuthorizationStatus, ChallengeKind,
    ChallengeSnapshot, OrderSnapshot, OrderStatus,
};
use crate::issuer::{retry_transient, IssueError, IssueRequest, NameFailure};
use crate::pki::{self, NameSet};

/// Challenge types in order of preference
const CHALLENGE_PREFERENCE: [ChallengeKind; 2] = [ChallengeKind::Http01, ChallengeKind::Dns01];

/// Protocol phase, used to classify terminal CA answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Order,
    Authorization,
    Finalize,
}

impl Phase {
    fn map(self, err: AcmeError, names: &NameSet) -> IssueError {
        match err {
            AcmeError::Transient(message) => IssueError::NetworkTransient(message),
            AcmeError::RateLimited {
                detail,
                retry_after,
            } => IssueError::RateLimited {
                message: detail,
                retry_after,
            },
            AcmeError::Credentials(message) => IssueError::AuthenticationFailed(message),
            AcmeError::Rejected { problem_type, .. }
                if problem_type.as_deref()
                    == Some("urn:ietf:params:acme:error:accountDoesNotExist") =>
            {
                IssueError::AuthenticationFailed(
                    "ACME account no longer exists on the server".to_string(),
                )
            }
            other => match self {
                Phase::Order | Phase::Authorization => IssueError::challenge_failed(
                    names
                        .names()
                        .iter()
                        .map(|n| NameFailure::new(n, other.to_string()))
                        .collect(),
                ),
                Phase::Finalize => IssueError::FinalizeFailed(other.to_string()),
            },
        }
    }

    /// The attempt deadline passed while `operation` was outstanding
    fn timed_out(self, operation: &str, names: &NameSet) -> IssueError {
        let reason = format!("attempt deadline passed during {}", operation);
        match self {
            Phase::Order | Phase::Authorization => IssueError::challenge_failed(
                names
                    .names()
                    .iter()
                    .map(|n| NameFailure::new(n, reason.clone()))
                    .collect(),
            ),
            Phase::Finalize => IssueError::FinalizeFailed(reason),
        }
    }
}

/// Challenge chosen for one authorization
struct PlannedChallenge {
    name: String,
    challenge: ChallengeSnapshot,
    solver: Arc<dyn ChallengeSolver>,
}

pub struct AcmeOrchestrator {
    api: Arc<dyn AcmeApi>,
    solvers: Vec<Arc<dyn ChallengeSolver>>,
    poll: RetryPolicy,
    transient: RetryPolicy,
}

impl AcmeOrchestrator {
    pub fn new(
        api: Arc<dyn AcmeApi>,
        solvers: Vec<Arc<dyn ChallengeSolver>>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            api,
            solvers,
            poll: config.acme_poll.clone(),
            transient: config.transient_retry.clone(),
        }
    }

    /// Run one attempt and return the leaf-first PEM chain
    pub async fn issue(&self, request: &IssueRequest) -> Result<String, IssueError> {
        let csr = pki::build_csr(&request.key_pem, &request.names)?;
        let order = self.locate_order(request).await?;

        let result = self.drive(&order, request, &csr.der).await;

        // Interrupted attempts keep the order so the next one resumes it
        let keep_order = matches!(
            &result,
            Err(IssueError::NetworkTransient(_)) | Err(IssueError::RateLimited { .. })
        );
        if !keep_order {
            if let Err(e) = request.journal.record(None).await {
                warn!(order = %order.url, error = %e, "Failed to clear recorded ACME order");
            }
        }
        self.api.forget(&order.url);

        match &result {
            Ok(_) => info!(
                order = %order.url,
                common_name = request.names.common_name(),
                "ACME order completed"
            ),
            Err(e) => debug!(order = %order.url, error = %e, "ACME attempt failed"),
        }
        result
    }

    /// Run an ACME call, retrying transient failures until the deadline.
    /// A call still outstanding at the deadline is abandoned and reported
    /// as a failure of `phase`.
    async fn call<T, F, Fut>(
        &self,
        request: &IssueRequest,
        phase: Phase,
        operation: &str,
        mut op: F,
    ) -> Result<T, IssueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AcmeError>>,
    {
        let names = &request.names;
        let deadline = request.deadline;
        retry_transient(&self.transient, deadline, operation, || {
            let fut = op();
            async move {
                match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result.map_err(|e| phase.map(e, names)),
                    Err(_) => {
                        warn!(operation = operation, "ACME call exceeded the attempt deadline");
                        Err(phase.timed_out(operation, names))
                    }
                }
            }
        })
        .await
    }

    async fn locate_order(&self, request: &IssueRequest) -> Result<OrderSnapshot, IssueError> {
        if let Some(pending) = request.journal.load().await {
            if request.names.matches(&pending.names) {
                let fetched = self
                    .call(request, Phase::Order, "fetch recorded order", || {
                        self.api.order(&pending.url)
                    })
                    .await;
                match fetched {
                    Ok(order) if order.status.is_resumable() => {
                        debug!(order = %order.url, status = ?order.status, "Resuming ACME order");
                        return Ok(order);
                    }
                    Ok(order) => {
                        debug!(order = %order.url, status = ?order.status, "Abandoning recorded ACME order");
                        self.api.forget(&order.url);
                    }
                    Err(e @ IssueError::NetworkTransient(_))
                    | Err(e @ IssueError::RateLimited { .. }) => return Err(e),
                    Err(e) => {
                        debug!(order = %pending.url, error = %e, "Recorded ACME order is unusable");
                    }
                }
            } else {
                debug!(order = %pending.url, "Recorded ACME order is for other names");
            }
        }

        let names = request.names.names().to_vec();
        let order = self
            .call(request, Phase::Order, "create order", || {
                self.api.new_order(&names)
            })
            .await?;
        debug!(order = %order.url, names = ?names, "Created ACME order");

        if let Err(e) = request
            .journal
            .record(Some(PendingOrder {
                url: order.url.clone(),
                names,
            }))
            .await
        {
            warn!(order = %order.url, error = %e, "Failed to record ACME order");
        }
        Ok(order)
    }

    async fn drive(
        &self,
        order: &OrderSnapshot,
        request: &IssueRequest,
        csr_der: &[u8],
    ) -> Result<String, IssueError> {
        if order.status == OrderStatus::Pending {
            self.validate_authorizations(&order.url, request).await?;
        }

        let order = self
            .poll_order(&order.url, request, "ready", |s| s != OrderStatus::Pending)
            .await?;
        if order.status != OrderStatus::Ready {
            return Err(order_failure(&order));
        }

        let finalized = self
            .call(request, Phase::Finalize, "finalize order", || {
                self.api.finalize(&order.url, csr_der)
            })
            .await?;
        trace!(order = %order.url, status = ?finalized.status, "Finalized ACME order");

        let done = if finalized.status == OrderStatus::Valid {
            finalized
        } else {
            self.poll_order(&order.url, request, "valid", |s| {
                !matches!(s, OrderStatus::Ready | OrderStatus::Processing)
            })
            .await?
        };
        if done.status != OrderStatus::Valid {
            return Err(order_failure(&done));
        }

        self.call(request, Phase::Finalize, "download certificate", || {
            self.api.certificate(&order.url)
        })
        .await?
        .ok_or_else(|| IssueError::FinalizeFailed("valid order has no certificate".to_string()))
    }

    async fn poll_order(
        &self,
        url: &str,
        request: &IssueRequest,
        waiting_for: &str,
        settled: impl Fn(OrderStatus) -> bool,
    ) -> Result<OrderSnapshot, IssueError> {
        let mut backoff = self.poll.backoff();
        loop {
            let order = self
                .call(request, Phase::Finalize, "fetch order", || self.api.order(url))
                .await?;
            if settled(order.status) {
                return Ok(order);
            }

            let delay = backoff.next().unwrap_or(self.poll.max);
            if Instant::now() + delay >= request.deadline {
                return Err(IssueError::FinalizeFailed(format!(
                    "timed out waiting for order to become {}",
                    waiting_for
                )));
            }
            trace!(order = %url, status = ?order.status, delay_ms = delay.as_millis() as u64, "Waiting for ACME order");
            tokio::time::sleep(delay).await;
        }
    }

    async fn validate_authorizations(
        &self,
        order_url: &str,
        request: &IssueRequest,
    ) -> Result<(), IssueError> {
        let authorizations = self
            .call(request, Phase::Authorization, "fetch authorizations", || {
                self.api.authorizations(order_url)
            })
            .await?;

        let offered: Vec<String> = authorizations.iter().map(|a| a.name.clone()).collect();
        if !request.names.matches(&offered) {
            return Err(IssueError::MalformedResponse(format!(
                "order authorizations {:?} do not match requested names {:?}",
                offered,
                request.names.names()
            )));
        }

        let mut plan = Vec::new();
        let mut failures = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => {
                    trace!(name = %authz.name, "Authorization already valid");
                }
                AuthorizationStatus::Pending => match self.select_challenge(authz) {
                    Some(planned) => plan.push(planned),
                    None => failures.push(NameFailure::new(
                        &authz.name,
                        format!(
                            "no supported challenge among offered [{}]",
                            authz
                                .challenges
                                .iter()
                                .map(|c| c.kind.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    )),
                },
                AuthorizationStatus::Invalid | AuthorizationStatus::Gone => {
                    failures.push(authorization_failure(authz))
                }
            }
        }
        if !failures.is_empty() {
            return Err(IssueError::challenge_failed(failures));
        }
        if plan.is_empty() {
            return Ok(());
        }

        let mut presented = Vec::with_capacity(plan.len());
        let result = self
            .present_and_wait(order_url, request, &plan, &mut presented)
            .await;
        for (solver, challenge) in &presented {
            solver.cleanup(challenge).await;
            trace!(name = %challenge.name, solver = solver.name(), "Cleaned up challenge");
        }
        result
    }

    fn select_challenge(&self, authz: &AuthorizationSnapshot) -> Option<PlannedChallenge> {
        CHALLENGE_PREFERENCE.iter().find_map(|kind| {
            let challenge = authz.challenges.iter().find(|c| &c.kind == kind)?;
            let solver = self
                .solvers
                .iter()
                .find(|s| s.supports(kind, &authz.name))?;
            Some(PlannedChallenge {
                name: authz.name.clone(),
                challenge: challenge.clone(),
                solver: Arc::clone(solver),
            })
        })
    }

    async fn present_and_wait(
        &self,
        order_url: &str,
        request: &IssueRequest,
        plan: &[PlannedChallenge],
        presented: &mut Vec<(Arc<dyn ChallengeSolver>, ChallengeRequest)>,
    ) -> Result<(), IssueError> {
        for step in plan {
            let challenge = ChallengeRequest::new(&step.name, &step.challenge);
            if let Err(e) = step.solver.present(&challenge).await {
                return Err(IssueError::challenge_failed(vec![NameFailure::new(
                    &step.name,
                    e.to_string(),
                )]));
            }
            debug!(
                name = %step.name,
                kind = %step.challenge.kind,
                solver = step.solver.name(),
                "Presented ACME challenge"
            );
            presented.push((Arc::clone(&step.solver), challenge));
        }

        for step in plan {
            self.call(request, Phase::Authorization, "set challenge ready", || {
                self.api.set_challenge_ready(order_url, &step.challenge.url)
            })
            .await?;
        }

        let mut backoff = self.poll.backoff();
        loop {
            let authorizations = self
                .call(request, Phase::Authorization, "poll authorizations", || {
                    self.api.authorizations(order_url)
                })
                .await?;

            let mut failures = Vec::new();
            let mut pending = Vec::new();
            for authz in &authorizations {
                match authz.status {
                    AuthorizationStatus::Valid => {}
                    AuthorizationStatus::Pending => pending.push(authz.name.clone()),
                    AuthorizationStatus::Invalid | AuthorizationStatus::Gone => {
                        failures.push(authorization_failure(authz))
                    }
                }
            }
            if !failures.is_empty() {
                return Err(IssueError::challenge_failed(failures));
            }
            if pending.is_empty() {
                debug!(order = %order_url, "All authorizations valid");
                return Ok(());
            }

            let delay = backoff.next().unwrap_or(self.poll.max);
            if Instant::now() + delay >= request.deadline {
                return Err(IssueError::challenge_failed(
                    pending
                        .into_iter()
                        .map(|name| NameFailure::new(name, "timed out waiting for validation"))
                        .collect(),
                ));
            }
            trace!(pending = ?pending, delay_ms = delay.as_millis() as u64, "Waiting for authorizations");
            tokio::time::sleep(delay).await;
        }
    }
}

fn authorization_failure(authz: &AuthorizationSnapshot) -> NameFailure {
    let reason = authz.failure_reason().unwrap_or_else(|| match authz.status {
        AuthorizationStatus::Gone => "authorization expired or was deactivated".to_string(),
        _ => "authorization is invalid".to_string(),
    });
    NameFailure::new(&authz.name, reason)
}

fn order_failure(order: &OrderSnapshot) -> IssueError {
    IssueError::FinalizeFailed(match &order.error {
        Some(error) => format!("order is {:?}: {}", order.status, error),
        None => format!("order is {:?}", order.status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::challenge::{ChallengeManager, Http01Solver};
    use crate::issuer::MemoryJournal;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Outcome {
        Validates,
        Fails(&'static str),
        StaysPending,
    }

    #[derive(Default)]
    struct FakeState {
        orders: HashMap<String, (OrderStatus, Vec<String>)>,
        challenges: HashMap<String, String>,
        ready: HashSet<String>,
        new_orders: u32,
        ready_calls: u32,
        transient_failures: u32,
    }

    struct FakeAcme {
        offered: Vec<ChallengeKind>,
        outcome: Outcome,
        hang_on_ready: bool,
        state: Mutex<FakeState>,
    }

    impl FakeAcme {
        fn new(offered: Vec<ChallengeKind>, outcome: Outcome) -> Self {
            Self {
                offered,
                outcome,
                hang_on_ready: false,
                state: Mutex::new(FakeState::default()),
            }
        }

        /// Never answer challenge-ready requests
        fn hanging_on_ready(mut self) -> Self {
            self.hang_on_ready = true;
            self
        }

        fn fail_next(&self, n: u32) {
            self.state.lock().transient_failures = n;
        }

        fn new_orders(&self) -> u32 {
            self.state.lock().new_orders
        }

        fn ready_calls(&self) -> u32 {
            self.state.lock().ready_calls
        }

        fn authz_status(&self, state: &FakeState, name: &str) -> AuthorizationStatus {
            if !state.ready.contains(name) {
                return AuthorizationStatus::Pending;
            }
            match self.outcome {
                Outcome::Validates => AuthorizationStatus::Valid,
                Outcome::Fails(_) => AuthorizationStatus::Invalid,
                Outcome::StaysPending => AuthorizationStatus::Pending,
            }
        }
    }

    #[async_trait]
    impl AcmeApi for FakeAcme {
        async fn new_order(&self, names: &[String]) -> Result<OrderSnapshot, AcmeError> {
            let mut state = self.state.lock();
            if state.transient_failures > 0 {
                state.transient_failures -= 1;
                return Err(AcmeError::Transient("503 Service Unavailable".into()));
            }
            state.new_orders += 1;
            let url = format!("https://acme.test/order/{}", state.new_orders);
            state
                .orders
                .insert(url.clone(), (OrderStatus::Pending, names.to_vec()));
            Ok(OrderSnapshot {
                url,
                status: OrderStatus::Pending,
                error: None,
            })
        }

        async fn order(&self, url: &str) -> Result<OrderSnapshot, AcmeError> {
            let mut state = self.state.lock();
            let (status, names) = state
                .orders
                .get(url)
                .cloned()
                .ok_or_else(|| AcmeError::UnknownOrder(url.to_string()))?;
            let status = match status {
                OrderStatus::Pending
                    if names
                        .iter()
                        .all(|n| self.authz_status(&state, n) == AuthorizationStatus::Valid) =>
                {
                    OrderStatus::Ready
                }
                OrderStatus::Processing => OrderStatus::Valid,
                other => other,
            };
            if let Some(entry) = state.orders.get_mut(url) {
                entry.0 = status;
            }
            Ok(OrderSnapshot {
                url: url.to_string(),
                status,
                error: None,
            })
        }

        async fn authorizations(
            &self,
            order_url: &str,
        ) -> Result<Vec<AuthorizationSnapshot>, AcmeError> {
            let mut state = self.state.lock();
            let names = state
                .orders
                .get(order_url)
                .map(|(_, names)| names.clone())
                .ok_or_else(|| AcmeError::UnknownOrder(order_url.to_string()))?;

            let mut out = Vec::new();
            for name in names {
                let status = self.authz_status(&state, &name);
                let error = match (status, self.outcome) {
                    (AuthorizationStatus::Invalid, Outcome::Fails(reason)) => {
                        Some(reason.to_string())
                    }
                    _ => None,
                };
                let mut challenges = Vec::new();
                for kind in &self.offered {
                    let url = format!("https://acme.test/chall/{}/{}", name, kind);
                    state.challenges.insert(url.clone(), name.clone());
                    challenges.push(ChallengeSnapshot {
                        kind: kind.clone(),
                        url,
                        token: format!("tok-{}", name),
                        key_authorization: format!("tok-{}.thumb", name),
                        dns_value: "digest".into(),
                        error: error.clone(),
                    });
                }
                out.push(AuthorizationSnapshot {
                    name,
                    status,
                    challenges,
                });
            }
            Ok(out)
        }

        async fn set_challenge_ready(
            &self,
            _order_url: &str,
            challenge_url: &str,
        ) -> Result<(), AcmeError> {
            if self.hang_on_ready {
                std::future::pending::<()>().await;
            }
            let mut state = self.state.lock();
            state.ready_calls += 1;
            if let Some(name) = state.challenges.get(challenge_url).cloned() {
                state.ready.insert(name);
            }
            Ok(())
        }

        async fn finalize(
            &self,
            order_url: &str,
            _csr_der: &[u8],
        ) -> Result<OrderSnapshot, AcmeError> {
            let mut state = self.state.lock();
            if let Some(entry) = state.orders.get_mut(order_url) {
                entry.0 = OrderStatus::Processing;
            }
            Ok(OrderSnapshot {
                url: order_url.to_string(),
                status: OrderStatus::Processing,
                error: None,
            })
        }

        async fn certificate(&self, order_url: &str) -> Result<Option<String>, AcmeError> {
            let state = self.state.lock();
            Ok(match state.orders.get(order_url) {
                Some((OrderStatus::Valid, _)) => Some(format!("chain for {}", order_url)),
                _ => None,
            })
        }
    }

    fn request(names: &[&str], journal: Arc<MemoryJournal>, timeout: Duration) -> IssueRequest {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        IssueRequest {
            names: NameSet::from_spec("", &names).unwrap(),
            key_pem: pki::generate_key().unwrap(),
            duration: Duration::from_secs(90 * 86400),
            journal,
            deadline: Instant::now() + timeout,
        }
    }

    fn orchestrator(api: Arc<FakeAcme>, manager: &ChallengeManager) -> AcmeOrchestrator {
        AcmeOrchestrator::new(
            api,
            vec![Arc::new(Http01Solver::new(manager.clone()))],
            &ControllerConfig::fast(),
        )
    }

    #[tokio::test]
    async fn test_order_completes_and_cleans_up() {
        let api = Arc::new(FakeAcme::new(
            vec![ChallengeKind::Dns01, ChallengeKind::Http01],
            Outcome::Validates,
        ));
        let manager = ChallengeManager::new();
        let journal = Arc::new(MemoryJournal::default());
        let req = request(
            &["a.example.com", "b.example.com"],
            journal.clone(),
            Duration::from_secs(5),
        );

        let chain = orchestrator(api.clone(), &manager)
            .issue(&req)
            .await
            .unwrap();
        assert_eq!(chain, "chain for https://acme.test/order/1");
        assert_eq!(api.new_orders(), 1);
        assert_eq!(api.ready_calls(), 2);
        assert_eq!(manager.pending_count(), 0);
        assert!(journal.current().is_none());
    }

    #[tokio::test]
    async fn test_no_supported_challenge_fails_before_presenting() {
        let api = Arc::new(FakeAcme::new(vec![ChallengeKind::Dns01], Outcome::Validates));
        let manager = ChallengeManager::new();
        let journal = Arc::new(MemoryJournal::default());
        let req = request(&["a.example.com"], journal.clone(), Duration::from_secs(5));

        let err = orchestrator(api.clone(), &manager)
            .issue(&req)
            .await
            .unwrap_err();
        match err {
            IssueError::ChallengeFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "a.example.com");
                assert!(failures[0].reason.contains("no supported challenge"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(api.ready_calls(), 0);
        assert_eq!(manager.pending_count(), 0);
        assert!(journal.current().is_none());
    }

    #[tokio::test]
    async fn test_invalid_authorization_carries_server_reason() {
        let api = Arc::new(FakeAcme::new(
            vec![ChallengeKind::Http01],
            Outcome::Fails("Connection refused"),
        ));
        let manager = ChallengeManager::new();
        let req = request(
            &["a.example.com"],
            Arc::new(MemoryJournal::default()),
            Duration::from_secs(5),
        );

        let err = orchestrator(api, &manager).issue(&req).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "challenge validation failed: a.example.com: Connection refused"
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_authorization_times_out() {
        let api = Arc::new(FakeAcme::new(
            vec![ChallengeKind::Http01],
            Outcome::StaysPending,
        ));
        let manager = ChallengeManager::new();
        let req = request(
            &["a.example.com"],
            Arc::new(MemoryJournal::default()),
            Duration::from_millis(100),
        );

        let err = orchestrator(api, &manager).issue(&req).await.unwrap_err();
        match err {
            IssueError::ChallengeFailed { failures } => {
                assert_eq!(failures[0].reason, "timed out waiting for validation")
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hung_call_fails_at_deadline_and_cleans_up() {
        let api = Arc::new(
            FakeAcme::new(vec![ChallengeKind::Http01], Outcome::Validates).hanging_on_ready(),
        );
        let manager = ChallengeManager::new();
        let timeout = Duration::from_millis(100);
        let req = request(&["a.example.com"], Arc::new(MemoryJournal::default()), timeout);

        // Bounded the same way the certificate reconciler bounds an attempt
        let outcome = tokio::time::timeout(
            timeout + Duration::from_secs(1),
            orchestrator(api, &manager).issue(&req),
        )
        .await;
        let err = outcome.expect("attempt should end at its own deadline").unwrap_err();
        match err {
            IssueError::ChallengeFailed { failures } => {
                assert_eq!(failures[0].name, "a.example.com");
                assert!(failures[0].reason.contains("set challenge ready"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recorded_order_is_resumed() {
        let api = Arc::new(FakeAcme::new(vec![ChallengeKind::Http01], Outcome::Validates));
        let existing = api
            .new_order(&["a.example.com".to_string()])
            .await
            .unwrap();
        let journal = Arc::new(MemoryJournal::new(Some(PendingOrder {
            url: existing.url.clone(),
            names: vec!["a.example.com".to_string()],
        })));
        let req = request(&["a.example.com"], journal.clone(), Duration::from_secs(5));

        let chain = orchestrator(api.clone(), &ChallengeManager::new())
            .issue(&req)
            .await
            .unwrap();
        assert_eq!(chain, format!("chain for {}", existing.url));
        assert_eq!(api.new_orders(), 1);
        assert!(journal.current().is_none());
    }

    #[tokio::test]
    async fn test_recorded_order_for_other_names_is_abandoned() {
        let api = Arc::new(FakeAcme::new(vec![ChallengeKind::Http01], Outcome::Validates));
        let journal = Arc::new(MemoryJournal::new(Some(PendingOrder {
            url: "https://acme.test/order/stale".to_string(),
            names: vec!["old.example.com".to_string()],
        })));
        let req = request(&["a.example.com"], journal, Duration::from_secs(5));

        orchestrator(api.clone(), &ChallengeManager::new())
            .issue(&req)
            .await
            .unwrap();
        assert_eq!(api.new_orders(), 1);
    }

    #[tokio::test]
    async fn test_transient_order_creation_is_retried() {
        let api = Arc::new(FakeAcme::new(vec![ChallengeKind::Http01], Outcome::Validates));
        api.fail_next(2);
        let req = request(
            &["a.example.com"],
            Arc::new(MemoryJournal::default()),
            Duration::from_secs(5),
        );

        orchestrator(api.clone(), &ChallengeManager::new())
            .issue(&req)
            .await
            .unwrap();
        assert_eq!(api.new_orders(), 1);
    }

    #[test]
    fn test_rejected_order_fails_every_name() {
        let names = NameSet::from_spec(
            "",
            &["a.example.com".to_string(), "b.example.com".to_string()],
        )
        .unwrap();
        let err = Phase::Order.map(
            AcmeError::Rejected {
                problem_type: Some("urn:ietf:params:acme:error:rejectedIdentifier".into()),
                detail: "policy forbids issuing for name".into(),
                status: Some(400),
            },
            &names,
        );
        match err {
            IssueError::ChallengeFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(
            Phase::Finalize.map(
                AcmeError::Rejected {
                    problem_type: None,
                    detail: "bad CSR".into(),
                    status: Some(400)
                },
                &names
            ),
            IssueError::FinalizeFailed(_)
        ));
    }
}
