//! Visitor Fallback Controller
//!
//! Picks the tunnel a visitor uses for each local connection. The primary
//! (direct, hole-punched) tunnel gets a bounded head start; when it does not
//! come up in time the relayed fallback tunnel is used instead.
//!
//! Each primary attempt owns exactly one timer, raced against the attempt in
//! a biased `select!`. When both complete in the same instant the primary
//! wins. With `keep_tunnel_open` the attempt outlives its timer and, once it
//! succeeds, serves every later request. Sessions already running over the
//! fallback are never moved.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BurrowError, Result};

/// Default head start of the primary tunnel
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Establishes one tunnel of a visitor
pub trait Establish<T>: Send + Sync + 'static {
    fn establish(&self) -> BoxFuture<'static, Result<T>>;
}

impl<T, F, Fut> Establish<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn establish(&self) -> BoxFuture<'static, Result<T>> {
        Box::pin(self())
    }
}

/// Which tunnel served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Primary => write!(f, "primary"),
            Route::Fallback => write!(f, "fallback"),
        }
    }
}

/// The tunnel handed to one local connection
#[derive(Debug, Clone)]
pub struct Selected<T> {
    pub route: Route,
    pub tunnel: T,
}

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitorState {
    Idle,
    AttemptingPrimary,
    UsingPrimary,
    AttemptingFallback,
    UsingFallback,
    Closed,
}

/// Timing knobs of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub fallback_timeout: Duration,
    pub keep_tunnel_open: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            keep_tunnel_open: false,
        }
    }
}

impl FallbackPolicy {
    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn with_keep_tunnel_open(mut self, keep: bool) -> Self {
        self.keep_tunnel_open = keep;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptStatus {
    Pending,
    Succeeded,
    TimedOut,
    Failed(String),
}

impl AttemptStatus {
    fn is_pending(&self) -> bool {
        matches!(self, AttemptStatus::Pending)
    }
}

struct Attempt {
    id: u64,
    status: watch::Receiver<AttemptStatus>,
}

impl Attempt {
    fn is_pending(&self) -> bool {
        self.status.borrow().is_pending()
    }
}

struct Shared<T> {
    closed: bool,
    primary: Option<T>,
    fallback: Option<T>,
    primary_attempt: Option<Attempt>,
    fallback_attempt: Option<Attempt>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            closed: false,
            primary: None,
            fallback: None,
            primary_attempt: None,
            fallback_attempt: None,
            tasks: Vec::new(),
        }
    }
}

enum Step<T> {
    Ready(Selected<T>),
    WaitPrimary(u64, watch::Receiver<AttemptStatus>),
    WaitFallback(u64, watch::Receiver<AttemptStatus>),
    Unavailable(String),
    Closed,
}

/// Chooses between a primary and an optional fallback tunnel
pub struct FallbackController<T> {
    name: Arc<str>,
    primary: Arc<dyn Establish<T>>,
    fallback: Option<Arc<dyn Establish<T>>>,
    policy: FallbackPolicy,
    shared: Arc<Mutex<Shared<T>>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    /// Bumped whenever a primary tunnel comes up
    primary_ready: Arc<watch::Sender<u64>>,
}

impl<T> FallbackController<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A controller using only the primary tunnel
    pub fn new(name: impl Into<String>, primary: impl Establish<T>, policy: FallbackPolicy) -> Self {
        Self {
            name: Arc::from(name.into()),
            primary: Arc::new(primary),
            fallback: None,
            policy,
            shared: Arc::new(Mutex::new(Shared::default())),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(0),
            primary_ready: Arc::new(watch::channel(0).0),
        }
    }

    /// Builder pattern: add the fallback tunnel
    pub fn with_fallback(mut self, fallback: impl Establish<T>) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn state(&self) -> VisitorState {
        let shared = self.lock();
        if shared.closed {
            VisitorState::Closed
        } else if shared.primary.is_some() {
            VisitorState::UsingPrimary
        } else if shared.fallback_attempt.is_some() {
            VisitorState::AttemptingFallback
        } else if shared.fallback.is_some() {
            VisitorState::UsingFallback
        } else if shared.primary_attempt.as_ref().is_some_and(Attempt::is_pending) {
            VisitorState::AttemptingPrimary
        } else {
            VisitorState::Idle
        }
    }

    /// Tunnel for one new local connection
    pub async fn acquire(&self) -> Result<Selected<T>> {
        // Set once the primary has had its chance for this request.
        let mut primary_outcome: Option<AttemptStatus> = None;

        loop {
            // Subscribed before inspecting state so no success is missed.
            let mut primary_ready = self.primary_ready.subscribe();

            match self.next_step(primary_outcome.as_ref()) {
                Step::Ready(selected) => {
                    debug!("[{}] using {} tunnel", self.name, selected.route);
                    return Ok(selected);
                }
                Step::WaitPrimary(id, rx) => {
                    let status = self.wait(id, rx, Route::Primary).await;
                    match &status {
                        AttemptStatus::Succeeded => continue,
                        AttemptStatus::TimedOut if self.has_fallback() => info!(
                            "[{}] primary tunnel not ready after {:?}, falling back",
                            self.name, self.policy.fallback_timeout
                        ),
                        AttemptStatus::Failed(reason) if self.has_fallback() => {
                            info!("[{}] primary tunnel failed ({}), falling back", self.name, reason)
                        }
                        _ => {}
                    }
                    primary_outcome = Some(status);
                }
                Step::WaitFallback(id, rx) => {
                    // A kept primary attempt may finish first; it is preferred.
                    let status = tokio::select! {
                        biased;
                        _ = primary_ready.changed() => None,
                        status = self.wait(id, rx, Route::Fallback) => Some(status),
                    };
                    let Some(status) = status else {
                        continue;
                    };
                    if let AttemptStatus::Failed(reason) = status {
                        if let Some(tunnel) = self.lock().primary.clone() {
                            return Ok(Selected {
                                route: Route::Primary,
                                tunnel,
                            });
                        }
                        return Err(self.unavailable(reason));
                    }
                }
                Step::Unavailable(reason) => return Err(self.unavailable(reason)),
                Step::Closed => return Err(BurrowError::VisitorClosed(self.name.to_string())),
            }
        }
    }

    /// Forget a tunnel that stopped working so later requests rebuild it
    pub fn report_broken(&self, route: Route) {
        let mut shared = self.lock();
        let cleared = match route {
            Route::Primary => shared.primary.take().is_some(),
            Route::Fallback => shared.fallback.take().is_some(),
        };
        if cleared {
            warn!("[{}] {} tunnel reported broken", self.name, route);
        }
    }

    /// Cancel pending attempts and refuse further requests. Idempotent.
    pub async fn close(&self) {
        let tasks = {
            let mut shared = self.lock();
            shared.closed = true;
            shared.primary = None;
            shared.fallback = None;
            shared.primary_attempt = None;
            shared.fallback_attempt = None;
            std::mem::take(&mut shared.tasks)
        };

        self.shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("[{}] tunnel attempt panicked: {}", self.name, e);
                }
            }
        }
        debug!("[{}] fallback controller closed", self.name);
    }

    fn next_step(&self, primary_outcome: Option<&AttemptStatus>) -> Step<T> {
        let mut shared = self.lock();

        if shared.closed {
            return Step::Closed;
        }
        if let Some(tunnel) = &shared.primary {
            return Step::Ready(Selected {
                route: Route::Primary,
                tunnel: tunnel.clone(),
            });
        }

        if primary_outcome.is_none() {
            let in_flight = shared
                .primary_attempt
                .as_ref()
                .map(|attempt| (attempt.id, attempt.status.clone(), attempt.is_pending()));
            match in_flight {
                Some((id, rx, true)) => return Step::WaitPrimary(id, rx),
                // Timed out but kept open: it no longer blocks requests.
                Some((_, _, false)) => {}
                None => {
                    let (id, rx) = self.spawn_primary(&mut shared);
                    return Step::WaitPrimary(id, rx);
                }
            }
        }

        if self.fallback.is_none() {
            let reason = match primary_outcome {
                Some(AttemptStatus::Failed(reason)) => reason.clone(),
                _ => "primary tunnel is still being established".to_string(),
            };
            return Step::Unavailable(reason);
        }

        if let Some(tunnel) = &shared.fallback {
            return Step::Ready(Selected {
                route: Route::Fallback,
                tunnel: tunnel.clone(),
            });
        }

        let in_flight = shared
            .fallback_attempt
            .as_ref()
            .map(|attempt| (attempt.id, attempt.status.clone()));
        let (id, rx) = match in_flight {
            Some(attempt) => attempt,
            None => self.spawn_fallback(&mut shared),
        };
        Step::WaitFallback(id, rx)
    }

    async fn wait(&self, id: u64, mut rx: watch::Receiver<AttemptStatus>, route: Route) -> AttemptStatus {
        let status = match rx.wait_for(|status| !status.is_pending()).await {
            Ok(status) => status.clone(),
            Err(_) => AttemptStatus::Failed("attempt was cancelled".to_string()),
        };

        // A task that vanished without reporting leaves a stale entry.
        if matches!(status, AttemptStatus::Failed(_)) {
            let mut shared = self.lock();
            let slot = match route {
                Route::Primary => &mut shared.primary_attempt,
                Route::Fallback => &mut shared.fallback_attempt,
            };
            if slot.as_ref().is_some_and(|attempt| attempt.id == id) {
                *slot = None;
            }
        }
        status
    }

    fn spawn_primary(&self, shared: &mut Shared<T>) -> (u64, watch::Receiver<AttemptStatus>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(AttemptStatus::Pending);
        shared.primary_attempt = Some(Attempt { id, status: rx.clone() });

        // The head start only matters when there is something to fall back to.
        let timeout = self.fallback.as_ref().map(|_| self.policy.fallback_timeout);
        let task = PrimaryAttempt {
            id,
            name: Arc::clone(&self.name),
            attempt: self.primary.establish(),
            timeout,
            keep_tunnel_open: self.policy.keep_tunnel_open,
            shared: Arc::clone(&self.shared),
            shutdown: self.shutdown.clone(),
            status: tx,
            ready: Arc::clone(&self.primary_ready),
        };

        debug!("[{}] starting primary tunnel attempt #{}", self.name, id);
        self.track(shared, tokio::spawn(task.run()));
        (id, rx)
    }

    fn spawn_fallback(&self, shared: &mut Shared<T>) -> (u64, watch::Receiver<AttemptStatus>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(AttemptStatus::Pending);
        shared.fallback_attempt = Some(Attempt { id, status: rx.clone() });

        let name = Arc::clone(&self.name);
        let attempt = self
            .fallback
            .as_ref()
            .map(|fallback| fallback.establish());
        let state = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();

        debug!("[{}] starting fallback tunnel attempt #{}", self.name, id);
        let handle = tokio::spawn(async move {
            let Some(attempt) = attempt else {
                return;
            };
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = attempt => result,
            };

            let mut shared = state.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.fallback_attempt.as_ref().is_some_and(|a| a.id == id) {
                shared.fallback_attempt = None;
            }
            if shared.closed {
                return;
            }
            match result {
                Ok(tunnel) => {
                    info!("[{}] fallback tunnel established", name);
                    shared.fallback = Some(tunnel);
                    tx.send_replace(AttemptStatus::Succeeded);
                }
                Err(e) => {
                    warn!("[{}] fallback tunnel failed: {}", name, e);
                    tx.send_replace(AttemptStatus::Failed(e.to_string()));
                }
            }
        });

        self.track(shared, handle);
        (id, rx)
    }

    fn track(&self, shared: &mut Shared<T>, handle: JoinHandle<()>) {
        shared.tasks.retain(|task| !task.is_finished());
        shared.tasks.push(handle);
    }

    fn unavailable(&self, reason: String) -> BurrowError {
        BurrowError::TunnelUnavailable {
            visitor: self.name.to_string(),
            reason,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One primary establishment together with its timer
struct PrimaryAttempt<T> {
    id: u64,
    name: Arc<str>,
    attempt: BoxFuture<'static, Result<T>>,
    timeout: Option<Duration>,
    keep_tunnel_open: bool,
    shared: Arc<Mutex<Shared<T>>>,
    shutdown: CancellationToken,
    status: watch::Sender<AttemptStatus>,
    ready: Arc<watch::Sender<u64>>,
}

impl<T: Send + 'static> PrimaryAttempt<T> {
    async fn run(self) {
        let PrimaryAttempt {
            id,
            name,
            mut attempt,
            timeout,
            keep_tunnel_open,
            shared,
            shutdown,
            status,
            ready,
        } = self;

        let first = match timeout {
            Some(limit) => {
                let timer = tokio::time::sleep(limit);
                tokio::pin!(timer);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    result = &mut attempt => Some(result),
                    _ = &mut timer => None,
                }
            }
            None => tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = &mut attempt => Some(result),
            },
        };

        let result = match first {
            Some(result) => result,
            None if keep_tunnel_open => {
                debug!("[{}] primary attempt #{} kept open past its timer", name, id);
                status.send_replace(AttemptStatus::TimedOut);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    result = attempt => result,
                }
            }
            None => {
                drop(attempt);
                let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if shared.primary_attempt.as_ref().is_some_and(|a| a.id == id) {
                    shared.primary_attempt = None;
                }
                status.send_replace(AttemptStatus::TimedOut);
                return;
            }
        };

        let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.primary_attempt.as_ref().is_some_and(|a| a.id == id) {
            shared.primary_attempt = None;
        }
        if shared.closed {
            return;
        }
        match result {
            Ok(tunnel) => {
                info!("[{}] primary tunnel established", name);
                shared.primary = Some(tunnel);
                status.send_replace(AttemptStatus::Succeeded);
                ready.send_modify(|generation| *generation += 1);
            }
            Err(e) => {
                debug!("[{}] primary attempt #{} failed: {}", name, id, e);
                status.send_replace(AttemptStatus::Failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{Instant, sleep};

    fn policy(timeout_ms: u64, keep: bool) -> FallbackPolicy {
        FallbackPolicy::default()
            .with_fallback_timeout(Duration::from_millis(timeout_ms))
            .with_keep_tunnel_open(keep)
    }

    /// Establishes `value` after `delay`, counting starts and completions
    fn delayed(
        delay_ms: u64,
        value: u32,
        started: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    ) -> impl Establish<u32> {
        move || {
            let started = Arc::clone(&started);
            let completed = Arc::clone(&completed);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(delay_ms)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn immediate(value: u32) -> impl Establish<u32> {
        move || async move { Ok(value) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_after_timeout() {
        let (started, completed) = counters();
        let controller = FallbackController::new("xtcp", delayed(10_000, 1, started, completed), policy(200, false))
            .with_fallback(immediate(2));

        let begin = Instant::now();
        let selected = controller.acquire().await.unwrap();

        assert_eq!(selected.route, Route::Fallback);
        assert_eq!(selected.tunnel, 2);
        assert!(begin.elapsed() >= Duration::from_millis(200));
        assert!(begin.elapsed() < Duration::from_millis(300));
        assert_eq!(controller.state(), VisitorState::UsingFallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_within_timeout() {
        let (started, completed) = counters();
        let (fb_started, fb_completed) = counters();
        let controller = FallbackController::new("xtcp", delayed(50, 1, started, completed), policy(200, false))
            .with_fallback(delayed(0, 2, Arc::clone(&fb_started), fb_completed));

        let selected = controller.acquire().await.unwrap();

        assert_eq!(selected.route, Route::Primary);
        assert_eq!(selected.tunnel, 1);
        assert_eq!(fb_started.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), VisitorState::UsingPrimary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_wins_tie() {
        let (started, completed) = counters();
        let controller = FallbackController::new("xtcp", delayed(200, 1, started, completed), policy(200, false))
            .with_fallback(immediate(2));

        let selected = controller.acquire().await.unwrap();
        assert_eq!(selected.route, Route::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_tunnel_open_serves_later_requests() {
        let (started, completed) = counters();
        let controller = FallbackController::new(
            "xtcp",
            delayed(500, 1, Arc::clone(&started), Arc::clone(&completed)),
            policy(200, true),
        )
        .with_fallback(immediate(2));

        let first = controller.acquire().await.unwrap();
        assert_eq!(first.route, Route::Fallback);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), VisitorState::UsingPrimary);

        let second = controller.acquire().await.unwrap();
        assert_eq!(second.route, Route::Primary);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // The first session keeps the tunnel it was given.
        assert_eq!(first.tunnel, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_primary_rescues_waiting_request() {
        let (started, completed) = counters();
        let controller = FallbackController::new("xtcp", delayed(300, 1, started, completed), policy(200, true))
            .with_fallback(|| async {
                sleep(Duration::from_millis(600)).await;
                Err::<u32, _>(BurrowError::DialError("relay down".to_string()))
            });

        let begin = Instant::now();
        let selected = controller.acquire().await.unwrap();

        assert_eq!(selected.route, Route::Primary);
        assert_eq!(selected.tunnel, 1);
        assert!(begin.elapsed() < Duration::from_millis(400));

        // The failing fallback leaves the primary in place.
        sleep(Duration::from_millis(400)).await;
        assert_eq!(controller.state(), VisitorState::UsingPrimary);
        assert_eq!(controller.acquire().await.unwrap().route, Route::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cancelled_without_keep_open() {
        let (started, completed) = counters();
        let controller = FallbackController::new(
            "xtcp",
            delayed(500, 1, Arc::clone(&started), Arc::clone(&completed)),
            policy(200, false),
        )
        .with_fallback(immediate(2));

        assert_eq!(controller.acquire().await.unwrap().route, Route::Fallback);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), VisitorState::UsingFallback);

        // A new request gives the primary another head start.
        let begin = Instant::now();
        assert_eq!(controller.acquire().await.unwrap().route, Route::Fallback);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(begin.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kept_attempt_does_not_block_requests() {
        let (started, completed) = counters();
        let controller = FallbackController::new(
            "xtcp",
            delayed(10_000, 1, Arc::clone(&started), completed),
            policy(200, true),
        )
        .with_fallback(immediate(2));

        controller.acquire().await.unwrap();

        let begin = Instant::now();
        let selected = controller.acquire().await.unwrap();
        assert_eq!(selected.route, Route::Fallback);
        assert_eq!(begin.elapsed(), Duration::ZERO);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_falls_back_immediately() {
        let primary = || async {
            sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(BurrowError::DialError("hole punch failed".into()))
        };
        let controller = FallbackController::new("xtcp", primary, policy(200, false)).with_fallback(immediate(2));

        let begin = Instant::now();
        let selected = controller.acquire().await.unwrap();

        assert_eq!(selected.route, Route::Fallback);
        assert!(begin.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_is_returned() {
        let primary = || futures::future::pending::<Result<u32>>();
        let fallback = || async { Err::<u32, _>(BurrowError::DialError("relay down".into())) };
        let controller = FallbackController::new("xtcp", primary, policy(100, false)).with_fallback(fallback);

        let err = controller.acquire().await.unwrap_err();
        assert!(matches!(err, BurrowError::TunnelUnavailable { .. }));
        assert_eq!(controller.state(), VisitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_fallback() {
        let primary = || async {
            sleep(Duration::from_secs(5)).await;
            Ok::<u32, BurrowError>(7)
        };
        let controller = FallbackController::new("stcp", primary, FallbackPolicy::default());

        // No head start applies when there is nothing to fall back to.
        let selected = controller.acquire().await.unwrap();
        assert_eq!(selected.route, Route::Primary);
        assert_eq!(selected.tunnel, 7);

        let failing = || async { Err::<u32, _>(BurrowError::DialError("no route".into())) };
        let controller = FallbackController::new("stcp", failing, FallbackPolicy::default());
        assert!(matches!(
            controller.acquire().await,
            Err(BurrowError::TunnelUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_attempt() {
        let (started, completed) = counters();
        let controller = FallbackController::new(
            "xtcp",
            delayed(100, 1, Arc::clone(&started), completed),
            policy(200, false),
        )
        .with_fallback(immediate(2));

        let results = futures::future::join_all((0..5).map(|_| controller.acquire())).await;

        assert!(results.iter().all(|r| r.as_ref().unwrap().route == Route::Primary));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_broken() {
        let (started, completed) = counters();
        let controller = FallbackController::new(
            "xtcp",
            delayed(0, 1, Arc::clone(&started), completed),
            policy(200, false),
        );

        controller.acquire().await.unwrap();
        controller.report_broken(Route::Primary);
        assert_eq!(controller.state(), VisitorState::Idle);

        controller.acquire().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let primary = || futures::future::pending::<Result<u32>>();
        let controller = Arc::new(FallbackController::new("xtcp", primary, policy(60_000, false)).with_fallback(immediate(2)));

        let waiting = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire().await })
        };
        sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.state(), VisitorState::AttemptingPrimary);

        controller.close().await;
        controller.close().await;

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(BurrowError::VisitorClosed(_))));
        assert!(matches!(controller.acquire().await, Err(BurrowError::VisitorClosed(_))));
        assert_eq!(controller.state(), VisitorState::Closed);
    }
}
