//! Graceful shutdown: `running -> draining -> terminated`.
//!
//! The first termination signal flips the gateway into draining, cancels
//! the listener's shutdown token and starts the grace timer. Requests that
//! were already accepted (open streams included) keep running. A second
//! signal, or the grace timer firing first, forces termination.

use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Terminated,
}

impl ShutdownPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Terminated => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every accepted request finished before the grace period ran out.
    Drained,
    /// The grace period expired or a second signal arrived.
    Forced,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    token: CancellationToken,
    in_flight: AtomicUsize,
    idle: Notify,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            phase: AtomicU8::new(ShutdownPhase::Running.as_u8()),
            token: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            grace,
        })
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_draining(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Register an accepted request. `None` once draining has begun.
    #[must_use]
    pub fn track(self: &Arc<Self>) -> Option<InFlightGuard> {
        if self.is_draining() {
            return None;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("chatgate_in_flight_requests").set(now as f64);
        Some(InFlightGuard(Arc::new(GuardInner {
            coordinator: Arc::clone(self),
        })))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once draining starts. Handed to the listener so it stops
    /// accepting connections.
    pub fn drain_signal(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Move to draining. Returns `false` if draining had already begun.
    pub fn begin_drain(&self) -> bool {
        let switched = self
            .phase
            .compare_exchange(
                ShutdownPhase::Running.as_u8(),
                ShutdownPhase::Draining.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if switched {
            tracing::info!(
                in_flight = self.in_flight(),
                grace_ms = self.grace.as_millis() as u64,
                "draining: no longer accepting new requests"
            );
            self.token.cancel();
        }
        switched
    }

    /// Wait until no tracked request is left.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drive `server` to completion under the shutdown state machine.
    ///
    /// `server` is expected to stop on its own once [`drain_signal`]
    /// resolves and its connections have closed.
    ///
    /// [`drain_signal`]: Self::drain_signal
    pub async fn run<F, S>(self: &Arc<Self>, server: F, mut signals: S) -> std::io::Result<DrainOutcome>
    where
        F: Future<Output = std::io::Result<()>>,
        S: Stream<Item = ()> + Unpin,
    {
        tokio::pin!(server);
        let mut deadline: Option<Instant> = None;
        let mut signals_open = true;
        loop {
            tokio::select! {
                result = &mut server => {
                    self.terminate();
                    result?;
                    tracing::info!("all requests drained, shutting down");
                    return Ok(DrainOutcome::Drained);
                }
                signal = signals.next(), if signals_open => match signal {
                    None => signals_open = false,
                    Some(()) if deadline.is_none() => {
                        self.begin_drain();
                        deadline = Some(Instant::now() + self.grace);
                    }
                    Some(()) => {
                        tracing::warn!(
                            in_flight = self.in_flight(),
                            "second termination signal received, forcing shutdown"
                        );
                        self.terminate();
                        return Ok(DrainOutcome::Forced);
                    }
                },
                _ = sleep_until(deadline) => {
                    tracing::warn!(
                        in_flight = self.in_flight(),
                        "grace period expired, forcing shutdown"
                    );
                    self.terminate();
                    return Ok(DrainOutcome::Forced);
                }
            }
        }
    }

    fn terminate(&self) {
        self.phase
            .store(ShutdownPhase::Terminated.as_u8(), Ordering::SeqCst);
        self.token.cancel();
    }

    fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("chatgate_in_flight_requests").set(previous.saturating_sub(1) as f64);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Marks one accepted request as in flight until every clone is dropped.
///
/// Clones share one slot, so the guard can ride along in request
/// extensions and then move into a response body stream.
#[derive(Debug, Clone)]
pub struct InFlightGuard(Arc<GuardInner>);

#[derive(Debug)]
struct GuardInner {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

/// SIGINT and, on unix, SIGTERM as one stream of shutdown requests.
pub fn termination_signals() -> ReceiverStream<()> {
    let (tx, rx) = mpsc::channel(4);

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT");
            if ctrl_c_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                while term.recv().await.is_some() {
                    tracing::info!("received SIGTERM");
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    });
    #[cfg(not(unix))]
    drop(tx);

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal_channel() -> (mpsc::Sender<()>, ReceiverStream<()>) {
        let (tx, rx) = mpsc::channel(4);
        (tx, ReceiverStream::new(rx))
    }

    /// Stands in for the listener: stops when draining starts and every
    /// tracked request has finished.
    fn fake_server(
        coordinator: &Arc<ShutdownCoordinator>,
    ) -> impl Future<Output = std::io::Result<()>> {
        let coordinator = Arc::clone(coordinator);
        async move {
            coordinator.drain_signal().await;
            coordinator.wait_idle().await;
            Ok(())
        }
    }

    #[test]
    fn draining_rejects_new_requests() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let guard = coordinator.track().unwrap();
        assert_eq!(coordinator.in_flight(), 1);

        assert!(coordinator.begin_drain());
        assert!(!coordinator.begin_drain());
        assert!(coordinator.track().is_none());

        let clone = guard.clone();
        drop(guard);
        assert_eq!(coordinator.in_flight(), 1);
        drop(clone);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_request_finishes_within_grace() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let guard = coordinator.track().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(guard);
        });

        let (tx, signals) = signal_channel();
        tx.send(()).await.unwrap();
        let outcome = coordinator
            .run(fake_server(&coordinator), signals)
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(coordinator.phase(), ShutdownPhase::Terminated);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_forces_termination() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let _stuck = coordinator.track().unwrap();

        let (tx, signals) = signal_channel();
        tx.send(()).await.unwrap();
        let started = Instant::now();
        let outcome = coordinator
            .run(fake_server(&coordinator), signals)
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(coordinator.phase(), ShutdownPhase::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_short_circuits_the_drain() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let _stuck = coordinator.track().unwrap();

        let (tx, signals) = signal_channel();
        tokio::spawn(async move {
            tx.send(()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(()).await.unwrap();
        });
        let started = Instant::now();
        let outcome = coordinator
            .run(fake_server(&coordinator), signals)
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_signal_stream_does_not_trigger_drain() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let (tx, signals) = signal_channel();
        drop(tx);

        let trigger = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.begin_drain();
        });
        let outcome = coordinator
            .run(fake_server(&coordinator), signals)
            .await
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Drained);
    }
}
