//! Link bring-up supervision
//!
//! A [`LinkSupervisor`] watches two endpoints from the moment both are
//! started until each knows at least `threshold` nodes, or until the deadline
//! passes. The caller owns the clock and the endpoints; the supervisor only
//! tells it what to do next.

use crate::node::{Node, NodeStatus};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trellis_core::{Error, Result};

/// Time allowed for a link to converge
pub const DEFAULT_DEADLINE_MS: u64 = 5_000;

/// Nodes each endpoint must know: itself and the other
pub const DEFAULT_THRESHOLD: usize = 2;

/// What the supervisor observes of an endpoint
pub trait LinkEndpoint {
    fn is_started(&self) -> bool;
    fn node_count(&self) -> usize;
}

impl LinkEndpoint for Node {
    fn is_started(&self) -> bool {
        Node::is_started(self)
    }

    fn node_count(&self) -> usize {
        Node::node_count(self)
    }
}

impl LinkEndpoint for watch::Receiver<NodeStatus> {
    fn is_started(&self) -> bool {
        self.borrow().started
    }

    fn node_count(&self) -> usize {
        self.borrow().node_count
    }
}

/// Next action for the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Both endpoints are up: link them now
    Link,
    /// Keep waiting
    Pending,
    /// Both endpoints reached the threshold
    Converged,
}

/// Supervisor state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    NotYetBeaconed,
    AwaitingConvergence,
    Converged,
    Failed,
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Drives one link from bring-up to convergence or timeout
pub struct LinkSupervisor {
    start_ms: u64,
    deadline_ms: u64,
    threshold: usize,
    state: LinkState,
    on_ready: Option<ReadyCallback>,
}

impl LinkSupervisor {
    pub fn new(start_ms: u64, deadline_ms: u64, threshold: usize) -> Self {
        Self {
            start_ms,
            deadline_ms,
            threshold,
            state: LinkState::NotYetBeaconed,
            on_ready: None,
        }
    }

    /// Supervisor with the default deadline and threshold
    pub fn starting_at(start_ms: u64) -> Self {
        Self::new(start_ms, DEFAULT_DEADLINE_MS, DEFAULT_THRESHOLD)
    }

    /// Run `callback` once, when the link converges
    pub fn on_ready(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Advance the state machine at `now_ms`.
    pub fn check(
        &mut self,
        now_ms: u64,
        a: &impl LinkEndpoint,
        b: &impl LinkEndpoint,
    ) -> Result<Step> {
        match self.state {
            LinkState::Converged => return Ok(Step::Converged),
            LinkState::Failed => return Err(self.timeout()),
            LinkState::NotYetBeaconed | LinkState::AwaitingConvergence => {}
        }

        if self.state == LinkState::AwaitingConvergence
            && a.node_count() >= self.threshold
            && b.node_count() >= self.threshold
        {
            self.state = LinkState::Converged;
            info!(
                "link converged after {} ms",
                now_ms.saturating_sub(self.start_ms)
            );
            if let Some(callback) = self.on_ready.take() {
                callback();
            }
            return Ok(Step::Converged);
        }

        if now_ms.saturating_sub(self.start_ms) > self.deadline_ms {
            self.state = LinkState::Failed;
            warn!(
                "link did not converge within {} ms (counts {} and {})",
                self.deadline_ms,
                a.node_count(),
                b.node_count()
            );
            return Err(self.timeout());
        }

        if self.state == LinkState::NotYetBeaconed && a.is_started() && b.is_started() {
            self.state = LinkState::AwaitingConvergence;
            debug!("both endpoints started, linking");
            return Ok(Step::Link);
        }
        Ok(Step::Pending)
    }

    fn timeout(&self) -> Error {
        Error::ConvergenceTimeout {
            deadline_ms: self.deadline_ms,
        }
    }
}

/// Poll `supervisor` every `period` until the link converges or times out.
///
/// `link` runs once, when both endpoints are started. Time is measured on the
/// tokio clock from the call, offset by the supervisor's start time.
pub async fn converge<A, B>(
    mut supervisor: LinkSupervisor,
    a: &A,
    b: &B,
    period: Duration,
    mut link: impl FnMut(),
) -> Result<()>
where
    A: LinkEndpoint,
    B: LinkEndpoint,
{
    let clock = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let elapsed = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let now_ms = supervisor.start_ms.saturating_add(elapsed);
        match supervisor.check(now_ms, a, b)? {
            Step::Link => link(),
            Step::Pending => {}
            Step::Converged => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fake {
        started: bool,
        count: Cell<usize>,
    }

    impl Fake {
        fn new(started: bool, count: usize) -> Self {
            Self {
                started,
                count: Cell::new(count),
            }
        }
    }

    impl LinkEndpoint for Fake {
        fn is_started(&self) -> bool {
            self.started
        }

        fn node_count(&self) -> usize {
            self.count.get()
        }
    }

    #[test]
    fn test_link_then_converge() {
        let ready = Arc::new(AtomicUsize::new(0));
        let counter = ready.clone();
        let mut sup = LinkSupervisor::new(0, 5_000, 2).on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = Fake::new(true, 1);
        let b = Fake::new(true, 1);
        assert_eq!(sup.check(0, &a, &b).unwrap(), Step::Link);
        assert_eq!(sup.state(), LinkState::AwaitingConvergence);
        assert_eq!(sup.check(1, &a, &b).unwrap(), Step::Pending);

        a.count.set(2);
        assert_eq!(sup.check(2, &a, &b).unwrap(), Step::Pending);
        b.count.set(2);
        assert_eq!(sup.check(3, &a, &b).unwrap(), Step::Converged);
        assert_eq!(sup.check(99_999, &a, &b).unwrap(), Step::Converged);
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waits_for_both_started() {
        let mut sup = LinkSupervisor::starting_at(100);
        let a = Fake::new(true, 2);
        let b = Fake::new(false, 2);
        // Counts alone do not converge an unlinked pair
        assert_eq!(sup.check(100, &a, &b).unwrap(), Step::Pending);
        assert_eq!(sup.state(), LinkState::NotYetBeaconed);
    }

    #[test]
    fn test_timeout_exactly_after_deadline() {
        let mut sup = LinkSupervisor::new(1_000, 5_000, 2);
        let a = Fake::new(true, 1);
        let b = Fake::new(true, 1);
        assert_eq!(sup.check(1_000, &a, &b).unwrap(), Step::Link);
        assert_eq!(sup.check(6_000, &a, &b).unwrap(), Step::Pending);

        let err = sup.check(6_001, &a, &b).unwrap_err();
        assert!(matches!(err, Error::ConvergenceTimeout { deadline_ms: 5_000 }));
        assert_eq!(sup.state(), LinkState::Failed);

        // Late convergence does not undo the failure
        a.count.set(2);
        b.count.set(2);
        assert!(sup.check(6_002, &a, &b).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_converge_driver_times_out() {
        let a = Fake::new(true, 1);
        let b = Fake::new(true, 1);
        let mut links = 0;
        let result = converge(
            LinkSupervisor::starting_at(0),
            &a,
            &b,
            Duration::from_millis(1),
            || links += 1,
        )
        .await;
        assert!(matches!(result, Err(Error::ConvergenceTimeout { .. })));
        assert_eq!(links, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converge_driver_succeeds() {
        let a = Fake::new(true, 2);
        let b = Fake::new(true, 2);
        converge(
            LinkSupervisor::starting_at(0),
            &a,
            &b,
            Duration::from_millis(1),
            || {},
        )
        .await
        .unwrap();
    }
}
