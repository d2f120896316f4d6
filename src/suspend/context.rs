//! Request context and resolution state machine.
//!
//! # State Transitions
//! ```text
//! Suspended → Resolving: atomic claim (worker, timeout or cancel, first wins)
//! Resolving → Resolved | Failed | TimedOut | Cancelled: claimant only
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Resolution state of a request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Suspended = 0,
    Resolving = 1,
    Resolved = 2,
    Failed = 3,
    TimedOut = 4,
    Cancelled = 5,
}

impl ResolutionState {
    /// True for the four terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResolutionState::Resolved
                | ResolutionState::Failed
                | ResolutionState::TimedOut
                | ResolutionState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionState::Suspended => "suspended",
            ResolutionState::Resolving => "resolving",
            ResolutionState::Resolved => "resolved",
            ResolutionState::Failed => "failed",
            ResolutionState::TimedOut => "timed_out",
            ResolutionState::Cancelled => "cancelled",
        }
    }
}

impl From<u8> for ResolutionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ResolutionState::Resolving,
            2 => ResolutionState::Resolved,
            3 => ResolutionState::Failed,
            4 => ResolutionState::TimedOut,
            5 => ResolutionState::Cancelled,
            _ => ResolutionState::Suspended,
        }
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and state of one in-flight request.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    arrived_at: Instant,
    state: AtomicU8,
}

impl RequestContext {
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            arrived_at: Instant::now(),
            state: AtomicU8::new(ResolutionState::Suspended as u8),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    /// Time since the request arrived.
    pub fn elapsed(&self) -> Duration {
        self.arrived_at.elapsed()
    }

    pub fn state(&self) -> ResolutionState {
        ResolutionState::from(self.state.load(Ordering::Acquire))
    }

    /// Take the exclusive right to resolve this request.
    ///
    /// Succeeds for exactly one caller. Losers get the state they observed.
    pub(crate) fn try_claim(&self) -> Result<(), ResolutionState> {
        self.state
            .compare_exchange(
                ResolutionState::Suspended as u8,
                ResolutionState::Resolving as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ResolutionState::from)
    }

    /// Publish the terminal state. Only the claimant calls this.
    pub(crate) fn finish(&self, terminal: ResolutionState) {
        debug_assert!(terminal.is_terminal());
        self.state.store(terminal as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn request_id_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn request_id_parses_uuid() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn claim_is_taken_once() {
        let ctx = RequestContext::new(RequestId::new());
        assert_eq!(ctx.state(), ResolutionState::Suspended);
        assert!(ctx.try_claim().is_ok());
        assert_eq!(ctx.try_claim(), Err(ResolutionState::Resolving));

        ctx.finish(ResolutionState::TimedOut);
        assert_eq!(ctx.try_claim(), Err(ResolutionState::TimedOut));
        assert!(ctx.state().is_terminal());
    }

    #[test]
    fn concurrent_claims_have_single_winner() {
        let ctx = Arc::new(RequestContext::new(RequestId::new()));
        let wins = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let ctx = ctx.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if ctx.try_claim().is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
