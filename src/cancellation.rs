//! Session cancellation: generation counter + token guard.
//! Stopping or suspending dictation advances the generation; transcript
//! events stamped with an older generation are dropped on arrival. This is
//! the stop-grace debounce: the speech engine has no synchronous
//! cancel-and-flush contract, so snapshots already in flight when a session
//! stops must lose the race against the state reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks the live dictation generation. Each start/stop/suspend/resume
/// advances the generation, cancels outstanding tokens, and issues a fresh
/// one for the new segment.
pub struct SessionGeneration {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl SessionGeneration {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current generation, advance, and return the new token
    /// plus generation number.
    pub fn advance(&self) -> (CancellationToken, u64) {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_root = CancellationToken::new();
        let child = new_root.child_token();
        *token_guard = new_root;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (child, generation)
    }

    /// Guard for the current generation without advancing.
    pub fn guard(&self) -> GenerationGuard {
        let token = self.current_token.read().child_token();
        GenerationGuard {
            generation: Arc::clone(&self.generation),
            my_generation: self.current(),
            token,
        }
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True when `stamped` is the live generation.
    pub fn accepts(&self, stamped: u64) -> bool {
        self.current() == stamped
    }
}

impl Default for SessionGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Checked by producer-side work before it writes results. The guard shares
/// the generation counter, so an advance on the control thread is visible
/// immediately.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    /// True if this guard still belongs to the live generation.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True if dependent work should keep going.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.my_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_increments_and_cancels() {
        let gen = SessionGeneration::new();
        let guard = {
            let (_, g) = gen.advance();
            assert_eq!(g, 1);
            gen.guard()
        };
        assert!(guard.should_continue());

        let (_, g) = gen.advance();
        assert_eq!(g, 2);
        assert!(guard.is_cancelled());
        assert!(!guard.is_current());
        assert!(!guard.should_continue());
    }

    #[test]
    fn stale_stamps_are_rejected() {
        let gen = SessionGeneration::new();
        let (_, first) = gen.advance();
        assert!(gen.accepts(first));

        let (_, second) = gen.advance();
        assert!(!gen.accepts(first));
        assert!(gen.accepts(second));
    }
}
