//! Hashcash-style proof of work gating secret creation.
//!
//! A solution is the smallest counter for which
//! `SHA-256(prefix || nonce || decimal(counter))` starts with at least
//! `difficulty` zero bits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

/// Attempts between cancellation checks and cooperative yields.
pub const YIELD_EVERY: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub difficulty: u8,
    pub prefix: String,
}

fn digest(prefix: &str, nonce: &str, counter: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(counter.to_string().as_bytes());
    hasher.finalize().into()
}

/// Zero bits before the first set bit, scanning bytes from the front.
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for &byte in hash {
        if byte != 0 {
            return bits + byte.leading_zeros();
        }
        bits += 8;
    }
    bits
}

/// Pure check of a submitted solution.
pub fn verify(nonce: &str, solution: u64, challenge: &Challenge) -> bool {
    let hash = digest(&challenge.prefix, nonce, solution);
    leading_zero_bits(&hash) >= u32::from(challenge.difficulty)
}

/// Blocking search from counter 0. Returns the smallest valid counter.
pub fn solve(nonce: &str, challenge: &Challenge) -> u64 {
    let mut counter = 0u64;
    while !verify(nonce, counter, challenge) {
        counter += 1;
    }
    counter
}

/// Same search as [`solve`], yielding to the runtime every [`YIELD_EVERY`]
/// attempts. Returns `None` once `cancel` is set.
pub async fn solve_cooperative(nonce: &str, challenge: &Challenge, cancel: &AtomicBool) -> Option<u64> {
    let mut counter = 0u64;
    loop {
        if verify(nonce, counter, challenge) {
            return Some(counter);
        }
        counter = counter.checked_add(1)?;
        if counter % YIELD_EVERY == 0 {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }
}

/// A proof-of-work search running in the background.
///
/// Dropping the task cancels it. There is nothing to tell the server: an
/// abandoned challenge simply expires with its token.
pub struct SolveTask {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<Option<u64>>>,
}

impl SolveTask {
    /// Must be called from within a tokio runtime.
    pub fn spawn(nonce: String, challenge: Challenge) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let handle = tokio::spawn(async move { solve_cooperative(&nonce, &challenge, &flag).await });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the result. `None` if the search was cancelled.
    pub async fn join(mut self) -> Option<u64> {
        let handle = self.handle.take()?;
        handle.await.ok().flatten()
    }
}

impl Drop for SolveTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(difficulty: u8, prefix: &str) -> Challenge {
        Challenge {
            difficulty,
            prefix: prefix.into(),
        }
    }

    #[test]
    fn counts_bytes_then_bits() {
        assert_eq!(leading_zero_bits(&[0xff]), 0);
        assert_eq!(leading_zero_bits(&[0x80, 0x00]), 0);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0x10]), 19);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
        assert_eq!(leading_zero_bits(&[]), 0);
    }

    #[test]
    fn zero_difficulty_is_trivial() {
        let c = challenge(0, "p");
        assert_eq!(solve("nonce", &c), 0);
        assert!(verify("nonce", 12345, &c));
    }

    #[test]
    fn solve_and_verify_agree() {
        for difficulty in [1u8, 4, 8, 12] {
            for nonce in ["a", "nonce-2", "AAAAAAAAAAAAAAAAAAAAAA"] {
                let c = challenge(difficulty, "9f2c");
                let solution = solve(nonce, &c);
                assert!(verify(nonce, solution, &c), "d={difficulty} n={nonce}");
            }
        }
    }

    #[test]
    fn solution_is_the_smallest_counter() {
        let c = challenge(8, "min");
        let solution = solve("n", &c);
        assert!((0..solution).all(|counter| !verify("n", counter, &c)));
    }

    #[test]
    fn twenty_bits_solves() {
        let c = challenge(20, "hush");
        let solution = solve("0f1e2d3c4b5a", &c);
        assert!(verify("0f1e2d3c4b5a", solution, &c));
    }

    #[test]
    fn rejects_solution_for_other_inputs() {
        let c = challenge(16, "prefix-a");
        let solution = solve("nonce-a", &c);
        assert!(verify("nonce-a", solution, &c));

        assert!(!verify("nonce-b", solution, &c));
        assert!(!verify("nonce-a", solution, &challenge(16, "prefix-b")));

        // Whatever the hash happens to have, one bit more must fail.
        let zeros = leading_zero_bits(&digest("prefix-a", "nonce-a", solution));
        let harder = challenge(zeros as u8 + 1, "prefix-a");
        assert!(!verify("nonce-a", solution, &harder));
    }

    #[tokio::test]
    async fn background_task_finds_the_same_solution() {
        let c = challenge(10, "bg");
        let expected = solve("n", &c);
        let task = SolveTask::spawn("n".into(), c);
        assert_eq!(task.join().await, Some(expected));
    }

    #[tokio::test]
    async fn cancelled_task_returns_none() {
        // 200 leading zero bits will not be found.
        let task = SolveTask::spawn("n".into(), challenge(200, "never"));
        task.cancel();
        assert_eq!(task.join().await, None);
    }
}
