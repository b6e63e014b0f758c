//! Stream identifier generation.
//!
//! Stream ids are unsigned 32-bit decimal strings, the form the media
//! engine accepts as a track uid. One generator is owned by the
//! [`SessionFactory`](crate::factory::SessionFactory) and shared by
//! reference with every session it creates.

use crate::model::StreamId;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Attempts before the generator gives up on finding a free id.
const MAX_ATTEMPTS: usize = 64;

struct GeneratorState {
    rng: StdRng,
    issued: HashSet<u32>,
}

/// Explicitly owned random stream-id source.
pub struct StreamIdGenerator {
    state: Mutex<GeneratorState>,
}

impl StreamIdGenerator {
    /// Seed from OS entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic generator for reproducible tests.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                rng,
                issued: HashSet::new(),
            }),
        }
    }

    /// Issue a new id that was never issued before by this generator and
    /// that `is_taken` does not reject (ids already present in a session).
    ///
    /// Returns `None` only if every attempt collided.
    pub fn next_stream_id(&self, is_taken: impl Fn(&StreamId) -> bool) -> Option<StreamId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        for _ in 0..MAX_ATTEMPTS {
            let candidate: u32 = state.rng.gen_range(1..=u32::MAX);
            if state.issued.contains(&candidate) {
                continue;
            }
            let stream_id = StreamId::new(candidate.to_string());
            if is_taken(&stream_id) {
                continue;
            }
            state.issued.insert(candidate);
            return Some(stream_id);
        }

        None
    }

    /// Number of ids issued so far.
    pub fn issued_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issued
            .len()
    }
}

impl Default for StreamIdGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
