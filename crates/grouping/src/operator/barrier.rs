//! Arrival barrier used by grouping replicas to elect the replica that seals
//! their shared map.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct BarrierState {
    parties: usize,
    arrived: usize,
    phase: u64,
}

impl BarrierState {
    // Completes the current phase if every registered party has arrived.
    fn try_advance(&mut self) -> bool {
        if self.arrived < self.parties {
            return false;
        }
        debug!(
            "arrival barrier completed phase {} ({} parties)",
            self.phase, self.parties
        );
        self.arrived = 0;
        self.phase += 1;
        true
    }
}

/// Outcome of [`ArrivalBarrier::arrive`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arrival {
    /// Phase the caller arrived in.
    pub phase: u64,
    /// The caller was the last party to arrive and completed the phase.
    pub last: bool,
}

impl Arrival {
    pub fn is_last(&self) -> bool {
        self.last
    }
}

/// A reusable rendezvous among a dynamic set of parties.
///
/// Each party calls [`arrive`](Self::arrive) once per phase.  The call
/// never blocks; it reports `last` for exactly one caller per phase, the
/// last one to arrive, and the barrier then moves on to the next phase.
/// The number of parties can change between phases via
/// [`register`](Self::register) and the `deregister` methods.
#[derive(Debug)]
pub struct ArrivalBarrier {
    state: Mutex<BarrierState>,
}

impl ArrivalBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                parties,
                arrived: 0,
                phase: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a party.
    ///
    /// # Panics
    ///
    /// Panics if some party already arrived in the current phase: the new
    /// party could otherwise make an earlier arrival look like the last.
    pub fn register(&self) {
        let mut state = self.lock();
        if state.arrived > 0 {
            panic!(
                "cannot register a party on an arrival barrier in the middle of phase {} ({} of {} parties arrived)",
                state.phase, state.arrived, state.parties
            );
        }
        state.parties += 1;
    }

    /// Records the arrival of one party.
    ///
    /// # Panics
    ///
    /// Panics if more parties arrive than are registered.
    pub fn arrive(&self) -> Arrival {
        let mut state = self.lock();
        if state.arrived >= state.parties {
            panic!(
                "arrival barrier received more arrivals than its {} registered parties",
                state.parties
            );
        }
        state.arrived += 1;
        let phase = state.phase;
        Arrival {
            phase,
            last: state.try_advance(),
        }
    }

    /// Removes a party that has not arrived in the current phase.  Returns
    /// `true` if the remaining parties have all arrived, which completes the
    /// phase.
    pub fn arrive_and_deregister(&self) -> bool {
        let mut state = self.lock();
        if state.parties == 0 {
            panic!("deregistering from an arrival barrier with no parties");
        }
        state.parties -= 1;
        state.try_advance()
    }

    /// Removes a party that arrived in `phase`.
    ///
    /// If `phase` is still in progress, the party's arrival is withdrawn
    /// along with it, so the phase keeps waiting for the others.  Otherwise
    /// the party leaves the current phase without arriving, which completes
    /// it if every remaining party has arrived; the return value reports
    /// that completion.
    pub fn deregister(&self, phase: u64) -> bool {
        let mut state = self.lock();
        if state.parties == 0 {
            panic!("deregistering from an arrival barrier with no parties");
        }
        state.parties -= 1;
        if state.phase == phase {
            state.arrived = state.arrived.saturating_sub(1);
            false
        } else {
            state.arrived > 0 && state.try_advance()
        }
    }

    /// Discards arrivals recorded in the current phase and starts a new
    /// phase.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.arrived > 0 {
            state.arrived = 0;
            state.phase += 1;
        }
    }

    pub fn parties(&self) -> usize {
        self.lock().parties
    }

    pub fn arrived(&self) -> usize {
        self.lock().arrived
    }

    /// Number of completed phases.
    pub fn phase(&self) -> u64 {
        self.lock().phase
    }
}

#[cfg(test)]
mod test {
    use super::{Arrival, ArrivalBarrier};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn exactly_one_last_arrival() {
        for parties in [1, 2, 8, 64] {
            let barrier = Arc::new(ArrivalBarrier::new(parties));
            let last = Arc::new(AtomicUsize::new(0));

            let handles = (0..parties)
                .map(|_| {
                    let barrier = barrier.clone();
                    let last = last.clone();
                    thread::spawn(move || {
                        if barrier.arrive().is_last() {
                            last.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(last.load(Ordering::Relaxed), 1);
            assert_eq!(barrier.phase(), 1);
            assert_eq!(barrier.arrived(), 0);
        }
    }

    #[test]
    fn phases_cycle() {
        let barrier = ArrivalBarrier::new(2);
        for phase in 0..3 {
            assert_eq!(barrier.phase(), phase);
            assert!(!barrier.arrive().is_last());
            assert_eq!(barrier.arrive(), Arrival { phase, last: true });
        }
    }

    #[test]
    fn register_grows_the_group() {
        let barrier = ArrivalBarrier::new(1);
        barrier.register();
        barrier.register();
        assert_eq!(barrier.parties(), 3);
        assert!(!barrier.arrive().is_last());
        assert!(!barrier.arrive().is_last());
        assert!(barrier.arrive().is_last());
    }

    #[test]
    #[should_panic(expected = "in the middle of phase")]
    fn register_after_arrival_panics() {
        let barrier = ArrivalBarrier::new(2);
        barrier.arrive();
        barrier.register();
    }

    #[test]
    #[should_panic(expected = "more arrivals")]
    fn too_many_arrivals_panic() {
        let barrier = ArrivalBarrier::new(0);
        barrier.arrive();
    }

    #[test]
    fn departing_party_completes_phase() {
        let barrier = ArrivalBarrier::new(3);
        assert!(!barrier.arrive().is_last());
        assert!(!barrier.arrive().is_last());
        assert!(barrier.arrive_and_deregister());
        assert_eq!(barrier.parties(), 2);
        assert_eq!(barrier.phase(), 1);

        assert!(!barrier.arrive_and_deregister());
        assert_eq!(barrier.parties(), 1);
        assert!(barrier.arrive().is_last());
    }

    #[test]
    fn withdrawn_arrival_keeps_phase_open() {
        let barrier = ArrivalBarrier::new(2);
        let arrival = barrier.arrive();
        assert!(!arrival.is_last());

        // The party leaves before its sibling arrives: the sibling must
        // still be the one to complete the phase.
        assert!(!barrier.deregister(arrival.phase));
        assert_eq!(barrier.parties(), 1);
        assert_eq!(barrier.arrived(), 0);
        assert!(barrier.arrive().is_last());
    }

    #[test]
    fn deregister_after_completed_phase() {
        let barrier = ArrivalBarrier::new(2);
        let first = barrier.arrive();
        assert!(barrier.arrive().is_last());

        // Next phase: one party arrives, the other leaves without arriving
        // again.
        assert!(!barrier.arrive().is_last());
        assert!(barrier.deregister(first.phase));
        assert_eq!(barrier.phase(), 2);

        // Leaving when nobody is waiting completes nothing.
        let barrier = ArrivalBarrier::new(3);
        let first = barrier.arrive();
        assert!(!barrier.arrive().is_last());
        assert!(barrier.arrive().is_last());
        assert!(!barrier.deregister(first.phase));
        assert_eq!(barrier.phase(), 1);
    }

    #[test]
    fn reset_drops_partial_arrivals() {
        let barrier = ArrivalBarrier::new(2);
        assert!(!barrier.arrive().is_last());
        barrier.reset();
        assert_eq!(barrier.arrived(), 0);
        assert!(!barrier.arrive().is_last());
        assert!(barrier.arrive().is_last());
    }
}
