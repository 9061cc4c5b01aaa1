//! Two-phase tick barrier.
//!
//! One [`PhaseBarrier`] exists per logical phase (read, update). The engine
//! task is the only leader: it releases a phase, waits for completion, and
//! resets it. Agent sessions are followers: each waits for the gate to open
//! for its (room, subsystem) pair, contributes, and marks the pair done.
//!
//! ```text
//! leader:    release() ──► wait_complete() ──► reset()
//!                 │               ▲
//!                 ▼               │ last pair
//! followers: await_open_and_release() ──► open_in(generation)
//! ```
//!
//! The barrier never times out on its own; time limits belong to the leader.

use crate::building::{RoomId, Subsystem};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Read,
    Update,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Read => f.write_str("read"),
            Phase::Update => f.write_str("update"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BarrierError {
    #[error("({room}, {subsystem}) does not take part in this barrier")]
    UnknownParticipant { room: RoomId, subsystem: Subsystem },

    /// The phase closed (or moved on) before the contribution was recorded
    #[error("Phase is closed")]
    Closed,

    #[error("Barrier cancelled")]
    Cancelled,
}

/// Heater/cooler flags for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubsystemPair {
    pub heater: bool,
    pub cooler: bool,
}

impl SubsystemPair {
    pub fn get(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Heater => self.heater,
            Subsystem::Cooler => self.cooler,
        }
    }

    pub fn set(&mut self, subsystem: Subsystem, value: bool) {
        match subsystem {
            Subsystem::Heater => self.heater = value,
            Subsystem::Cooler => self.cooler = value,
        }
    }

    pub fn is_full(&self) -> bool {
        self.heater && self.cooler
    }

    fn complement(&self) -> Self {
        Self {
            heater: !self.heater,
            cooler: !self.cooler,
        }
    }
}

/// Per-room completion flags for one phase.
///
/// Subsystems a room does not host are marked done on every clear, so
/// completeness only waits for real participants.
#[derive(Debug, Clone)]
pub struct PhaseCompletionSet {
    expected: BTreeMap<RoomId, SubsystemPair>,
    done: BTreeMap<RoomId, SubsystemPair>,
}

impl PhaseCompletionSet {
    pub fn new(participants: &BTreeMap<RoomId, Vec<Subsystem>>) -> Self {
        let expected: BTreeMap<_, _> = participants
            .iter()
            .map(|(room, subsystems)| {
                let mut pair = SubsystemPair::default();
                for s in subsystems {
                    pair.set(*s, true);
                }
                (room.clone(), pair)
            })
            .collect();

        let mut set = Self {
            expected,
            done: BTreeMap::new(),
        };
        set.clear();
        set
    }

    pub fn clear(&mut self) {
        self.done = self
            .expected
            .iter()
            .map(|(room, pair)| (room.clone(), pair.complement()))
            .collect();
    }

    pub fn contains(&self, room: &RoomId, subsystem: Subsystem) -> bool {
        self.expected
            .get(room)
            .map(|pair| pair.get(subsystem))
            .unwrap_or(false)
    }

    /// Marks a pair done. Returns `false` if it already was.
    pub fn mark(&mut self, room: &RoomId, subsystem: Subsystem) -> Result<bool, BarrierError> {
        if !self.contains(room, subsystem) {
            return Err(BarrierError::UnknownParticipant {
                room: room.clone(),
                subsystem,
            });
        }
        let pair = self.done.entry(room.clone()).or_default();
        let fresh = !pair.get(subsystem);
        pair.set(subsystem, true);
        Ok(fresh)
    }

    pub fn is_done(&self, room: &RoomId, subsystem: Subsystem) -> bool {
        self.done
            .get(room)
            .map(|pair| pair.get(subsystem))
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.done.values().all(SubsystemPair::is_full)
    }

    /// Pairs still expected in this phase.
    pub fn outstanding(&self) -> Vec<(RoomId, Subsystem)> {
        self.done
            .iter()
            .flat_map(|(room, pair)| {
                Subsystem::ALL
                    .into_iter()
                    .filter(move |s| !pair.get(*s))
                    .map(move |s| (room.clone(), s))
            })
            .collect()
    }
}

/// Gate state broadcast to waiting followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Gate {
    generation: u64,
    open: bool,
    cancelled: bool,
}

/// Reusable barrier for one phase.
pub struct PhaseBarrier {
    phase: Phase,
    set: Mutex<PhaseCompletionSet>,
    gate: watch::Sender<Gate>,
    completed: Notify,
}

impl PhaseBarrier {
    pub fn new(phase: Phase, participants: &BTreeMap<RoomId, Vec<Subsystem>>) -> Self {
        let (gate, _) = watch::channel(Gate::default());
        Self {
            phase,
            set: Mutex::new(PhaseCompletionSet::new(participants)),
            gate,
            completed: Notify::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current generation (incremented by every release).
    pub fn generation(&self) -> u64 {
        self.gate.borrow().generation
    }

    pub fn is_open(&self) -> bool {
        self.gate.borrow().open
    }

    /// Leader: opens the gate for a new generation.
    pub fn release(&self) -> u64 {
        let _set = self.set.lock().unwrap();
        let mut generation = 0;
        self.gate.send_modify(|gate| {
            gate.generation += 1;
            gate.open = true;
            generation = gate.generation;
        });
        tracing::trace!("{} phase released (generation {})", self.phase, generation);
        generation
    }

    /// Follower: waits until the gate is open and this pair is still
    /// outstanding. Returns the generation the contribution belongs to.
    pub async fn await_open_and_release(
        &self,
        room: &RoomId,
        subsystem: Subsystem,
    ) -> Result<u64, BarrierError> {
        let mut rx = self.gate.subscribe();
        loop {
            let gate = *rx.borrow_and_update();
            if gate.cancelled {
                return Err(BarrierError::Cancelled);
            }
            {
                let set = self.set.lock().unwrap();
                if !set.contains(room, subsystem) {
                    return Err(BarrierError::UnknownParticipant {
                        room: room.clone(),
                        subsystem,
                    });
                }
                if gate.open && !set.is_done(room, subsystem) {
                    return Ok(gate.generation);
                }
            }
            if rx.changed().await.is_err() {
                return Err(BarrierError::Cancelled);
            }
        }
    }

    /// Marks a pair done in whatever generation is open.
    pub fn open(&self, room: &RoomId, subsystem: Subsystem) -> Result<bool, BarrierError> {
        let generation = self.generation();
        self.open_in(generation, room, subsystem)
    }

    /// Marks a pair done, provided `generation` is still the open one.
    ///
    /// Re-marking is a no-op returning `false`. The last pair wakes the
    /// leader.
    pub fn open_in(
        &self,
        generation: u64,
        room: &RoomId,
        subsystem: Subsystem,
    ) -> Result<bool, BarrierError> {
        let mut set = self.set.lock().unwrap();
        let gate = *self.gate.borrow();
        if gate.cancelled {
            return Err(BarrierError::Cancelled);
        }
        if !gate.open || gate.generation != generation {
            return Err(BarrierError::Closed);
        }
        let fresh = set.mark(room, subsystem)?;
        if fresh && set.is_complete() {
            self.completed.notify_one();
        }
        Ok(fresh)
    }

    pub fn is_complete(&self) -> bool {
        self.set.lock().unwrap().is_complete()
    }

    pub fn contains(&self, room: &RoomId, subsystem: Subsystem) -> bool {
        self.set.lock().unwrap().contains(room, subsystem)
    }

    /// Leader: waits until every participant has reported.
    pub async fn wait_complete(&self) -> Result<(), BarrierError> {
        loop {
            if self.gate.borrow().cancelled {
                return Err(BarrierError::Cancelled);
            }
            if self.is_complete() {
                return Ok(());
            }
            self.completed.notified().await;
        }
    }

    /// Leader: clears the completion set and closes the gate.
    pub fn reset(&self) {
        let mut set = self.set.lock().unwrap();
        set.clear();
        self.gate.send_modify(|gate| gate.open = false);
    }

    /// Wakes every waiter with [`BarrierError::Cancelled`].
    pub fn cancel(&self) {
        let _set = self.set.lock().unwrap();
        self.gate.send_modify(|gate| {
            gate.cancelled = true;
            gate.open = false;
        });
        self.completed.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.borrow().cancelled
    }

    pub fn outstanding(&self) -> Vec<(RoomId, Subsystem)> {
        self.set.lock().unwrap().outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn participants() -> BTreeMap<RoomId, Vec<Subsystem>> {
        [
            (RoomId::new("A11"), vec![Subsystem::Heater, Subsystem::Cooler]),
            (RoomId::new("A12"), vec![Subsystem::Heater]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_completion_set_needs_every_expected_pair() {
        let mut set = PhaseCompletionSet::new(&participants());
        let a11 = RoomId::new("A11");
        let a12 = RoomId::new("A12");

        assert!(!set.is_complete());
        assert_eq!(set.outstanding().len(), 3);

        set.mark(&a11, Subsystem::Heater).unwrap();
        set.mark(&a11, Subsystem::Cooler).unwrap();
        assert!(!set.is_complete());

        // A12 hosts no cooler, so its heater alone completes the room
        assert!(set.mark(&a12, Subsystem::Heater).unwrap());
        assert!(set.is_complete());

        set.clear();
        assert!(!set.is_complete());
        assert!(set.is_done(&a12, Subsystem::Cooler));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut set = PhaseCompletionSet::new(&participants());
        let a11 = RoomId::new("A11");
        assert!(set.mark(&a11, Subsystem::Heater).unwrap());
        assert!(!set.mark(&a11, Subsystem::Heater).unwrap());
    }

    #[test]
    fn test_unknown_participant() {
        let mut set = PhaseCompletionSet::new(&participants());
        let err = set.mark(&RoomId::new("A12"), Subsystem::Cooler).unwrap_err();
        assert!(matches!(err, BarrierError::UnknownParticipant { .. }));
        assert!(set.mark(&RoomId::new("B99"), Subsystem::Heater).is_err());
    }

    #[test]
    fn test_open_requires_open_gate() {
        let barrier = PhaseBarrier::new(Phase::Read, &participants());
        let a11 = RoomId::new("A11");

        assert_eq!(barrier.open(&a11, Subsystem::Heater), Err(BarrierError::Closed));

        let generation = barrier.release();
        assert_eq!(barrier.open_in(generation, &a11, Subsystem::Heater), Ok(true));

        barrier.reset();
        barrier.release();
        // Contribution for a phase that already moved on
        assert_eq!(
            barrier.open_in(generation, &a11, Subsystem::Heater),
            Err(BarrierError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_wait_for_release() {
        let barrier = Arc::new(PhaseBarrier::new(Phase::Read, &participants()));
        let a11 = RoomId::new("A11");

        let follower = {
            let barrier = barrier.clone();
            let room = a11.clone();
            tokio::spawn(async move { barrier.await_open_and_release(&room, Subsystem::Heater).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!follower.is_finished());

        let generation = barrier.release();
        assert_eq!(follower.await.unwrap(), Ok(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_pair_waits_for_next_generation() {
        let barrier = Arc::new(PhaseBarrier::new(Phase::Update, &participants()));
        let a11 = RoomId::new("A11");

        let first = barrier.release();
        barrier.open_in(first, &a11, Subsystem::Heater).unwrap();

        let follower = {
            let barrier = barrier.clone();
            let room = a11.clone();
            tokio::spawn(async move { barrier.await_open_and_release(&room, Subsystem::Heater).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!follower.is_finished());

        barrier.reset();
        let second = barrier.release();
        assert_eq!(follower.await.unwrap(), Ok(second));
        assert_eq!(second, first + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_wakes_on_last_pair() {
        let barrier = Arc::new(PhaseBarrier::new(Phase::Read, &participants()));
        let generation = barrier.release();

        let leader = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait_complete().await })
        };

        for (room, subsystem) in [
            ("A11", Subsystem::Heater),
            ("A12", Subsystem::Heater),
            ("A11", Subsystem::Cooler),
        ] {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!leader.is_finished());
            barrier.open_in(generation, &RoomId::new(room), subsystem).unwrap();
        }

        assert_eq!(leader.await.unwrap(), Ok(()));
        assert!(barrier.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_everyone() {
        let barrier = Arc::new(PhaseBarrier::new(Phase::Read, &participants()));

        let follower = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier
                    .await_open_and_release(&RoomId::new("A12"), Subsystem::Heater)
                    .await
            })
        };
        let leader = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait_complete().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        barrier.cancel();
        assert_eq!(follower.await.unwrap(), Err(BarrierError::Cancelled));
        assert_eq!(leader.await.unwrap(), Err(BarrierError::Cancelled));
    }
}
