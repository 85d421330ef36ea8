//! Triple-buffer swap protocol between one writer and one reader.
//!
//! Three slots are addressed by `read_idx` and `write_idx`. The writer (the
//! compute loop) renders into `write_idx`, the reader (the frame loop) samples
//! `read_idx`. Each side swaps in two phases: a non-blocking `try_*` that
//! advances its index when the other side allows it, and a `complete_*` issued
//! once the GPU work that may still touch the previous slot has drained.
//!
//! The distance `(write_idx - read_idx) mod 3` is always 1 or 2. Distance 2
//! means a freshly written slot sits between them and the reader may advance;
//! distance 1 means the reader caught up and the writer may advance.

use parking_lot::Mutex;

/// Number of field slots.
pub const SLOT_COUNT: usize = 3;

/// Current phase of the swap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    /// No transition in progress.
    General,
    /// The reader advanced and is draining frames that used the old slot.
    ReadingNew,
    /// The writer advanced and is draining work that used the old slot.
    WritingNew,
}

/// Completing a transition from the wrong phase. Always a protocol bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// `complete_*` called while not in the matching phase.
    #[error("cannot complete {transition}: expected phase {expected:?}, found {found:?}")]
    UnexpectedPhase {
        /// The transition being completed.
        transition: &'static str,
        /// Phase the transition requires.
        expected: SwapPhase,
        /// Phase actually observed.
        found: SwapPhase,
    },
}

/// Pure swap state. Wrap in [`TripleBuffer`] to share between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripleBufferState {
    read_idx: usize,
    write_idx: usize,
    phase: SwapPhase,
}

impl Default for TripleBufferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TripleBufferState {
    /// Initial state: reader on slot 0, writer on slot 2.
    pub const fn new() -> Self {
        Self {
            read_idx: 0,
            write_idx: 2,
            phase: SwapPhase::General,
        }
    }

    /// Slot the reader samples.
    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    /// Slot the writer renders into.
    pub fn write_idx(&self) -> usize {
        self.write_idx
    }

    /// Current phase.
    pub fn phase(&self) -> SwapPhase {
        self.phase
    }

    /// `(write_idx - read_idx) mod 3`.
    pub fn distance(&self) -> usize {
        (self.write_idx + SLOT_COUNT - self.read_idx) % SLOT_COUNT
    }

    /// Advance the reader onto the newest written slot, if there is one.
    pub fn try_transition_to_read_new(&mut self) -> bool {
        if self.phase != SwapPhase::General || self.distance() != 2 {
            return false;
        }
        self.read_idx = (self.read_idx + 1) % SLOT_COUNT;
        self.phase = SwapPhase::ReadingNew;
        true
    }

    /// Finish a reader transition.
    pub fn complete_transition_to_read_new(&mut self) -> Result<(), TransitionError> {
        self.complete("transition to read new", SwapPhase::ReadingNew)
    }

    /// Advance the writer onto a free slot, if the reader has caught up.
    pub fn try_transition_to_write_new(&mut self) -> bool {
        if self.phase != SwapPhase::General || self.distance() != 1 {
            return false;
        }
        self.write_idx = (self.write_idx + 1) % SLOT_COUNT;
        self.phase = SwapPhase::WritingNew;
        true
    }

    /// Finish a writer transition.
    pub fn complete_transition_to_write_new(&mut self) -> Result<(), TransitionError> {
        self.complete("transition to write new", SwapPhase::WritingNew)
    }

    fn complete(&mut self, transition: &'static str, expected: SwapPhase) -> Result<(), TransitionError> {
        if self.phase != expected {
            return Err(TransitionError::UnexpectedPhase {
                transition,
                expected,
                found: self.phase,
            });
        }
        self.phase = SwapPhase::General;
        Ok(())
    }
}

/// Thread-safe [`TripleBufferState`]. Every call takes the lock briefly and
/// never waits on the other side.
#[derive(Debug, Default)]
pub struct TripleBuffer {
    state: Mutex<TripleBufferState>,
}

impl TripleBuffer {
    /// Initial state: reader on slot 0, writer on slot 2.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TripleBufferState {
        *self.state.lock()
    }

    /// Slot the reader samples.
    pub fn read_idx(&self) -> usize {
        self.state.lock().read_idx()
    }

    /// Slot the writer renders into.
    pub fn write_idx(&self) -> usize {
        self.state.lock().write_idx()
    }

    /// See [`TripleBufferState::try_transition_to_read_new`].
    pub fn try_transition_to_read_new(&self) -> bool {
        self.state.lock().try_transition_to_read_new()
    }

    /// See [`TripleBufferState::complete_transition_to_read_new`].
    pub fn complete_transition_to_read_new(&self) -> Result<(), TransitionError> {
        self.state.lock().complete_transition_to_read_new()
    }

    /// See [`TripleBufferState::try_transition_to_write_new`].
    pub fn try_transition_to_write_new(&self) -> bool {
        self.state.lock().try_transition_to_write_new()
    }

    /// See [`TripleBufferState::complete_transition_to_write_new`].
    pub fn complete_transition_to_write_new(&self) -> Result<(), TransitionError> {
        self.state.lock().complete_transition_to_write_new()
    }
}
