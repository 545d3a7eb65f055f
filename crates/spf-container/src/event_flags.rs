//! Framework event flags.
//!
//! Handlers raise events while they run; the data path consumes them at its
//! next checkpoint. The owning thread writes a plain word. Other contexts
//! (asynchronous command handling, peer notifications delivered out of band)
//! write an atomic shadow word through an [`AsyncEventSetter`]. The two are
//! merged by [`EventFlags::reconcile`] before anything reads them.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// OR-able set of framework events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FwkEvent(u32);

impl FwkEvent {
    /// No event.
    pub const NONE: Self = Self(0);
    /// A subgraph changed state.
    pub const SG_STATE_CHANGE: Self = Self(1 << 0);
    /// The container moved between started and not started.
    pub const CNTR_RUN_STATE_CHANGE: Self = Self(1 << 1);
    /// The weighted processing scale factor changed.
    pub const KPPS_BW_SCALE_FACTOR_CHANGE: Self = Self(1 << 2);
    /// A real-time flag changed on some port.
    pub const RT_FTRT_CHANGE: Self = Self(1 << 3);
    /// Some port changed state or was closed.
    pub const PORT_STATE_CHANGE: Self = Self(1 << 4);
    /// Dynamic frame size changed.
    pub const DFS_CHANGE: Self = Self(1 << 5);
    /// Processing duration changed.
    pub const PROC_DUR_CHANGE: Self = Self(1 << 6);
    /// Container frame length changed.
    pub const FRAME_LEN_CHANGE: Self = Self(1 << 7);
    /// Island entry may be unblocked.
    pub const DCM_UNBLOCK_ISLAND_ENTRY: Self = Self(1 << 8);
    /// Island must be exited.
    pub const DCM_ISLAND_EXIT: Self = Self(1 << 9);
    /// The island vote must be evaluated again.
    pub const REEVALUATE_ISLAND_VOTE: Self = Self(1 << 10);
    /// An upstream peer changed its frame length.
    pub const UPSTREAM_FRAME_LEN_CHANGE: Self = Self(1 << 11);
    /// Data was flushed from some port.
    pub const PORT_FLUSHED: Self = Self(1 << 12);

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a set from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// True if any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// True if no event is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FwkEvent {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FwkEvent {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Event flags of one container.
#[derive(Debug, Default)]
pub struct EventFlags {
    sync: u32,
    shadow: Arc<AtomicU32>,
}

impl EventFlags {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `ev` from the owning thread.
    #[inline]
    pub fn set(&mut self, ev: FwkEvent) {
        self.sync |= ev.bits();
    }

    /// Handle for raising events from another context.
    pub fn async_setter(&self) -> AsyncEventSetter {
        AsyncEventSetter(Arc::clone(&self.shadow))
    }

    /// Folds the shadow word into the owned word and clears the shadow.
    ///
    /// Must run before any handler reads the flags.
    pub fn reconcile(&mut self) -> FwkEvent {
        let shadow = self.shadow.swap(0, Ordering::AcqRel);
        self.sync |= shadow;
        FwkEvent(self.sync)
    }

    /// Owned word, without the shadow.
    #[inline]
    pub fn current(&self) -> FwkEvent {
        FwkEvent(self.sync)
    }

    /// True if any bit of `ev` is set in the owned word.
    #[inline]
    pub fn contains(&self, ev: FwkEvent) -> bool {
        self.current().intersects(ev)
    }

    /// Clears `ev`.
    #[inline]
    pub fn clear(&mut self, ev: FwkEvent) {
        self.sync &= !ev.bits();
    }

    /// Returns the reconciled set and clears everything.
    pub fn take(&mut self) -> FwkEvent {
        let ev = self.reconcile();
        self.sync = 0;
        ev
    }
}

/// Cloneable handle raising events into a container's shadow word.
#[derive(Clone, Debug)]
pub struct AsyncEventSetter(Arc<AtomicU32>);

impl AsyncEventSetter {
    /// Raises `ev`.
    pub fn set(&self, ev: FwkEvent) {
        self.0.fetch_or(ev.bits(), Ordering::AcqRel);
    }
}
