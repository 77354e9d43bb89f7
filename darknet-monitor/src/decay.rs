//! Credit-based activity decay.
//!
//! Every index carries a credit in `[0, alpha + 1]`. Activity refills it to
//! `alpha + 1`; each silent tick drains one unit. An index is inactive exactly
//! when its credit is zero, so short gaps in signal delivery never flip it.

/// Outcome of polling one index's activity flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    Active,
    Silent,
    /// The poll failed or timed out; the credit is held over.
    Unknown,
}

impl From<bool> for Signal {
    fn from(active: bool) -> Self {
        if active { Signal::Active } else { Signal::Silent }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Inactive -> active. Credit refilled.
    BecameActive,
    /// Already active and seen again. Credit refilled.
    Refreshed,
    /// Silent but still has credit left.
    Coasting,
    /// Last unit of credit spent.
    BecameInactive,
    StillInactive,
    HeldOver,
}

impl Transition {
    /// Value the data plane's active marker must take after this transition,
    /// if it changes.
    pub fn marker(self) -> Option<bool> {
        match self {
            Transition::BecameActive => Some(true),
            Transition::BecameInactive => Some(false),
            _ => None,
        }
    }
}

/// Largest usable `alpha`; a full credit of `alpha + 1` must fit in a `u32`.
pub const MAX_ALPHA: u32 = u32::MAX - 1;

/// Per-index credit counters.
#[derive(Clone, Debug)]
pub struct CreditTable {
    alpha: u32,
    credits: Vec<u32>,
}

impl CreditTable {
    /// All indices start active. With `alpha == 0` they start with a single
    /// unit so the first silent tick, not construction, marks them inactive.
    pub fn new(len: usize, alpha: u32) -> Self {
        let alpha = alpha.min(MAX_ALPHA);
        Self {
            alpha,
            credits: vec![alpha.max(1); len],
        }
    }

    pub fn alpha(&self) -> u32 {
        self.alpha
    }

    pub fn len(&self) -> usize {
        self.credits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }

    pub fn credit(&self, index: usize) -> Option<u32> {
        self.credits.get(index).copied()
    }

    pub fn is_inactive(&self, index: usize) -> bool {
        self.credits.get(index) == Some(&0)
    }

    pub fn inactive_count(&self) -> usize {
        self.credits.iter().filter(|c| **c == 0).count()
    }

    /// Apply one tick's signal to `index`. Out-of-range indices are held over.
    pub fn apply(&mut self, index: usize, signal: Signal) -> Transition {
        let alpha = self.alpha;
        match self.credits.get_mut(index) {
            Some(credit) => step(credit, alpha, signal),
            None => Transition::HeldOver,
        }
    }
}

fn step(credit: &mut u32, alpha: u32, signal: Signal) -> Transition {
    match signal {
        Signal::Unknown => Transition::HeldOver,
        Signal::Active => {
            let was_inactive = *credit == 0;
            *credit = alpha + 1;
            if was_inactive {
                Transition::BecameActive
            } else {
                Transition::Refreshed
            }
        }
        Signal::Silent => match *credit {
            0 => Transition::StillInactive,
            1 => {
                *credit = 0;
                Transition::BecameInactive
            }
            _ => {
                *credit -= 1;
                Transition::Coasting
            }
        },
    }
}
