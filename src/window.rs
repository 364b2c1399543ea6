//! Window identity and pacing.
//!
//! A [`WindowId`] is the unit of checkpoint granularity and the dedup
//! key embedded in every tuple's identity. The high 32 bits are a
//! coarse epoch in seconds since the Unix epoch, the low 32 bits count
//! windows within that epoch. Ordering is plain numeric ordering.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// 64-bit, strictly increasing window identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(u64);

impl WindowId {
    /// Largest sequence number before rolling into the next epoch.
    pub const MAX_SEQUENCE: u32 = u32::MAX;

    pub fn new(epoch_seconds: u32, sequence: u32) -> Self {
        Self((u64::from(epoch_seconds) << 32) | u64::from(sequence))
    }

    /// First window of the epoch containing `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        let secs = u32::try_from(at.timestamp().max(0)).unwrap_or(u32::MAX);
        Self::new(secs, 0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn epoch_seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sequence(&self) -> u32 {
        self.0 as u32
    }

    /// The window after this one, or `None` past the last
    /// representable id.
    ///
    /// Pure: the same window always has the same successor, which is
    /// what lets a restarted source replay identical window ids.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Number of windows from `earlier` up to `self`, if both share an
    /// epoch, otherwise counts whole epochs as full sequences.
    pub fn windows_since(&self, earlier: WindowId) -> u64 {
        if *self <= earlier {
            return 0;
        }
        if self.epoch_seconds() == earlier.epoch_seconds() {
            u64::from(self.sequence() - earlier.sequence())
        } else {
            let epochs = u64::from(self.epoch_seconds() - earlier.epoch_seconds());
            epochs * (u64::from(Self::MAX_SEQUENCE) + 1) + u64::from(self.sequence())
                - u64::from(earlier.sequence())
        }
    }
}

/// Deterministic text form `"{epoch_seconds}_{sequence}"`.
impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.epoch_seconds(), self.sequence())
    }
}

impl FromStr for WindowId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, seq) = s
            .split_once('_')
            .ok_or_else(|| format!("window id `{s}` is not of the form `seconds_sequence`"))?;
        let secs = secs
            .parse::<u32>()
            .map_err(|err| format!("bad epoch in window id `{s}`: {err}"))?;
        let seq = seq
            .parse::<u32>()
            .map_err(|err| format!("bad sequence in window id `{s}`: {err}"))?;
        Ok(Self::new(secs, seq))
    }
}

/// Paces a source operator so each window lasts `width` of system
/// time.
///
/// Only timing lives here. Which window comes next is decided by
/// [`WindowId::next`] so that it doesn't depend on wall clock.
#[derive(Debug)]
pub(crate) struct WindowClock {
    width: Duration,
    window_started: Option<Instant>,
}

impl WindowClock {
    pub(crate) fn new(width: Duration) -> Self {
        Self {
            width,
            window_started: None,
        }
    }

    /// How long until the next window may begin. Zero if it can
    /// start now.
    pub(crate) fn remaining(&self) -> Duration {
        match self.window_started {
            None => Duration::ZERO,
            Some(started) => self.width.saturating_sub(started.elapsed()),
        }
    }

    pub(crate) fn start_window(&mut self) {
        self.window_started = Some(Instant::now());
    }
}

#[test]
fn layout_splits_epoch_and_sequence() {
    let id = WindowId::new(1_700_000_000, 7);
    assert_eq!(id.epoch_seconds(), 1_700_000_000);
    assert_eq!(id.sequence(), 7);
    assert_eq!(id.as_u64(), (1_700_000_000u64 << 32) | 7);
}

#[test]
fn ordering_is_numeric() {
    let a = WindowId::new(10, u32::MAX);
    let b = WindowId::new(11, 0);
    assert!(a < b);
    assert_eq!(a.next(), Some(b));
    assert!(WindowId::new(10, 1) < WindowId::new(10, 2));
}

#[test]
fn text_form_is_seconds_underscore_sequence() {
    let id = WindowId::new(1_700_000_000, 42);
    assert_eq!(id.to_string(), "1700000000_42");
    assert_eq!("1700000000_42".parse::<WindowId>(), Ok(id));
    assert!("170000000042".parse::<WindowId>().is_err());
}

#[test]
fn windows_since_counts_within_epoch() {
    let a = WindowId::new(5, 3);
    assert_eq!(WindowId::new(5, 9).windows_since(a), 6);
    assert_eq!(a.windows_since(a), 0);
    assert_eq!(a.windows_since(WindowId::new(5, 9)), 0);
    assert_eq!(WindowId::new(6, 0).windows_since(WindowId::new(5, u32::MAX)), 1);
}

#[test]
fn serializes_as_plain_u64() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(&WindowId::new(1, 2), &[Token::U64((1u64 << 32) | 2)]);
}

#[test]
fn starting_at_uses_epoch_seconds() {
    let at = DateTime::<Utc>::from_timestamp(1_700_000_123, 999).unwrap();
    assert_eq!(WindowId::starting_at(at), WindowId::new(1_700_000_123, 0));
}

#[test]
fn next_stops_at_last_window() {
    let last = WindowId::new(u32::MAX, u32::MAX);
    assert_eq!(last.next(), None);
    let before = WindowId::new(u32::MAX, u32::MAX - 1);
    assert_eq!(before.next(), Some(last));
}
