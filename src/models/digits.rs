//! Confirmed digits and final identifier assembly.
//!
//! K_i: A position, once confirmed, is never overwritten.
//! B_i: Evidence is consistent → conflicts are recorded, not raised.

use super::{IdentityLabel, Probe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker for a position the run could not resolve.
pub const UNKNOWN: char = '?';

/// Conflicting evidence for one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationAnomaly {
    pub position: usize,
    /// Digit confirmed first and kept
    pub kept: u8,
    /// Digit seen later and discarded
    pub conflicting: u8,
    /// Session label that carried the conflicting digit
    pub label: String,
}

/// What happened when a probe observation was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Position was unresolved and is now confirmed
    Confirmed,
    /// Position already held the same digit
    Duplicate,
    /// Position already held a different digit; first value kept
    Conflict { kept: u8 },
}

/// Per-position resolved digits, first writer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedDigits {
    digits: BTreeMap<usize, u8>,
    anomalies: Vec<CorrelationAnomaly>,
}

impl ConfirmedDigits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `probe` was observed under `label`.
    pub fn record(&mut self, probe: Probe, label: &IdentityLabel) -> RecordOutcome {
        match self.digits.get(&probe.position) {
            None => {
                self.digits.insert(probe.position, probe.digit);
                RecordOutcome::Confirmed
            }
            Some(&kept) if kept == probe.digit => RecordOutcome::Duplicate,
            Some(&kept) => {
                self.anomalies.push(CorrelationAnomaly {
                    position: probe.position,
                    kept,
                    conflicting: probe.digit,
                    label: label.to_string(),
                });
                RecordOutcome::Conflict { kept }
            }
        }
    }

    pub fn get(&self, position: usize) -> Option<u8> {
        self.digits.get(&position).copied()
    }

    /// Number of resolved positions.
    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn anomalies(&self) -> &[CorrelationAnomaly] {
        &self.anomalies
    }
}

/// Assemble the final identifier, `?` for every unresolved position.
///
/// Pure and idempotent. Positions at or beyond `width` are ignored.
pub fn assemble(confirmed: &ConfirmedDigits, width: usize) -> String {
    (0..width)
        .map(|position| match confirmed.get(position) {
            Some(digit) => char::from(b'0' + digit),
            None => UNKNOWN,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{encode, Pattern, ACCOUNT_ID_WIDTH};

    fn observe(digits: &mut ConfirmedDigits, position: usize, digit: u8) -> RecordOutcome {
        let probe = Probe::new(position, digit);
        let label = encode(&Pattern::new(ACCOUNT_ID_WIDTH, probe));
        digits.record(probe, &label)
    }

    #[test]
    fn test_assemble_partial() {
        let mut digits = ConfirmedDigits::new();
        observe(&mut digits, 0, 4);
        observe(&mut digits, 1, 2);
        observe(&mut digits, 3, 9);

        assert_eq!(assemble(&digits, ACCOUNT_ID_WIDTH), "42?9????????");
    }

    #[test]
    fn test_assemble_is_idempotent() {
        let mut digits = ConfirmedDigits::new();
        for (position, digit) in [(0, 1), (5, 0), (11, 8)] {
            observe(&mut digits, position, digit);
        }
        let first = assemble(&digits, ACCOUNT_ID_WIDTH);
        let second = assemble(&digits, ACCOUNT_ID_WIDTH);
        assert_eq!(first, second);
        assert_eq!(first, "1????0?????8");
        assert_eq!(assemble(&ConfirmedDigits::new(), 3), "???");
    }

    #[test]
    fn test_first_writer_wins() {
        let mut digits = ConfirmedDigits::new();
        assert_eq!(observe(&mut digits, 5, 1), RecordOutcome::Confirmed);
        assert_eq!(observe(&mut digits, 5, 1), RecordOutcome::Duplicate);
        assert_eq!(observe(&mut digits, 5, 7), RecordOutcome::Conflict { kept: 1 });

        assert_eq!(digits.get(5), Some(1));
        assert_eq!(digits.len(), 1);
        assert_eq!(
            digits.anomalies(),
            &[CorrelationAnomaly {
                position: 5,
                kept: 1,
                conflicting: 7,
                label: "-----7------".to_string(),
            }]
        );
    }
}
