//! Probes, patterns and session labels.
//!
//! K_i: A probe is a (position, digit) pair over a fixed-width identifier.
//! K_i: Probe ↔ pattern ↔ label are bijections; nothing is lost in transit.
//! B_i: A label read back from the audit trail may be anything → Result

use super::LabelError;
use std::fmt;
use std::str::FromStr;

/// Width of an AWS account id.
pub const ACCOUNT_ID_WIDTH: usize = 12;

/// Number of values a single digit can take.
pub const DIGIT_RANGE: u8 = 10;

/// Marker for "any digit" in a pattern.
pub const WILDCARD: char = '?';

/// Stand-in for the wildcard inside a session label.
///
/// `?` is rejected by STS as a session name character; `-` is accepted and
/// never collides with a digit.
pub const SEPARATOR: char = '-';

/// One (position, digit) pair of the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Probe {
    pub position: usize,
    pub digit: u8,
}

impl Probe {
    pub fn new(position: usize, digit: u8) -> Self {
        debug_assert!(digit < DIGIT_RANGE, "digit out of range: {digit}");
        Self { position, digit }
    }

    /// The digit as its ASCII character.
    pub fn digit_char(&self) -> char {
        char::from(b'0' + self.digit)
    }
}

/// Enumerate the full probe space, position-major then digit.
///
/// Every (position, digit) combination appears exactly once.
pub fn probe_space(width: usize, digit_range: u8) -> Vec<Probe> {
    (0..width)
        .flat_map(|position| (0..digit_range).map(move |digit| Probe::new(position, digit)))
        .collect()
}

/// A width-length string with one concrete digit and wildcards elsewhere.
///
/// e.g. `Pattern::new(12, Probe::new(2, 7))` renders as `??7?????????`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pattern {
    width: usize,
    probe: Probe,
}

impl Pattern {
    pub fn new(width: usize, probe: Probe) -> Self {
        debug_assert!(probe.position < width, "position outside pattern width");
        Self { width, probe }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn probe(&self) -> Probe {
        self.probe
    }

    /// Render with an arbitrary filler for the non-digit positions.
    fn render(&self, filler: char) -> String {
        (0..self.width)
            .map(|i| {
                if i == self.probe.position {
                    self.probe.digit_char()
                } else {
                    filler
                }
            })
            .collect()
    }

    /// Parse a rendered pattern using `filler` as the wildcard marker.
    fn parse(s: &str, filler: char) -> Result<Self, LabelError> {
        let width = s.chars().count();
        let mut found: Option<Probe> = None;
        let mut digits = 0;

        for (position, c) in s.chars().enumerate() {
            if let Some(d) = c.to_digit(10) {
                digits += 1;
                found = Some(Probe::new(position, d as u8));
            } else if c != filler {
                return Err(LabelError::InvalidCharacter {
                    label: s.to_string(),
                    position,
                    found: c,
                });
            }
        }

        match (digits, found) {
            (1, Some(probe)) => Ok(Self::new(width, probe)),
            _ => Err(LabelError::DigitCount {
                label: s.to_string(),
                digits,
            }),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(WILDCARD))
    }
}

impl FromStr for Pattern {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, WILDCARD)
    }
}

/// Session label carried through STS into the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityLabel(String);

impl IdentityLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode a pattern as a session label.
pub fn encode(pattern: &Pattern) -> IdentityLabel {
    IdentityLabel(pattern.render(SEPARATOR))
}

/// Decode a session label observed in the audit trail back into its pattern.
///
/// B_i(label was produced by `encode`) → Result
pub fn decode(label: &str, width: usize) -> Result<Pattern, LabelError> {
    let actual = label.chars().count();
    if actual != width {
        return Err(LabelError::WrongLength {
            label: label.to_string(),
            expected: width,
            actual,
        });
    }
    Pattern::parse(label, SEPARATOR)
}
