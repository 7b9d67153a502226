use super::PatchError;
use super::Result;

use log::trace;
use regex::bytes::Regex;

/// Action is an enum which defines the two kinds of entries in a byte signature:
///    * `Ignore` => The byte analyzed will always match
///    * `Offset(u8)` => The byte analyzed will have to match the given one
///
/// This enum is normally built from a signature string by the Pattern struct.
///
/// Example
/// ```rust
///    use srcfixes::pattern::Action;
///    let action = Action::Ignore;
///    let action_from = Action::from("??");
///    let action = Action::from("2F");
///    let action = Action::Offset(0x2F);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Offset(u8),
    Ignore,
}
impl Action {
    /// from is a function which returns an Action given a two-character hex token
    pub fn from(action: &str) -> Result<Self> {
        use Action::*;
        let action = match action {
            "??" => Ignore,
            _ => Offset(hex::decode(action)?[0]),
        };
        Ok(action)
    }
}
impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Action::*;
        match self {
            Ignore => write!(f, "??")?,
            Offset(offset) => write!(f, "{:#04x}", offset)?,
        };
        Ok(())
    }
}

/// Pattern is a byte signature with wildcard positions, scanned forward inside a
/// bounded window starting from an anchor address.
///
/// The first (lowest) offset where every non-wildcard byte matches exactly wins.
/// A match has to fit entirely inside the window.
///
/// Example
/// ```rust
/// use srcfixes::pattern::Pattern;
/// let pattern = Pattern::new("0F 82 ?? ?? ?? ?? 83 EC").unwrap();
/// assert_eq!(pattern.len(), 8);
/// ```
#[derive(Clone, Debug)]
pub struct Pattern {
    offsets: Vec<Action>,
}
impl Pattern {
    /// Parses a signature string of space-separated hex tokens, `??` marking a
    /// wildcard byte. Empty signatures are rejected here so the scanner never
    /// has to deal with them.
    pub fn new(pattern: &str) -> Result<Self> {
        let offsets: Vec<Action> = pattern
            .split(' ')
            .filter(|token| !token.is_empty())
            .map(Action::from)
            .collect::<Result<Vec<Action>>>()?;
        if offsets.is_empty() {
            return Err(PatchError::PatternError(pattern.to_string()));
        }
        Ok(Pattern { offsets })
    }

    /// Number of bytes the signature covers, wildcards included.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        // Rejected by `new`, kept for the conventional pairing with `len`.
        self.offsets.is_empty()
    }

    fn build_regexp(&self) -> Result<Regex> {
        let mut regexp = self
            .offsets
            .iter()
            .map(|x| match x {
                Action::Ignore => ".".to_string(),
                Action::Offset(offset) => format!("\\x{:02x}", offset),
            })
            .collect::<Vec<_>>()
            .join("");
        regexp.insert_str(0, "(?s-u)");
        Ok(Regex::new(&regexp)?)
    }

    /// Returns the offset of the first match inside `window`, or None.
    pub fn find_in(&self, window: &[u8]) -> Option<usize> {
        let regexp = match self.build_regexp() {
            Ok(regexp) => regexp,
            Err(_) => return None,
        };
        regexp.find(window).map(|matches| matches.start())
    }

    /// Scans `window` bytes forward from `base` and returns the absolute address
    /// of the first match.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `window` bytes starting at `base` are
    /// mapped and readable.
    pub unsafe fn find(&self, base: usize, window: usize) -> Option<usize> {
        trace!("Scanning {:#x}+{:#x} for pattern {}", base, window, self);
        let data = std::slice::from_raw_parts(base as *const u8, window);
        self.find_in(data).map(|offset| base + offset)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for action in &self.offsets {
            write!(f, "{} ", action)?
        }
        Ok(())
    }
}
