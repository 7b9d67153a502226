use crate::callsite;
use crate::memory;
use crate::pattern::Pattern;
use crate::symbols::SymbolSource;
use crate::{PatchError, Result};

use log::{debug, error};

/// Default number of bytes scanned forward from the anchor symbol. Keeps a
/// signature from matching in unrelated code further down the module.
pub const DEFAULT_WINDOW: usize = 0x400;

/// Parses a replacement byte string of space-separated hex tokens. No
/// wildcards here: every byte gets written.
pub fn parse_bytes(text: &str) -> Result<Vec<u8>> {
    let mut bytes = vec![];
    for token in text.split(' ').filter(|token| !token.is_empty()) {
        bytes.push(hex::decode(token)?[0]);
    }
    Ok(bytes)
}

/// How a descriptor locates the region to overwrite, starting from its anchor.
#[derive(Clone, Debug)]
pub enum Matcher {
    /// Literal byte signature with wildcard positions.
    Bytes(Pattern),
    /// First `E8` call whose target is the given exported function. The match
    /// region is the whole 5-byte call instruction.
    Call { library: String, symbol: String },
}

/// Static configuration for one desired modification. Applied state lives in
/// the [`PatchSet`], never here.
#[derive(Clone, Debug)]
pub struct PatchDescriptor {
    name: String,
    library: String,
    anchor: String,
    matcher: Matcher,
    replacement: Vec<u8>,
    window: usize,
    max_occurrences: usize,
}

impl PatchDescriptor {
    /// Literal-signature descriptor. The replacement must cover exactly the
    /// signature's length; this is checked here so apply never has to.
    pub fn bytes(
        name: &str,
        library: &str,
        anchor: &str,
        signature: &str,
        replacement: &str,
    ) -> Result<Self> {
        let pattern = Pattern::new(signature)?;
        let replacement = parse_bytes(replacement)?;
        if replacement.len() != pattern.len() {
            return Err(PatchError::LengthMismatch {
                name: name.to_string(),
                expected: pattern.len(),
                got: replacement.len(),
            });
        }
        Ok(PatchDescriptor {
            name: name.to_string(),
            library: library.to_string(),
            anchor: anchor.to_string(),
            matcher: Matcher::Bytes(pattern),
            replacement,
            window: DEFAULT_WINDOW,
            max_occurrences: 1,
        })
    }

    /// Call-site descriptor: overwrite direct calls to `target_symbol`. The
    /// replacement must cover the 5-byte call instruction.
    pub fn call(
        name: &str,
        library: &str,
        anchor: &str,
        target_library: &str,
        target_symbol: &str,
        replacement: &str,
    ) -> Result<Self> {
        let replacement = parse_bytes(replacement)?;
        if replacement.len() != callsite::CALL_LEN {
            return Err(PatchError::LengthMismatch {
                name: name.to_string(),
                expected: callsite::CALL_LEN,
                got: replacement.len(),
            });
        }
        Ok(PatchDescriptor {
            name: name.to_string(),
            library: library.to_string(),
            anchor: anchor.to_string(),
            matcher: Matcher::Call {
                library: target_library.to_string(),
                symbol: target_symbol.to_string(),
            },
            replacement,
            window: DEFAULT_WINDOW,
            max_occurrences: 1,
        })
    }

    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn occurrences(mut self, max_occurrences: usize) -> Self {
        self.max_occurrences = max_occurrences.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn patch_len(&self) -> usize {
        self.replacement.len()
    }
}

/// One applied occurrence: where we wrote and what was there before. Exists if
/// and only if the write went through; reverting walks exactly these records,
/// so an occurrence that was never touched is never "restored".
#[derive(Debug)]
pub struct AppliedPatch {
    address: usize,
    original: Vec<u8>,
}

impl AppliedPatch {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

struct PatchEntry {
    descriptor: PatchDescriptor,
    applied: Vec<AppliedPatch>,
}

/// Whether a failing descriptor aborts the whole set or only marks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallMode {
    /// Stop at the first failing descriptor.
    Strict,
    /// Log each failure, keep applying the remaining independent descriptors,
    /// report the number of failures at the end. The caller still owns the
    /// decision to roll back.
    BestEffort,
}

/// Owns every descriptor and every applied-occurrence record. Records are
/// created at apply time and drained at revert time; the set tolerates being
/// reverted while partially (or not at all) populated.
#[derive(Default)]
pub struct PatchSet {
    entries: Vec<PatchEntry>,
}

impl PatchSet {
    pub fn new(descriptors: Vec<PatchDescriptor>) -> Self {
        PatchSet {
            entries: descriptors
                .into_iter()
                .map(|descriptor| PatchEntry {
                    descriptor,
                    applied: vec![],
                })
                .collect(),
        }
    }

    pub fn applied_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.applied.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &AppliedPatch> {
        self.entries.iter().flat_map(|entry| entry.applied.iter())
    }

    /// Applies every descriptor in configured order.
    ///
    /// # Safety
    ///
    /// Resolved anchors must point into mapped code and nothing may execute
    /// inside the patched regions while bytes are being rewritten.
    pub unsafe fn apply_all(&mut self, symbols: &dyn SymbolSource, mode: InstallMode) -> Result<()> {
        let mut failed = 0;
        for entry in &mut self.entries {
            if let Err(e) = Self::apply_entry(entry, symbols) {
                match mode {
                    InstallMode::Strict => return Err(e),
                    InstallMode::BestEffort => {
                        error!("{}: {}", entry.descriptor.name, e);
                        failed += 1;
                    }
                }
            }
        }
        if failed > 0 {
            return Err(PatchError::PartialFailure(failed));
        }
        Ok(())
    }

    unsafe fn apply_entry(entry: &mut PatchEntry, symbols: &dyn SymbolSource) -> Result<()> {
        enum Locator<'a> {
            Bytes(&'a Pattern),
            Call(usize),
        }

        let descriptor = &entry.descriptor;
        let anchor = symbols.resolve(&descriptor.library, &descriptor.anchor)?;
        let locator = match &descriptor.matcher {
            Matcher::Bytes(pattern) => Locator::Bytes(pattern),
            Matcher::Call { library, symbol } => Locator::Call(symbols.resolve(library, symbol)?),
        };

        let len = descriptor.patch_len();
        let mut offset = 0;
        for found in 0..descriptor.max_occurrences {
            if offset >= descriptor.window {
                break;
            }
            let remaining = descriptor.window - offset;
            let hit = match &locator {
                Locator::Bytes(pattern) => pattern.find(anchor + offset, remaining),
                Locator::Call(target) => callsite::find_call(anchor + offset, *target, remaining),
            };
            let address = match hit {
                Some(address) => address,
                // The first occurrence is mandatory; running out of matches
                // below max_occurrences afterwards is fine.
                None if found == 0 => {
                    return Err(PatchError::PatternNotFound(descriptor.name.clone()))
                }
                None => break,
            };
            offset = address - anchor + len;

            let original = memory::apply_bytes(address, &descriptor.replacement)?;
            debug!(
                "Patched {} occurrence {} at {:#x} ({} bytes)",
                descriptor.name, found, address, len
            );
            entry.applied.push(AppliedPatch { address, original });
        }
        Ok(())
    }

    /// Restores every applied record and frees it. Entries with zero records
    /// are skipped; regions across descriptors are disjoint so order does not
    /// matter. A protection failure is reported but does not stop the walk.
    ///
    /// # Safety
    ///
    /// Same contract as [`PatchSet::apply_all`]; patched regions must still be
    /// mapped.
    pub unsafe fn revert_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for entry in &mut self.entries {
            for record in entry.applied.drain(..) {
                if let Err(e) = memory::restore_bytes(record.address, &record.original) {
                    error!(
                        "Could not restore {} bytes at {:#x}: {}",
                        record.original.len(),
                        record.address,
                        e
                    );
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }
}
