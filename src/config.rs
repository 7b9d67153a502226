use super::PatchError;
use super::Result;
use crate::symbols::SymbolSource;

use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One resolvable target: which module to query and the build-specific mangled
/// export name, plus an optional byte offset applied after resolution (used for
/// data anchors like vtables).
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolEntry {
    pub library: String,
    pub symbol: String,
    #[serde(default)]
    pub offset: isize,
}

/// The game config maps logical aliases (how patches and detours name their
/// targets) to per-platform/per-build [`SymbolEntry`] values. Loaded once at
/// extension load; nothing keeps the file open afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameConfig {
    pub symbols: BTreeMap<String, SymbolEntry>,
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: GameConfig = serde_json::from_str(&content)?;
        debug!("Loaded game config with {} symbols", config.symbols.len());
        Ok(config)
    }

    pub fn entry(&self, alias: &str) -> Result<&SymbolEntry> {
        self.symbols
            .get(alias)
            .ok_or_else(|| PatchError::UnknownAlias(alias.to_string()))
    }

    /// Resolves an alias to an absolute address, applying the configured
    /// offset.
    pub fn address_of(&self, source: &dyn SymbolSource, alias: &str) -> Result<usize> {
        let entry = self.entry(alias)?;
        let address = source.resolve(&entry.library, &entry.symbol)?;
        Ok((address as isize + entry.offset) as usize)
    }
}
