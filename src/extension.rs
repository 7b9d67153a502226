use crate::config::GameConfig;
use crate::intercept::{HookTarget, HookToken, InterceptState, Redirector};
use crate::patcher::{InstallMode, PatchSet};
use crate::symbols::SymbolSource;
use crate::table::{builtin_plan, InstallPlan, Settings};
use crate::Result;

use log::{debug, error, info};
use std::mem;

/// Itanium-ABI vtable symbols point at the offset-to-top word; the slot array
/// starts after it and the typeinfo pointer.
pub const VTABLE_HEADER: usize = 2 * mem::size_of::<usize>();

/// Ties the pieces together over the host's load/unload lifecycle: loads the
/// config, installs detours and vtable hooks through the [`Redirector`],
/// applies the patch set, and tears everything down again in reverse.
///
/// Loading is all-or-nothing: if any step fails, whatever was installed up to
/// that point is removed before the error is returned, so a failed load leaves
/// the process exactly as it found it.
pub struct Extension<R, S> {
    config: GameConfig,
    settings: Settings,
    redirector: R,
    symbols: S,
    patches: PatchSet,
    hooks: Vec<HookToken>,
    state: InterceptState,
    plan: Option<InstallPlan>,
    loaded: bool,
}

impl<R: Redirector, S: SymbolSource> Extension<R, S> {
    /// Extension with the builtin plan, built from `config` and `settings` at
    /// load time.
    pub fn new(config: GameConfig, settings: Settings, redirector: R, symbols: S) -> Self {
        Extension {
            config,
            settings,
            redirector,
            symbols,
            patches: PatchSet::default(),
            hooks: vec![],
            state: InterceptState::new(),
            plan: None,
            loaded: false,
        }
    }

    /// Extension with an explicit plan instead of the builtin one.
    pub fn with_plan(
        config: GameConfig,
        settings: Settings,
        redirector: R,
        symbols: S,
        plan: InstallPlan,
    ) -> Self {
        let mut extension = Self::new(config, settings, redirector, symbols);
        extension.plan = Some(plan);
        extension
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn state(&self) -> &InterceptState {
        &self.state
    }

    pub fn redirector(&self) -> &R {
        &self.redirector
    }

    pub fn applied_patches(&self) -> usize {
        self.patches.applied_count()
    }

    /// Script-callable: install or clear the entity-owner remap table used by
    /// the bullet filter.
    pub fn set_entity_remap(&self, map: Option<Vec<i32>>) {
        self.state.set_remap(map);
    }

    /// Installs everything in plan order. On any error the partial install is
    /// rolled back via [`Extension::on_unload`] before returning.
    ///
    /// # Safety
    ///
    /// Patch anchors resolved through the symbol source must point into mapped
    /// code that is not concurrently executing; same contract as
    /// [`PatchSet::apply_all`].
    pub unsafe fn on_load(&mut self, mode: InstallMode) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if let Err(e) = self.install(mode) {
            error!("Load failed, rolling back: {}", e);
            self.on_unload();
            return Err(e);
        }
        self.loaded = true;
        Ok(())
    }

    unsafe fn install(&mut self, mode: InstallMode) -> Result<()> {
        let plan = match &self.plan {
            Some(plan) => plan.clone(),
            None => builtin_plan(&self.config, &self.settings)?,
        };

        for detour in &plan.detours {
            let entry = self.config.entry(detour.alias)?;
            let target = HookTarget::Export {
                library: entry.library.clone(),
                symbol: entry.symbol.clone(),
            };
            let token = self
                .redirector
                .install(detour.alias, &target, detour.priority)?;
            debug!("Detoured {}", detour.alias);
            self.hooks.push(token);
        }

        for hook in &plan.vtable_hooks {
            let vtable = self.config.address_of(&self.symbols, hook.alias)? + VTABLE_HEADER;
            let target = HookTarget::VtableSlot {
                vtable,
                slot: hook.slot,
            };
            let token = self.redirector.install(hook.alias, &target, hook.priority)?;
            debug!("Hooked {} slot {} at {:#x}", hook.alias, hook.slot, vtable);
            self.hooks.push(token);
        }

        self.patches = PatchSet::new(plan.patches);
        self.patches.apply_all(&self.symbols, mode)?;
        info!(
            "Installed {} hooks and {} patch occurrences",
            self.hooks.len(),
            self.patches.applied_count()
        );
        Ok(())
    }

    /// Tears down in reverse install order: hooks newest-first, then patch
    /// bytes, then interception state. Individual failures are logged and the
    /// teardown continues; unloading never half-stops.
    ///
    /// # Safety
    ///
    /// Patched regions must still be mapped; same contract as
    /// [`PatchSet::revert_all`].
    pub unsafe fn on_unload(&mut self) {
        let mut tokens = mem::take(&mut self.hooks);
        while let Some(token) = tokens.pop() {
            if let Err(e) = self.redirector.remove(token) {
                error!("Could not remove hook {:?}: {}", token, e);
            }
        }
        if let Err(e) = self.patches.revert_all() {
            error!("Could not fully revert patches: {}", e);
        }
        self.state.reset();
        self.loaded = false;
    }

    /// Host callback fired once every other extension has loaded; nothing to
    /// resolve late here, so it only reports status.
    pub fn on_all_functionality_loaded(&self) {
        info!(
            "srcfixes running: {} hooks, {} patch occurrences",
            self.hooks.len(),
            self.patches.applied_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolEntry;
    use crate::intercept::HookPriority;
    use crate::patcher::PatchDescriptor;
    use crate::table::{DetourSpec, VtableHookSpec};
    use crate::PatchError;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Default)]
    struct FakeRedirector {
        active: HashMap<u64, (String, HookTarget)>,
        next: u64,
        fail_on: Option<&'static str>,
    }

    impl Redirector for FakeRedirector {
        fn install(
            &mut self,
            name: &str,
            target: &HookTarget,
            _priority: HookPriority,
        ) -> crate::Result<HookToken> {
            if self.fail_on == Some(name) {
                return Err(PatchError::HookError(name.to_string()));
            }
            self.next += 1;
            self.active
                .insert(self.next, (name.to_string(), target.clone()));
            Ok(HookToken(self.next))
        }

        fn remove(&mut self, token: HookToken) -> crate::Result<()> {
            self.active
                .remove(&token.0)
                .map(|_| ())
                .ok_or_else(|| PatchError::HookError(format!("unknown token {:?}", token)))
        }
    }

    struct MapSource(HashMap<(String, String), usize>);
    impl SymbolSource for MapSource {
        fn resolve(&self, library: &str, symbol: &str) -> crate::Result<usize> {
            self.0
                .get(&(library.to_string(), symbol.to_string()))
                .copied()
                .ok_or_else(|| {
                    PatchError::SymbolNotFound(library.to_string(), symbol.to_string())
                })
        }
    }

    fn config_with(aliases: &[(&str, &str)]) -> GameConfig {
        let mut symbols = BTreeMap::new();
        for (alias, symbol) in aliases {
            symbols.insert(
                alias.to_string(),
                SymbolEntry {
                    library: "server_srv.so".to_string(),
                    symbol: symbol.to_string(),
                    offset: 0,
                },
            );
        }
        GameConfig { symbols }
    }

    struct Fixture {
        buffer: Vec<u8>,
        vtable: Vec<usize>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut buffer = vec![0x55u8; 32];
            buffer[10] = 0x74;
            buffer[11] = 0x0E;
            Fixture {
                buffer,
                vtable: vec![0; 4],
            }
        }

        fn source(&mut self) -> MapSource {
            let mut map = HashMap::new();
            map.insert(
                ("server_srv.so".to_string(), "_think".to_string()),
                self.buffer.as_mut_ptr() as usize,
            );
            map.insert(
                ("server_srv.so".to_string(), "_ztv_filter".to_string()),
                self.vtable.as_mut_ptr() as usize,
            );
            MapSource(map)
        }

        fn plan(&self) -> InstallPlan {
            InstallPlan {
                detours: vec![DetourSpec {
                    alias: "CGameUI::Think",
                    priority: HookPriority::Pre,
                }],
                vtable_hooks: vec![VtableHookSpec {
                    alias: "CTraceFilterSimple",
                    slot: 0,
                    priority: HookPriority::Post,
                }],
                patches: vec![PatchDescriptor::bytes(
                    "jz-to-jmp",
                    "server_srv.so",
                    "_think",
                    "74 0E",
                    "EB 0E",
                )
                .unwrap()
                .window(self.buffer.len())],
            }
        }

        fn config(&self) -> GameConfig {
            config_with(&[
                ("CGameUI::Think", "_think"),
                ("CTraceFilterSimple", "_ztv_filter"),
            ])
        }
    }

    #[test]
    fn test_load_then_unload_restores_everything() {
        let mut fixture = Fixture::new();
        let pristine = fixture.buffer.clone();
        let source = fixture.source();
        let plan = fixture.plan();
        let vtable_base = fixture.vtable.as_ptr() as usize;
        let mut extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            FakeRedirector::default(),
            source,
            plan,
        );

        unsafe { extension.on_load(InstallMode::Strict) }.unwrap();
        assert!(extension.is_loaded());
        assert_eq!(extension.redirector().active.len(), 2);
        assert_eq!(extension.applied_patches(), 1);
        assert_eq!(&fixture.buffer[10..12], &[0xEB, 0x0E]);

        // The vtable hook skipped the two-word header.
        let filter_target = extension
            .redirector()
            .active
            .values()
            .find(|(name, _)| name == "CTraceFilterSimple")
            .map(|(_, target)| target.clone())
            .unwrap();
        assert_eq!(
            filter_target,
            HookTarget::VtableSlot {
                vtable: vtable_base + VTABLE_HEADER,
                slot: 0,
            }
        );

        unsafe { extension.on_unload() };
        assert!(!extension.is_loaded());
        assert!(extension.redirector().active.is_empty());
        assert_eq!(extension.applied_patches(), 0);
        assert_eq!(fixture.buffer, pristine);
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut fixture = Fixture::new();
        let source = fixture.source();
        let plan = fixture.plan();
        let mut extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            FakeRedirector::default(),
            source,
            plan,
        );

        unsafe { extension.on_load(InstallMode::Strict) }.unwrap();
        unsafe { extension.on_load(InstallMode::Strict) }.unwrap();
        assert_eq!(extension.redirector().active.len(), 2);
        assert_eq!(extension.applied_patches(), 1);
    }

    #[test]
    fn test_failed_hook_rolls_back_load() {
        let mut fixture = Fixture::new();
        let pristine = fixture.buffer.clone();
        let source = fixture.source();
        let plan = fixture.plan();
        let redirector = FakeRedirector {
            fail_on: Some("CTraceFilterSimple"),
            ..FakeRedirector::default()
        };
        let mut extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            redirector,
            source,
            plan,
        );

        assert!(matches!(
            unsafe { extension.on_load(InstallMode::Strict) },
            Err(PatchError::HookError(_))
        ));
        assert!(!extension.is_loaded());
        // The detour that made it in before the failure was removed again.
        assert!(extension.redirector().active.is_empty());
        assert_eq!(fixture.buffer, pristine);
    }

    #[test]
    fn test_failed_patch_rolls_back_hooks() {
        let mut fixture = Fixture::new();
        let source = fixture.source();
        let mut plan = fixture.plan();
        plan.patches = vec![PatchDescriptor::bytes(
            "absent",
            "server_srv.so",
            "_think",
            "DE AD BE EF",
            "90 90 90 90",
        )
        .unwrap()
        .window(fixture.buffer.len())];
        let mut extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            FakeRedirector::default(),
            source,
            plan,
        );

        assert!(matches!(
            unsafe { extension.on_load(InstallMode::Strict) },
            Err(PatchError::PatternNotFound(_))
        ));
        assert!(!extension.is_loaded());
        assert!(extension.redirector().active.is_empty());
    }

    #[test]
    fn test_unknown_detour_alias_fails_load() {
        let mut fixture = Fixture::new();
        let source = fixture.source();
        let mut plan = fixture.plan();
        plan.detours.push(DetourSpec {
            alias: "NotInConfig",
            priority: HookPriority::Pre,
        });
        let mut extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            FakeRedirector::default(),
            source,
            plan,
        );

        assert!(matches!(
            unsafe { extension.on_load(InstallMode::Strict) },
            Err(PatchError::UnknownAlias(_))
        ));
        assert!(extension.redirector().active.is_empty());
    }

    #[test]
    fn test_remap_setter_reaches_state() {
        let mut fixture = Fixture::new();
        let source = fixture.source();
        let plan = fixture.plan();
        let extension = Extension::with_plan(
            fixture.config(),
            Settings::default(),
            FakeRedirector::default(),
            source,
            plan,
        );
        extension.set_entity_remap(Some(vec![0, 1, 2]));
        extension.set_entity_remap(None);
    }
}
