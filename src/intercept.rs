use crate::Result;

use log::trace;
use std::cell::{Cell, RefCell};

/// Upper bound on entity indices the remap table may cover.
pub const MAX_EDICTS: usize = 2048;

/// Remap values in `-3..=-1` encode a team directly instead of a client index
/// (world-owned props get tagged with the team that spawned them).
fn team_marker(index: i32) -> Option<i32> {
    if (-3..=-1).contains(&index) {
        Some(-index)
    } else {
        None
    }
}

/// Call-scoped interception context shared between the outer detour (which
/// arms it) and the filter predicate (which reads it).
///
/// The whole crate runs on the host's single simulation thread; `Cell` and
/// `RefCell` make that assumption explicit. Arming is done through a guard so
/// the state cannot stay armed past the intercepted call's dynamic extent.
/// The armed flag is a single slot, not a stack: the host guarantees the
/// intercepted functions do not recurse into themselves.
#[derive(Debug, Default)]
pub struct InterceptState {
    armed: Cell<bool>,
    team: Cell<i32>,
    remap: RefCell<Option<Vec<i32>>>,
}

impl InterceptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self) -> bool {
        self.armed.get()
    }

    pub fn team(&self) -> i32 {
        self.team.get()
    }

    /// Arms the state for the duration of the returned guard. Context is
    /// cleared again when the guard drops, even on early return.
    pub fn arm(&self, team: i32) -> ArmedGuard<'_> {
        trace!("Arming bullet filter for team {}", team);
        self.armed.set(true);
        self.team.set(team);
        ArmedGuard { state: self }
    }

    /// Installs or clears the externally supplied entity-index remap table
    /// (script-callable setter).
    pub fn set_remap(&self, map: Option<Vec<i32>>) {
        *self.remap.borrow_mut() = map;
    }

    fn remapped(&self, index: i32) -> i32 {
        match self.remap.borrow().as_ref() {
            Some(map) => map.get(index as usize).copied().unwrap_or(index),
            None => index,
        }
    }

    /// Back to the neutral state: disarmed, no remap table.
    pub fn reset(&self) {
        self.armed.set(false);
        self.team.set(0);
        self.set_remap(None);
    }
}

/// Clears the armed context on scope exit.
pub struct ArmedGuard<'a> {
    state: &'a InterceptState,
}

impl<'a> Drop for ArmedGuard<'a> {
    fn drop(&mut self) {
        self.state.armed.set(false);
        self.state.team.set(0);
    }
}

/// What the substitute tells the call-redirection mechanism to do with the
/// intercepted call's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the original result; the substitute had no opinion.
    Defer,
    /// Use this value instead of the original result.
    Override(bool),
}

/// Player metadata the predicate needs; backed by the host's player manager
/// in production and by fixtures in tests. `None` answers mean the entity
/// cannot be resolved right now (disconnected, no info) and must never be
/// guessed around.
pub trait PlayerLookup {
    fn max_clients(&self) -> i32;
    fn team(&self, client: i32) -> Option<i32>;
    fn is_alive(&self, client: i32) -> Option<bool>;
}

/// Trace-filter predicate, invoked by the redirection mechanism after the
/// original `ShouldHitEntity` on every candidate entity considered during a
/// bullet trace.
///
/// Outside the armed window this is a strict pass-through, so unrelated
/// traces are untouched. Inside it, a candidate on the arming shooter's team
/// (or an already-dead player) is forced to not-hit; anything that cannot be
/// resolved to a team defers to the original result.
pub fn bullet_filter(
    state: &InterceptState,
    players: &dyn PlayerLookup,
    entry_index: i32,
    original_result: bool,
) -> Verdict {
    if !state.armed() {
        return Verdict::Defer;
    }
    // The original filter already rejected the hit; nothing to override.
    if !original_result {
        return Verdict::Defer;
    }

    let max_clients = players.max_clients();
    let mut index = entry_index;
    if index > max_clients && (index as usize) < MAX_EDICTS {
        index = state.remapped(index);
    }

    let team;
    let mut alive = true;
    if let Some(marker) = team_marker(index) {
        team = marker;
    } else if index >= 1 && index <= max_clients {
        team = match players.team(index) {
            Some(team) => team,
            None => return Verdict::Defer,
        };
        alive = players.is_alive(index).unwrap_or(true);
    } else {
        return Verdict::Defer;
    }

    if team == state.team() || !alive {
        return Verdict::Override(false);
    }
    Verdict::Defer
}

/// Runs `original` with the filter armed for `shooter`'s team. If the shooter
/// cannot be resolved the call goes through unarmed, leaving behavior
/// untouched rather than guessing.
pub fn fire_scoped<R>(
    state: &InterceptState,
    players: &dyn PlayerLookup,
    shooter: i32,
    original: impl FnOnce() -> R,
) -> R {
    if shooter < 1 || shooter > players.max_clients() {
        return original();
    }
    match players.team(shooter) {
        Some(team) => {
            let _armed = state.arm(team);
            original()
        }
        None => original(),
    }
}

/// Identity returned by the redirection mechanism at install time and handed
/// back for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookToken(pub u64);

/// Whether the substitute runs before or after the original implementation.
/// Run-after substitutes get to see the original result (see [`Verdict`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPriority {
    Pre,
    Post,
}

/// What gets redirected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookTarget {
    /// A free or member function reachable through an exported symbol.
    Export { library: String, symbol: String },
    /// One function-pointer slot in a vtable located at `vtable`, for targets
    /// only reachable through dynamic dispatch.
    VtableSlot { vtable: usize, slot: usize },
}

/// Contract required from the external call-redirection mechanism. The crate
/// never generates trampolines itself; it installs substitutes through this
/// boundary and removes them with the same token.
pub trait Redirector {
    fn install(&mut self, name: &str, target: &HookTarget, priority: HookPriority)
        -> Result<HookToken>;
    fn remove(&mut self, token: HookToken) -> Result<()>;
}
