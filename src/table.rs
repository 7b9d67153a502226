use crate::config::GameConfig;
use crate::intercept::HookPriority;
use crate::patcher::PatchDescriptor;
use crate::Result;

/// Toggles for the optional server-behavior patches. Console-variable
/// plumbing lives in the plugin shell; by the time the plan is built these
/// are plain booleans. Defaults mirror the shipped cvar defaults.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Force all spawnpoints and buyzones to the CT side.
    pub force_ct_spawn: bool,
    /// Skip the cash reset to 16000 when buying an item.
    pub skip_cash_reset: bool,
    /// Let players run around freely after game end.
    pub gameend_unfreeze: bool,
    /// Always transmit point_viewcontrol (debugging aid).
    pub always_transmit_viewcontrol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            force_ct_spawn: true,
            skip_cash_reset: true,
            gameend_unfreeze: true,
            always_transmit_viewcontrol: false,
        }
    }
}

/// A function detour to request from the redirection mechanism; the target is
/// resolved from the config alias at install time.
#[derive(Clone, Debug)]
pub struct DetourSpec {
    pub alias: &'static str,
    pub priority: HookPriority,
}

/// A vtable-slot override to request. The alias resolves to the vtable
/// object's address (config offset included); the first callable slot sits
/// past the offset-to-top and RTTI words.
#[derive(Clone, Debug)]
pub struct VtableHookSpec {
    pub alias: &'static str,
    pub slot: usize,
    pub priority: HookPriority,
}

/// Everything `on_load` installs, in order: detours, vtable hooks, patches.
#[derive(Clone, Debug, Default)]
pub struct InstallPlan {
    pub detours: Vec<DetourSpec>,
    pub vtable_hooks: Vec<VtableHookSpec>,
    pub patches: Vec<PatchDescriptor>,
}

const DETOURS: &[&str] = &[
    "CBaseFilter::InputTestActivator",
    "CBaseEntity::PostConstructor",
    "CreateEntityByName",
    "CBaseFilter::PassesFilterImpl",
    "CBasePlayer::FindUseEntity",
    "CTraceFilterSimple::CTraceFilterSimple",
    "CBaseEntity::KeyValue",
    "FX_FireBullets",
    "CKnife::SwingOrStab",
];

/// Builds the builtin plan against a loaded config. Patch anchors are looked
/// up eagerly so a broken config fails the load before anything is touched.
pub fn builtin_plan(config: &GameConfig, settings: &Settings) -> Result<InstallPlan> {
    let bytes_patch = |name: &str, alias: &str, signature: &str, replacement: &str| {
        let entry = config.entry(alias)?;
        PatchDescriptor::bytes(name, &entry.library, &entry.symbol, signature, replacement)
    };
    let call_patch = |name: &str, alias: &str, target_alias: &str, replacement: &str| {
        let entry = config.entry(alias)?;
        let target = config.entry(target_alias)?;
        PatchDescriptor::call(
            name,
            &entry.library,
            &entry.symbol,
            &target.library,
            &target.symbol,
            replacement,
        )
    };

    let mut patches = vec![
        // game_ui must not apply FL_ONTRAIN, else client prediction turns off.
        bytes_patch(
            "game_ui-no-ontrain",
            "CGameUI::Think",
            "0F 82 ?? ?? ?? ?? 83 EC ?? 6A ?? 53 E8 ?? ?? ?? ??",
            "0F 82 C4 03 00 00 83 EC 08 6A 10 53 90 90 90 90 90",
        )?,
        // player_speedmod must not turn off the flashlight.
        bytes_patch(
            "speedmod-keep-flashlight",
            "CMovementSpeedMod::InputSpeedMod",
            "0F 85 ?? ?? ?? ?? 83 EC ?? 57 E8 ?? ?? ?? ?? 83 C4 ?? 09 83",
            "90 90 90 90 90 90 83 EC 0C 57 E8 1D FF FF FF 83 C4 10 09 83",
        )?,
        // Disable the alive check in point_viewcontrol Disable.
        bytes_patch(
            "viewcontrol-disable-alive-check",
            "CTriggerCamera::Disable",
            "0F 84 ?? ?? ?? ?? F6 83 ?? ?? ?? ?? ?? 0F 85",
            "90 90 90 90 90 90 F6 83 40 01 00 00 20 0F 85",
        )?,
        // Keep m_takedamage intact when point_viewcontrol is enabled.
        bytes_patch(
            "viewcontrol-keep-takedamage",
            "CTriggerCamera::Enable",
            "C6 80 FD 00 00 00 00 8B 83",
            "90 90 90 90 90 90 90 8B 83",
        )?
        .window(0x600),
        // Skip the m_nOldTakeDamage writeback in point_viewcontrol Disable.
        bytes_patch(
            "viewcontrol-skip-takedamage-restore",
            "CTriggerCamera::Disable",
            "74 ?? 8B 16 8B 92 ?? ?? ?? ?? 81 FA ?? ?? ?? ?? 0F 85",
            "EB 1A 8B 16 8B 92 04 02 00 00 81 FA 30 F9 29 00 0F 85",
        )?,
        // Keep the fakeclient field out of the userinfo stringtable.
        bytes_patch(
            "userinfo-no-fakeclient",
            "CBaseClient::FillUserInfo",
            "88 46 6C",
            "90 90 90",
        )?,
        // Packet spam floods the console with ConMsgs and lags the server;
        // NOP every call site inside the two packet-header paths.
        call_patch(
            "netchan-silence-conmsg",
            "CNetChan::ProcessPacketHeader",
            "ConMsg",
            "90 90 90 90 90",
        )?
        .window(0x7d1)
        .occurrences(100),
        call_patch(
            "netgetlong-silence-conmsg",
            "NET_GetLong",
            "ConMsg",
            "90 90 90 90 90",
        )?
        .window(0x800)
        .occurrences(100),
        // CTriggerCamera::FollowTarget: don't early-return on a null player
        // handle.
        bytes_patch(
            "followtarget-null-handle",
            "CTriggerCamera::FollowTarget",
            "0F 84 D6 02 00 00 83 FA FF",
            "90 90 90 90 90 90 83 FA FF",
        )?,
        // NOP out player->SetGravity(0) in CGameMovement::LadderMove. The
        // cloned _part_0 function has no stable symbol, so the anchor is the
        // function laid out right before it.
        bytes_patch(
            "laddermove-keep-gravity",
            "CGameMovement::CheckFalling",
            "C7 80 ?? ?? ?? ?? ?? ?? ?? ?? 8B 03 8B 80",
            "90 90 90 90 90 90 90 90 90 90 8B 03 8B 80",
        )?,
        // CZipPackFile::GetFileInfo rejects mixed-case names in bsp pakfiles.
        bytes_patch(
            "zippack-mixed-case",
            "CZipPackFile::GetFileInfo",
            "75 ?? 8B 09",
            "90 90 8B 09",
        )?,
    ];

    if settings.force_ct_spawn {
        patches.push(bytes_patch(
            "spawn-ct-only",
            "CCSPlayer::EntSelectSpawnPoint",
            "74 ?? 83 EC ?? 53 E8 ?? ?? ?? ?? 83 C4 ?? 83 F8 ?? 0F 84",
            "EB 57 83 EC 0C 53 E8 6E 34 CA FF 83 C4 10 83 F8 02 0F 84",
        )?);
        patches.push(bytes_patch(
            "spawn-skip-t-check",
            "CCSGameRules::NeededPlayersCheck",
            "74 0A 8B 83 ?? ?? ?? ?? 85 C0 75 ?? 83 EC ?? 68 ?? ?? ?? ?? E8 ?? ?? ?? ?? 5A 59",
            "75 54 8B 83 94 02 00 00 85 C0 75 4A 90 90 90 90 90 90 90 90 90 90 90 90 90 90 90",
        )?);
    }

    if settings.skip_cash_reset {
        patches.push(bytes_patch(
            "buy-no-cash-reset",
            "CCSPlayer::AddAccount",
            "3D ?? ?? ?? ?? 0F 8F ?? ?? ?? ?? 8D 65",
            "90 90 90 90 90 90 90 90 90 90 90 8D 65",
        )?);
    }

    if settings.gameend_unfreeze {
        patches.push(bytes_patch(
            "gameend-no-freeze-flag",
            "CCSGameRules::GoToIntermission",
            "74 0E 83 EC 08 6A 40 50",
            "EB 0E 83 EC 08 6A 40 50",
        )?);
        patches.push(bytes_patch(
            "gameend-skip-freeze-period",
            "CCSGameRules::GoToIntermission",
            "75 0F E8 69 CE DA FF 8B 45 08",
            "EB 0F E8 69 CE DA FF 8B 45 08",
        )?);
    }

    if settings.always_transmit_viewcontrol {
        patches.push(bytes_patch(
            "viewcontrol-always-transmit",
            "CTriggerCamera::UpdateTransmitState",
            "74 16",
            "EB 16",
        )?);
    }

    Ok(InstallPlan {
        detours: DETOURS
            .iter()
            .map(|&alias| DetourSpec {
                alias,
                priority: HookPriority::Pre,
            })
            .collect(),
        vtable_hooks: vec![
            VtableHookSpec {
                alias: "CTraceFilterSkipTwoEntities",
                slot: 0,
                priority: HookPriority::Post,
            },
            VtableHookSpec {
                alias: "CTraceFilterSimple",
                slot: 0,
                priority: HookPriority::Post,
            },
        ],
        patches,
    })
}
