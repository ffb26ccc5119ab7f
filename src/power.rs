//! Power state controller
//!
//! Three independent booleans collapse into one keep-awake directive, which
//! is handed to the OS power-management facility. Applying is best-effort:
//! backend failures are logged and otherwise ignored.

use tracing::{debug, info, warn};

use crate::constants::app;
use crate::ipc::{FlagOverrides, IpcFlags};

/// One of the three user-facing flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerFlag {
    Enabled,
    PreventSystemSleep,
    PreventDisplayOff,
}

impl PowerFlag {
    pub const ALL: [PowerFlag; 3] = [
        PowerFlag::Enabled,
        PowerFlag::PreventSystemSleep,
        PowerFlag::PreventDisplayOff,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerState {
    pub enabled: bool,
    pub prevent_system_sleep: bool,
    pub prevent_display_off: bool,
}

impl PowerState {
    pub fn get(&self, flag: PowerFlag) -> bool {
        match flag {
            PowerFlag::Enabled => self.enabled,
            PowerFlag::PreventSystemSleep => self.prevent_system_sleep,
            PowerFlag::PreventDisplayOff => self.prevent_display_off,
        }
    }

    pub fn set(&mut self, flag: PowerFlag, value: bool) {
        match flag {
            PowerFlag::Enabled => self.enabled = value,
            PowerFlag::PreventSystemSleep => self.prevent_system_sleep = value,
            PowerFlag::PreventDisplayOff => self.prevent_display_off = value,
        }
    }

    /// Apply the `Some` entries of `overrides`, leaving the rest alone
    pub fn merge(&mut self, overrides: FlagOverrides) {
        if let Some(value) = overrides.enable {
            self.enabled = value;
        }
        if let Some(value) = overrides.system {
            self.prevent_system_sleep = value;
        }
        if let Some(value) = overrides.display {
            self.prevent_display_off = value;
        }
    }

    /// Nothing is prevented while `enabled` is off
    pub fn directive(&self) -> Directive {
        if !self.enabled {
            return Directive::NONE;
        }
        Directive {
            system: self.prevent_system_sleep,
            display: self.prevent_display_off,
        }
    }
}

/// What the OS is asked to keep awake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Directive {
    pub system: bool,
    pub display: bool,
}

impl Directive {
    pub const NONE: Directive = Directive {
        system: false,
        display: false,
    };

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// OS power-management facility
///
/// Each call replaces whatever this backend requested before.
pub trait PowerBackend {
    fn apply(&mut self, directive: Directive) -> anyhow::Result<()>;
}

/// Backend built on the `keepawake` crate (logind/ScreenSaver inhibitors on Linux)
#[derive(Default)]
pub struct KeepAwakeBackend {
    guard: Option<keepawake::KeepAwake>,
}

impl PowerBackend for KeepAwakeBackend {
    fn apply(&mut self, directive: Directive) -> anyhow::Result<()> {
        // Release first so a new request never stacks on the old one
        self.guard = None;
        if directive.is_none() {
            return Ok(());
        }

        let guard = keepawake::Builder::default()
            .display(directive.display)
            .idle(directive.system)
            .sleep(directive.system)
            .reason(app::INHIBIT_REASON)
            .app_name(app::NAME)
            .app_reverse_domain(app::REVERSE_DOMAIN)
            .create()
            .map_err(|e| anyhow::anyhow!("keepawake request failed: {e}"))?;
        self.guard = Some(guard);
        Ok(())
    }
}

pub struct PowerController<B: PowerBackend> {
    state: PowerState,
    backend: B,
}

impl<B: PowerBackend> PowerController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            state: PowerState::default(),
            backend,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Replace all three flags without touching the OS
    pub fn load_state(&mut self, state: PowerState) {
        self.state = state;
    }

    /// Issue the directive derived from the current flags
    pub fn apply_state(&mut self) {
        let directive = self.state.directive();
        debug!(?directive, "Applying keep-awake directive");
        if let Err(e) = self.backend.apply(directive) {
            warn!(error = %e, ?directive, "Failed to apply keep-awake directive");
        }
    }

    /// Decode an IPC flag field, update the flags, then apply
    pub fn apply_state_from_flags(&mut self, flags: IpcFlags) {
        let overrides = flags.decode();
        self.state.merge(overrides);
        info!(flags = flags.bits(), state = ?self.state, "Applied flag update");
        self.apply_state();
    }

    /// Flip one flag and apply; returns the new value
    pub fn toggle(&mut self, flag: PowerFlag) -> bool {
        let value = !self.state.get(flag);
        self.state.set(flag, value);
        info!(?flag, value, "Toggled power flag");
        self.apply_state();
        value
    }

    /// Release every request, regardless of the flags
    pub fn finish(&mut self) {
        if let Err(e) = self.backend.apply(Directive::NONE) {
            warn!(error = %e, "Failed to release keep-awake directive");
        }
    }
}
