//! Power flags as persisted in the config store

use crate::config::ConfigStore;
use crate::constants::config::{KEY_DISPLAY, KEY_ENABLE, KEY_SYSTEM};
use crate::power::{PowerFlag, PowerState};

fn key_for(flag: PowerFlag) -> &'static str {
    match flag {
        PowerFlag::Enabled => KEY_ENABLE,
        PowerFlag::PreventSystemSleep => KEY_SYSTEM,
        PowerFlag::PreventDisplayOff => KEY_DISPLAY,
    }
}

/// Add any missing keys with value 0 so the file always lists all three
pub fn seed_defaults(store: &ConfigStore) {
    for flag in PowerFlag::ALL {
        store.set(key_for(flag), 0, true);
    }
}

/// Read the persisted power state; absent keys read as off
pub fn read_state(store: &ConfigStore) -> PowerState {
    let read = |flag| store.get(key_for(flag)).unwrap_or(0) != 0;
    PowerState {
        enabled: read(PowerFlag::Enabled),
        prevent_system_sleep: read(PowerFlag::PreventSystemSleep),
        prevent_display_off: read(PowerFlag::PreventDisplayOff),
    }
}

/// Copy every flag into the store (does not save)
pub fn write_state(store: &ConfigStore, state: &PowerState) {
    for flag in PowerFlag::ALL {
        store.set(key_for(flag), i32::from(state.get(flag)), false);
    }
}
