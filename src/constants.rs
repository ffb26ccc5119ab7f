//! Application-wide constants
//!
//! Names, keys and protocol values shared between the owner and delegate
//! processes. Both sides of the socket must agree on everything in `ipc`.

/// Identity of the application on the desktop
pub mod app {
    /// Display name (tray title, help banner)
    pub const NAME: &str = "SleepPreventer";

    /// Directory name under the runtime dir holding the lock and socket
    pub const RUNTIME_DIR: &str = "sleep-preventer";

    /// Reverse-domain identifier handed to the power-management facility
    pub const REVERSE_DOMAIN: &str = "io.github.sleep_preventer";

    /// Reason string shown by desktops that list active inhibitors
    pub const INHIBIT_REASON: &str = "Keep-awake requested by user";
}

/// Persisted configuration file
pub mod config {
    /// Extension swapped onto the executable path to locate the config file
    pub const EXTENSION: &str = "cfg";

    pub const KEY_ENABLE: &str = "enable";
    pub const KEY_SYSTEM: &str = "system";
    pub const KEY_DISPLAY: &str = "display";
}

/// Single-instance registry and wire protocol
pub mod ipc {
    use std::time::Duration;

    /// Lock file whose exclusive flock marks the running owner
    pub const LOCK_FILENAME: &str = "instance.lock";

    /// Socket published by the owner once it can process deliveries
    pub const SOCKET_FILENAME: &str = "instance.sock";

    /// Discriminator: flags update from a newly launched instance
    pub const KIND_FLAGS_UPDATE: u32 = 1;

    /// Upper bound on a single frame; envelopes are tiny
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Delegate gives up waiting on an unresponsive owner after this long
    pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Attempts to locate the owner's socket before reporting it missing
    pub const LOCATE_ATTEMPTS: u32 = 10;

    /// Delay between locate attempts
    pub const LOCATE_RETRY_DELAY: Duration = Duration::from_millis(100);
}

/// Status icon names (freedesktop icon theme)
pub mod tray {
    pub const ICON_ACTIVE: &str = "caffeine-cup-full";
    pub const ICON_INACTIVE: &str = "caffeine-cup-empty";
}
