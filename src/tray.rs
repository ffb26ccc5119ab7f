//! Status icon and context menu via the StatusNotifier D-Bus protocol
//!
//! The tray service runs on its own small tokio runtime (ksni is async).
//! Menu clicks never touch power state directly; they are queued as
//! events for the owner's control loop.

use anyhow::{anyhow, Context, Result};
use ksni::TrayMethods;
use ksni::menu::{CheckmarkItem, StandardItem};
use std::sync::mpsc::Sender;
use tracing::{info, warn};

use crate::app::{Event, MenuCommand};
use crate::constants::{app, tray};
use crate::power::PowerState;

/// Visible presence of the owner in the desktop shell
pub trait Presence {
    /// Redraw icon, tooltip and menu checkmarks for `state`
    fn update(&mut self, state: PowerState);

    /// Remove the icon; called once at shutdown
    fn unregister(&mut self);
}

struct StatusTray {
    state: PowerState,
    events: Sender<Event>,
}

impl StatusTray {
    fn send(&self, command: MenuCommand) {
        if self.events.send(Event::Menu(command)).is_err() {
            warn!(?command, "Event loop gone, dropping menu command");
        }
    }
}

impl ksni::Tray for StatusTray {
    const MENU_ON_ACTIVATE: bool = true;

    fn id(&self) -> String {
        env!("CARGO_PKG_NAME").into()
    }

    fn title(&self) -> String {
        app::NAME.into()
    }

    fn icon_name(&self) -> String {
        if self.state.directive().is_none() {
            tray::ICON_INACTIVE.into()
        } else {
            tray::ICON_ACTIVE.into()
        }
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        ksni::ToolTip {
            title: app::NAME.into(),
            description: describe(self.state),
            ..Default::default()
        }
    }

    fn menu(&self) -> Vec<ksni::MenuItem<Self>> {
        vec![
            CheckmarkItem {
                label: "Enable".into(),
                checked: self.state.enabled,
                activate: Box::new(|this: &mut Self| this.send(MenuCommand::ToggleEnable)),
                ..Default::default()
            }
            .into(),
            CheckmarkItem {
                label: "Prevent system sleep".into(),
                enabled: self.state.enabled,
                checked: self.state.prevent_system_sleep,
                activate: Box::new(|this: &mut Self| this.send(MenuCommand::ToggleSystem)),
                ..Default::default()
            }
            .into(),
            CheckmarkItem {
                label: "Prevent display off".into(),
                enabled: self.state.enabled,
                checked: self.state.prevent_display_off,
                activate: Box::new(|this: &mut Self| this.send(MenuCommand::ToggleDisplay)),
                ..Default::default()
            }
            .into(),
            ksni::MenuItem::Separator,
            StandardItem {
                label: "Quit".into(),
                icon_name: "application-exit".into(),
                activate: Box::new(|this: &mut Self| this.send(MenuCommand::Quit)),
                ..Default::default()
            }
            .into(),
        ]
    }
}

/// Tooltip text listing what is currently kept awake
fn describe(state: PowerState) -> String {
    let directive = state.directive();
    match (directive.system, directive.display) {
        (false, false) if state.enabled => "Enabled, nothing selected".into(),
        (false, false) => "Disabled".into(),
        (true, false) => "Preventing system sleep".into(),
        (false, true) => "Preventing display off".into(),
        (true, true) => "Preventing system sleep and display off".into(),
    }
}

/// ksni-backed presence
pub struct TrayPresence {
    runtime: tokio::runtime::Runtime,
    handle: ksni::Handle<StatusTray>,
}

impl TrayPresence {
    /// Register the status icon. Fails when no StatusNotifier host is running.
    pub fn register(state: PowerState, events: Sender<Event>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tray")
            .enable_all()
            .build()
            .context("Failed to start tray runtime")?;

        let tray = StatusTray { state, events };
        let handle = runtime
            .block_on(tray.spawn())
            .map_err(|e| anyhow!("Failed to register status icon: {e}"))?;

        info!("Tray icon created");
        Ok(Self { runtime, handle })
    }
}

impl Presence for TrayPresence {
    fn update(&mut self, state: PowerState) {
        let updated = self
            .runtime
            .block_on(self.handle.update(move |tray: &mut StatusTray| tray.state = state));
        if updated.is_none() {
            warn!("Tray service has stopped, icon not updated");
        }
    }

    fn unregister(&mut self) {
        self.runtime.block_on(self.handle.shutdown());
        info!("Tray icon removed");
    }
}
