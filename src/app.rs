//! Owner event loop
//!
//! Every input the owner reacts to (deliveries from later launches, menu
//! clicks, termination signals) arrives as an [`Event`] on one mpsc queue.
//! The loop is the only code that touches the power state, the config store
//! and the presence, so none of them need to be shared across threads.

use anyhow::{Context, Result};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use tracing::{debug, info, warn};

use crate::config::{settings, ConfigStore};
use crate::instance::{InstanceLock, InstanceRegistry};
use crate::ipc::{self, Delivery, IpcFlags, Reply, Request};
use crate::power::{PowerBackend, PowerController, PowerFlag, PowerState};
use crate::tray::Presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuCommand {
    ToggleEnable,
    ToggleSystem,
    ToggleDisplay,
    Quit,
}

#[derive(Debug)]
pub enum Event {
    /// Flag field handed over by a later launch
    Delivery(Delivery),
    Menu(MenuCommand),
    /// SIGINT / SIGTERM
    Quit,
}

impl From<Delivery> for Event {
    fn from(delivery: Delivery) -> Self {
        Event::Delivery(delivery)
    }
}

pub struct App<B: PowerBackend, P: Presence> {
    power: PowerController<B>,
    config: ConfigStore,
    presence: P,
}

impl<B: PowerBackend, P: Presence> App<B, P> {
    /// Restore persisted flags, register the presence, then apply `initial`
    /// on top. A failed registration leaves the override unapplied and unsaved.
    pub fn start<F>(backend: B, config: ConfigStore, initial: IpcFlags, register: F) -> Result<Self>
    where
        F: FnOnce(PowerState) -> Result<P>,
    {
        settings::seed_defaults(&config);
        if config.is_dirty() {
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save seeded config");
            }
        }

        let mut power = PowerController::new(backend);
        power.load_state(settings::read_state(&config));

        let mut presence = register(power.state())?;

        let restored = power.state();
        power.apply_state_from_flags(initial);
        persist(&config, power.state());
        if power.state() != restored {
            presence.update(power.state());
        }

        info!(state = ?power.state(), config = %config.path().display(), "Owner started");
        Ok(Self {
            power,
            config,
            presence,
        })
    }

    pub fn state(&self) -> PowerState {
        self.power.state()
    }

    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Delivery(Delivery { request, ack }) => {
                let reply = match request {
                    Request::FlagsUpdate(flags) => {
                        self.power.apply_state_from_flags(flags);
                        self.changed();
                        Reply::Handled
                    }
                };
                if ack.send(reply).is_err() {
                    debug!("Delegate connection closed before reply");
                }
            }
            Event::Menu(MenuCommand::ToggleEnable) => self.toggle(PowerFlag::Enabled),
            Event::Menu(MenuCommand::ToggleSystem) => self.toggle(PowerFlag::PreventSystemSleep),
            Event::Menu(MenuCommand::ToggleDisplay) => self.toggle(PowerFlag::PreventDisplayOff),
            Event::Menu(MenuCommand::Quit) | Event::Quit => {
                info!("Quit requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn toggle(&mut self, flag: PowerFlag) {
        // Sub-flags are greyed out in the menu while disabled
        if flag != PowerFlag::Enabled && !self.power.state().enabled {
            debug!(?flag, "Ignoring toggle while disabled");
            return;
        }
        self.power.toggle(flag);
        self.changed();
    }

    fn changed(&mut self) {
        let state = self.power.state();
        persist(&self.config, state);
        self.presence.update(state);
    }

    /// Process events until quit, or until every sender is gone
    pub fn run(&mut self, events: Receiver<Event>) {
        for event in events.iter() {
            if self.handle(event).is_break() {
                return;
            }
        }
        warn!("Event queue closed without a quit request");
    }

    /// Release the OS request, flush the config and remove the icon
    pub fn shutdown(mut self) {
        self.power.finish();
        persist(&self.config, self.power.state());
        self.presence.unregister();
        info!("Owner stopped");
    }
}

fn persist(config: &ConfigStore, state: PowerState) {
    settings::write_state(config, &state);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

/// Everything the owner needs beyond its collaborators
pub struct OwnerSetup {
    pub registry: InstanceRegistry,
    pub lock: InstanceLock,
    pub config_path: PathBuf,
    pub initial: IpcFlags,
    pub handle_signals: bool,
}

/// Run the owner until quit. The socket is published before the presence
/// is registered; deliveries arriving meanwhile wait in the queue.
pub fn run_owner<B, P, F>(setup: OwnerSetup, backend: B, register_presence: F) -> Result<()>
where
    B: PowerBackend,
    P: Presence,
    F: FnOnce(PowerState, Sender<Event>) -> Result<P>,
{
    let OwnerSetup {
        registry,
        lock,
        config_path,
        initial,
        handle_signals,
    } = setup;

    let (tx, rx) = mpsc::channel();

    let server = registry.publish(&lock)?;
    ipc::spawn_listener(&server, tx.clone())?;
    info!(
        lock = %lock.path().display(),
        socket = %server.path().display(),
        "Accepting deliveries"
    );

    if handle_signals {
        spawn_signal_listener(tx.clone())?;
    }

    let config = ConfigStore::open(config_path);
    let mut app = App::start(backend, config, initial, |state| register_presence(state, tx))?;
    app.run(rx);
    app.shutdown();

    // Socket goes before the lock so no delegate ever sees a socket without an owner
    drop(server);
    drop(lock);
    Ok(())
}

fn spawn_signal_listener(events: Sender<Event>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received termination signal");
                let _ = events.send(Event::Quit);
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::FakePresence;
    use super::*;
    use crate::constants::config::{KEY_DISPLAY, KEY_ENABLE, KEY_SYSTEM};
    use crate::instance::{self, Claim, Role};
    use crate::power::testing::RecordingBackend;
    use crate::power::Directive;
    use std::fs;

    fn start_app(
        dir: &tempfile::TempDir,
        initial: IpcFlags,
    ) -> (App<RecordingBackend, FakePresence>, RecordingBackend, FakePresence) {
        let backend = RecordingBackend::default();
        let presence = FakePresence::default();
        let config = ConfigStore::open(dir.path().join("sp.cfg"));
        let app = App::start(backend.clone(), config, initial, |_| Ok(presence.clone())).unwrap();
        (app, backend, presence)
    }

    fn delivery(flags: IpcFlags) -> (Event, mpsc::Receiver<Reply>) {
        let (ack, reply) = mpsc::sync_channel(1);
        let event = Event::Delivery(Delivery {
            request: Request::FlagsUpdate(flags),
            ack,
        });
        (event, reply)
    }

    #[test]
    fn test_start_seeds_and_saves_fresh_config() {
        let dir = tempfile::tempdir().unwrap();
        let (app, backend, _) = start_app(&dir, IpcFlags::empty());

        assert_eq!(app.state(), PowerState::default());
        assert_eq!(backend.last(), Some(Directive::NONE));
        let contents = fs::read_to_string(dir.path().join("sp.cfg")).unwrap();
        assert_eq!(contents, "display = 0\nenable = 0\nsystem = 0\n");
    }

    #[test]
    fn test_start_applies_override_on_persisted_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sp.cfg"), "enable = 1\nsystem = 1\ndisplay = 0\n").unwrap();

        let (app, backend, _) = start_app(&dir, IpcFlags::UNSET_SYSTEM | IpcFlags::SET_DISPLAY);

        let state = app.state();
        assert!(state.enabled);
        assert!(!state.prevent_system_sleep);
        assert!(state.prevent_display_off);
        assert_eq!(
            backend.last(),
            Some(Directive {
                system: false,
                display: true
            })
        );
        let store = ConfigStore::open(dir.path().join("sp.cfg"));
        assert_eq!(store.get(KEY_SYSTEM), Some(0));
        assert_eq!(store.get(KEY_DISPLAY), Some(1));
    }

    #[test]
    fn test_start_leaves_config_alone_when_presence_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sp.cfg");
        fs::write(&path, "display = 0\nenable = 0\nsystem = 0\n").unwrap();
        let backend = RecordingBackend::default();

        let result = App::<_, FakePresence>::start(
            backend.clone(),
            ConfigStore::open(path.clone()),
            IpcFlags::ENABLE | IpcFlags::SET_SYSTEM,
            |_| anyhow::bail!("no status notifier host"),
        );

        assert!(result.is_err());
        assert!(backend.applied.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "display = 0\nenable = 0\nsystem = 0\n");
    }

    #[test]
    fn test_presence_registered_with_persisted_state_then_updated() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        let presence = FakePresence::default();
        let registered = std::sync::Arc::new(std::sync::Mutex::new(None));

        let seen = registered.clone();
        let app = App::start(
            backend,
            ConfigStore::open(dir.path().join("sp.cfg")),
            IpcFlags::ENABLE,
            |state| {
                *seen.lock().unwrap() = Some(state);
                Ok(presence.clone())
            },
        )
        .unwrap();

        assert_eq!(*registered.lock().unwrap(), Some(PowerState::default()));
        assert_eq!(presence.updates.lock().unwrap().last(), Some(&app.state()));
        assert!(app.state().enabled);
    }

    #[test]
    fn test_delivery_updates_persists_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _, presence) = start_app(&dir, IpcFlags::empty());

        let (event, reply) = delivery(IpcFlags::ENABLE | IpcFlags::SET_DISPLAY);
        assert!(app.handle(event).is_continue());

        assert_eq!(reply.recv().unwrap(), Reply::Handled);
        assert!(app.state().enabled);
        assert_eq!(presence.updates.lock().unwrap().last(), Some(&app.state()));
        let store = ConfigStore::open(dir.path().join("sp.cfg"));
        assert_eq!(store.get(KEY_ENABLE), Some(1));
        assert_eq!(store.get(KEY_DISPLAY), Some(1));
    }

    #[test]
    fn test_menu_toggles_flip_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, backend, _) = start_app(&dir, IpcFlags::empty());

        let _ = app.handle(Event::Menu(MenuCommand::ToggleEnable));
        let _ = app.handle(Event::Menu(MenuCommand::ToggleSystem));

        assert_eq!(
            backend.last(),
            Some(Directive {
                system: true,
                display: false
            })
        );
        let store = ConfigStore::open(dir.path().join("sp.cfg"));
        assert_eq!(store.get(KEY_ENABLE), Some(1));
        assert_eq!(store.get(KEY_SYSTEM), Some(1));
    }

    #[test]
    fn test_sub_toggles_ignored_while_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _, presence) = start_app(&dir, IpcFlags::empty());

        let _ = app.handle(Event::Menu(MenuCommand::ToggleDisplay));

        assert_eq!(app.state(), PowerState::default());
        assert!(presence.updates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_quit_breaks_and_shutdown_releases() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, backend, presence) = start_app(&dir, IpcFlags::ENABLE | IpcFlags::SET_SYSTEM);

        assert!(app.handle(Event::Menu(MenuCommand::Quit)).is_break());
        assert!(app.handle(Event::Quit).is_break());
        app.shutdown();

        assert_eq!(backend.last(), Some(Directive::NONE));
        assert!(*presence.unregistered.lock().unwrap());
        // Shutdown releases the OS request but keeps the user's choice on disk
        let store = ConfigStore::open(dir.path().join("sp.cfg"));
        assert_eq!(store.get(KEY_ENABLE), Some(1));
        assert_eq!(store.get(KEY_SYSTEM), Some(1));
    }

    #[test]
    fn test_run_stops_on_quit_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _, _) = start_app(&dir, IpcFlags::empty());
        let (tx, rx) = mpsc::channel();
        tx.send(Event::Menu(MenuCommand::ToggleEnable)).unwrap();
        tx.send(Event::Quit).unwrap();
        tx.send(Event::Menu(MenuCommand::ToggleEnable)).unwrap();

        app.run(rx);
        assert!(app.state().enabled);
    }

    /// Spawn an owner on its own thread; returns its event sender once it is ready
    fn spawn_owner(
        registry: &InstanceRegistry,
        config_path: PathBuf,
        initial: IpcFlags,
    ) -> (thread::JoinHandle<Result<()>>, Sender<Event>) {
        let Claim::Claimed(lock) = registry.try_claim().unwrap() else {
            panic!("expected to claim a fresh registry");
        };
        let setup = OwnerSetup {
            registry: registry.clone(),
            lock,
            config_path,
            initial,
            handle_signals: false,
        };
        let (ready_tx, ready_rx) = mpsc::channel();
        let owner = thread::spawn(move || {
            run_owner(setup, RecordingBackend::default(), move |_, events| {
                ready_tx.send(events).unwrap();
                Ok(FakePresence::default())
            })
        });
        (owner, ready_rx.recv().unwrap())
    }

    #[test]
    fn test_second_launch_delegates_to_owner() {
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::new(dir.path().join("run"));
        let config_path = dir.path().join("sp.cfg");
        let (owner, events) = spawn_owner(&registry, config_path.clone(), IpcFlags::empty());

        let role = instance::start(&registry, IpcFlags::ENABLE | IpcFlags::SET_SYSTEM).unwrap();
        assert!(matches!(role, Role::Delegate));
        assert_eq!(
            fs::read_to_string(&config_path).unwrap(),
            "display = 0\nenable = 1\nsystem = 1\n"
        );

        events.send(Event::Quit).unwrap();
        owner.join().unwrap().unwrap();

        assert!(!registry.socket_path().exists());
        assert!(matches!(registry.try_claim().unwrap(), Claim::Claimed(_)));
    }

    #[test]
    fn test_fresh_owner_with_disable_writes_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::new(dir.path().join("run"));
        let config_path = dir.path().join("sp.cfg");
        let (owner, events) = spawn_owner(&registry, config_path.clone(), IpcFlags::DISABLE);

        assert_eq!(
            fs::read_to_string(&config_path).unwrap(),
            "display = 0\nenable = 0\nsystem = 0\n"
        );

        events.send(Event::Menu(MenuCommand::Quit)).unwrap();
        owner.join().unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(&config_path).unwrap(),
            "display = 0\nenable = 0\nsystem = 0\n"
        );
    }
}
