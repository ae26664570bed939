// Tracker event loop
// Single task that owns the tab registry; every tab input and submission result passes through it

use crate::bindings::{BindingChange, BindingRegistry};
use crate::config::{Config, SamplerConfig};
use crate::dispatcher::{SubmissionDispatcher, SubmissionReport};
use crate::error::TrackerStopped;
use crate::identity::{Correction, IdentityResolver};
use crate::machine::{DispatchRequest, Item};
use crate::registry::{LifecycleListener, MachineHandle, RoutedRequest, TabId, TabInput, TabRegistry};
use crate::sample::{Connector, PlaybackSample, Sampler};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

enum Command {
    Attach {
        tab_id: TabId,
        connector: Option<Box<dyn Connector>>,
        reply: oneshot::Sender<MachineHandle>,
    },
    Detach(TabId),
    Activate(TabId),
    Input(TabId, TabInput),
    CurrentItem {
        tab_id: TabId,
        reply: oneshot::Sender<Option<Item>>,
    },
}

/// Messages produced by tasks the tracker spawned
enum Internal {
    Sample {
        handle: MachineHandle,
        sample: PlaybackSample,
    },
    SubmissionFinished {
        handle: MachineHandle,
        item: Item,
        report: SubmissionReport,
    },
}

/// Cloneable front door to a running tracker
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TrackerHandle {
    /// Start tracking a tab whose samples will be pushed with [`TrackerHandle::sample`]
    pub async fn attach(&self, tab_id: TabId) -> Result<MachineHandle, TrackerStopped> {
        self.attach_inner(tab_id, None).await
    }

    /// Start tracking a tab and poll `connector` for its samples until the tab is detached
    pub async fn attach_connector(
        &self,
        tab_id: TabId,
        connector: Box<dyn Connector>,
    ) -> Result<MachineHandle, TrackerStopped> {
        self.attach_inner(tab_id, Some(connector)).await
    }

    async fn attach_inner(
        &self,
        tab_id: TabId,
        connector: Option<Box<dyn Connector>>,
    ) -> Result<MachineHandle, TrackerStopped> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Attach {
            tab_id,
            connector,
            reply,
        })?;
        response.await.map_err(|_| TrackerStopped)
    }

    pub fn detach(&self, tab_id: TabId) -> Result<(), TrackerStopped> {
        self.send(Command::Detach(tab_id))
    }

    /// The user switched to `tab_id`
    pub fn activate(&self, tab_id: TabId) -> Result<(), TrackerStopped> {
        self.send(Command::Activate(tab_id))
    }

    pub fn sample(&self, tab_id: TabId, sample: PlaybackSample) -> Result<(), TrackerStopped> {
        self.send(Command::Input(tab_id, TabInput::Sample(sample)))
    }

    pub fn correct_identity(&self, tab_id: TabId, correction: Correction) -> Result<(), TrackerStopped> {
        self.send(Command::Input(tab_id, TabInput::Correct(correction)))
    }

    pub fn toggle_love(&self, tab_id: TabId, loved: bool) -> Result<(), TrackerStopped> {
        self.send(Command::Input(tab_id, TabInput::ToggleLove(loved)))
    }

    pub fn skip(&self, tab_id: TabId) -> Result<(), TrackerStopped> {
        self.send(Command::Input(tab_id, TabInput::Skip))
    }

    pub async fn current_item(&self, tab_id: TabId) -> Result<Option<Item>, TrackerStopped> {
        let (reply, response) = oneshot::channel();
        self.send(Command::CurrentItem { tab_id, reply })?;
        response.await.map_err(|_| TrackerStopped)
    }

    fn send(&self, command: Command) -> Result<(), TrackerStopped> {
        self.commands.send(command).map_err(|_| TrackerStopped)
    }
}

pub struct Tracker {
    registry: TabRegistry,
    dispatcher: Arc<SubmissionDispatcher>,
    sampler: SamplerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    binding_changes: broadcast::Receiver<BindingChange>,
}

impl Tracker {
    pub fn new(
        registry: TabRegistry,
        dispatcher: Arc<SubmissionDispatcher>,
        sampler: SamplerConfig,
    ) -> (Self, TrackerHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let binding_changes = dispatcher.bindings().subscribe();

        let tracker = Self {
            registry,
            dispatcher,
            sampler,
            commands,
            internal_tx,
            internal_rx,
            binding_changes,
        };
        (tracker, TrackerHandle { commands: commands_tx })
    }

    /// Build a tracker from configuration with the given bindings and listeners
    pub fn from_config(
        config: &Config,
        bindings: Arc<BindingRegistry>,
        listeners: Vec<Box<dyn LifecycleListener>>,
    ) -> (Self, TrackerHandle) {
        let resolver = IdentityResolver::new(&config.cleanup, &config.filter);
        let mut registry = TabRegistry::new(resolver, config.tracking.clone());
        for listener in listeners {
            registry.add_listener(listener);
        }
        let dispatcher = Arc::new(SubmissionDispatcher::new(bindings, config.dispatch.clone()));
        Self::new(registry, dispatcher, config.sampler.clone())
    }

    /// Run on a new task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands until every [`TrackerHandle`] is dropped, then detach all tabs
    pub async fn run(mut self) {
        log::info!("Tracker started");
        let mut watch_bindings = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                change = self.binding_changes.recv(), if watch_bindings => match change {
                    Ok(change) => log::info!("Binding change: {:?}", change),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} binding change notifications", missed)
                    }
                    Err(RecvError::Closed) => watch_bindings = false,
                },
            }
        }

        for tab_id in self.registry.tab_ids() {
            self.registry.detach(tab_id);
        }
        log::info!("Tracker stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach {
                tab_id,
                connector,
                reply,
            } => {
                let is_new = !self.registry.contains(tab_id);
                let handle = self.registry.attach(tab_id);
                if let Some(connector) = connector {
                    if is_new {
                        self.spawn_sampler(handle, connector);
                    } else {
                        log::warn!("Tab {} already attached, ignoring extra connector", tab_id);
                    }
                }
                let _ = reply.send(handle);
            }
            Command::Detach(tab_id) => {
                self.registry.detach(tab_id);
            }
            Command::Activate(tab_id) => self.registry.activate(tab_id),
            Command::Input(tab_id, input) => {
                let requests = self.registry.route(tab_id, input, Instant::now());
                self.dispatch(requests);
            }
            Command::CurrentItem { tab_id, reply } => {
                let _ = reply.send(self.registry.current_item(tab_id));
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Sample { handle, sample } => {
                // A late sample from a sampler of an earlier attachment
                if self.registry.session(handle.tab_id) != Some(handle.session) {
                    return;
                }
                let requests = self
                    .registry
                    .route(handle.tab_id, TabInput::Sample(sample), Instant::now());
                self.dispatch(requests);
            }
            Internal::SubmissionFinished {
                handle,
                item,
                report,
            } => self.registry.complete_submission(handle, item, &report),
        }
    }

    fn spawn_sampler(&self, handle: MachineHandle, connector: Box<dyn Connector>) {
        let Some(cancel) = self.registry.cancel_token(handle.tab_id) else {
            return;
        };
        let internal = self.internal_tx.clone();
        let sampler = Sampler::new(&self.sampler);

        tokio::spawn(sampler.run(connector, self.sampler.interval(), cancel, move |sample| {
            internal.send(Internal::Sample { handle, sample }).is_ok()
        }));
    }

    fn dispatch(&mut self, requests: Vec<RoutedRequest>) {
        for RoutedRequest {
            handle,
            request,
            cancel,
        } in requests
        {
            let dispatcher = self.dispatcher.clone();
            match request {
                DispatchRequest::Submit(item) => {
                    let pending = dispatcher
                        .bindings()
                        .bindings()
                        .into_iter()
                        .filter(|binding| binding.enabled)
                        .map(|binding| binding.service_id);
                    self.registry.dispatch_accepted(handle, &item, pending);

                    let internal = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let report = dispatcher.submit(&item, &cancel).await;
                        let _ = internal.send(Internal::SubmissionFinished {
                            handle,
                            item,
                            report,
                        });
                    });
                }
                DispatchRequest::UpdateLove { item, loved } => {
                    tokio::spawn(async move {
                        let report = dispatcher.update_love(&item, loved, &cancel).await;
                        log::info!(
                            "Love update for {} - {}: {:?}",
                            item.identity().artist,
                            item.identity().track,
                            report.aggregate
                        );
                    });
                }
                DispatchRequest::NowPlaying(item) => {
                    tokio::spawn(async move {
                        let report = dispatcher.now_playing(&item).await;
                        log::debug!("Now playing relay: {:?}", report.aggregate);
                    });
                }
            }
        }
    }
}
