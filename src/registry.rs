// Tab registry
// Owns one playback state machine per tab and publishes their lifecycle events

use crate::config::TrackingConfig;
use crate::dispatcher::SubmissionReport;
use crate::identity::{Correction, IdentityResolver};
use crate::machine::{DispatchRequest, Item, LifecycleEvent, PlaybackStateMachine, Transition};
use crate::sample::PlaybackSample;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type TabId = u64;

/// Identifies one attachment of a tab; re-attaching after a detach yields a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineHandle {
    pub tab_id: TabId,
    pub session: u64,
}

/// Consumer of lifecycle events (UI, notifications, analytics)
pub trait LifecycleListener: Send {
    fn on_event(&mut self, tab_id: TabId, event: &LifecycleEvent);
}

/// Forwards events into a channel
pub struct ChannelListener(pub mpsc::UnboundedSender<(TabId, LifecycleEvent)>);

impl LifecycleListener for ChannelListener {
    fn on_event(&mut self, tab_id: TabId, event: &LifecycleEvent) {
        // Receiver gone means nobody is interested any more
        let _ = self.0.send((tab_id, event.clone()));
    }
}

/// Inbound input for one tab's machine
#[derive(Debug, Clone)]
pub enum TabInput {
    Sample(PlaybackSample),
    Correct(Correction),
    ToggleLove(bool),
    Skip,
}

/// Dispatcher work together with the tab session it belongs to
#[derive(Debug)]
pub struct RoutedRequest {
    pub handle: MachineHandle,
    pub request: DispatchRequest,
    /// Cancelled when the tab is detached
    pub cancel: CancellationToken,
}

struct Tab {
    machine: PlaybackStateMachine,
    session: u64,
    cancel: CancellationToken,
}

pub struct TabRegistry {
    tabs: HashMap<TabId, Tab>,
    listeners: Vec<Box<dyn LifecycleListener>>,
    resolver: IdentityResolver,
    tracking: TrackingConfig,
    active_tab: Option<TabId>,
    next_session: u64,
}

impl TabRegistry {
    pub fn new(resolver: IdentityResolver, tracking: TrackingConfig) -> Self {
        Self {
            tabs: HashMap::new(),
            listeners: Vec::new(),
            resolver,
            tracking,
            active_tab: None,
            next_session: 0,
        }
    }

    /// Listeners receive events in registration order
    pub fn add_listener(&mut self, listener: Box<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.tabs.contains_key(&tab_id)
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Start tracking a tab; attaching a known tab returns its existing handle
    pub fn attach(&mut self, tab_id: TabId) -> MachineHandle {
        if let Some(tab) = self.tabs.get(&tab_id) {
            return MachineHandle {
                tab_id,
                session: tab.session,
            };
        }

        self.next_session += 1;
        let mut machine = PlaybackStateMachine::new(self.tracking.clone());
        machine.set_active(self.is_active(tab_id));
        self.tabs.insert(
            tab_id,
            Tab {
                machine,
                session: self.next_session,
                cancel: CancellationToken::new(),
            },
        );

        log::debug!("Attached tab {} (session {})", tab_id, self.next_session);
        MachineHandle {
            tab_id,
            session: self.next_session,
        }
    }

    /// Stop tracking a tab, resetting whatever it was playing
    pub fn detach(&mut self, tab_id: TabId) -> bool {
        let Some(mut tab) = self.tabs.remove(&tab_id) else {
            log::debug!("Detach of unknown tab {}", tab_id);
            return false;
        };

        tab.cancel.cancel();
        if let Some(event) = tab.machine.teardown() {
            self.broadcast_event(tab_id, &event);
        }
        if self.active_tab == Some(tab_id) {
            self.active_tab = None;
            self.refresh_active();
        }

        log::debug!("Detached tab {}", tab_id);
        true
    }

    /// Record the tab the user activated last
    pub fn activate(&mut self, tab_id: TabId) {
        self.active_tab = Some(tab_id);
        self.refresh_active();
    }

    pub fn session(&self, tab_id: TabId) -> Option<u64> {
        self.tabs.get(&tab_id).map(|tab| tab.session)
    }

    pub fn cancel_token(&self, tab_id: TabId) -> Option<CancellationToken> {
        self.tabs.get(&tab_id).map(|tab| tab.cancel.clone())
    }

    pub fn current_item(&self, tab_id: TabId) -> Option<Item> {
        self.tabs
            .get(&tab_id)
            .and_then(|tab| tab.machine.current_item().cloned())
    }

    /// Feed input to a tab's machine, publish its events and return the dispatcher work
    ///
    /// Unknown tabs are ignored: tabs close asynchronously.
    pub fn route(&mut self, tab_id: TabId, input: TabInput, now: Instant) -> Vec<RoutedRequest> {
        let Some(tab) = self.tabs.get_mut(&tab_id) else {
            log::debug!("Dropping input for unknown tab {}", tab_id);
            return Vec::new();
        };

        let transition = match input {
            TabInput::Sample(sample) => tab.machine.on_sample(&self.resolver, sample, now),
            TabInput::Correct(correction) => tab.machine.correct(&self.resolver, correction),
            TabInput::ToggleLove(loved) => tab.machine.toggle_love(loved),
            TabInput::Skip => tab.machine.skip(),
        };

        let handle = MachineHandle {
            tab_id,
            session: tab.session,
        };
        let cancel = tab.cancel.clone();
        let Transition { events, requests } = transition;

        for event in &events {
            self.broadcast_event(tab_id, event);
        }

        requests
            .into_iter()
            .map(|request| RoutedRequest {
                handle,
                request,
                cancel: cancel.child_token(),
            })
            .collect()
    }

    /// Publish one event to every listener
    pub fn broadcast_event(&mut self, tab_id: TabId, event: &LifecycleEvent) {
        for listener in self.listeners.iter_mut() {
            listener.on_event(tab_id, event);
        }
    }

    pub fn dispatch_accepted(
        &mut self,
        handle: MachineHandle,
        item: &Item,
        pending: impl IntoIterator<Item = String>,
    ) {
        if let Some(tab) = self.live_tab(handle) {
            tab.machine.dispatch_accepted(item, pending);
        }
    }

    /// Record a finished submission and publish `Submitted`
    ///
    /// Results for a tab that has since been detached are dropped.
    pub fn complete_submission(&mut self, handle: MachineHandle, item: Item, report: &SubmissionReport) {
        let Some(tab) = self.live_tab(handle) else {
            log::debug!(
                "Tab {} is gone, discarding submission result ({:?})",
                handle.tab_id,
                report.aggregate
            );
            return;
        };

        let event = tab.machine.record_submission(item, report);
        self.broadcast_event(handle.tab_id, &event);
    }

    fn live_tab(&mut self, handle: MachineHandle) -> Option<&mut Tab> {
        self.tabs
            .get_mut(&handle.tab_id)
            .filter(|tab| tab.session == handle.session)
    }

    /// Until the user activates a tab, every tab counts as active
    fn is_active(&self, tab_id: TabId) -> bool {
        self.active_tab.map_or(true, |active| active == tab_id)
    }

    fn refresh_active(&mut self) {
        let active_tab = self.active_tab;
        for (tab_id, tab) in self.tabs.iter_mut() {
            tab.machine
                .set_active(active_tab.map_or(true, |active| active == *tab_id));
        }
    }
}
