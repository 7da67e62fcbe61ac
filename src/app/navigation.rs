use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::presenter::{Presenter, PresenterState};
use super::router::{HistoryParams, Route, RouteError};
use super::LocationBar;
use crate::bus::{Event, EventBus};
use crate::core::models::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(Uuid);

impl TabId {
    fn new() -> Self {
        TabId(Uuid::new_v4())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Back/forward availability of a tab. `enabled == false` means the tab has
/// no usable sibling list (opened standalone, or navigated away from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NavControls {
    pub enabled: bool,
    pub back: Option<RecordId>,
    pub forward: Option<RecordId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTrigger {
    Back,
    Forward,
}

/// What to show in a tab, and the list it was opened from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenContext {
    pub record_id: RecordId,
    pub siblings: Vec<RecordId>,
    pub att_id: Option<u64>,
}

impl OpenContext {
    pub fn standalone(record_id: RecordId) -> Self {
        OpenContext {
            record_id,
            ..Default::default()
        }
    }

    pub fn in_list(record_id: RecordId, siblings: Vec<RecordId>) -> Self {
        OpenContext {
            record_id,
            siblings,
            att_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum NavError {
    #[error("no such tab")]
    UnknownTab,
    #[error("back/forward is disabled for this tab")]
    Disabled,
    #[error("no record in that direction")]
    NoSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabState {
    pub id: TabId,
    pub current: RecordId,
    pub siblings: Vec<RecordId>,
    /// Set when `current` left the sibling list; cleared only by a fresh
    /// context.
    pub detached: bool,
    pub att_id: Option<u64>,
}

impl TabState {
    pub fn controls(&self) -> NavControls {
        if self.detached || self.siblings.is_empty() {
            return NavControls::default();
        }
        let Some(pos) = self.siblings.iter().position(|&id| id == self.current) else {
            return NavControls::default();
        };
        NavControls {
            enabled: true,
            back: pos.checked_sub(1).map(|i| self.siblings[i]),
            forward: self.siblings.get(pos + 1).copied(),
        }
    }

    pub fn route(&self) -> Route {
        Route::Bug {
            id: self.current,
            params: HistoryParams {
                ids: self.siblings.clone(),
                att_id: self.att_id,
            },
        }
    }

    fn apply_context(&mut self, ctx: OpenContext) {
        if !ctx.siblings.is_empty() && !ctx.siblings.contains(&ctx.record_id) {
            log::warn!(
                "Bug {} is not in its sibling list, opening it standalone",
                ctx.record_id
            );
            self.siblings = Vec::new();
        } else {
            self.siblings = ctx.siblings;
        }
        self.current = ctx.record_id;
        self.att_id = ctx.att_id;
        self.detached = false;
    }
}

/// Location entries kept per tab; the oldest are dropped first.
const MAX_HISTORY: usize = 100;

struct Tab {
    state: TabState,
    presenter: Arc<dyn Presenter>,
    // Snapshots behind each location entry of this tab
    history: Vec<TabState>,
    cursor: usize,
}

impl Tab {
    fn record_history(&mut self) {
        self.history.truncate(self.cursor + 1);
        self.history.push(self.state.clone());
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.cursor = self.history.len() - 1;
    }

    /// Step to an adjacent history entry showing `id`, if there is one.
    fn step_history(&mut self, id: RecordId, ids: &[RecordId]) -> bool {
        let candidates = [self.cursor.checked_sub(1), Some(self.cursor + 1)];
        for index in candidates.into_iter().flatten() {
            let Some(entry) = self.history.get(index) else {
                continue;
            };
            if entry.current == id && (ids.is_empty() || entry.siblings == ids) {
                self.cursor = index;
                self.state = entry.clone();
                return true;
            }
        }
        false
    }
}

pub type PresenterFactory = Box<dyn Fn() -> Arc<dyn Presenter> + Send + Sync>;

#[derive(Default)]
struct Tabs {
    tabs: IndexMap<TabId, Tab>,
    focused: Option<TabId>,
}

/// Owns the open tabs, their back/forward state, and the presenter of each.
pub struct TabNavigator {
    tabs: Mutex<Tabs>,
    bus: EventBus,
    location: Arc<dyn LocationBar>,
    new_presenter: PresenterFactory,
}

impl TabNavigator {
    pub fn new(bus: EventBus, location: Arc<dyn LocationBar>, new_presenter: PresenterFactory) -> Self {
        TabNavigator {
            tabs: Mutex::new(Tabs::default()),
            bus,
            location,
            new_presenter,
        }
    }

    /// Open `ctx` in a new tab, or focus the tab already showing that record.
    pub async fn open(&self, ctx: OpenContext) -> TabId {
        let (state, presenter) = {
            let mut tabs = self.tabs.lock();
            let existing = tabs
                .tabs
                .iter()
                .find(|(_, tab)| tab.state.current == ctx.record_id)
                .map(|(id, _)| *id);

            match existing {
                Some(id) => {
                    log::debug!("Bug {} already open in tab {id}, focusing", ctx.record_id);
                    tabs.focused = Some(id);
                    let Some(tab) = tabs.tabs.get_mut(&id) else {
                        return id;
                    };
                    if !ctx.siblings.is_empty() {
                        tab.state.apply_context(ctx);
                        tab.record_history();
                    }
                    (tab.state.clone(), tab.presenter.clone())
                }
                None => {
                    let id = TabId::new();
                    let mut state = TabState {
                        id,
                        current: ctx.record_id,
                        siblings: Vec::new(),
                        detached: false,
                        att_id: None,
                    };
                    state.apply_context(ctx);
                    let presenter = (self.new_presenter)();
                    let mut tab = Tab {
                        state: state.clone(),
                        presenter: presenter.clone(),
                        history: Vec::new(),
                        cursor: 0,
                    };
                    tab.record_history();
                    tabs.tabs.insert(id, tab);
                    tabs.focused = Some(id);
                    log::debug!("Opened tab {id} for bug {}", state.current);
                    (state, presenter)
                }
            }
        };

        let id = state.id;
        self.show(state, presenter, true).await;
        id
    }

    /// Move to the adjacent sibling.
    pub async fn navigate(&self, tab: TabId, trigger: NavigationTrigger) -> Result<RecordId, NavError> {
        let (state, presenter) = {
            let mut tabs = self.tabs.lock();
            let entry = tabs.tabs.get_mut(&tab).ok_or(NavError::UnknownTab)?;
            let controls = entry.state.controls();
            if !controls.enabled {
                return Err(NavError::Disabled);
            }
            let target = match trigger {
                NavigationTrigger::Back => controls.back,
                NavigationTrigger::Forward => controls.forward,
            }
            .ok_or(NavError::NoSibling)?;
            entry.state.current = target;
            entry.record_history();
            (entry.state.clone(), entry.presenter.clone())
        };

        let current = state.current;
        self.show(state, presenter, true).await;
        Ok(current)
    }

    /// Jump to any record. Outside the sibling list the tab keeps its list
    /// but disables back/forward; coming back into the list does not
    /// re-enable them.
    pub async fn navigate_to(&self, tab: TabId, id: RecordId) -> Result<(), NavError> {
        let (state, presenter) = {
            let mut tabs = self.tabs.lock();
            let entry = tabs.tabs.get_mut(&tab).ok_or(NavError::UnknownTab)?;
            if !entry.state.siblings.contains(&id) {
                log::debug!("Bug {id} is outside the sibling list of tab {tab}");
                entry.state.detached = true;
            }
            entry.state.current = id;
            entry.record_history();
            (entry.state.clone(), entry.presenter.clone())
        };

        self.show(state, presenter, true).await;
        Ok(())
    }

    /// React to a location change that did not originate here (browser
    /// back/forward, a typed or clicked link).
    pub async fn on_location_changed(&self, location: &str) -> Result<Option<TabId>, RouteError> {
        let (id, params) = match Route::parse(location)? {
            Route::Bug { id, params } => (id, params),
            other => {
                log::debug!("Location {other:?} does not target a tab");
                return Ok(None);
            }
        };

        let resolved = {
            let mut tabs = self.tabs.lock();
            let mut found = None;
            if let Some(focused) = tabs.focused {
                if let Some(tab) = tabs.tabs.get_mut(&focused) {
                    if tab.step_history(id, &params.ids) {
                        found = Some((tab.state.clone(), tab.presenter.clone()));
                    }
                }
            }
            if found.is_none() {
                let showing = tabs
                    .tabs
                    .iter()
                    .find(|(_, tab)| tab.state.current == id)
                    .map(|(id, tab)| (*id, tab.state.clone(), tab.presenter.clone()));
                if let Some((tab_id, state, presenter)) = showing {
                    tabs.focused = Some(tab_id);
                    found = Some((state, presenter));
                }
            }
            found
        };

        match resolved {
            Some((state, presenter)) => {
                let id = state.id;
                self.show(state, presenter, false).await;
                Ok(Some(id))
            }
            None => {
                let ctx = OpenContext {
                    record_id: id,
                    siblings: params.ids,
                    att_id: params.att_id,
                };
                Ok(Some(self.open(ctx).await))
            }
        }
    }

    pub fn focus(&self, tab: TabId) -> bool {
        let state = {
            let mut tabs = self.tabs.lock();
            let Some(state) = tabs.tabs.get(&tab).map(|t| t.state.clone()) else {
                return false;
            };
            tabs.focused = Some(tab);
            state
        };
        self.announce(&state, true);
        true
    }

    /// Close a tab and tear down its presenter.
    pub fn close(&self, tab: TabId) -> bool {
        let removed = {
            let mut tabs = self.tabs.lock();
            let removed = tabs.tabs.shift_remove(&tab);
            if tabs.focused == Some(tab) {
                tabs.focused = tabs.tabs.keys().last().copied();
            }
            removed
        };
        match removed {
            Some(t) => {
                t.presenter.teardown();
                log::debug!("Closed tab {tab}");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<Tab> = {
            let mut tabs = self.tabs.lock();
            tabs.focused = None;
            tabs.tabs.drain(..).map(|(_, t)| t).collect()
        };
        for tab in &drained {
            tab.presenter.teardown();
        }
        if !drained.is_empty() {
            log::info!("Closed {} tabs", drained.len());
        }
    }

    pub fn tab(&self, tab: TabId) -> Option<TabState> {
        self.tabs.lock().tabs.get(&tab).map(|t| t.state.clone())
    }

    pub fn tabs(&self) -> Vec<TabState> {
        self.tabs.lock().tabs.values().map(|t| t.state.clone()).collect()
    }

    pub fn focused(&self) -> Option<TabId> {
        self.tabs.lock().focused
    }

    pub fn controls(&self, tab: TabId) -> Option<NavControls> {
        self.tab(tab).map(|s| s.controls())
    }

    pub fn presenter(&self, tab: TabId) -> Option<Arc<dyn Presenter>> {
        self.tabs.lock().tabs.get(&tab).map(|t| t.presenter.clone())
    }

    fn announce(&self, state: &TabState, push_location: bool) {
        if push_location {
            let route = state.route();
            self.location.push(&route.path(), &route.params());
        }
        self.bus.publish(Event::TabChanged {
            tab: state.id,
            record_id: state.current,
            controls: state.controls(),
        });
    }

    async fn show(&self, state: TabState, presenter: Arc<dyn Presenter>, push_location: bool) {
        self.announce(&state, push_location);
        // A failed load is retried whenever the tab is shown again
        let settled = matches!(
            presenter.state(),
            PresenterState::Available | PresenterState::Loading
        );
        if presenter.record_id() != Some(state.current) || !settled {
            presenter.activate(state.current).await;
        }
    }
}
