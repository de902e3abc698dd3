//! Connection health aggregation.
//!
//! Every axis, controller and peripheral exposes its link state as a
//! `watch::Receiver<bool>`. The [`ConnectionMonitor`] ANDs them into one
//! subsystem flag, recomputed whenever any member changes.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Member {
    name: String,
    connected: bool,
}

/// Aggregates member link states into a single boolean.
pub struct ConnectionMonitor {
    members: Arc<Mutex<Vec<Member>>>,
    state: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    /// Monitor without members (reports connected)
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            members: Arc::new(Mutex::new(Vec::new())),
            state,
            tasks: Vec::new(),
        }
    }

    /// Monitor over the given members
    pub fn with_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = (S, watch::Receiver<bool>)>,
        S: Into<String>,
    {
        let mut monitor = Self::new();
        for (name, rx) in members {
            monitor.add(name, rx);
        }
        monitor
    }

    /// Add a member. Must be called from within a tokio runtime.
    pub fn add(&mut self, name: impl Into<String>, mut rx: watch::Receiver<bool>) {
        let name = name.into();
        let index = {
            let mut members = self.members.lock();
            members.push(Member {
                name: name.clone(),
                connected: *rx.borrow_and_update(),
            });
            members.len() - 1
        };
        recompute(&self.members, &self.state);

        let members = self.members.clone();
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                if let Some(member) = members.lock().get_mut(index) {
                    member.connected = connected;
                }
                tracing::info!(member = %name, connected, "Member connection changed");
                recompute(&members, &state);
            }
        }));
    }

    /// Subsystem connected: every member connected
    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Aggregate state stream; only notifies on actual changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Names of members currently disconnected
    pub fn disconnected(&self) -> Vec<String> {
        self.members
            .lock()
            .iter()
            .filter(|m| !m.connected)
            .map(|m| m.name.clone())
            .collect()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// No members registered
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn recompute(members: &Mutex<Vec<Member>>, state: &watch::Sender<bool>) {
    let all = members.lock().iter().all(|m| m.connected);
    let changed = state.send_if_modified(|current| {
        let changed = *current != all;
        *current = all;
        changed
    });
    if changed {
        tracing::info!(connected = all, "Subsystem connection state changed");
    }
}
