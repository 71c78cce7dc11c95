//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby coordination through the shared instance record."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use tokio::sync::watch;

/// Snapshot of the redundancy role published by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Activity {
    pub active: bool,
    /// Instance flag `keepProtocolRunningWhileInactive`.
    pub keep_protocol_running: bool,
}

/// Write side of the activity flag. Only the redundancy controller holds one
/// in production; tests use it to drive components directly.
#[derive(Debug)]
pub struct ActivitySwitch {
    tx: watch::Sender<Activity>,
}

impl ActivitySwitch {
    pub fn new(initial: Activity) -> (Self, ActivityHandle) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, ActivityHandle { rx })
    }

    pub fn set(&self, activity: Activity) {
        self.tx.send_if_modified(|current| {
            if *current == activity {
                false
            } else {
                *current = activity;
                true
            }
        });
    }

    pub fn set_active(&self, active: bool) {
        let current = *self.tx.borrow();
        self.set(Activity { active, ..current });
    }

    pub fn current(&self) -> Activity {
        *self.tx.borrow()
    }

    pub fn handle(&self) -> ActivityHandle {
        ActivityHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the activity flag.
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    rx: watch::Receiver<Activity>,
}

impl ActivityHandle {
    pub fn is_active(&self) -> bool {
        self.rx.borrow().active
    }

    /// Whether field sessions should stay open in the current role.
    pub fn keep_sessions_open(&self) -> bool {
        let activity = *self.rx.borrow();
        activity.active || activity.keep_protocol_running
    }

    /// Wait for the next change. Returns `None` once the controller is gone.
    pub async fn changed(&mut self) -> Option<Activity> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_observes_switch() {
        let (switch, mut handle) = ActivitySwitch::new(Activity::default());
        assert!(!handle.is_active());
        switch.set_active(true);
        let seen = handle.changed().await.unwrap();
        assert!(seen.active);
        assert!(handle.keep_sessions_open());
        drop(switch);
        assert!(handle.changed().await.is_none());
        assert!(handle.is_active());
    }

    #[test]
    fn keep_running_holds_sessions_while_standby() {
        let (_switch, handle) = ActivitySwitch::new(Activity {
            active: false,
            keep_protocol_running: true,
        });
        assert!(!handle.is_active());
        assert!(handle.keep_sessions_open());
    }
}
