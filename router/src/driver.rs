//! # Router Driver
//!
//! Runs a [`Router`] on tokio. The router sits behind one mutex; three tasks
//! take it in turn:
//!
//! | Task         | Wakes on                              | Calls                      |
//! |--------------|---------------------------------------|----------------------------|
//! | tick         | every `ROUTER_TICK_INTERVAL`          | [`Router::tick`]           |
//! | link events  | each link event                       | [`Router::handle_event`]   |
//! | reachability | every `REACHABILITY_TESTING_INTERVAL` | [`Router::run_reachability_tests`] |
//!
//! The reachability task only exists for service nodes in whitelist mode.
//! Tasks hold a weak reference, so dropping the handle ends them too.
//!
//! Shutdown runs the three router phases with a grace delay between them:
//! `stop`, then `after_stop_issued`, then `close`. The lock is never held
//! across an await.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{REACHABILITY_TESTING_INTERVAL, ROUTER_TICK_INTERVAL, STOP_GRACE_DELAY};
use crate::error::RouterError;
use crate::link::LinkEventReceiver;
use crate::router::Router;
use crate::time::now_ms;

type Shared = Arc<Mutex<Router>>;

pub struct RouterHandle {
    inner: Shared,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterHandle {
    /// Starts `router` and spawns its tasks on the current runtime.
    pub fn start(mut router: Router, events: LinkEventReceiver) -> Result<Self, RouterError> {
        router.start(now_ms())?;
        let test_others = router.is_service_node() && router.whitelist_mode();

        let inner = Arc::new(Mutex::new(router));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(tick_loop(Arc::downgrade(&inner), shutdown_rx.clone())),
            tokio::spawn(event_loop(
                Arc::downgrade(&inner),
                events,
                shutdown_rx.clone(),
            )),
        ];
        if test_others {
            tasks.push(tokio::spawn(reachability_loop(
                Arc::downgrade(&inner),
                shutdown_rx,
            )));
        }
        info!(tasks = tasks.len(), "router driver running");

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Runs `f` with the router locked. Keep it short: ticks wait on it.
    pub fn with_router<R>(&self, f: impl FnOnce(&mut Router) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    /// Graceful shutdown. Returns `false` if the router was already
    /// stopping or never ran.
    pub async fn stop(&self) -> bool {
        let stopping = self.inner.lock().stop();
        if !stopping {
            return false;
        }
        let _ = self.shutdown.send(true);

        time::sleep(STOP_GRACE_DELAY).await;
        self.inner.lock().after_stop_issued();
        time::sleep(STOP_GRACE_DELAY).await;
        self.inner.lock().close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        true
    }

    /// Immediate shutdown.
    pub fn die(&self) {
        self.inner.lock().die();
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn tick_loop(router: Weak<Mutex<Router>>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(ROUTER_TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(router) = router.upgrade() else {
            break;
        };
        router.lock().tick(now_ms());
    }
    debug!("tick loop exited");
}

async fn event_loop(
    router: Weak<Mutex<Router>>,
    mut events: LinkEventReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let Some(event) = event else {
            debug!("link event channel closed");
            break;
        };
        let Some(router) = router.upgrade() else {
            break;
        };
        router.lock().handle_event(event, now_ms());
    }
    debug!("event loop exited");
}

async fn reachability_loop(router: Weak<Mutex<Router>>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval_at(
        Instant::now() + REACHABILITY_TESTING_INTERVAL,
        REACHABILITY_TESTING_INTERVAL,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(router) = router.upgrade() else {
            break;
        };
        router.lock().run_reachability_tests(now_ms());
    }
    debug!("reachability loop exited");
}
