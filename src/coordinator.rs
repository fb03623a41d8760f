//! The polling coordinator: one shared fetch cycle feeding many subscribers.
//!
//! The coordinator owns the device client, runs the repeating timer, keeps the
//! last successful [`Snapshot`], and fans each successful fetch out to the
//! registered subscribers. Subscribers never query the device themselves: they
//! re-read [`Coordinator::current`] when notified.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bon::bon;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    task::JoinHandle,
};

use crate::{
    device::{DeviceClient, DeviceError, Endpoint, Snapshot},
    prelude::*,
};

/// Outcome of the most recent fetch attempt.
#[derive(Clone, Debug)]
pub enum FetchStatus {
    /// No fetch has resolved yet.
    Pending,

    Success {
        at: DateTime<Utc>,
    },

    /// The attempt failed; the previous snapshot, if any, is still current.
    Failed {
        at: DateTime<Utc>,
        error: Arc<DeviceError>,
    },
}

impl FetchStatus {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn into_result(self) -> Result<(), Arc<DeviceError>> {
        match self {
            Self::Pending | Self::Success { .. } => Ok(()),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

/// What [`Coordinator::current`] hands out: the last successful snapshot, if
/// any, together with the status of the last attempt.
#[derive(Clone, Debug)]
pub struct Reading {
    pub snapshot: Option<Arc<Snapshot>>,
    pub status: FetchStatus,
}

/// A unit of interest in the coordinator's data, usually one sensor.
pub trait Subscriber: Send + Sync {
    /// Called after every successful fetch cycle, never after a failed one.
    ///
    /// The subscriber pulls whatever it cares about via
    /// [`Coordinator::current`]. Must not subscribe or unsubscribe from within
    /// the callback, and must not block for long: dispatch is sequential, so a
    /// slow subscriber delays the others.
    fn on_update(&self, coordinator: &Coordinator);
}

/// Handle returned by [`Coordinator::subscribe`], used to unsubscribe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionId(u64);

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("the coordinator is already started")]
    AlreadyStarted,

    #[error("the coordinator is stopped")]
    Stopped,
}

/// Either lead a fresh fetch or join the one already in flight.
enum Role {
    Lead(watch::Sender<Option<FetchStatus>>),
    Join(watch::Receiver<Option<FetchStatus>>),
}

struct State {
    snapshot: Option<Arc<Snapshot>>,
    status: FetchStatus,
}

struct ClientSlot {
    inner: Box<dyn DeviceClient>,
    connected: bool,
}

struct Timer {
    shutdown: watch::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Coordinator {
    endpoint: Endpoint,

    /// Exclusive access to the device connection. Held across the fetch await,
    /// which is fine because the single-flight guard admits one leader at a
    /// time anyway.
    client: AsyncMutex<ClientSlot>,

    /// Snapshot and status. Never held across an await.
    state: Mutex<State>,

    /// The single-flight guard: `Some` while a fetch is in flight. Joiners
    /// clone the receiver and wait for the leader to publish the outcome.
    in_flight: Mutex<Option<watch::Receiver<Option<FetchStatus>>>>,

    subscribers: Mutex<Vec<(SubscriptionId, Arc<dyn Subscriber>)>>,
    next_subscription: AtomicU64,

    timer: Mutex<Option<Timer>>,
    stopped: AtomicBool,
}

#[bon]
impl Coordinator {
    /// Build a coordinator. No I/O happens here: the client connects lazily
    /// when the first update cycle runs.
    #[builder]
    pub fn new(client: Box<dyn DeviceClient>, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            client: AsyncMutex::new(ClientSlot { inner: client, connected: false }),
            state: Mutex::new(State { snapshot: None, status: FetchStatus::Pending }),
            in_flight: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            timer: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }
}

impl Coordinator {
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The latest snapshot and last fetch status. Never triggers a fetch.
    #[must_use]
    pub fn current(&self) -> Reading {
        let state = lock(&self.state);
        Reading { snapshot: state.snapshot.clone(), status: state.status.clone() }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, subscriber));
        id
    }

    /// Returns whether the subscription was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(subscription, _)| *subscription != id);
        subscribers.len() < before
    }

    /// Begin the repeating timer. Each cycle is scheduled `interval` after the
    /// previous one completed, regardless of its outcome.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<(), CoordinatorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Stopped);
        }
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return Err(CoordinatorError::AlreadyStarted);
        }
        let (shutdown, mut shutdown_rx) = watch::channel(());
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                // Not cancelled mid-fetch: shutdown is only observed between cycles.
                let _status = coordinator.refresh().await;
            }
        });
        *timer = Some(Timer { shutdown, handle });
        info!(endpoint = %self.endpoint, interval_secs = interval.as_secs(), "polling started");
        Ok(())
    }

    /// Fetch now if no fetch has ever completed, suspending the caller until
    /// the attempt resolves. Joins an in-flight attempt instead of spawning a
    /// second one. If an attempt already completed, returns its status
    /// immediately.
    ///
    /// This is the only path that surfaces a fetch error to its caller, so
    /// start-up can decide whether to abort. Scheduled ticks only record it.
    pub async fn request_first_refresh(&self) -> Result<(), Arc<DeviceError>> {
        match self.current().status {
            FetchStatus::Pending => self.refresh().await.into_result(),
            status => status.into_result(),
        }
    }

    /// Cancel the timer and release the device connection.
    ///
    /// An in-flight fetch is allowed to complete and update the stored state,
    /// but no further ticks are scheduled and no subscriber is notified after
    /// this returns. Safe to call multiple times.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Taking the subscribers lock fences out a notification that is
        // already dispatching.
        lock(&self.subscribers).clear();
        let timer = lock(&self.timer).take();
        if let Some(timer) = timer {
            drop(timer.shutdown);
            let _ = timer.handle.await;
        }
        let mut client = self.client.lock().await;
        if client.connected {
            client.inner.close().await;
            client.connected = false;
        }
        info!(endpoint = %self.endpoint, "stopped");
    }

    /// One update cycle, shared by scheduled ticks and the first-refresh path.
    ///
    /// Whoever finds no fetch in flight becomes the leader and talks to the
    /// device; everyone else waits for the leader's outcome on a watch channel.
    ///
    /// The leader runs in its caller's task, and that caller may be cancelled
    /// mid-fetch (a first refresh under a timeout, say). [`InFlightGuard`]
    /// clears the slot even then, and a joiner whose leader vanished without
    /// publishing loops back to contend for leadership itself.
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn refresh(&self) -> FetchStatus {
        loop {
            let role = {
                let mut in_flight = lock(&self.in_flight);
                match &*in_flight {
                    Some(receiver) => Role::Join(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        *in_flight = Some(receiver);
                        Role::Lead(sender)
                    }
                }
            };
            match role {
                Role::Join(mut receiver) => loop {
                    if let Some(status) = receiver.borrow_and_update().clone() {
                        return status;
                    }
                    if receiver.changed().await.is_err() {
                        // The leader was cancelled before publishing. Retry
                        // from the top rather than report a stale status.
                        break;
                    }
                },
                Role::Lead(sender) => {
                    let guard = InFlightGuard(self);
                    let outcome = self.fetch_once().await;
                    let status = self.apply(outcome);
                    drop(guard);
                    sender.send_replace(Some(status.clone()));
                    if status.is_success() {
                        self.notify();
                    }
                    return status;
                }
            }
        }
    }

    /// Connect if needed and perform one fetch. Only ever runs on the leader.
    async fn fetch_once(&self) -> Result<Snapshot, DeviceError> {
        let mut client = self.client.lock().await;
        if !client.connected {
            client.inner.connect().await?;
            client.connected = true;
        }
        match client.inner.fetch_all().await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                if error.is_connection() {
                    // Drop the connection so the next tick re-establishes it.
                    client.inner.close().await;
                    client.connected = false;
                }
                Err(error)
            }
        }
    }

    /// Record the outcome. A failure leaves the previous snapshot untouched:
    /// subscribers keep their last-known values through transient failures.
    fn apply(&self, outcome: Result<Snapshot, DeviceError>) -> FetchStatus {
        let mut state = lock(&self.state);
        state.status = match outcome {
            Ok(snapshot) => {
                debug!(n_metrics = snapshot.len(), "fetched");
                state.snapshot = Some(Arc::new(snapshot));
                FetchStatus::Success { at: Utc::now() }
            }
            Err(error) => {
                warn!(error = %error, "fetch failed, keeping the last snapshot");
                FetchStatus::Failed { at: Utc::now(), error: Arc::new(error) }
            }
        };
        state.status.clone()
    }

    /// Sequential dispatch: fine for the subscriber counts at hand (tens).
    /// Runs under the subscribers lock so that [`Self::stop`] can fence it out.
    fn notify(&self) {
        let subscribers = lock(&self.subscribers);
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        for (_, subscriber) in subscribers.iter() {
            subscriber.on_update(self);
        }
    }
}

/// Clears the single-flight slot when the leader's cycle ends, including when
/// the leading task is dropped mid-fetch.
struct InFlightGuard<'a>(&'a Coordinator);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.in_flight) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
