use std::panic;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bounds::Bounds;
use super::client::{self, ListOptions, ListerWatcher, WatchEvent, WatchStream};
use super::pager::Pager;
use super::resource::{ObjectList, Resource};
use super::store::Store;
use super::version::VersionTracker;

/// Watch timeouts are spread uniformly in `[MIN_WATCH_TIMEOUT,
/// 2 * MIN_WATCH_TIMEOUT)` so reconnects do not arrive at the api server in
/// lockstep.
const MIN_WATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// The initial list is traced step by step; the trace is logged only when
/// the whole phase took longer than this.
const INIT_TRACE_THRESHOLD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The initial list could not be completed.
    #[error("{name}: failed to list, {source}")]
    ListFailed { name: String, source: client::Error },

    /// The store rejected the seeded list.
    #[error("{name}: failed to replace store content, {source}")]
    ReplaceFailed { name: String, source: crate::Error },

    /// The store failed a forced resync.
    #[error("{name}: resync failed, {source}")]
    ResyncFailed { name: String, source: crate::Error },

    /// The watch closed in under a second without delivering anything,
    /// usually an api server stuck in a reconnect loop.
    #[error(
        "very short watch: {name}: unexpected watch close - \
         watch lasted less than a second and no items received"
    )]
    VeryShortWatch { name: String },

    /// The watch stream delivered an error.
    #[error("watch stream error, {0}")]
    Stream(#[from] client::Error),

    /// The reset endpoint closed while a watch was being consumed.
    #[error("reset channel closed")]
    ResetChannelClosed,

    /// Sentinel: the stop signal fired. Never reported as a failure.
    #[error("stop requested")]
    StopRequested,

    /// Sentinel: new bounds arrived and the list must be redone immediately.
    #[error("reset requested")]
    ResetRequested,
}

impl Error {
    fn is_expired(&self) -> bool {
        matches!(self, Error::Stream(err) if err.is_expired())
    }
}

/// Construction options for a [`Reflector`].
pub struct Config {
    /// Identifier used in logs. Defaults to the construction call site.
    pub name: Option<String>,

    /// Accept only event objects declaring this kind; `None` disables the
    /// filter.
    pub expected_kind: Option<String>,

    /// Minimum delay between successive list-and-watch attempts.
    pub period: Duration,

    /// Interval between forced store resyncs; zero disables them.
    pub resync_period: Duration,

    /// Consulted on each resync tick; a `false` skips the tick.
    pub should_resync: Option<Arc<dyn Fn() -> bool + Send + Sync>>,

    /// Requested chunk size for the initial list; zero uses the pager
    /// default.
    pub page_size: u32,

    /// Receive endpoint for hashkey bound updates; `None` disables the
    /// reset protocol.
    pub reset_rx: Option<broadcast::Receiver<[i64; 2]>>,

    /// Scopes the bounds predicate to owner references of this kind.
    pub owner_kind: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            expected_kind: None,
            period: Duration::from_secs(1),
            resync_period: Duration::ZERO,
            should_resync: None,
            page_size: 0,
            reset_rx: None,
            owner_kind: None,
        }
    }
}

/// Watches a remote resource collection and causes all changes to be
/// reflected in the given store.
pub struct Reflector<R: Resource> {
    name: String,
    expected_kind: Option<String>,
    store: Arc<dyn Store<R>>,
    lister_watcher: Arc<dyn ListerWatcher<R>>,
    period: Duration,
    resync_period: Duration,
    should_resync: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    page_size: u32,
    version: VersionTracker,
    bounds: Bounds,
    owner_kind: Option<String>,
    reset_rx: Option<broadcast::Receiver<[i64; 2]>>,
}

impl<R: Resource> Reflector<R> {
    /// Creates a reflector syncing `lister_watcher` into `store`.
    ///
    /// All collaborators are required up front; there is no late-binding
    /// setter path.
    #[track_caller]
    pub fn new(
        lister_watcher: Arc<dyn ListerWatcher<R>>,
        store: Arc<dyn Store<R>>,
        config: Config,
    ) -> Self {
        let caller = panic::Location::caller();
        let name = config
            .name
            .unwrap_or_else(|| format!("{}:{}", caller.file(), caller.line()));

        debug!(
            message = "new reflector",
            name = %name,
            kind = R::KIND,
            reset = config.reset_rx.is_some(),
        );

        Self {
            name,
            expected_kind: config.expected_kind,
            store,
            lister_watcher,
            period: config.period,
            resync_period: config.resync_period,
            should_resync: config.should_resync,
            page_size: config.page_size,
            version: VersionTracker::default(),
            bounds: Bounds::default(),
            owner_kind: config.owner_kind.filter(|kind| !kind.is_empty()),
            reset_rx: config.reset_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lister_watcher(&self) -> Arc<dyn ListerWatcher<R>> {
        Arc::clone(&self.lister_watcher)
    }

    /// The resource version observed when last syncing with the store.
    ///
    /// The value is not synchronized with access to the store itself.
    pub fn last_sync_version(&self) -> String {
        self.version.get()
    }

    /// A shared handle on the tracked version, valid after [`Reflector::run`]
    /// has consumed the reflector.
    pub fn version_tracker(&self) -> VersionTracker {
        self.version.clone()
    }

    /// Drives list-and-watch cycles, spaced by the configured period, until
    /// `stop` is cancelled. With the reset protocol enabled a bounds change
    /// restarts the cycle immediately instead of waiting out the period.
    pub async fn run(mut self, stop: CancellationToken) {
        debug!(
            message = "starting reflector",
            name = %self.name,
            kind = R::KIND,
            resync_period = ?self.resync_period,
        );

        loop {
            if stop.is_cancelled() {
                return;
            }

            if self.reset_rx.is_none() {
                if let Err(err) = self.list_and_watch(&stop).await {
                    error!(message = "list and watch failed", name = %self.name, %err);
                }
            } else {
                loop {
                    match self.list_and_watch(&stop).await {
                        Ok(()) => break,
                        Err(Error::ResetRequested) => {
                            info!(
                                message = "reset received, redoing list and watch",
                                name = %self.name,
                            );
                        }
                        Err(err) => {
                            error!(message = "list and watch failed", name = %self.name, %err);
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }

    /// Lists all items to seed the store at the resource version of the
    /// moment, then watches from that version.
    ///
    /// Returns an error only when it did not even get to open a watch, or
    /// when a bounds reset demands an immediate restart.
    pub async fn list_and_watch(&mut self, stop: &CancellationToken) -> Result<(), Error> {
        debug!(message = "listing and watching", name = %self.name, kind = R::KIND);

        // "0" lets the list be served from the api server cache and
        // potentially lag behind the backing storage; the watch catches up.
        let mut options = ListOptions {
            resource_version: Some("0".to_string()),
            ..Default::default()
        };

        if let Some(reset_rx) = self.reset_rx.as_mut() {
            if self.bounds.is_uninitialized() {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        signal = reset_rx.recv() => match signal {
                            Ok(bounds) => {
                                self.bounds.set(bounds);
                                break;
                            }
                            Err(RecvError::Closed) => {
                                error!(message = "reset channel closed", name = %self.name);
                                return Ok(());
                            }
                            Err(RecvError::Lagged(missed)) => {
                                warn!(
                                    message = "reset channel lagged, retrying read",
                                    name = %self.name,
                                    missed,
                                );
                            }
                        },
                    }
                }
            } else {
                // A reset already waiting on the channel is left there for
                // the watch loop to pick up.
                if stop.is_cancelled() {
                    return Ok(());
                }
                debug!(
                    message = "bounds already initialized",
                    name = %self.name,
                    bounds = ?self.bounds,
                );
            }

            let selector = self.bounds.field_selector(self.owner_kind.as_deref());
            options.append_field_selector(&selector);
        }

        // LIST
        let mut version = {
            let mut trace = InitTrace::new(&self.name);

            let pager = Pager::new(Arc::clone(&self.lister_watcher)).page_size(self.page_size);
            let list_options = options.clone();
            // The list runs on its own task so the stop signal stays
            // responsive; a panic in there is resumed right here.
            let mut task = tokio::spawn(async move { pager.list(list_options).await });

            let list = tokio::select! {
                _ = stop.cancelled() => {
                    task.abort();
                    return Ok(());
                }
                joined = &mut task => match joined {
                    Ok(Ok(list)) => list,
                    Ok(Err(source)) => {
                        return Err(Error::ListFailed {
                            name: self.name.clone(),
                            source,
                        });
                    }
                    Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                    Err(_) => return Ok(()),
                },
            };
            trace.step("objects listed");

            let ObjectList { metadata, items } = list;
            let version = metadata.resource_version.unwrap_or_default();
            trace.step("resource version extracted");
            trace.step("objects extracted");

            self.store
                .replace(items, &version)
                .map_err(|source| Error::ReplaceFailed {
                    name: self.name.clone(),
                    source,
                })?;
            trace.step("store replaced");

            self.version.set(&version);
            trace.step("resource version updated");

            version
        };

        // RESYNC
        let (resync_err_tx, mut resync_err_rx) = mpsc::channel::<crate::Error>(1);
        let resync_cancel = CancellationToken::new();
        let worker = tokio::spawn(resync_worker(
            Arc::clone(&self.store),
            self.name.clone(),
            self.resync_period,
            self.should_resync.clone(),
            resync_err_tx,
            stop.clone(),
            resync_cancel.clone(),
        ));

        // WATCH
        let result = self
            .watch_loop(stop, &mut version, &mut resync_err_rx)
            .await;

        // The worker must be gone before the next cycle spawns another one.
        resync_cancel.cancel();
        let _ = worker.await;

        result
    }

    async fn watch_loop(
        &mut self,
        stop: &CancellationToken,
        version: &mut String,
        resync_err_rx: &mut mpsc::Receiver<crate::Error>,
    ) -> Result<(), Error> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let mut options = ListOptions {
                resource_version: Some(version.clone()),
                // Hanging watchers are cut server side once the jittered
                // timeout elapses.
                timeout: Some(jittered_watch_timeout()),
                bookmarks: false,
                ..Default::default()
            };
            if self.reset_rx.is_some() {
                // Bounds may have changed since the last iteration; the
                // selector is rendered fresh every time.
                let selector = self.bounds.field_selector(self.owner_kind.as_deref());
                options.append_field_selector(&selector);
            }

            let events = match self.lister_watcher.watch(&options).await {
                Ok(events) => events,
                Err(err) if err.is_connection_refused() => {
                    // The api server is most likely unresponsive; the watch
                    // can resume where it ended, so re-listing buys nothing.
                    debug!(message = "watch connection refused, retrying", name = %self.name);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(err) => {
                    if err.is_unexpected_eof() {
                        info!(message = "watch closed with unexpected EOF", name = %self.name, %err);
                    } else {
                        warn!(
                            message = "failed to watch",
                            name = %self.name,
                            kind = R::KIND,
                            %err,
                        );
                    }
                    return Ok(());
                }
            };

            match self.watch_handler(events, version, resync_err_rx, stop).await {
                Ok(()) => {}
                Err(Error::StopRequested) => return Ok(()),
                Err(Error::ResetRequested) => return Err(Error::ResetRequested),
                Err(Error::ResetChannelClosed) => return Err(Error::ResetChannelClosed),
                Err(err) if err.is_expired() => {
                    debug!(
                        message = "watch ended with expired version, relisting",
                        name = %self.name,
                        %err,
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        message = "watch ended with error",
                        name = %self.name,
                        kind = R::KIND,
                        %err,
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Consumes one watch stream, keeping `version` up to date.
    async fn watch_handler(
        &mut self,
        mut events: WatchStream<R>,
        version: &mut String,
        resync_err_rx: &mut mpsc::Receiver<crate::Error>,
        stop: &CancellationToken,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let mut event_count = 0u64;

        loop {
            let step = match self.reset_rx.as_mut() {
                Some(reset_rx) => tokio::select! {
                    _ = stop.cancelled() => Step::Stopped,
                    signal = reset_rx.recv() => Step::Reset(signal),
                    Some(source) = resync_err_rx.recv() => Step::ResyncFailed(source),
                    event = events.next() => Step::Event(event),
                },
                None => tokio::select! {
                    _ = stop.cancelled() => Step::Stopped,
                    Some(source) = resync_err_rx.recv() => Step::ResyncFailed(source),
                    event = events.next() => Step::Event(event),
                },
            };

            match step {
                Step::Stopped => return Err(Error::StopRequested),
                Step::ResyncFailed(source) => {
                    return Err(Error::ResyncFailed {
                        name: self.name.clone(),
                        source,
                    });
                }
                Step::Reset(Ok(signal)) => {
                    self.bounds.set(signal);
                    return Err(Error::ResetRequested);
                }
                Step::Reset(Err(RecvError::Closed)) => {
                    error!(message = "reset channel closed", name = %self.name);
                    return Err(Error::ResetChannelClosed);
                }
                Step::Reset(Err(RecvError::Lagged(missed))) => {
                    warn!(message = "reset channel lagged", name = %self.name, missed);
                }
                Step::Event(Some(Ok(event))) => {
                    self.dispatch(event, version, &mut event_count)?;
                }
                Step::Event(Some(Err(err))) => return Err(Error::Stream(err)),
                Step::Event(None) => break,
            }
        }

        if started.elapsed() < Duration::from_secs(1) && event_count == 0 {
            return Err(Error::VeryShortWatch {
                name: self.name.clone(),
            });
        }

        debug!(
            message = "watch closed",
            name = %self.name,
            kind = R::KIND,
            event_count,
        );
        Ok(())
    }

    /// Classifies a single watch event and applies it to the store.
    ///
    /// Store failures on individual events are logged and dropped; the
    /// version advances regardless so the watch does not replay them.
    fn dispatch(
        &self,
        event: WatchEvent<R>,
        version: &mut String,
        event_count: &mut u64,
    ) -> Result<(), Error> {
        let new_version = match event {
            WatchEvent::Error(status) => {
                return Err(Error::Stream(client::Error::Api(status)));
            }
            WatchEvent::Bookmark(bookmark) => {
                // No payload; only the version advances.
                bookmark.metadata.resource_version
            }
            WatchEvent::Added(object) => {
                let Some(new_version) = self.accept(&object) else {
                    return Ok(());
                };
                if let Err(err) = self.store.add(object) {
                    error!(
                        message = "unable to add watch event object to store",
                        name = %self.name,
                        %err,
                    );
                }
                new_version
            }
            WatchEvent::Modified(object) => {
                let Some(new_version) = self.accept(&object) else {
                    return Ok(());
                };
                if let Err(err) = self.store.update(object) {
                    error!(
                        message = "unable to update watch event object in store",
                        name = %self.name,
                        %err,
                    );
                }
                new_version
            }
            WatchEvent::Deleted(object) => {
                let Some(new_version) = self.accept(&object) else {
                    return Ok(());
                };
                if let Err(err) = self.store.delete(object) {
                    error!(
                        message = "unable to delete watch event object from store",
                        name = %self.name,
                        %err,
                    );
                }
                new_version
            }
        };

        version.clone_from(&new_version);
        self.version.set(&new_version);
        *event_count += 1;
        Ok(())
    }

    /// Applies the kind filter; returns the object's resource version when
    /// the event is accepted.
    fn accept(&self, object: &R) -> Option<String> {
        if let Some(expected) = &self.expected_kind {
            if object.kind() != expected {
                warn!(
                    message = "dropping watch event with unexpected kind",
                    name = %self.name,
                    expected = %expected,
                    actual = %object.kind(),
                );
                return None;
            }
        }

        Some(object.metadata().resource_version.clone())
    }
}

/// One select round of the watch handler.
enum Step<R> {
    Stopped,
    Reset(Result<[i64; 2], RecvError>),
    ResyncFailed(crate::Error),
    Event(Option<Result<WatchEvent<R>, client::Error>>),
}

/// Periodically resyncs the store until stopped or cancelled.
///
/// A resync failure is surfaced on the error channel and ends the worker.
async fn resync_worker<R: Resource>(
    store: Arc<dyn Store<R>>,
    name: String,
    period: Duration,
    should_resync: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    errors: mpsc::Sender<crate::Error>,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = resync_tick(period) => {}
            _ = stop.cancelled() => return,
            _ = cancel.cancelled() => return,
        }

        if should_resync.as_ref().map_or(true, |predicate| predicate()) {
            debug!(message = "forcing resync", name = %name);
            if let Err(err) = store.resync() {
                let _ = errors.try_send(err);
                return;
            }
        }
    }
}

/// Resolves when the next resync is due; never resolves when resync is
/// disabled.
async fn resync_tick(period: Duration) {
    if period.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(period).await;
    }
}

fn jittered_watch_timeout() -> u32 {
    (MIN_WATCH_TIMEOUT.as_secs_f64() * (1.0 + rand::rng().random::<f64>())) as u32
}

/// Step marks around the initial list. Logged on drop when the whole phase
/// exceeded [`INIT_TRACE_THRESHOLD`], so slow error paths are covered too.
struct InitTrace {
    name: String,
    started: Instant,
    steps: Vec<(&'static str, Instant)>,
}

impl InitTrace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: Instant::now(),
            steps: Vec::new(),
        }
    }

    fn step(&mut self, what: &'static str) {
        self.steps.push((what, Instant::now()));
    }
}

impl Drop for InitTrace {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed < INIT_TRACE_THRESHOLD {
            return;
        }

        let mut last = self.started;
        for &(what, at) in &self.steps {
            info!(
                message = "slow initial list step",
                name = %self.name,
                step = what,
                elapsed = ?at.duration_since(last),
            );
            last = at;
        }
        info!(message = "slow initial list", name = %self.name, total = ?elapsed);
    }
}
