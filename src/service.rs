//! Async wiring around [`Tracker`].
//!
//! ```text
//!  Scheduler loops ──SourceReport──┐
//!  TrackerHandle ────Command───────┼──> controller task ──watch──> ViewSnapshot
//!  shape fetch task ──(token, Result)┘         │
//!                                              └──broadcast──> DisplayEvent
//! ```
//!
//! The controller task is the only writer. Handles read the latest
//! [`ViewSnapshot`] without waiting on it and send commands for everything
//! that mutates state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::error::{ConfigError, Result, StartupError, TrackerError};
use crate::models::{FleetNumberEntry, RouteShape, SourceTag, VehicleRecord};
use crate::route_shape::{ShapeRequest, ShapeView};
use crate::scheduler::{RetryPolicy, Scheduler, SourceReport};
use crate::sources::{
    HttpShapeClient, PerRouteFeedClient, PositionFeedClient, ShapeClient, SnapshotFeedClient, SourceClient,
    create_http_client,
};
use crate::tracker::{DisplayEvent, SourceStatus, Tracker, ViewSnapshot};

const REPORT_CHANNEL_SIZE: usize = 64;
const COMMAND_CHANNEL_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 256;
const SHAPE_CHANNEL_SIZE: usize = 4;

enum Command {
    SetSearch {
        query: String,
        reply: oneshot::Sender<usize>,
    },
    Select {
        id: String,
        reply: oneshot::Sender<std::result::Result<ShapeView, TrackerError>>,
    },
    Deselect {
        reply: oneshot::Sender<ShapeView>,
    },
    Refresh {
        source: Option<SourceTag>,
        reply: oneshot::Sender<Vec<SourceTag>>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable display-side API.
pub struct TrackerHandle {
    view: watch::Receiver<Arc<ViewSnapshot>>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Receiver<DisplayEvent>,
}

impl Clone for TrackerHandle {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            commands: self.commands.clone(),
            events: self.events.resubscribe(),
        }
    }
}

impl TrackerHandle {
    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.view.borrow().clone()
    }

    pub fn visible_vehicles(&self) -> Vec<VehicleRecord> {
        self.snapshot().vehicles.clone()
    }

    pub fn trail(&self, id: &str) -> Vec<[f64; 2]> {
        self.snapshot().trail(id)
    }

    pub fn source_status(&self) -> Vec<SourceStatus> {
        self.snapshot().sources.clone()
    }

    pub fn fleet_numbers(&self) -> Vec<FleetNumberEntry> {
        self.snapshot().fleet.clone()
    }

    pub fn shape(&self) -> ShapeView {
        self.snapshot().shape.clone()
    }

    /// Receiver notified whenever a new snapshot is published.
    pub fn watch(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.events.resubscribe()
    }

    /// Run `callback` for every display event until the tracker stops.
    pub fn on_change<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(DisplayEvent) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Display subscriber lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Returns how many vehicles are visible under the new query.
    pub async fn set_search_query(&self, query: &str) -> std::result::Result<usize, TrackerError> {
        let query = query.to_string();
        self.request(|reply| Command::SetSearch { query, reply }).await
    }

    pub async fn select(&self, id: &str) -> std::result::Result<ShapeView, TrackerError> {
        let id = id.to_string();
        self.request(|reply| Command::Select { id, reply }).await?
    }

    pub async fn deselect(&self) -> std::result::Result<ShapeView, TrackerError> {
        self.request(|reply| Command::Deselect { reply }).await
    }

    /// Poll one source (or all) now. Returns the sources that were nudged.
    pub async fn refresh(&self, source: Option<SourceTag>) -> std::result::Result<Vec<SourceTag>, TrackerError> {
        self.request(|reply| Command::Refresh { source, reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> std::result::Result<T, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| TrackerError::Shutdown)?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }
}

// ============================================================================
// Builder & Service
// ============================================================================

pub struct TrackerBuilder {
    config: TrackerConfig,
    tracker: Tracker,
    scheduler: Scheduler,
    cancel: CancellationToken,
    reports_tx: mpsc::Sender<SourceReport>,
    reports_rx: mpsc::Receiver<SourceReport>,
}

impl TrackerBuilder {
    pub fn new(config: TrackerConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let tracker = Tracker::new(&config)?;
        let cancel = CancellationToken::new();
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_SIZE);

        Ok(Self {
            scheduler: Scheduler::new(cancel.child_token()),
            config,
            tracker,
            cancel,
            reports_tx,
            reports_rx,
        })
    }

    /// Poll `client` at the interval configured for its source. Must run inside a runtime.
    pub fn source<C>(mut self, client: Arc<C>) -> Self
    where
        C: SourceClient + 'static,
    {
        let interval = self.config.source(client.tag()).interval;
        let retry = RetryPolicy {
            retries: self.config.network_retries,
            delay: self.config.retry_delay,
        };
        self.scheduler.spawn(client, interval, retry, self.reports_tx.clone());
        self
    }

    pub fn start<H>(self, shapes: Arc<H>) -> TrackerService
    where
        H: ShapeClient + 'static,
    {
        let (view_tx, view_rx) = watch::channel(Arc::new(self.tracker.snapshot(Utc::now())));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (shape_tx, shape_rx) = mpsc::channel(SHAPE_CHANNEL_SIZE);

        let sources = self.scheduler.sources();
        let controller = Controller {
            tracker: self.tracker,
            scheduler: self.scheduler,
            shapes,
            view: view_tx,
            events: events_tx,
            shape_tx,
            shape_task: None,
        };
        // Only the pollers hold report senders from here on
        drop(self.reports_tx);

        let channels = ControllerChannels {
            reports: self.reports_rx,
            commands: commands_rx,
            shapes: shape_rx,
        };
        let task = tokio::spawn(controller.run(channels, self.config.sweep_interval(), self.cancel.clone()));

        tracing::info!(sources = ?sources, "Tracker started");

        TrackerService {
            handle: TrackerHandle {
                view: view_rx,
                commands: commands_tx,
                events: events_rx,
            },
            cancel: self.cancel,
            controller: task,
        }
    }
}

pub struct TrackerService {
    handle: TrackerHandle,
    cancel: CancellationToken,
    controller: JoinHandle<()>,
}

impl TrackerService {
    pub fn builder(config: TrackerConfig) -> std::result::Result<TrackerBuilder, ConfigError> {
        TrackerBuilder::new(config)
    }

    /// Start polling every enabled upstream feed over HTTP.
    pub fn start_http(config: TrackerConfig) -> std::result::Result<Self, StartupError> {
        let http = create_http_client(config.request_timeout)?;
        let mut builder = TrackerBuilder::new(config.clone())?;

        if config.position.enabled {
            builder = builder.source(Arc::new(PositionFeedClient::new(http.clone(), &config.position.url)));
        }
        if config.snapshot.enabled {
            builder = builder.source(Arc::new(SnapshotFeedClient::new(http.clone(), &config.snapshot.url)));
        }
        if config.per_route.enabled {
            builder = builder.source(Arc::new(PerRouteFeedClient::new(
                http.clone(),
                &config.per_route.url,
                config.routes.clone(),
            )));
        }

        Ok(builder.start(Arc::new(HttpShapeClient::new(http, &config.shape_url))))
    }

    pub fn handle(&self) -> TrackerHandle {
        self.handle.clone()
    }

    /// Stop every poller and the controller. Nothing is published afterwards.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down tracker");
        self.cancel.cancel();
        if let Err(e) = self.controller.await {
            tracing::warn!(error = %e, "Tracker controller ended abnormally");
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerChannels {
    reports: mpsc::Receiver<SourceReport>,
    commands: mpsc::Receiver<Command>,
    shapes: mpsc::Receiver<(u64, Result<RouteShape>)>,
}

struct Controller<H> {
    tracker: Tracker,
    scheduler: Scheduler,
    shapes: Arc<H>,
    view: watch::Sender<Arc<ViewSnapshot>>,
    events: broadcast::Sender<DisplayEvent>,
    shape_tx: mpsc::Sender<(u64, Result<RouteShape>)>,
    shape_task: Option<JoinHandle<()>>,
}

impl<H: ShapeClient + 'static> Controller<H> {
    async fn run(mut self, mut channels: ControllerChannels, sweep_every: Duration, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(report) = channels.reports.recv() => {
                    let event = self.tracker.apply_report(report, Utc::now());
                    self.publish(event);
                }
                Some(command) = channels.commands.recv() => self.handle_command(command),
                Some((token, result)) = channels.shapes.recv() => {
                    let event = self.tracker.complete_shape(token, result);
                    self.publish(event);
                }
                _ = sweep.tick() => {
                    let event = self.tracker.sweep(Utc::now());
                    self.publish(event);
                }
            }
        }

        if let Some(task) = self.shape_task.take() {
            task.abort();
        }
        self.scheduler.shutdown().await;
        tracing::info!("Tracker controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetSearch { query, reply } => {
                let event = self.tracker.set_search_query(&query, Utc::now());
                self.publish(event);
                let _ = reply.send(self.tracker.visible_count());
            }
            Command::Select { id, reply } => match self.tracker.select(&id) {
                Ok((request, event)) => {
                    if let Some(request) = request {
                        self.start_shape_fetch(request);
                    }
                    self.publish(Some(event));
                    let _ = reply.send(Ok(self.tracker.shape_view()));
                }
                Err(e) => {
                    tracing::debug!(vehicle = %id, error = %e, "Selection rejected");
                    let _ = reply.send(Err(e));
                }
            },
            Command::Deselect { reply } => {
                if let Some(task) = self.shape_task.take() {
                    task.abort();
                }
                let event = self.tracker.deselect();
                self.publish(Some(event));
                let _ = reply.send(self.tracker.shape_view());
            }
            Command::Refresh { source, reply } => {
                let nudged = match source {
                    Some(tag) if self.scheduler.refresh(tag) => vec![tag],
                    Some(_) => Vec::new(),
                    None => {
                        self.scheduler.refresh_all();
                        self.scheduler.sources()
                    }
                };
                tracing::info!(sources = ?nudged, "Manual refresh requested");
                let _ = reply.send(nudged);
            }
        }
    }

    /// Only one shape fetch runs at a time; a newer selection aborts the old one.
    fn start_shape_fetch(&mut self, request: ShapeRequest) {
        if let Some(previous) = self.shape_task.take() {
            previous.abort();
        }

        let shapes = self.shapes.clone();
        let done = self.shape_tx.clone();
        self.shape_task = Some(tokio::spawn(async move {
            let result = shapes.fetch_shape(&request.id).await;
            let _ = done.send((request.token, result)).await;
        }));
    }

    fn publish(&mut self, event: Option<DisplayEvent>) {
        self.view.send_replace(Arc::new(self.tracker.snapshot(Utc::now())));
        if let Some(event) = event {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}
