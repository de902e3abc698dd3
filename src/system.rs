//! Positioning system facade.
//!
//! [`PositioningSystem`] is the surface an operator UI drives. It owns the
//! active stage (kinematic chain, speed and work-point controllers), the
//! shared peripherals (beam source, imaging detector) and the collaborators
//! it only calls into (image store, alignment solver).
//!
//! Everything it does is reported on one [`SystemEvent`] stream: chain
//! moves, subsystem connectivity, workflow completion, operator messages
//! and a machine-readable [`SystemStatus`].
//!
//! At most one workflow (imaging or treatment) runs at a time. Direct
//! patient moves and stage reselection are refused while one is running,
//! and a workflow or reselection is refused while any axis is still moving.
//! A workflow that ends early closes the beam path before it reports.

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{BeamlineConfig, StageConfig};
use crate::error::{AppResult, PositionerError};
use crate::hardware::capabilities::{
    AlignmentSolver, BeamSource, Detector, DeviceFactory, ImageSetStore,
};
use crate::monitor::ConnectionMonitor;
use crate::motion::axis::{AxisState, MoveMode};
use crate::motion::chain::{ChainEvent, ChainMove, KinematicChain};
use crate::motion::controllers::{VelocityController, WorkPointController};
use crate::motion::decomposition::Decomposition;
use crate::motion::pose::Pose;
use crate::workflow::operations::{
    close_beam_path, imaging_workflow, treatment_workflow, Beamline, ImagingPlan, Notifier,
    TreatmentPort,
};
use crate::workflow::scheduler::{CancelHandle, WorkflowItem, WorkflowScheduler};

const SYSTEM_EVENT_CAPACITY: usize = 256;

/// Events published by the [`PositioningSystem`].
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Aggregate connectivity of the active stage and peripherals changed
    Connected(bool),
    /// A chain move was issued
    NewMove(Uuid),
    /// Every axis of a chain move reported back
    MoveFinished(Uuid),
    /// A workflow left the running state (finished, aborted or cancelled)
    WorkflowFinished,
    /// Operator-facing message
    DisplayMessage(String),
    /// Machine-readable snapshot, published after every state change
    Status(SystemStatus),
}

/// Machine-readable system state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    /// Active stage
    pub stage: String,
    /// All members connected
    pub connected: bool,
    /// Members currently disconnected
    pub disconnected: Vec<String>,
    /// Axes with a move in flight
    pub moving: Vec<String>,
    /// Label of the running workflow
    pub workflow: Option<String>,
    /// An alignment is calculated and not yet applied
    pub alignment_pending: bool,
    /// Last reported failure
    pub last_error: Option<String>,
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
}

/// Handle to a running workflow.
pub struct WorkflowHandle {
    id: Uuid,
    label: String,
    cancel: CancelHandle,
    join: JoinHandle<AppResult<()>>,
}

impl WorkflowHandle {
    /// Correlation id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Workflow label ("imaging" or "treatment")
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Request cancellation; takes effect at the next trigger wait
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the workflow to end
    pub async fn wait(self) -> AppResult<()> {
        self.join.await.map_err(|e| {
            PositionerError::Device(format!("workflow task {} failed: {}", self.id, e))
        })?
    }
}

/// Stage selected from configuration, with the tasks relaying its events.
struct ActiveStage {
    chain: Arc<KinematicChain>,
    velocity: Option<Arc<VelocityController>>,
    work_point: Option<WorkPointController>,
    monitor: ConnectionMonitor,
    relays: Vec<JoinHandle<()>>,
}

impl Drop for ActiveStage {
    fn drop(&mut self) {
        for relay in &self.relays {
            relay.abort();
        }
    }
}

struct SystemInner {
    config: BeamlineConfig,
    devices: Arc<dyn DeviceFactory>,
    store: Arc<dyn ImageSetStore>,
    solver: Arc<dyn AlignmentSolver>,
    source: Option<Arc<dyn BeamSource>>,
    detector: Option<Arc<dyn Detector>>,
    stage: RwLock<Arc<ActiveStage>>,
    events: broadcast::Sender<SystemEvent>,
    pending_alignment: Mutex<Option<Decomposition>>,
    workflow_slot: Arc<tokio::sync::Mutex<()>>,
    workflow_label: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

/// Facade over the positioning core.
#[derive(Clone)]
pub struct PositioningSystem {
    inner: Arc<SystemInner>,
}

impl PositioningSystem {
    /// Build the system and select `config.active_stage`.
    ///
    /// Peripherals are built once; the stage is rebuilt by
    /// [`select_stage`](Self::select_stage).
    pub async fn build(
        config: BeamlineConfig,
        devices: Arc<dyn DeviceFactory>,
        store: Arc<dyn ImageSetStore>,
        solver: Arc<dyn AlignmentSolver>,
    ) -> AppResult<Self> {
        config.validate().map_err(PositionerError::Configuration)?;

        let source = match &config.source {
            Some(source) => Some(devices.source(&source.address)?),
            None => None,
        };
        let detector = match config.imaging_detector() {
            Some(detector) => Some(devices.detector(&detector.name, &detector.address)?),
            None => None,
        };

        let (events, _) = broadcast::channel(SYSTEM_EVENT_CAPACITY);
        let stage_config = config.active()?.clone();
        let stage = build_stage(
            &stage_config,
            &config,
            &*devices,
            source.as_ref(),
            detector.as_ref(),
            &events,
        )
        .await?;

        tracing::info!(
            stage = %stage_config.name,
            backend = devices.name(),
            axes = stage.chain.axes().len(),
            "Positioning system ready"
        );

        Ok(Self {
            inner: Arc::new(SystemInner {
                config,
                devices,
                store,
                solver,
                source,
                detector,
                stage: RwLock::new(Arc::new(stage)),
                events,
                pending_alignment: Mutex::new(None),
                workflow_slot: Arc::new(tokio::sync::Mutex::new(())),
                workflow_label: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        })
    }

    /// Replace the active stage wholesale with the named configuration.
    ///
    /// Any calculated alignment is discarded.
    pub async fn select_stage(&self, name: &str) -> AppResult<()> {
        let _slot = self.claim_workflow_slot("stage selection")?;
        self.ensure_settled(&self.chain(), "stage selection")?;
        let stage_config = self.inner.config.select_stage(name)?.clone();
        let stage = build_stage(
            &stage_config,
            &self.inner.config,
            &*self.inner.devices,
            self.inner.source.as_ref(),
            self.inner.detector.as_ref(),
            &self.inner.events,
        )
        .await?;

        *self.inner.stage.write() = Arc::new(stage);
        *self.inner.pending_alignment.lock() = None;
        tracing::info!(stage = %name, "Stage selected");
        self.display(format!("Stage {} selected", name));
        self.publish_status();
        Ok(())
    }

    /// Move the patient by or to a pose.
    ///
    /// Axes whose command is rejected (e.g. limits) are reported as
    /// operator messages; the other axes still move.
    pub async fn move_patient(&self, pose: Pose, mode: MoveMode) -> AppResult<ChainMove> {
        let _slot = self.claim_workflow_slot("patient move")?;
        let chain = self.chain();
        tracing::info!(chain = %chain.name(), %mode, "Move patient {}", pose);

        let chain_move = match mode {
            MoveMode::Absolute => chain.set_position(&pose).await,
            MoveMode::Relative => chain.shift_position(&pose).await,
        }
        .map_err(|e| self.record_error(e))?;

        for (axis, error) in &chain_move.rejected {
            self.report_error(format!("Axis {} rejected: {}", axis, error));
        }
        self.publish_status();
        Ok(chain_move)
    }

    /// Ask the alignment solver for a correction and decompose it for the
    /// active stage. The result is held until [`apply_alignment`](Self::apply_alignment).
    pub async fn calculate_alignment(&self) -> AppResult<Decomposition> {
        let correction = self
            .inner
            .solver
            .solve()
            .await
            .map_err(|e| self.record_error(e.into()))?;
        let decomposition = self
            .chain()
            .calculate_motion(&correction)
            .await
            .map_err(|e| self.record_error(e))?;

        let mut message = format!("Alignment calculated: {}", correction);
        if !decomposition.converged {
            message.push_str(&format!(
                " (did not converge, residual {:.3} mm)",
                decomposition.residual_mm
            ));
        }
        if !decomposition.unallocated.is_empty() {
            message.push_str(&format!(
                " (no axis for {:?})",
                decomposition.unallocated
            ));
        }
        self.display(message);

        *self.inner.pending_alignment.lock() = Some(decomposition.clone());
        self.publish_status();
        Ok(decomposition)
    }

    /// Issue the alignment calculated last.
    ///
    /// # Errors
    /// `InvalidArgument` when nothing was calculated since the last apply or
    /// stage selection.
    pub async fn apply_alignment(&self) -> AppResult<ChainMove> {
        let _slot = self.claim_workflow_slot("alignment")?;
        let pending = self.inner.pending_alignment.lock().take();
        let decomposition = pending.ok_or_else(|| {
            PositionerError::InvalidArgument("no alignment has been calculated".to_string())
        })?;

        let chain_move = self.chain().apply_motion(&decomposition).await;
        for (axis, error) in &chain_move.rejected {
            self.report_error(format!("Axis {} rejected: {}", axis, error));
        }
        self.display("Alignment applied".to_string());
        self.publish_status();
        Ok(chain_move)
    }

    /// Start an imaging acquisition at each angle over `z_range`.
    pub async fn acquire_images(
        &self,
        angles: Vec<f64>,
        z_range: (f64, f64),
        comment: impl Into<String>,
    ) -> AppResult<WorkflowHandle> {
        let slot = self.claim_workflow_slot("imaging")?;
        let detector = self.inner.detector.clone().ok_or_else(|| {
            PositionerError::Configuration("no detector configured for imaging".to_string())
        })?;
        let beamline = self.beamline()?;
        self.ensure_settled(&beamline.chain, "imaging")?;
        let start_pose = beamline.chain.position().await;

        let items = imaging_workflow(
            &beamline,
            detector,
            self.inner.store.clone(),
            &self.inner.config.imaging,
            ImagingPlan {
                angles,
                scan_range: z_range,
                comment: comment.into(),
                start_pose,
            },
            self.notifier(),
        )?;
        let cleanup = close_beam_path(&beamline.source);
        Ok(self.spawn_workflow("imaging", items, cleanup, slot))
    }

    /// Start treatment delivery. Port `i` is `ports[i]` (offset from the
    /// current pose), scanned over `scan_ranges[i]` at `speeds[i]`.
    pub async fn deliver_treatment(
        &self,
        ports: Vec<Pose>,
        scan_ranges: Vec<(f64, f64)>,
        speeds: Vec<f64>,
    ) -> AppResult<WorkflowHandle> {
        if ports.len() != scan_ranges.len() || ports.len() != speeds.len() {
            return Err(PositionerError::InvalidArgument(format!(
                "{} ports, {} scan ranges and {} speeds must match",
                ports.len(),
                scan_ranges.len(),
                speeds.len()
            )));
        }
        let slot = self.claim_workflow_slot("treatment")?;
        let beamline = self.beamline()?;
        self.ensure_settled(&beamline.chain, "treatment")?;
        let home = beamline.chain.position().await;

        let ports = ports
            .into_iter()
            .zip(scan_ranges)
            .zip(speeds)
            .map(|((offset, scan_range), speed)| TreatmentPort {
                offset,
                scan_range,
                speed,
            })
            .collect();
        let items = treatment_workflow(
            &beamline,
            home,
            self.inner.config.imaging.scan_dof,
            ports,
            self.notifier(),
        )?;
        let cleanup = close_beam_path(&beamline.source);
        Ok(self.spawn_workflow("treatment", items, cleanup, slot))
    }

    /// Aggregate connectivity of stage axes, controllers and peripherals
    pub fn is_connected(&self) -> bool {
        self.stage().monitor.is_connected()
    }

    /// Subscribe to system events
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.events.subscribe()
    }

    /// Current status snapshot
    pub fn status(&self) -> SystemStatus {
        let stage = self.stage();
        SystemStatus {
            stage: stage.chain.name().to_string(),
            connected: stage.monitor.is_connected(),
            disconnected: stage.monitor.disconnected(),
            moving: stage
                .chain
                .axes()
                .iter()
                .filter(|axis| axis.state() == AxisState::Moving)
                .map(|axis| axis.name().to_string())
                .collect(),
            workflow: self.inner.workflow_label.lock().clone(),
            alignment_pending: self.inner.pending_alignment.lock().is_some(),
            last_error: self.inner.last_error.lock().clone(),
            timestamp: Utc::now(),
        }
    }

    /// Active kinematic chain
    pub fn chain(&self) -> Arc<KinematicChain> {
        self.stage().chain.clone()
    }

    /// Work-point offset last written for the active stage
    pub fn work_point(&self) -> Option<Vector3<f64>> {
        self.stage().work_point.as_ref().map(|wp| wp.last_set())
    }

    /// Loaded configuration
    pub fn config(&self) -> &BeamlineConfig {
        &self.inner.config
    }

    fn stage(&self) -> Arc<ActiveStage> {
        self.inner.stage.read().clone()
    }

    fn beamline(&self) -> AppResult<Beamline> {
        let stage = self.stage();
        let velocity = stage.velocity.clone().ok_or_else(|| {
            PositionerError::Configuration(format!(
                "stage '{}' has no velocity control",
                stage.chain.name()
            ))
        })?;
        let source = self.inner.source.clone().ok_or_else(|| {
            PositionerError::Configuration("no beam source configured".to_string())
        })?;
        Ok(Beamline {
            chain: stage.chain.clone(),
            velocity,
            source,
        })
    }

    fn claim_workflow_slot(&self, purpose: &str) -> AppResult<OwnedMutexGuard<()>> {
        self.inner
            .workflow_slot
            .clone()
            .try_lock_owned()
            .map_err(|_| {
                let running = self
                    .inner
                    .workflow_label
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "operation".to_string());
                tracing::warn!(%purpose, %running, "Refused, stage is busy");
                PositionerError::WorkflowBusy(running)
            })
    }

    /// Refuse to start while a patient move or alignment is still running:
    /// the workflow's reference pose would be read mid-move.
    fn ensure_settled(&self, chain: &KinematicChain, purpose: &str) -> AppResult<()> {
        match chain.axes().iter().find_map(|axis| {
            axis.in_flight()
                .map(|request| (axis.name().to_string(), request.id))
        }) {
            Some((axis, move_id)) => {
                tracing::warn!(%purpose, %axis, %move_id, "Refused, stage is still moving");
                Err(PositionerError::AxisBusy {
                    axis,
                    move_id: move_id.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    fn spawn_workflow(
        &self,
        label: &'static str,
        items: Vec<WorkflowItem>,
        cleanup: WorkflowItem,
        slot: OwnedMutexGuard<()>,
    ) -> WorkflowHandle {
        let id = Uuid::new_v4();
        let mut scheduler = WorkflowScheduler::new(self.inner.config.workflow);
        scheduler.extend(items);
        scheduler.on_failure(cleanup);
        let cancel = scheduler.cancel_handle();

        *self.inner.workflow_label.lock() = Some(label.to_string());
        tracing::info!(workflow = label, %id, items = scheduler.len(), "Workflow started");
        self.display(format!("Starting {}", label));
        self.publish_status();

        let system = self.clone();
        let join = tokio::spawn(async move {
            let result = scheduler.run().await;
            match &result {
                Ok(()) => {
                    tracing::info!(workflow = label, %id, "Workflow finished");
                    system.display(format!("{} finished", label));
                }
                Err(error) => {
                    tracing::error!(workflow = label, %id, %error, "Workflow ended early");
                    system.report_error(format!("{} stopped: {}", label, error));
                }
            }
            *system.inner.workflow_label.lock() = None;
            drop(slot);
            let _ = system.inner.events.send(SystemEvent::WorkflowFinished);
            system.publish_status();
            result
        });

        WorkflowHandle {
            id,
            label: label.to_string(),
            cancel,
            join,
        }
    }

    fn notifier(&self) -> Notifier {
        let events = self.inner.events.clone();
        Arc::new(move |text: String| {
            let _ = events.send(SystemEvent::DisplayMessage(text));
        })
    }

    fn display(&self, text: String) {
        let _ = self.inner.events.send(SystemEvent::DisplayMessage(text));
    }

    fn report_error(&self, text: String) {
        *self.inner.last_error.lock() = Some(text.clone());
        self.display(text);
    }

    fn record_error(&self, error: PositionerError) -> PositionerError {
        self.report_error(error.to_string());
        error
    }

    fn publish_status(&self) {
        let _ = self.inner.events.send(SystemEvent::Status(self.status()));
    }
}

async fn build_stage(
    stage: &StageConfig,
    config: &BeamlineConfig,
    devices: &dyn DeviceFactory,
    source: Option<&Arc<dyn BeamSource>>,
    detector: Option<&Arc<dyn Detector>>,
    events: &broadcast::Sender<SystemEvent>,
) -> AppResult<ActiveStage> {
    stage.validate().map_err(PositionerError::Configuration)?;

    let chain = Arc::new(KinematicChain::from_specs(
        &stage.name,
        &stage.axes,
        devices,
        config.decomposition,
    )?);
    let velocity = match &stage.velocity {
        Some(velocity) => Some(Arc::new(VelocityController::from_factory(
            velocity.clone(),
            devices,
        )?)),
        None => None,
    };
    let work_point = match &stage.work_point {
        Some(work_point) => {
            let controller = WorkPointController::from_factory(work_point, devices)?;
            controller.set(Vector3::from(work_point.offset)).await?;
            Some(controller)
        }
        None => None,
    };

    let mut members: Vec<(String, watch::Receiver<bool>)> = chain
        .axes()
        .iter()
        .map(|axis| (axis.name().to_string(), axis.connection()))
        .collect();
    if let Some(velocity) = &velocity {
        members.push(("velocity".to_string(), velocity.connection()));
    }
    if let Some(work_point) = &work_point {
        members.push(("work point".to_string(), work_point.connection()));
    }
    if let Some(source) = source {
        members.push(("source".to_string(), source.connection()));
    }
    if let Some(detector) = detector {
        members.push((detector.name().to_string(), detector.connection()));
    }
    let monitor = ConnectionMonitor::with_members(members);

    let relays = vec![
        tokio::spawn(relay_chain(chain.subscribe(), events.clone())),
        tokio::spawn(relay_connection(monitor.subscribe(), events.clone())),
    ];

    Ok(ActiveStage {
        chain,
        velocity,
        work_point,
        monitor,
        relays,
    })
}

async fn relay_chain(
    mut chain_events: broadcast::Receiver<ChainEvent>,
    events: broadcast::Sender<SystemEvent>,
) {
    loop {
        match chain_events.recv().await {
            Ok(ChainEvent::MoveStarted { id, .. }) => {
                let _ = events.send(SystemEvent::NewMove(id));
            }
            Ok(ChainEvent::MoveFinished { id, outcomes }) => {
                for outcome in &outcomes {
                    if let Err(error) = &outcome.result {
                        let _ = events.send(SystemEvent::DisplayMessage(format!(
                            "Axis {}: {}",
                            outcome.axis, error
                        )));
                    }
                }
                let _ = events.send(SystemEvent::MoveFinished(id));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "System relay lagged behind chain events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn relay_connection(
    mut connection: watch::Receiver<bool>,
    events: broadcast::Sender<SystemEvent>,
) {
    while connection.changed().await.is_ok() {
        let connected = *connection.borrow_and_update();
        let _ = events.send(SystemEvent::Connected(connected));
    }
}
