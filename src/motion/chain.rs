//! Kinematic chain: the ordered axes of one stage.
//!
//! The chain routes pose components to the axes that own them, runs the
//! decomposition solver, and turns N independent per-axis completions into a
//! single [`ChainEvent::MoveFinished`].
//!
//! Values handed to the chain are in stage coordinates (mm, degrees). The
//! axis `direction` converts them to device units on the way down and back
//! on the way up.

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppResult, PositionerError};
use crate::hardware::capabilities::DeviceFactory;
use crate::motion::axis::{Axis, AxisEvent, AxisSpec, MoveMode, MoveTicket};
use crate::motion::decomposition::{
    decompose, AxisCommand, Decomposition, DecompositionSettings,
};
use crate::motion::pose::{Dof, Pose};

const CHAIN_EVENT_CAPACITY: usize = 64;

/// Commands smaller than this are listed but not sent.
const NEGLIGIBLE_COMMAND: f64 = 1e-9;

/// Final result of one axis within a chain move.
#[derive(Debug, Clone)]
pub struct AxisOutcome {
    /// Axis name
    pub axis: String,
    /// Axis correlation id
    pub move_id: Uuid,
    /// Read-back position (device units) or the reason the move failed
    pub result: Result<f64, PositionerError>,
}

/// Events published by a [`KinematicChain`].
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Commands were issued
    MoveStarted {
        /// Chain move id
        id: Uuid,
        /// Axes that accepted a command
        axes: Vec<String>,
    },
    /// Every commanded axis reported back
    MoveFinished {
        /// Chain move id
        id: Uuid,
        /// One entry per commanded axis
        outcomes: Vec<AxisOutcome>,
    },
}

impl ChainEvent {
    /// Chain move id
    pub fn id(&self) -> Uuid {
        match self {
            ChainEvent::MoveStarted { id, .. } | ChainEvent::MoveFinished { id, .. } => *id,
        }
    }
}

/// Receipt for a chain move.
#[derive(Debug, Clone, Serialize)]
pub struct ChainMove {
    /// Chain move id, carried by both chain events
    pub id: Uuid,
    /// Full command set in stage units, including zero entries
    pub commands: Vec<AxisCommand>,
    /// Axis moves that were issued
    #[serde(skip)]
    pub issued: Vec<MoveTicket>,
    /// Axes whose command was refused, with the reason
    #[serde(skip)]
    pub rejected: Vec<(String, PositionerError)>,
}

impl ChainMove {
    /// Every command was either issued or negligible
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    /// First rejection as an error
    pub fn first_rejection(&self) -> Option<PositionerError> {
        self.rejected.first().map(|(_, e)| e.clone())
    }

    /// Command for a named axis
    pub fn command_for(&self, axis: &str) -> Option<f64> {
        self.commands
            .iter()
            .find(|c| c.axis == axis)
            .map(|c| c.value)
    }
}

/// An ordered stack of axes.
pub struct KinematicChain {
    name: String,
    axes: Vec<Axis>,
    specs: Vec<AxisSpec>,
    settings: DecompositionSettings,
    events: broadcast::Sender<ChainEvent>,
}

impl KinematicChain {
    /// Build from axes; they are sorted by stacking order.
    pub fn new(
        name: impl Into<String>,
        mut axes: Vec<Axis>,
        settings: DecompositionSettings,
    ) -> Self {
        axes.sort_by_key(|a| a.spec().order);
        let specs = axes.iter().map(|a| a.spec().clone()).collect();
        let (events, _) = broadcast::channel(CHAIN_EVENT_CAPACITY);
        Self {
            name: name.into(),
            axes,
            specs,
            settings,
            events,
        }
    }

    /// Build every axis from its spec using a device factory.
    pub fn from_specs(
        name: impl Into<String>,
        specs: &[AxisSpec],
        factory: &dyn DeviceFactory,
        settings: DecompositionSettings,
    ) -> AppResult<Self> {
        let axes = specs
            .iter()
            .map(|spec| Ok(Axis::new(spec.clone(), factory.motor(&spec.address)?)))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self::new(name, axes, settings))
    }

    /// Stage name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Axes in stacking order
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Axis by name
    pub fn axis(&self, name: &str) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name() == name)
    }

    /// First axis in stacking order driving `dof`
    pub fn owner(&self, dof: Dof) -> Option<&Axis> {
        self.axes.iter().find(|a| a.spec().dof == dof)
    }

    /// Solver settings
    pub fn settings(&self) -> &DecompositionSettings {
        &self.settings
    }

    /// Subscribe to chain events
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Stage pose: per-axis reads times direction, summed per DoF. An axis
    /// that cannot be read counts as 0.
    pub async fn position(&self) -> Pose {
        let mut pose = Pose::ZERO;
        for axis in &self.axes {
            let dof = axis.spec().dof;
            match axis.read().await {
                Ok(value) => pose.set(dof, pose.get(dof) + value * axis.spec().sign()),
                Err(e) => {
                    tracing::warn!(chain = %self.name, axis = %axis.name(), error = %e, "Position read failed, counting as 0");
                }
            }
        }
        pose
    }

    /// Move by a relative pose, each component to its owning axis.
    pub async fn shift_position(&self, delta: &Pose) -> AppResult<ChainMove> {
        self.check_pose(delta)?;
        let commands = self.route(delta);
        Ok(self.execute(commands).await)
    }

    /// Move to an absolute pose. Returns the per-axis deltas that were
    /// needed; repeating the same pose yields a near-zero command set.
    ///
    /// Moves still in flight finish first, so the deltas are taken from
    /// settled read-backs.
    pub async fn set_position(&self, target: &Pose) -> AppResult<ChainMove> {
        self.check_pose(target)?;
        self.wait_idle().await?;
        let current = self.position().await;
        let commands = self.route(&(*target - current));
        Ok(self.execute(commands).await)
    }

    /// Decompose a pose change with the stage at its current position.
    pub async fn calculate_motion(&self, target: &Pose) -> AppResult<Decomposition> {
        self.check_pose(target)?;
        let current = self.position().await;
        let decomposition = decompose(&self.specs, target, &current, &self.settings);
        tracing::info!(
            chain = %self.name,
            converged = decomposition.converged,
            iterations = decomposition.iterations,
            residual_mm = decomposition.residual_mm,
            "Motion calculated for {}",
            target
        );
        Ok(decomposition)
    }

    /// Issue a decomposition's commands.
    pub async fn apply_motion(&self, decomposition: &Decomposition) -> ChainMove {
        self.execute(decomposition.commands.clone()).await
    }

    /// Issue commands and wait for the aggregate completion.
    pub async fn move_and_wait(&self, commands: Vec<AxisCommand>) -> (ChainMove, Vec<AxisOutcome>) {
        let mut events = self.subscribe();
        let chain_move = self.execute(commands).await;
        let outcomes = wait_finished(&mut events, chain_move.id).await;
        (chain_move, outcomes)
    }

    /// Absolute move that resolves once every axis reported back.
    pub async fn set_position_and_wait(&self, target: &Pose) -> AppResult<Vec<AxisOutcome>> {
        self.check_pose(target)?;
        self.wait_idle().await?;
        let current = self.position().await;
        let (chain_move, outcomes) = self.move_and_wait(self.route(&(*target - current))).await;
        match chain_move.first_rejection() {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Resolve once no axis has a move in flight.
    pub async fn wait_idle(&self) -> AppResult<()> {
        for axis in &self.axes {
            axis.wait_idle().await?;
        }
        Ok(())
    }

    fn check_pose(&self, pose: &Pose) -> AppResult<()> {
        if pose.is_finite() {
            Ok(())
        } else {
            Err(PositionerError::InvalidArgument(format!(
                "pose must be finite: {}",
                pose
            )))
        }
    }

    /// One command per axis; owners get their component, later axes with the
    /// same DoF get 0.
    fn route(&self, pose: &Pose) -> Vec<AxisCommand> {
        let mut taken = [false; 6];
        self.axes
            .iter()
            .map(|axis| {
                let dof = axis.spec().dof;
                let slot = &mut taken[dof.pose_index()];
                let value = if *slot { 0.0 } else { pose.get(dof) };
                *slot = true;
                AxisCommand {
                    axis: axis.name().to_string(),
                    dof,
                    value,
                }
            })
            .collect()
    }

    async fn execute(&self, commands: Vec<AxisCommand>) -> ChainMove {
        let id = Uuid::new_v4();
        let mut issued = Vec::new();
        let mut rejected = Vec::new();
        let mut pending = Vec::new();

        for command in &commands {
            if command.value.abs() < NEGLIGIBLE_COMMAND {
                continue;
            }
            let Some(axis) = self.axis(&command.axis) else {
                rejected.push((
                    command.axis.clone(),
                    PositionerError::InvalidArgument(format!(
                        "no axis '{}' in chain '{}'",
                        command.axis, self.name
                    )),
                ));
                continue;
            };

            // One command per axis at a time
            if let Err(e) = axis.wait_idle().await {
                rejected.push((command.axis.clone(), e));
                continue;
            }
            let events = axis.subscribe();
            match axis
                .write(command.value * axis.spec().sign(), MoveMode::Relative)
                .await
            {
                Ok(ticket) => {
                    pending.push((ticket.clone(), events));
                    issued.push(ticket);
                }
                Err(e) => {
                    tracing::warn!(chain = %self.name, axis = %command.axis, error = %e, "Axis command rejected");
                    rejected.push((command.axis.clone(), e));
                }
            }
        }

        let axes: Vec<String> = issued.iter().map(|t| t.axis.clone()).collect();
        tracing::info!(chain = %self.name, move_id = %id, axes = ?axes, rejected = rejected.len(), "Chain move started");
        let _ = self.events.send(ChainEvent::MoveStarted { id, axes });

        let sender = self.events.clone();
        let chain = self.name.clone();
        tokio::spawn(async move {
            let outcomes = join_all(
                pending
                    .into_iter()
                    .map(|(ticket, events)| wait_axis(ticket, events)),
            )
            .await;
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            tracing::info!(chain = %chain, move_id = %id, failed, "Chain move finished");
            let _ = sender.send(ChainEvent::MoveFinished { id, outcomes });
        });

        ChainMove {
            id,
            commands,
            issued,
            rejected,
        }
    }
}

async fn wait_axis(ticket: MoveTicket, mut events: broadcast::Receiver<AxisEvent>) -> AxisOutcome {
    loop {
        match events.recv().await {
            Ok(AxisEvent::MoveCompleted {
                move_id, actual, ..
            }) if move_id == ticket.id => {
                return AxisOutcome {
                    axis: ticket.axis,
                    move_id,
                    result: Ok(actual),
                }
            }
            Ok(AxisEvent::MoveError { move_id, error, .. }) if move_id == ticket.id => {
                return AxisOutcome {
                    axis: ticket.axis,
                    move_id,
                    result: Err(error),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(axis = %ticket.axis, skipped, "Chain lagged behind axis events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return AxisOutcome {
                    axis: ticket.axis.clone(),
                    move_id: ticket.id,
                    result: Err(PositionerError::Device(format!(
                        "axis '{}' closed before reporting",
                        ticket.axis
                    ))),
                }
            }
        }
    }
}

/// Wait for the `MoveFinished` of a given chain move.
pub async fn wait_finished(
    events: &mut broadcast::Receiver<ChainEvent>,
    id: Uuid,
) -> Vec<AxisOutcome> {
    loop {
        match events.recv().await {
            Ok(ChainEvent::MoveFinished { id: done, outcomes }) if done == id => return outcomes,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMode, MockMotor};
    use crate::motion::axis::Frame;
    use std::sync::Arc;
    use std::time::Duration;

    fn spec(name: &str, dof: Dof, order: u32) -> AxisSpec {
        AxisSpec {
            name: name.to_string(),
            dof,
            order,
            direction: 1,
            frame: Frame::Global,
            size: 0.0,
            work_distance: [0.0; 3],
            limits: [-100.0, 100.0],
            precision: 0.01,
            backlash: 0.0,
            address: format!("TEST:{}", name),
        }
    }

    fn chain_of(parts: Vec<(AxisSpec, MockMotor)>) -> KinematicChain {
        let axes = parts
            .into_iter()
            .map(|(spec, motor)| Axis::new(spec, Arc::new(motor)))
            .collect();
        KinematicChain::new("test", axes, DecompositionSettings::default())
    }

    #[tokio::test]
    async fn position_applies_direction_and_tolerates_failed_reads() {
        let mut y = spec("y", Dof::Ty, 1);
        y.direction = -1;
        let broken = MockMotor::builder("TEST:z")
            .initial_position(7.0)
            .disconnected()
            .build();
        let chain = chain_of(vec![
            (spec("x", Dof::Tx, 0), MockMotor::builder("TEST:x").initial_position(2.0).build()),
            (y, MockMotor::builder("TEST:y").initial_position(3.0).build()),
            (spec("z", Dof::Tz, 2), broken),
        ]);

        let pose = chain.position().await;
        assert_eq!(pose, Pose::new(2.0, -3.0, 0.0, 0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn set_position_twice_yields_near_zero_commands() {
        let x = MockMotor::new("TEST:x");
        let rz = MockMotor::new("TEST:rz");
        let chain = chain_of(vec![
            (spec("x", Dof::Tx, 0), x.clone()),
            (spec("rz", Dof::Rz, 1), rz.clone()),
        ]);
        let target = Pose::new(5.0, 0.0, 0.0, 0.0, 0.0, -30.0);

        let mut events = chain.subscribe();
        let first = chain.set_position(&target).await.unwrap();
        assert_eq!(first.command_for("x"), Some(5.0));
        assert_eq!(first.command_for("rz"), Some(-30.0));
        wait_finished(&mut events, first.id).await;

        let second = chain.set_position(&target).await.unwrap();
        assert!(second.commands.iter().all(|c| c.value.abs() < 1e-9));
        assert!(second.issued.is_empty());
        assert_eq!(x.command_count(), 1);
        assert_eq!(rz.command_count(), 1);
        // nothing to wait for, but completion is still announced
        assert!(wait_finished(&mut events, second.id).await.is_empty());
    }

    #[tokio::test]
    async fn absolute_move_starts_from_settled_position() {
        let x = MockMotor::builder("TEST:x")
            .mode(MockMode::Realistic)
            .speed(20.0)
            .update_interval(Duration::from_millis(10))
            .build();
        let chain = chain_of(vec![(spec("x", Dof::Tx, 0), x.clone())]);
        let mut events = chain.subscribe();

        chain.shift_position(&Pose::single(Dof::Tx, 2.0)).await.unwrap();
        assert!(x.is_moving());

        let second = chain.set_position(&Pose::single(Dof::Tx, 3.0)).await.unwrap();
        assert!((second.command_for("x").unwrap() - 1.0).abs() < 1e-9);
        wait_finished(&mut events, second.id).await;
        assert!((x.raw_position() - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_violation_only_drops_that_axis() {
        let x = MockMotor::new("TEST:x");
        let y = MockMotor::new("TEST:y");
        let chain = chain_of(vec![
            (spec("x", Dof::Tx, 0), x.clone()),
            (spec("y", Dof::Ty, 1), y.clone()),
        ]);

        let mut events = chain.subscribe();
        let result = chain
            .shift_position(&Pose::new(500.0, 4.0, 0.0, 0.0, 0.0, 0.0))
            .await
            .unwrap();
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].0, "x");
        assert!(matches!(
            result.rejected[0].1,
            PositionerError::LimitExceeded { .. }
        ));
        assert_eq!(x.command_count(), 0);

        let outcomes = wait_finished(&mut events, result.id).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].axis, "y");
        assert_eq!(y.raw_position(), 4.0);
    }

    #[tokio::test]
    async fn aggregate_completion_waits_for_every_axis() {
        let fast = MockMotor::builder("TEST:x")
            .mode(MockMode::Realistic)
            .speed(1000.0)
            .build();
        let slow = MockMotor::builder("TEST:y")
            .mode(MockMode::Realistic)
            .speed(20.0)
            .update_interval(Duration::from_millis(10))
            .build();
        let chain = chain_of(vec![
            (spec("x", Dof::Tx, 0), fast.clone()),
            (spec("y", Dof::Ty, 1), slow.clone()),
        ]);
        let x_axis = chain.axis("x").unwrap().clone();
        let mut x_events = x_axis.subscribe();
        let mut events = chain.subscribe();

        let started = chain
            .shift_position(&Pose::new(1.0, 2.0, 0.0, 0.0, 0.0, 0.0))
            .await
            .unwrap();

        // the fast axis finishes first; no aggregate event may follow it yet
        loop {
            if let AxisEvent::MoveCompleted { .. } = x_events.recv().await.unwrap() {
                break;
            }
        }
        assert!(slow.is_moving());
        loop {
            match events.try_recv() {
                Ok(ChainEvent::MoveFinished { .. }) => panic!("finished after one axis"),
                Ok(ChainEvent::MoveStarted { .. }) => continue,
                Err(_) => break,
            }
        }

        let outcomes = wait_finished(&mut events, started.id).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(!slow.is_moving());
    }

    #[tokio::test]
    async fn verification_failure_is_an_outcome_not_an_abort() {
        let x = MockMotor::builder("TEST:x").settle_error(1.0).build();
        let y = MockMotor::new("TEST:y");
        let chain = chain_of(vec![(spec("x", Dof::Tx, 0), x), (spec("y", Dof::Ty, 1), y)]);

        let (chain_move, outcomes) = chain
            .move_and_wait(vec![
                AxisCommand {
                    axis: "x".into(),
                    dof: Dof::Tx,
                    value: 2.0,
                },
                AxisCommand {
                    axis: "y".into(),
                    dof: Dof::Ty,
                    value: 3.0,
                },
            ])
            .await;
        assert!(chain_move.is_clean());
        let x_outcome = outcomes.iter().find(|o| o.axis == "x").unwrap();
        assert!(matches!(
            x_outcome.result,
            Err(PositionerError::MoveVerification { .. })
        ));
        let y_outcome = outcomes.iter().find(|o| o.axis == "y").unwrap();
        assert_eq!(y_outcome.result.as_ref().unwrap(), &3.0);
    }

    #[tokio::test]
    async fn decomposition_is_applied_in_device_units() {
        let mut x = spec("x", Dof::Tx, 0);
        x.direction = -1;
        let motor = MockMotor::new("TEST:x");
        let chain = chain_of(vec![(x, motor.clone())]);

        let d = chain
            .calculate_motion(&Pose::single(Dof::Tx, 3.0))
            .await
            .unwrap();
        assert!(d.converged);
        let mut events = chain.subscribe();
        let applied = chain.apply_motion(&d).await;
        wait_finished(&mut events, applied.id).await;

        assert_eq!(motor.raw_position(), -3.0);
        assert_eq!(chain.position().await.tx, 3.0);
    }
}
