//! End-to-end motion scenarios over simulated motors.

use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use beamline_positioner::hardware::mock::{MockMode, MockMotor};
use beamline_positioner::motion::axis::{AxisEvent, Frame};
use beamline_positioner::motion::chain::{wait_finished, ChainEvent};
use beamline_positioner::motion::decomposition::{compose, target_transform};
use beamline_positioner::motion::pose::translation_of;
use beamline_positioner::motion::DecompositionSettings;
use beamline_positioner::{Axis, AxisSpec, Dof, KinematicChain, MoveMode, Pose, PositionerError};

fn spec(name: &str, dof: Dof, order: u32, limits: [f64; 2]) -> AxisSpec {
    AxisSpec {
        name: name.to_string(),
        dof,
        order,
        direction: 1,
        frame: Frame::Global,
        size: 0.0,
        work_distance: [0.0; 3],
        limits,
        precision: 0.01,
        backlash: 0.0,
        address: format!("SIM:{}", name.to_uppercase()),
    }
}

fn chain(parts: Vec<(AxisSpec, MockMotor)>) -> KinematicChain {
    let axes = parts
        .into_iter()
        .map(|(spec, motor)| Axis::new(spec, Arc::new(motor)))
        .collect();
    KinematicChain::new("scenario", axes, DecompositionSettings::default())
}

#[tokio::test]
async fn out_of_range_write_is_rejected_without_command() {
    let motor = MockMotor::new("SIM:RZ");
    let axis = Axis::new(spec("rz", Dof::Rz, 0, [-90.0, 90.0]), Arc::new(motor.clone()));

    let result = axis.write(100.0, MoveMode::Absolute).await;

    assert!(matches!(
        result,
        Err(PositionerError::LimitExceeded { target, .. }) if target == 100.0
    ));
    assert_eq!(motor.command_count(), 0);
    assert_eq!(axis.read().await.unwrap(), 0.0);
    assert!(axis.in_flight().is_none());
}

#[tokio::test]
async fn offset_rotation_residual_goes_to_translation_axis() {
    let mut rz = spec("rz", Dof::Rz, 1, [-180.0, 180.0]);
    rz.work_distance = [100.0, 0.0, 0.0];
    let specs = vec![spec("x", Dof::Tx, 0, [-100.0, 100.0]), rz];
    let x_motor = MockMotor::new("SIM:X");
    let rz_motor = MockMotor::new("SIM:RZ");
    let chain = chain(vec![
        (specs[0].clone(), x_motor.clone()),
        (specs[1].clone(), rz_motor.clone()),
    ]);

    let target = Pose::new(10.0, 0.0, 0.0, 0.0, 0.0, 90.0);
    let decomposition = chain.calculate_motion(&target).await.unwrap();
    assert!(decomposition.converged);
    assert!((decomposition.command_for("x").unwrap() + 90.0).abs() < 1e-9);

    let mut events = chain.subscribe();
    let chain_move = chain.apply_motion(&decomposition).await;
    assert!(chain_move.is_clean());
    let outcomes = wait_finished(&mut events, chain_move.id).await;
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    let values = [x_motor.raw_position(), rz_motor.raw_position()];
    let stage = compose(&specs, &values, &Pose::ZERO);
    let goal = target_transform(&specs, &target);
    assert!((translation_of(&stage).x - translation_of(&goal).x).abs() < 0.01);
    let angle = stage[(1, 0)].atan2(stage[(0, 0)]).to_degrees();
    assert!((angle - 90.0).abs() < 0.01);
}

#[tokio::test]
async fn aggregate_completion_needs_both_axes() {
    let fast = MockMotor::builder("SIM:X")
        .mode(MockMode::Realistic)
        .speed(500.0)
        .build();
    let slow = MockMotor::builder("SIM:Y")
        .mode(MockMode::Realistic)
        .speed(25.0)
        .update_interval(Duration::from_millis(10))
        .build();
    let chain = chain(vec![
        (spec("x", Dof::Tx, 0, [-50.0, 50.0]), fast),
        (spec("y", Dof::Ty, 1, [-50.0, 50.0]), slow.clone()),
    ]);
    let mut x_events = chain.axis("x").unwrap().subscribe();
    let mut events = chain.subscribe();

    let chain_move = chain
        .shift_position(&Pose::new(1.0, 2.5, 0.0, 0.0, 0.0, 0.0))
        .await
        .unwrap();

    loop {
        if let AxisEvent::MoveCompleted { .. } = x_events.recv().await.unwrap() {
            break;
        }
    }
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ChainEvent::MoveFinished { .. }),
            "aggregate completion after a single axis"
        );
    }
    assert!(slow.is_moving());

    let outcomes = wait_finished(&mut events, chain_move.id).await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(chain.position().await, Pose::new(1.0, 2.5, 0.0, 0.0, 0.0, 0.0));
}

#[tokio::test]
async fn repeated_absolute_move_is_idempotent() {
    let mut rz = spec("rz", Dof::Rz, 2, [-180.0, 180.0]);
    rz.direction = -1;
    let motors = [MockMotor::new("SIM:X"), MockMotor::new("SIM:Z"), MockMotor::new("SIM:RZ")];
    let chain = chain(vec![
        (spec("x", Dof::Tx, 0, [-100.0, 100.0]), motors[0].clone()),
        (spec("z", Dof::Tz, 1, [-100.0, 100.0]), motors[1].clone()),
        (rz, motors[2].clone()),
    ]);
    let target = Pose::new(-4.0, 0.0, 12.0, 0.0, 0.0, 33.0);

    let outcomes = chain.set_position_and_wait(&target).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(chain.position().await, target);
    // direction -1: the device runs the other way
    assert_eq!(motors[2].raw_position(), -33.0);

    let again = chain.set_position(&target).await.unwrap();
    assert!(again.commands.iter().all(|c| c.value.abs() < 1e-9));
    assert!(motors.iter().all(|m| m.command_count() == 1));
}

#[tokio::test]
async fn busy_axis_refuses_second_move() {
    let motor = MockMotor::builder("SIM:X")
        .mode(MockMode::Realistic)
        .speed(10.0)
        .build();
    let axis = Axis::new(spec("x", Dof::Tx, 0, [-50.0, 50.0]), Arc::new(motor));

    let ticket = axis.write(5.0, MoveMode::Absolute).await.unwrap();
    let second = axis.write(6.0, MoveMode::Absolute).await;
    assert!(matches!(
        second,
        Err(PositionerError::AxisBusy { move_id, .. }) if move_id == ticket.id.to_string()
    ));

    assert_ok!(axis.wait_idle().await);
    assert!((assert_ok!(axis.read().await) - 5.0).abs() < 1e-9);
}
