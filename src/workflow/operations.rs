//! Imaging and treatment sequences.
//!
//! Both operations are expressed as workflow item lists for the
//! [`WorkflowScheduler`](super::WorkflowScheduler). A stage move completes
//! on the chain's `MoveFinished` for the move it issued, and fails when any
//! axis of that move failed. Shutter steps complete on the source's state
//! events; the scan/capture pair runs through [`synchronize`].
//!
//! Every stage target is checked against the axis limits while the items
//! are built, so an unreachable plan is refused before anything runs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppResult, PositionerError};
use crate::hardware::capabilities::{
    AcquiredFrame, AcquisitionRequest, BeamSource, Detector, ImageSetMetadata, ImageSetStore,
    SourceEvent,
};
use crate::motion::chain::{ChainEvent, KinematicChain};
use crate::motion::controllers::VelocityController;
use crate::motion::pose::{Dof, Pose};
use crate::workflow::scheduler::{CompletionTrigger, WorkflowItem};
use crate::workflow::sync::{sync_task, synchronize};

/// Operator-facing message sink.
pub type Notifier = Arc<dyn Fn(String) + Send + Sync>;

/// Imaging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingSettings {
    /// Duration of one mechanical scan, s
    pub scan_duration_s: f64,
    /// Extra delay before the detector starts, ms
    pub detector_start_delay_ms: u64,
    /// Translation the scan runs along
    pub scan_dof: Dof,
    /// Rotation that sets the imaging angle
    pub rotation_dof: Dof,
    /// Detector to use; the first configured one when absent
    pub detector: Option<String>,
}

impl Default for ImagingSettings {
    fn default() -> Self {
        Self {
            scan_duration_s: 2.0,
            detector_start_delay_ms: 0,
            scan_dof: Dof::Tz,
            rotation_dof: Dof::Rz,
            detector: None,
        }
    }
}

/// Hardware a sequence drives.
#[derive(Clone)]
pub struct Beamline {
    /// Active stage
    pub chain: Arc<KinematicChain>,
    /// Stage speed control
    pub velocity: Arc<VelocityController>,
    /// Beam source and shutter
    pub source: Arc<dyn BeamSource>,
}

/// Parameters of one imaging acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagingPlan {
    /// Imaging angles, degrees
    pub angles: Vec<f64>,
    /// Scan start and stop along the scan DoF, mm
    pub scan_range: (f64, f64),
    /// Operator comment stored with the set
    pub comment: String,
    /// Stage pose before the acquisition
    pub start_pose: Pose,
}

/// One treatment port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPort {
    /// Offset of the port from the home pose
    pub offset: Pose,
    /// Scan start and stop along the scan DoF, mm
    pub scan_range: (f64, f64),
    /// Scan speed, mm/s
    pub speed: f64,
}

/// Completion trigger on the aggregate completion of the chain move whose
/// id is stored in `expected`.
///
/// `MoveFinished` events of other moves are ignored. A matching event with
/// a failed axis outcome resolves to that axis' error.
pub fn chain_settled(
    chain: &Arc<KinematicChain>,
    expected: Arc<Mutex<Option<Uuid>>>,
) -> CompletionTrigger {
    let chain = chain.clone();
    CompletionTrigger::resolving(
        "stage move finished",
        move || chain.subscribe(),
        move |event: &ChainEvent| match event {
            ChainEvent::MoveFinished { id, outcomes } if Some(*id) == *expected.lock() => {
                Some(match outcomes.iter().find_map(|o| o.result.as_ref().err()) {
                    Some(error) => Err(error.clone()),
                    None => Ok(()),
                })
            }
            _ => None,
        },
    )
}

/// Completion trigger on a specific source event.
pub fn source_reached(source: &Arc<dyn BeamSource>, wanted: SourceEvent) -> CompletionTrigger {
    let source = source.clone();
    let description = format!("source {:?}", wanted);
    CompletionTrigger::new(description, move || source.subscribe(), move |event| *event == wanted)
}

fn move_item(label: String, chain: &Arc<KinematicChain>, target: Pose) -> WorkflowItem {
    let issued: Arc<Mutex<Option<Uuid>>> = Arc::default();
    let trigger = chain_settled(chain, issued.clone());
    let chain = chain.clone();
    WorkflowItem::new(label, move || async move {
        let chain_move = chain.set_position(&target).await?;
        *issued.lock() = Some(chain_move.id);
        match chain_move.first_rejection() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    })
    .until(trigger)
}

/// Cleanup item closing the beam path; registered on every workflow so an
/// aborted, stalled or cancelled run never leaves the shutter open.
pub fn close_beam_path(source: &Arc<dyn BeamSource>) -> WorkflowItem {
    let source = source.clone();
    WorkflowItem::new("close beam path", move || async move {
        source.close_shutter().await?;
        Ok(())
    })
}

/// Reject a pose whose components fall outside the travel range of the
/// axes owning them.
fn check_reachable(chain: &KinematicChain, pose: &Pose) -> AppResult<()> {
    for dof in Dof::ALL {
        if let Some(axis) = chain.owner(dof) {
            axis.spec().check_limits(pose.get(dof) * axis.spec().sign())?;
        }
    }
    Ok(())
}

fn shutter_item(label: String, source: &Arc<dyn BeamSource>, open: bool) -> WorkflowItem {
    let wanted = if open {
        SourceEvent::ShutterOpened
    } else {
        SourceEvent::ShutterClosed
    };
    let trigger = source_reached(source, wanted);
    let source = source.clone();
    WorkflowItem::new(label, move || async move {
        if open {
            source.open_shutter().await?;
        } else {
            source.close_shutter().await?;
        }
        Ok(())
    })
    .until(trigger)
}

fn check_range(range: (f64, f64)) -> AppResult<f64> {
    let span = (range.1 - range.0).abs();
    if !range.0.is_finite() || !range.1.is_finite() || span == 0.0 {
        return Err(PositionerError::InvalidArgument(format!(
            "scan range {:?} must be finite and non-empty",
            range
        )));
    }
    Ok(span)
}

/// Build the imaging sequence.
///
/// Per angle: rotate and move to scan start, arm the timed scan, open the
/// shutter, start the scan and the detector together, close the shutter.
/// Then restore the speed, return to `start_pose` and store the frames.
pub fn imaging_workflow(
    beamline: &Beamline,
    detector: Arc<dyn Detector>,
    store: Arc<dyn ImageSetStore>,
    settings: &ImagingSettings,
    plan: ImagingPlan,
    notify: Notifier,
) -> AppResult<Vec<WorkflowItem>> {
    if plan.angles.is_empty() || plan.angles.iter().any(|a| !a.is_finite()) {
        return Err(PositionerError::InvalidArgument(
            "imaging needs at least one finite angle".to_string(),
        ));
    }
    if settings.scan_duration_s.is_nan() || settings.scan_duration_s <= 0.0 {
        return Err(PositionerError::Configuration(
            "scan duration must be positive".to_string(),
        ));
    }
    let span = check_range(plan.scan_range)?;
    let scan_speed = span / settings.scan_duration_s;
    if scan_speed > beamline.velocity.max_speed() {
        return Err(PositionerError::LimitExceeded {
            axis: "velocity".to_string(),
            target: scan_speed,
            lower: 0.0,
            upper: beamline.velocity.max_speed(),
        });
    }

    let exposure = Duration::from_secs_f64(settings.scan_duration_s);
    let detector_delay = Duration::from_millis(settings.detector_start_delay_ms);
    let frames: Arc<Mutex<Vec<AcquiredFrame>>> = Arc::default();
    let saved_speed: Arc<Mutex<Option<f64>>> = Arc::default();
    let (start, stop) = plan.scan_range;
    let mut items = Vec::new();

    {
        let velocity = beamline.velocity.clone();
        let saved_speed = saved_speed.clone();
        items.push(WorkflowItem::new("record stage speed", move || async move {
            let speed = velocity.speed().await?;
            *saved_speed.lock() = (speed > 0.0).then_some(speed);
            Ok(())
        }));
    }

    for angle in plan.angles.iter().copied() {
        let mut at_start = plan.start_pose;
        at_start.set(settings.rotation_dof, angle);
        at_start.set(settings.scan_dof, start);
        let mut at_stop = at_start;
        at_stop.set(settings.scan_dof, stop);
        check_reachable(&beamline.chain, &at_start)?;
        check_reachable(&beamline.chain, &at_stop)?;

        items.push(move_item(
            format!("angle {angle}: move to scan start"),
            &beamline.chain,
            at_start,
        ));

        let velocity = beamline.velocity.clone();
        items.push(WorkflowItem::new(
            format!("angle {angle}: arm timed scan"),
            move || async move { velocity.set_speed(scan_speed).await },
        ));

        items.push(shutter_item(
            format!("angle {angle}: open beam path"),
            &beamline.source,
            true,
        ));

        let chain = beamline.chain.clone();
        let detector = detector.clone();
        let frames = frames.clone();
        items.push(WorkflowItem::new(
            format!("angle {angle}: scan and capture"),
            move || async move {
                let scan = sync_task(move || async move {
                    let outcomes = chain.set_position_and_wait(&at_stop).await?;
                    match outcomes.into_iter().find_map(|o| o.result.err()) {
                        Some(error) => Err(error),
                        None => Ok(()),
                    }
                });
                let capture = sync_task(move || async move {
                    let request = AcquisitionRequest {
                        label: format!("angle_{angle}"),
                        exposure,
                    };
                    let mut frame = detector.acquire(&request).await?;
                    frame
                        .metadata
                        .insert("angle_deg".to_string(), angle.to_string());
                    frames.lock().push(frame);
                    Ok(())
                });
                synchronize(vec![scan, capture], &[Duration::ZERO, detector_delay])
                    .await
                    .into_result()
            },
        ));

        items.push(shutter_item(
            format!("angle {angle}: close beam path"),
            &beamline.source,
            false,
        ));
    }

    {
        let velocity = beamline.velocity.clone();
        items.push(WorkflowItem::new("restore stage speed", move || async move {
            let saved = *saved_speed.lock();
            match saved {
                Some(speed) => velocity.set_speed(speed).await,
                None => Ok(()),
            }
        }));
    }

    items.push(move_item(
        "return to start pose".to_string(),
        &beamline.chain,
        plan.start_pose,
    ));

    let metadata = ImageSetMetadata {
        comment: plan.comment,
        angles: plan.angles,
        scan_range: plan.scan_range,
        start_pose: plan.start_pose,
    };
    items.push(WorkflowItem::new("store image set", move || async move {
        let captured = std::mem::take(&mut *frames.lock());
        let (name, count) = store.add_image_set(captured, metadata).await?;
        tracing::info!(set = %name, frames = count, "Image set stored");
        notify(format!("Stored image set {} ({} frames)", name, count));
        Ok(())
    }));

    Ok(items)
}

/// Build the treatment sequence; ports run strictly in order.
///
/// Per port: set speed, move to port offset and scan start, open the
/// shutter, scan to stop, close the shutter, return home.
pub fn treatment_workflow(
    beamline: &Beamline,
    home: Pose,
    scan_dof: Dof,
    ports: Vec<TreatmentPort>,
    notify: Notifier,
) -> AppResult<Vec<WorkflowItem>> {
    if ports.is_empty() {
        return Err(PositionerError::InvalidArgument(
            "treatment needs at least one port".to_string(),
        ));
    }

    let total = ports.len();
    let mut items = Vec::new();
    for (index, port) in ports.into_iter().enumerate() {
        let number = index + 1;
        check_range(port.scan_range)?;
        if !port.offset.is_finite() {
            return Err(PositionerError::InvalidArgument(format!(
                "port {number} offset must be finite"
            )));
        }
        if port.speed.is_nan() || port.speed <= 0.0 || port.speed > beamline.velocity.max_speed() {
            return Err(PositionerError::LimitExceeded {
                axis: "velocity".to_string(),
                target: port.speed,
                lower: 0.0,
                upper: beamline.velocity.max_speed(),
            });
        }

        let mut at_start = home + port.offset;
        at_start.set(scan_dof, port.scan_range.0);
        let mut at_stop = at_start;
        at_stop.set(scan_dof, port.scan_range.1);
        check_reachable(&beamline.chain, &at_start)?;
        check_reachable(&beamline.chain, &at_stop)?;

        let velocity = beamline.velocity.clone();
        let notify = notify.clone();
        let speed = port.speed;
        items.push(WorkflowItem::new(
            format!("port {number}: set speed"),
            move || async move {
                notify(format!("Delivering port {number}/{total}"));
                velocity.set_speed(speed).await
            },
        ));
        items.push(move_item(
            format!("port {number}: move to scan start"),
            &beamline.chain,
            at_start,
        ));
        items.push(shutter_item(
            format!("port {number}: open beam path"),
            &beamline.source,
            true,
        ));
        items.push(move_item(
            format!("port {number}: scan"),
            &beamline.chain,
            at_stop,
        ));
        items.push(shutter_item(
            format!("port {number}: close beam path"),
            &beamline.source,
            false,
        ));
        items.push(move_item(
            format!("port {number}: return home"),
            &beamline.chain,
            home,
        ));
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMode, MockMotor, MockSource};
    use crate::motion::axis::{Axis, AxisSpec, Frame};
    use crate::motion::controllers::VelocityConfig;
    use crate::motion::DecompositionSettings;
    use crate::workflow::scheduler::WorkflowScheduler;
    use tokio::sync::broadcast;

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
            address: format!("OPS:{}", name),
        }
    }

    struct Bench {
        beamline: Beamline,
        x: MockMotor,
        z: MockMotor,
        source: Arc<MockSource>,
    }

    fn bench(mode: MockMode) -> Bench {
        let x = MockMotor::builder("OPS:x")
            .mode(mode)
            .speed(20.0)
            .update_interval(Duration::from_millis(10))
            .build();
        let z = MockMotor::builder("OPS:z").mode(mode).speed(20.0).build();
        let chain = KinematicChain::new(
            "ops",
            vec![
                Axis::new(spec("x", Dof::Tx, 0), Arc::new(x.clone())),
                Axis::new(spec("z", Dof::Tz, 1), Arc::new(z.clone())),
                Axis::new(spec("rz", Dof::Rz, 2), Arc::new(MockMotor::new("OPS:rz"))),
            ],
            DecompositionSettings::default(),
        );
        let velocity = VelocityController::new(
            VelocityConfig {
                address: "OPS:SPEED".to_string(),
                max_speed: 10.0,
            },
            Arc::new(MockMotor::new("OPS:SPEED")),
        );
        let source = Arc::new(MockSource::new());
        Bench {
            beamline: Beamline {
                chain: Arc::new(chain),
                velocity: Arc::new(velocity),
                source: source.clone(),
            },
            x,
            z,
            source,
        }
    }

    fn quiet() -> Notifier {
        Arc::new(|_: String| {})
    }

    fn port(scan_range: (f64, f64)) -> TreatmentPort {
        TreatmentPort {
            offset: Pose::ZERO,
            scan_range,
            speed: 5.0,
        }
    }

    #[tokio::test]
    async fn stage_step_waits_for_its_own_move() {
        let b = bench(MockMode::Realistic);
        let chain = b.beamline.chain.clone();

        // An earlier move is still running when the step is armed
        chain.shift_position(&Pose::single(Dof::Tx, 2.0)).await.unwrap();
        assert!(b.x.is_moving());

        let moving_after_step: Arc<Mutex<Option<bool>>> = Arc::default();
        let mut scheduler = WorkflowScheduler::default();
        scheduler.enqueue(move_item(
            "to x 5".to_string(),
            &chain,
            Pose::single(Dof::Tx, 5.0),
        ));
        {
            let chain = chain.clone();
            let moving_after_step = moving_after_step.clone();
            scheduler.enqueue(WorkflowItem::new("check", move || async move {
                let moving = chain.axes().iter().any(|a| a.in_flight().is_some());
                *moving_after_step.lock() = Some(moving);
                Ok(())
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*moving_after_step.lock(), Some(false));
        assert!((b.x.raw_position() - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_positioning_aborts_before_the_shutter_opens() {
        let b = bench(MockMode::Instant);
        b.z.fault_next_move("following error");

        let items =
            treatment_workflow(&b.beamline, Pose::ZERO, Dof::Tz, vec![port((-1.0, 1.0))], quiet())
                .unwrap();
        let mut scheduler = WorkflowScheduler::default();
        scheduler.extend(items);

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(
            err,
            PositionerError::WorkflowAborted { ref item, ref reason }
                if item == "port 1: move to scan start" && reason.contains("following error")
        ));
        assert_eq!(b.source.shutter_cycles(), 0);
    }

    #[tokio::test]
    async fn aborted_scan_closes_the_beam_path() {
        let b = bench(MockMode::Instant);
        let mut source_events = b.source.subscribe();

        // Scan start equals home, so the first z command is the scan itself
        let items =
            treatment_workflow(&b.beamline, Pose::ZERO, Dof::Tz, vec![port((0.0, 2.0))], quiet())
                .unwrap();
        b.z.fault_next_move("following error");
        let beam_source: Arc<dyn BeamSource> = b.source.clone();
        let mut scheduler = WorkflowScheduler::default();
        scheduler.extend(items);
        scheduler.on_failure(close_beam_path(&beam_source));

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(
            err,
            PositionerError::WorkflowAborted { ref item, .. } if item == "port 1: scan"
        ));
        assert_eq!(b.source.shutter_cycles(), 1);

        let mut seen = Vec::new();
        loop {
            match source_events.recv().await {
                Ok(SourceEvent::ShutterClosed) => break,
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("source closed"),
            }
        }
        assert_eq!(seen, vec![SourceEvent::ShutterOpened]);
        assert!(!b.source.state().shutter_open);
    }

    #[tokio::test]
    async fn unreachable_targets_are_refused_before_queueing() {
        let b = bench(MockMode::Instant);

        let scan = treatment_workflow(
            &b.beamline,
            Pose::ZERO,
            Dof::Tz,
            vec![port((-5.0, 200.0))],
            quiet(),
        );
        assert!(matches!(
            scan,
            Err(PositionerError::LimitExceeded { ref axis, target, .. }) if axis == "z" && target == 200.0
        ));

        let offset = treatment_workflow(
            &b.beamline,
            Pose::single(Dof::Tx, 60.0),
            Dof::Tz,
            vec![TreatmentPort {
                offset: Pose::single(Dof::Tx, 50.0),
                ..port((-1.0, 1.0))
            }],
            quiet(),
        );
        assert!(matches!(
            offset,
            Err(PositionerError::LimitExceeded { ref axis, .. }) if axis == "x"
        ));

        let imaging = imaging_workflow(
            &b.beamline,
            Arc::new(crate::hardware::mock::MockDetector::new("det", 4, 4)),
            Arc::new(crate::hardware::mock::MemoryImageStore::new()),
            &ImagingSettings::default(),
            ImagingPlan {
                angles: vec![0.0, 150.0],
                scan_range: (-1.0, 1.0),
                comment: String::new(),
                start_pose: Pose::ZERO,
            },
            quiet(),
        );
        assert!(matches!(
            imaging,
            Err(PositionerError::LimitExceeded { ref axis, .. }) if axis == "rz"
        ));
        assert_eq!(b.z.command_count(), 0);
        assert_eq!(b.source.shutter_cycles(), 0);
    }
}
