//! Peer controllers that share the axis driver pattern.
//!
//! Neither controller moves the patient directly. [`VelocityController`]
//! sets the stage speed used by timed scans; [`WorkPointController`] tells the
//! motion controller where the rotation pivot sits.

use nalgebra::Vector3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::{AppResult, PositionerError};
use crate::hardware::capabilities::{DeviceFactory, DriverEvent, MotorDriver};
use crate::monitor::ConnectionMonitor;

/// Mirrors a driver's `Connected`/`Disconnected` events into a watch channel.
pub struct ConnectionLink {
    state: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionLink {
    /// Start tracking. Must be called from within a tokio runtime.
    pub fn track(driver: &Arc<dyn MotorDriver>) -> Self {
        let (state, _) = watch::channel(driver.is_connected());
        let mut events = driver.subscribe();
        let tx = state.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DriverEvent::Connected) => {
                        tx.send_replace(true);
                    }
                    Ok(DriverEvent::Disconnected) => {
                        tx.send_replace(false);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { state, task }
    }

    /// Current link state
    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Link state stream
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Drop for ConnectionLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Velocity
// =============================================================================

/// Configuration for a [`VelocityController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityConfig {
    /// Speed process variable
    pub address: String,
    /// Highest speed that may be commanded, units/s
    pub max_speed: f64,
}

/// Stage speed setting.
pub struct VelocityController {
    config: VelocityConfig,
    driver: Arc<dyn MotorDriver>,
    link: ConnectionLink,
}

impl VelocityController {
    /// Build from configuration
    pub fn new(config: VelocityConfig, driver: Arc<dyn MotorDriver>) -> Self {
        let link = ConnectionLink::track(&driver);
        Self {
            config,
            driver,
            link,
        }
    }

    /// Build using a device factory
    pub fn from_factory(config: VelocityConfig, factory: &dyn DeviceFactory) -> AppResult<Self> {
        let driver = factory.motor(&config.address)?;
        Ok(Self::new(config, driver))
    }

    /// Highest accepted speed
    pub fn max_speed(&self) -> f64 {
        self.config.max_speed
    }

    /// Command a new speed. Rejects non-positive speeds and speeds above
    /// `max_speed` without touching the driver.
    pub async fn set_speed(&self, speed: f64) -> AppResult<()> {
        if !speed.is_finite() || speed <= 0.0 || speed > self.config.max_speed {
            return Err(PositionerError::LimitExceeded {
                axis: "velocity".to_string(),
                target: speed,
                lower: 0.0,
                upper: self.config.max_speed,
            });
        }
        tracing::debug!(address = %self.config.address, speed, "Setting stage speed");
        self.driver
            .write(speed)
            .await
            .map_err(|e| PositionerError::Connection {
                device: self.config.address.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Current speed
    pub async fn speed(&self) -> AppResult<f64> {
        self.driver
            .read()
            .await
            .map_err(|e| PositionerError::Connection {
                device: self.config.address.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Link state stream
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    /// Current link state
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

// =============================================================================
// Work point
// =============================================================================

/// Configuration for a [`WorkPointController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPointConfig {
    /// Address prefix; the x/y/z components live at `{address}:X` etc.
    pub address: String,
    /// Offset applied when the stage is selected, mm
    #[serde(default)]
    pub offset: [f64; 3],
}

/// Rotation-pivot offset of the motion controller, one driver per component.
pub struct WorkPointController {
    address: String,
    drivers: [Arc<dyn MotorDriver>; 3],
    _links: [ConnectionLink; 3],
    monitor: ConnectionMonitor,
    current: Mutex<Vector3<f64>>,
}

impl WorkPointController {
    /// Build using a device factory
    pub fn from_factory(config: &WorkPointConfig, factory: &dyn DeviceFactory) -> AppResult<Self> {
        let drivers = [
            factory.motor(&format!("{}:X", config.address))?,
            factory.motor(&format!("{}:Y", config.address))?,
            factory.motor(&format!("{}:Z", config.address))?,
        ];
        Ok(Self::new(config.address.clone(), drivers))
    }

    /// Wrap three component drivers
    pub fn new(address: impl Into<String>, drivers: [Arc<dyn MotorDriver>; 3]) -> Self {
        let links = [
            ConnectionLink::track(&drivers[0]),
            ConnectionLink::track(&drivers[1]),
            ConnectionLink::track(&drivers[2]),
        ];
        let monitor = ConnectionMonitor::with_members(
            drivers
                .iter()
                .zip(links.iter())
                .map(|(driver, link)| (driver.address().to_string(), link.subscribe())),
        );

        Self {
            address: address.into(),
            drivers,
            _links: links,
            monitor,
            current: Mutex::new(Vector3::zeros()),
        }
    }

    /// Write a new pivot offset
    pub async fn set(&self, offset: Vector3<f64>) -> AppResult<()> {
        if !offset.iter().all(|v| v.is_finite()) {
            return Err(PositionerError::InvalidArgument(format!(
                "work point offset must be finite, got {:?}",
                offset
            )));
        }
        for (driver, value) in self.drivers.iter().zip(offset.iter()) {
            driver
                .write(*value)
                .await
                .map_err(|e| PositionerError::Connection {
                    device: driver.address().to_string(),
                    message: format!("{e:#}"),
                })?;
        }
        *self.current.lock() = offset;
        tracing::info!(address = %self.address, x = offset.x, y = offset.y, z = offset.z, "Work point set");
        Ok(())
    }

    /// Read the pivot offset back from the device
    pub async fn get(&self) -> AppResult<Vector3<f64>> {
        let mut values = [0.0; 3];
        for (slot, driver) in values.iter_mut().zip(self.drivers.iter()) {
            *slot = driver
                .read()
                .await
                .map_err(|e| PositionerError::Connection {
                    device: driver.address().to_string(),
                    message: format!("{e:#}"),
                })?;
        }
        Ok(Vector3::from(values))
    }

    /// Last offset written through this controller
    pub fn last_set(&self) -> Vector3<f64> {
        *self.current.lock()
    }

    /// Link state stream (all three components)
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.monitor.subscribe()
    }

    /// Current link state (all three components)
    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedDevices;

    #[tokio::test]
    async fn velocity_rejects_out_of_range_speed() {
        let devices = SimulatedDevices::default();
        let velocity = VelocityController::from_factory(
            VelocityConfig {
                address: "SPEED".into(),
                max_speed: 20.0,
            },
            &devices,
        )
        .unwrap();

        assert!(matches!(
            velocity.set_speed(25.0).await,
            Err(PositionerError::LimitExceeded { .. })
        ));
        assert!(velocity.set_speed(0.0).await.is_err());
        assert_eq!(devices.motor_mock("SPEED").unwrap().command_count(), 0);

        let mut events = devices.motor_mock("SPEED").unwrap().subscribe();
        velocity.set_speed(5.0).await.unwrap();
        while events.recv().await.unwrap() != DriverEvent::MoveFinished {}
        assert_eq!(velocity.speed().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn work_point_writes_all_components() {
        let devices = SimulatedDevices::default();
        let wp = WorkPointController::from_factory(
            &WorkPointConfig {
                address: "WP".into(),
                offset: [0.0; 3],
            },
            &devices,
        )
        .unwrap();

        wp.set(Vector3::new(100.0, 0.0, -5.0)).await.unwrap();
        assert_eq!(wp.last_set(), Vector3::new(100.0, 0.0, -5.0));
        for address in ["WP:X", "WP:Y", "WP:Z"] {
            assert_eq!(devices.motor_mock(address).unwrap().command_count(), 1);
        }
        assert!(wp.is_connected());
    }

    #[tokio::test]
    async fn work_point_connection_is_anded() {
        let devices = SimulatedDevices::default();
        let wp = WorkPointController::from_factory(
            &WorkPointConfig {
                address: "WP".into(),
                offset: [0.0; 3],
            },
            &devices,
        )
        .unwrap();
        let mut link = wp.connection();

        devices.motor_mock("WP:Y").unwrap().disconnect();
        link.wait_for(|c| !*c).await.unwrap();
        assert!(!wp.is_connected());

        devices.motor_mock("WP:Y").unwrap().reconnect();
        link.wait_for(|c| *c).await.unwrap();
    }
}
