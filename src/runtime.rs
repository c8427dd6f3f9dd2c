// 50 Hz loop with watchdog driving the wheel axes
// Note: the watchdog zeroes both wheels if twist commands stop arriving,
// e.g. when teleop crashes, instead of holding the last velocity forever.

use std::time::{Duration, Instant};
use tokio::task::block_in_place;
use tokio::time::interval;
use tracing::{info, warn};

// local imports
use crate::config::{
    CMD_TIMEOUT, ERROR_CHECK_TICKS, LOOP_HZ, TOPIC_CMD_VEL, TOPIC_HEALTH, TOPIC_RT_WHEELS,
};
use crate::messages::{RuntimeHealth, TwistCommand, WheelActuation};
use crate::odrive::{AxisPairController, DeviceFinder, DriveGeometry, twist_to_wheels};

pub struct Runtime {
    latest_cmd: Option<TwistCommand>,
    cmd_received_at: Instant,
    health: RuntimeHealth,
    geometry: DriveGeometry,
    axis_fault: bool,
    link_error: bool,
}

impl Runtime {
    pub fn new(geometry: DriveGeometry) -> Self {
        Self {
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
            geometry,
            axis_fault: false,
            link_error: false,
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    fn on_command(&mut self, cmd: TwistCommand) {
        info!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Instant::now();
    }

    /// Compute actuation based on watchdog state
    fn compute_actuation(&mut self) -> WheelActuation {
        let cmd_age = self.cmd_received_at.elapsed();

        let actuation = if cmd_age > CMD_TIMEOUT {
            // Watchdog triggered - stop the robot
            if self.health == RuntimeHealth::Ok {
                warn!("Command stale ({:?} old), stopping robot", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            WheelActuation::default() // Zero velocity
        } else if let Some(ref cmd) = self.latest_cmd {
            self.health = RuntimeHealth::Ok;
            twist_to_wheels(cmd.linear, cmd.angular, &self.geometry).into()
        } else {
            // No command ever received
            self.health = RuntimeHealth::CmdStale;
            WheelActuation::default()
        };

        // Device problems outrank the watchdog
        if self.link_error {
            self.health = RuntimeHealth::LinkError;
        } else if self.axis_fault {
            self.health = RuntimeHealth::AxisFault;
        }
        actuation
    }
}

pub async fn run<F: DeviceFinder>(
    controller: &mut AxisPairController<F>,
    geometry: DriveGeometry,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_VEL).await?;
    let pub_actuation = session.declare_publisher(TOPIC_RT_WHEELS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new(geometry);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let mut ticks: u64 = 0;
    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_VEL);
    info!("Publishing to: {}, {}", TOPIC_RT_WHEELS, TOPIC_HEALTH);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
        ticks += 1;

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<TwistCommand>(&payload) {
                Ok(cmd) => {
                    runtime.on_command(cmd);
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Compute actuation (includes watchdog logic) and send it
        let actuation = runtime.compute_actuation();
        runtime.link_error = block_in_place(|| controller.drive(actuation.left, actuation.right)).is_err();

        // 3. Check axis errors periodically
        if ticks % ERROR_CHECK_TICKS == 0 {
            match block_in_place(|| controller.get_errors(true)) {
                Ok(Some(errors)) => {
                    warn!("Axis fault: {}", errors);
                    runtime.axis_fault = true;
                }
                Ok(None) => runtime.axis_fault = false,
                Err(_) => runtime.link_error = true,
            }
        }

        // 4. Publish actuation
        let actuation_json = serde_json::to_string(&actuation)?;
        pub_actuation.put(actuation_json).await?;

        // 5. Publish health
        let health_json = serde_json::to_string(&runtime.health)?;
        pub_health.put(health_json).await?;
    }

    block_in_place(|| controller.release())?;
    Ok(())
}
