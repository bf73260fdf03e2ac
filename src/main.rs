use color_eyre::{eyre::eyre, Result};
use hapticlink::config::{HapticConfig, TransportConfig};
use hapticlink::device::simulated::plugged_identities;
use hapticlink::device::{Finger, FingerCommand, SimulatedRig};
use hapticlink::hand::{LifecycleManager, PoseUpdate};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

// Curl (radians) past which the demo wall engages on a finger
const WALL_CURL: f32 = 1.0;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = HapticConfig::locate(explicit_path.as_deref()).await;
    let config = HapticConfig::load(config_path.as_deref())
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    setup_logging_env(config.log_level()?);
    match &config_path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }
    info!("Starting hapticlink with {} slots at {} Hz", config.slots.len(), config.tick_rate_hz);

    let TransportConfig::Simulated(simulated) = &config.transport;
    let rig = SimulatedRig::new();
    for device in &simulated.devices {
        rig.plug(device.identity.clone(), device.orientation);
    }
    info!("Simulated gloves: {:?}", plugged_identities(&rig));

    let cancel = CancellationToken::new();
    let motion = rig.spawn_motion(
        cancel.clone(),
        Duration::from_millis(simulated.motion_interval_ms),
        simulated.reconnect_every_secs.map(Duration::from_secs),
    );

    let (pose_tx, mut pose_rx) = mpsc::channel(config.pose_channel_capacity);
    let mut manager = LifecycleManager::new(
        &config.slots,
        config.hand_settings(),
        Box::new(rig.clone()),
        Box::new(rig.clone()),
        pose_tx,
    )
    .map_err(|e| eyre!("Failed to build hand core: {}", e))?;
    manager
        .start()
        .map_err(|e| eyre!("Failed to start hand core: {}", e))?;

    let mut ticker = tokio::time::interval(config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => {
                manager.tick();
                while let Ok(update) = pose_rx.try_recv() {
                    apply_virtual_wall(&mut manager, &update);
                }
            }
        }
    }

    cancel.cancel();
    let report = manager.shutdown();
    info!("Shutdown complete: {:?}", report);
    motion
        .await
        .map_err(|e| eyre!("Simulated motion task failed: {}", e))?;

    Ok(())
}

// Stiffens every finger curled past the wall, releases the rest
fn apply_virtual_wall(manager: &mut LifecycleManager, update: &PoseUpdate) {
    let commands: Vec<FingerCommand> = Finger::ALL
        .into_iter()
        .map(|finger| {
            let curl = update.pose.finger(finger).curl[0];
            if curl > WALL_CURL {
                FingerCommand {
                    finger,
                    stiffness: 1.0,
                    position_setpoint: WALL_CURL / 1.2,
                    inward: true,
                }
            } else {
                FingerCommand::release(finger)
            }
        })
        .collect();

    let writes = manager.control_slot(update.slot, &commands);
    debug!("Virtual wall on {} slot {}: {} writes", update.orientation, update.slot, writes);
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
