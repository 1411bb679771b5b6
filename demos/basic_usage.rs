//! Basic usage example for Pipette Tracker.

use std::sync::Arc;

use nalgebra::Vector3;
use pipette_tracker::devices::sim::{SimConfig, SimRig};
use pipette_tracker::{
    Cancellation, Imager, MeasureOptions, PipetteTracker, ReferenceCaptureOptions,
    ReferenceLibrary,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt::init();

    // A simulated camera, pipette and stage
    let sim = SimRig::new(SimConfig::default().with_noise(0.02));
    let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));

    println!("📸 Capturing reference stack...\n");
    let options = ReferenceCaptureOptions::default()
        .with_z_range(20e-6)
        .with_tip_length(40e-6);
    tracker.capture_reference(&options, &Cancellation::new()).await?;

    // Pretend the manipulator lost 4 µm in x since the last calibration
    sim.miscalibrate(Vector3::new(4e-6, 0.0, 0.0));

    sim.camera.start();
    let measurement = tracker
        .measure_tip_position(&MeasureOptions::default().with_padding(30e-6))
        .await?;
    println!(
        "📍 Tip found {:.2} µm from where the manipulator expected it (confidence {:.2})",
        measurement.error().norm() * 1e6,
        measurement.confidence
    );

    match tracker.auto_calibrate(&MeasureOptions::default()).await {
        Ok(result) => {
            println!(
                "\n✅ Calibration corrected by {:.2} µm",
                result.local_error.norm() * 1e6
            );
        }
        Err(e) => {
            eprintln!("\n❌ Calibration failed: {}", e);
        }
    }
    sim.camera.stop();

    Ok(())
}
