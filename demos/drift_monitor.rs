//! Drift monitor example: recalibrate periodically while the pipette drifts.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use pipette_tracker::devices::sim::{SimConfig, SimRig};
use pipette_tracker::{
    Cancellation, DriftMonitor, DriftMonitorConfig, Imager, PipetteTracker,
    ReferenceCaptureOptions, ReferenceLibrary,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let sim = Arc::new(SimRig::new(SimConfig::default()));
    let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
    let options = ReferenceCaptureOptions::default()
        .with_z_range(20e-6)
        .with_tip_length(40e-6);
    tracker.capture_reference(&options, &Cancellation::new()).await?;

    sim.camera.start();
    let (tx, mut rx) = mpsc::channel(8);
    let handle = DriftMonitor::new(
        vec![Arc::new(tracker)],
        DriftMonitorConfig::default().with_interval(500).with_padding(30e-6),
    )
    .run(tx);

    // Slowly push the pipette away in x
    let drifter = {
        let sim = sim.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(500)).await;
                sim.drift(Vector3::new(0.5e-6, 0.0, 0.0));
            }
        })
    };

    for _ in 0..10 {
        let Some(sample) = rx.recv().await else {
            break;
        };
        println!(
            "📈 {} drift {:.2} µm",
            sample.time.format("%H:%M:%S%.3f"),
            sample.drift[0] * 1e6
        );
    }

    handle.stop().await;
    let _ = drifter.await;
    sim.camera.stop();
    println!("\n✅ Done");
    Ok(())
}
