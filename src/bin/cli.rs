//! Pipette Tracker - tip tracking and calibration against a simulated rig
//!
//! This is the CLI entry point for the pipette-tracker tool.
//! Run with: cargo run --bin pipette-tracker -- <command>

use pipette_tracker::devices::sim::{SimConfig, SimRig};
use pipette_tracker::{
    Cancellation, DriftMonitor, ErrorMapAnalysis, ErrorMapDataset, ErrorMapProgress, ErrorMapper,
    Imager, PipetteTracker, ReferenceLibrary, TrackerSettings,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Commands:
  reference            capture a reference focus stack
  calibrate            locate the tip and correct the calibration
  map-errors           run an error-mapping campaign
  drift [seconds]      monitor drift for a while (default 10 s)
  analyze [path]       analyze a saved error map
  quit                 exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    // Settings file first, environment overrides second
    let mut settings = TrackerSettings::load();
    if let Ok(pipette) = env::var("TRACKER_PIPETTE") {
        settings.pipette = pipette;
    }
    if let Some(ms) = env::var("TRACKER_FRAME_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        settings.frame_timeout_ms = ms;
    }
    if let Some(threshold) = env::var("TRACKER_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        settings.measure_threshold = threshold;
    }
    let noise: f32 = env::var("SIM_NOISE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.02);

    let library = match settings.reference_store_path() {
        Some(path) => ReferenceLibrary::open(path)?,
        None => ReferenceLibrary::new(),
    };

    println!("🔬 Pipette Tracker - tip tracking and auto-calibration");
    println!("================================================");
    println!("Pipette: {}", settings.pipette);
    println!("Frame timeout: {} ms", settings.frame_timeout_ms);
    println!("Threshold: {:.2}", settings.measure_threshold);
    println!(
        "Retry: max {} attempts, padding x{:.1}",
        settings.retry.max_retries, settings.retry.padding_multiplier
    );
    match library.path() {
        Some(path) => println!("Reference store: {}", path.display()),
        None => println!("Reference store: in memory"),
    }
    println!("Stored references: {}", library.keys().len());
    println!("================================================\n");

    let sim = SimRig::new(SimConfig::default().with_noise(noise));
    let tracker = Arc::new(
        PipetteTracker::new(sim.rig(), Arc::new(library))
            .with_retry_policy(settings.retry.clone())
            .with_frame_timeout(settings.frame_timeout()),
    );
    let session = Session {
        sim,
        tracker,
        settings,
    };

    if args.len() > 1 {
        session.run_command(&args[1..]).await?;
        return Ok(());
    }

    // Interactive mode
    println!("Interactive mode. Type a command and press Enter.\n");
    println!("{}\n", USAGE);

    let stdin = io::stdin();
    loop {
        print!("🔬 Command: ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();

        match words.first().map(String::as_str) {
            None => continue,
            Some("quit") | Some("exit") => {
                println!("Goodbye! 👋");
                break;
            }
            Some(_) => {
                if let Err(e) = session.run_command(&words).await {
                    eprintln!("\n❌ Error: {}\n", e);
                }
            }
        }
    }

    Ok(())
}

struct Session {
    sim: SimRig,
    tracker: Arc<PipetteTracker>,
    settings: TrackerSettings,
}

impl Session {
    async fn run_command(&self, words: &[String]) -> anyhow::Result<()> {
        let command = words.first().map(String::as_str).unwrap_or_default();
        match command {
            "reference" => self.reference().await,
            "calibrate" => self.calibrate().await,
            "map-errors" => self.map_errors().await,
            "drift" => {
                let seconds = words.get(1).and_then(|s| s.parse().ok()).unwrap_or(10);
                self.drift(seconds).await
            }
            "analyze" => {
                let path = words
                    .get(1)
                    .map(PathBuf::from)
                    .or_else(|| self.settings.error_map_path());
                match path {
                    Some(path) => analyze(&path),
                    None => anyhow::bail!("No error map path given"),
                }
            }
            _ => {
                println!("Unknown command: {}\n\n{}", command, USAGE);
                Ok(())
            }
        }
    }

    async fn reference(&self) -> anyhow::Result<()> {
        println!("📸 Capturing reference stack...");
        let options = self.settings.reference_options();
        let set = self
            .tracker
            .capture_reference(&options, &ctrl_c_cancellation())
            .await?;
        let (w, h) = set.template_size();
        println!(
            "✅ Stored {} frames of {}x{} px, center slice {}\n",
            set.frames.len(),
            w,
            h,
            set.center_index
        );
        Ok(())
    }

    async fn calibrate(&self) -> anyhow::Result<()> {
        self.sim.camera.start();
        let result = self
            .tracker
            .auto_calibrate(&self.settings.measure_options())
            .await;
        self.sim.camera.stop();

        let result = result?;
        println!(
            "✅ Corrected local error ({:.2}, {:.2}, {:.2}) µm, confidence {:.2}\n",
            result.local_error.x * 1e6,
            result.local_error.y * 1e6,
            result.local_error.z * 1e6,
            result.confidence
        );
        Ok(())
    }

    async fn map_errors(&self) -> anyhow::Result<()> {
        let config = self.settings.error_map.clone();
        println!(
            "🗺️  Mapping errors over {} points (Ctrl+C to cancel)...",
            config.point_count()
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<ErrorMapProgress>();
        let printer = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                println!(
                    "   {}/{} {:?}: ({:.2}, {:.2}, {:.2}) µm",
                    progress.visited,
                    progress.total,
                    progress.index,
                    progress.error.x * 1e6,
                    progress.error.y * 1e6,
                    progress.error.z * 1e6
                );
            }
        });

        let mut mapper = ErrorMapper::new(&self.tracker, config).with_progress(tx);
        if let Some(path) = self.settings.error_map_path() {
            mapper = mapper.with_output(path);
        }
        let dataset = mapper.run(&ctrl_c_cancellation()).await;
        drop(mapper);
        let _ = printer.await;

        let dataset = dataset?;
        if dataset.cancelled {
            println!("⚠️ Cancelled after {} points; nothing saved\n", dataset.visited);
        } else {
            println!("✅ Visited {} points in {:.1} s\n", dataset.visited, dataset.duration_secs);
        }
        println!("{}\n", ErrorMapAnalysis::new(&dataset));
        Ok(())
    }

    async fn drift(&self, seconds: u64) -> anyhow::Result<()> {
        println!("📈 Monitoring drift for {} s...", seconds);
        self.sim.camera.start();

        let (tx, mut rx) = mpsc::channel(16);
        let monitor = DriftMonitor::new(vec![self.tracker.clone()], self.settings.drift_config());
        let handle = monitor.run(tx);

        let printer = tokio::spawn(async move {
            let mut samples = 0;
            while let Some(sample) = rx.recv().await {
                for drift in &sample.drift {
                    println!("   {} drift {:.2} µm", sample.time.format("%H:%M:%S"), drift * 1e6);
                }
                samples += 1;
            }
            samples
        });

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        handle.stop().await;
        let samples = printer.await.unwrap_or(0);
        self.sim.camera.stop();

        if samples == 0 {
            println!("⚠️ No drift samples collected\n");
        } else {
            println!("✅ Drift monitor stopped after {} samples\n", samples);
        }
        Ok(())
    }
}

fn analyze(path: &Path) -> anyhow::Result<()> {
    let dataset = ErrorMapDataset::load(path)?;
    println!(
        "📊 Error map {} ({}, started {})",
        dataset.id,
        dataset.pipette,
        dataset.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("{}\n", ErrorMapAnalysis::new(&dataset));
    Ok(())
}

/// Cancellation token tripped by Ctrl+C.
fn ctrl_c_cancellation() -> Cancellation {
    let cancel = Cancellation::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trip.cancel();
        }
    });
    cancel
}
