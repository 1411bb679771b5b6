//! Simulated rig: a camera, a pipette manipulator and a stage sharing one
//! physical world.
//!
//! The camera renders a synthetic pipette tip whose blur and halo depend on
//! the distance between the tip and the focal plane. The pipette keeps a
//! reported (possibly miscalibrated) transform separate from the true one,
//! so calibration and error mapping can be exercised without hardware.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use image::Luma;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{Affine3, Point3, Translation3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::{
    CenterReference, DeviceError, DeviceFuture, Imager, MoveFuture, Pipette, Rig, Speed, Stage,
};
use crate::imaging::{ConfigKey, Frame, FrameImage};

/// Half-angle of the rendered tip.
const TIP_HALF_ANGLE: f64 = 10.0 * PI / 180.0;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    /// Pixel size in metres.
    pub pixel_size: f64,
    /// Length of the visible tip silhouette in metres.
    pub tip_length: f64,
    pub yaw: f64,
    pub background: f32,
    pub contrast: f32,
    /// Standard deviation of additive pixel noise.
    pub noise: f32,
    pub move_duration: Duration,
    pub exposure: Duration,
    pub frame_interval: Duration,
    pub config_key: String,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            pixel_size: 1e-6,
            tip_length: 40e-6,
            yaw: 0.0,
            background: 100.0,
            contrast: 60.0,
            noise: 0.5,
            move_duration: Duration::from_millis(4),
            exposure: Duration::from_millis(1),
            frame_interval: Duration::from_millis(20),
            config_key: "SimCamera/10x/no-filter".to_string(),
            seed: 7,
        }
    }
}

impl SimConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_yaw(mut self, yaw: f64) -> Self {
        self.yaw = yaw;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = key.into();
        self
    }
}

struct World {
    /// Pipette position in its local (motor) frame.
    motor: Point3<f64>,
    /// Transform reported to clients.
    believed: Affine3<f64>,
    /// Physical truth.
    actual: Affine3<f64>,
    /// Stage center (x, y) and focus depth (z).
    stage: Point3<f64>,
    pending_misses: usize,
    transform_updates: usize,
    rng: StdRng,
}

type SharedWorld = Arc<Mutex<World>>;

fn lock(world: &SharedWorld) -> MutexGuard<'_, World> {
    world.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to all simulated devices.
#[derive(Clone)]
pub struct SimRig {
    pub camera: Arc<SimCamera>,
    pub pipette: Arc<SimPipette>,
    pub stage: Arc<SimStage>,
    world: SharedWorld,
}

impl SimRig {
    /// Pipette tip and focal plane start at the global origin, calibrated.
    pub fn new(config: SimConfig) -> Self {
        let config = Arc::new(config);
        let world = Arc::new(Mutex::new(World {
            motor: Point3::origin(),
            believed: Affine3::identity(),
            actual: Affine3::identity(),
            stage: Point3::origin(),
            pending_misses: 0,
            transform_updates: 0,
            rng: StdRng::seed_from_u64(config.seed),
        }));
        let (frames, _) = watch::channel(None);

        Self {
            camera: Arc::new(SimCamera {
                world: world.clone(),
                config: config.clone(),
                frames: Arc::new(frames),
                streaming: Mutex::new(None),
            }),
            pipette: Arc::new(SimPipette {
                world: world.clone(),
                config: config.clone(),
                current: Mutex::new(None),
            }),
            stage: Arc::new(SimStage {
                world: world.clone(),
                config,
                current: Mutex::new(None),
            }),
            world,
        }
    }

    pub fn rig(&self) -> Rig {
        Rig::new(self.camera.clone(), self.pipette.clone(), self.stage.clone())
    }

    /// Physical tip position.
    pub fn true_tip_position(&self) -> Point3<f64> {
        let w = lock(&self.world);
        w.actual.transform_point(&w.motor)
    }

    /// Make the reported tip position differ from the true one by `-error`.
    pub fn miscalibrate(&self, error: Vector3<f64>) {
        let mut w = lock(&self.world);
        w.believed = Translation3::from(-error) * w.actual;
    }

    /// Physically shift the pipette by `offset` without updating its reported transform.
    pub fn drift(&self, offset: Vector3<f64>) {
        let mut w = lock(&self.world);
        w.actual = Translation3::from(offset) * w.actual;
    }

    /// Fail the next `count` pipette moves, leaving the tip slightly off target.
    pub fn inject_misses(&self, count: usize) {
        lock(&self.world).pending_misses = count;
    }

    /// Number of `set_transform` calls so far.
    pub fn transform_updates(&self) -> usize {
        lock(&self.world).transform_updates
    }

    pub fn focus_depth(&self) -> f64 {
        lock(&self.world).stage.z
    }
}

/// Replace the in-flight move of one device.
fn replace_move(slot: &Mutex<Option<AbortHandle>>, fut: &MoveFuture) {
    let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = current.replace(fut.abort_handle()) {
        previous.abort();
    }
}

/// Simulated camera.
pub struct SimCamera {
    world: SharedWorld,
    config: Arc<SimConfig>,
    frames: Arc<watch::Sender<Option<Frame>>>,
    streaming: Mutex<Option<AbortHandle>>,
}

impl SimCamera {
    fn render(world: &SharedWorld, config: &SimConfig) -> Option<Frame> {
        let mut w = lock(world);
        let tip = w.actual.transform_point(&w.motor);
        let stage = w.stage;
        let noise = Normal::new(0.0, config.noise.max(0.0) as f64).ok();
        let image = render_tip_image(config, &stage, &tip, noise.as_ref(), &mut w.rng);
        drop(w);

        let ps = config.pixel_size;
        let origin = Vector2::new(
            stage.x - config.width as f64 / 2.0 * ps,
            stage.y - config.height as f64 / 2.0 * ps,
        );
        Frame::axis_aligned(image, origin, Vector2::new(ps, ps), stage.z).ok()
    }
}

/// Render the synthetic scene as seen with the stage at `stage`.
fn render_tip_image(
    config: &SimConfig,
    stage: &Point3<f64>,
    tip: &Point3<f64>,
    noise: Option<&Normal<f64>>,
    rng: &mut StdRng,
) -> FrameImage {
    let (width, height) = (config.width, config.height);
    let ps = config.pixel_size;
    let apex = Vector2::new(
        (tip.x - stage.x) / ps + width as f64 / 2.0,
        (tip.y - stage.y) / ps + height as f64 / 2.0,
    );
    let length = config.tip_length / ps;
    let back1 = apex
        - length * Vector2::new((config.yaw + TIP_HALF_ANGLE).cos(), (config.yaw + TIP_HALF_ANGLE).sin());
    let back2 = apex
        - length * Vector2::new((config.yaw - TIP_HALF_ANGLE).cos(), (config.yaw - TIP_HALF_ANGLE).sin());

    // Supersampled coverage of the tip silhouette.
    let mask = FrameImage::from_fn(width, height, |x, y| {
        let mut covered = 0.0;
        for (sx, sy) in [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)] {
            let p = Vector2::new(x as f64 + sx, y as f64 + sy);
            if inside_triangle(&p, &apex, &back1, &back2) {
                covered += 0.25;
            }
        }
        Luma([covered])
    });

    let dz_um = (tip.z - stage.z) / 1e-6;
    let sigma = (0.7 + 0.35 * dz_um.abs()) as f32;
    let halo = (dz_um / 8.0).clamp(-0.6, 0.6) as f32;
    let core = gaussian_blur_f32(&mask, sigma);
    let wide = gaussian_blur_f32(&mask, sigma * 2.5);

    FrameImage::from_fn(width, height, |x, y| {
        let pattern = 3.0 * (x as f32 / 9.0).sin() * (y as f32 / 13.0).cos();
        let signal = core.get_pixel(x, y)[0] - halo * wide.get_pixel(x, y)[0];
        let n = noise.map(|d| d.sample(rng) as f32).unwrap_or(0.0);
        Luma([config.background + pattern - config.contrast * signal + n])
    })
}

fn inside_triangle(p: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>, c: &Vector2<f64>) -> bool {
    let cross = |o: &Vector2<f64>, u: &Vector2<f64>, v: &Vector2<f64>| {
        (u.x - o.x) * (v.y - o.y) - (u.y - o.y) * (v.x - o.x)
    };
    let d1 = cross(a, b, p);
    let d2 = cross(b, c, p);
    let d3 = cross(c, a, p);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

impl Imager for SimCamera {
    fn name(&self) -> &str {
        "Camera"
    }

    fn acquire_frames(&self, n: usize) -> DeviceFuture<Vec<Frame>> {
        let world = self.world.clone();
        let config = self.config.clone();
        let frames = self.frames.clone();
        DeviceFuture::spawn(self.name(), move |progress| async move {
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                tokio::time::sleep(config.exposure).await;
                let frame = SimCamera::render(&world, &config).ok_or_else(|| DeviceError::Acquisition {
                    device: "Camera".to_string(),
                    reason: "invalid frame geometry".to_string(),
                })?;
                frames.send_replace(Some(frame.clone()));
                out.push(frame);
                progress.set((i + 1) as f64 / n as f64);
            }
            Ok(out)
        })
    }

    fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.frames.subscribe()
    }

    fn is_running(&self) -> bool {
        self.streaming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn start(&self) {
        if self.is_running() {
            return;
        }
        let world = self.world.clone();
        let config = self.config.clone();
        let frames = self.frames.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.frame_interval).await;
                if let Some(frame) = SimCamera::render(&world, &config) {
                    frames.send_replace(Some(frame));
                }
            }
        });
        *self.streaming.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.abort_handle());
    }

    fn stop(&self) {
        if let Some(handle) = self.streaming.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn device_state_key(&self) -> ConfigKey {
        ConfigKey::new(self.config.config_key.clone())
    }
}

/// Simulated pipette manipulator.
pub struct SimPipette {
    world: SharedWorld,
    config: Arc<SimConfig>,
    current: Mutex<Option<AbortHandle>>,
}

impl SimPipette {
    fn move_motor(&self, target: Point3<f64>) -> MoveFuture {
        let world = self.world.clone();
        let duration = self.config.move_duration;
        let device = self.name().to_string();
        let fut = DeviceFuture::spawn(self.name(), move |progress| async move {
            let (start, miss) = {
                let mut w = lock(&world);
                let miss = w.pending_misses > 0;
                if miss {
                    w.pending_misses -= 1;
                }
                (w.motor, miss)
            };
            let steps = 4;
            for i in 1..=steps {
                tokio::time::sleep(duration / steps).await;
                let f = i as f64 / steps as f64;
                lock(&world).motor = start + (target - start) * f;
                progress.set(f);
            }
            if miss {
                lock(&world).motor = target + Vector3::new(2e-6, -1e-6, 0.0);
                return Err(DeviceError::MoveFailed {
                    device,
                    reason: "position error exceeds tolerance".to_string(),
                });
            }
            Ok(())
        });
        replace_move(&self.current, &fut);
        fut
    }
}

impl Pipette for SimPipette {
    fn name(&self) -> &str {
        "Pipette1"
    }

    fn global_position(&self) -> Point3<f64> {
        let w = lock(&self.world);
        w.believed.transform_point(&w.motor)
    }

    fn yaw_radians(&self) -> f64 {
        self.config.yaw
    }

    fn move_to_global(&self, pos: Point3<f64>, _speed: Speed) -> MoveFuture {
        let target = lock(&self.world)
            .believed
            .try_inverse()
            .map(|inv| inv.transform_point(&pos));
        match target {
            Some(target) => self.move_motor(target),
            None => DeviceFuture::ready(
                self.name(),
                Err(DeviceError::MoveFailed {
                    device: self.name().to_string(),
                    reason: "transform is not invertible".to_string(),
                }),
            ),
        }
    }

    fn move_to_local(&self, offset: Vector3<f64>, _speed: Speed) -> MoveFuture {
        let target = lock(&self.world).motor + offset;
        self.move_motor(target)
    }

    fn transform(&self) -> Affine3<f64> {
        lock(&self.world).believed
    }

    fn set_transform(&self, transform: Affine3<f64>) {
        let mut w = lock(&self.world);
        w.believed = transform;
        w.transform_updates += 1;
    }
}

/// Simulated stage with focus drive.
pub struct SimStage {
    world: SharedWorld,
    config: Arc<SimConfig>,
    current: Mutex<Option<AbortHandle>>,
}

impl SimStage {
    fn move_stage(&self, target: Point3<f64>) -> MoveFuture {
        let world = self.world.clone();
        let duration = self.config.move_duration;
        let fut = DeviceFuture::spawn(self.name(), move |progress| async move {
            let start = lock(&world).stage;
            let steps = 4;
            for i in 1..=steps {
                tokio::time::sleep(duration / steps).await;
                let f = i as f64 / steps as f64;
                lock(&world).stage = start + (target - start) * f;
                progress.set(f);
            }
            Ok(())
        });
        replace_move(&self.current, &fut);
        fut
    }
}

impl Stage for SimStage {
    fn name(&self) -> &str {
        "Microscope"
    }

    fn global_center_position(&self, _reference: CenterReference) -> Point3<f64> {
        lock(&self.world).stage
    }

    fn focus_depth(&self) -> f64 {
        lock(&self.world).stage.z
    }

    fn move_center_to_global(
        &self,
        pos: Point3<f64>,
        _speed: Speed,
        _reference: CenterReference,
    ) -> MoveFuture {
        self.move_stage(pos)
    }

    fn set_focus_depth(&self, z: f64, _speed: Speed) -> MoveFuture {
        let mut target = lock(&self.world).stage;
        target.z = z;
        self.move_stage(target)
    }
}
