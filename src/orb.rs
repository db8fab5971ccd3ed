use std::f32::consts::TAU;

use crate::protocol::UiState;

const IDLE_COLOR: Rgb = Rgb {
    r: 0.3686,
    g: 0.5294,
    b: 1.0,
};
const SEARCH_COLOR: Rgb = Rgb {
    r: 0.0,
    g: 1.0,
    b: 1.0,
};

/// Frame steps larger than this are clamped so a stalled terminal does not
/// jump the animation.
const MAX_FRAME_STEP: f32 = 0.1;
const AUTO_YAW_RATE: f32 = 0.0008;

const PULSE_PEAK: f32 = 0.15;
const PULSE_RISE: f32 = 0.2;
const PULSE_SETTLE: f32 = 0.5;
const PULSE_TOTAL: f32 = PULSE_RISE + PULSE_SETTLE;

const ANGLE_SAMPLES: usize = 720;
const VISIBILITY_FLOOR: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    fn lerp(self, other: Rgb, t: f32) -> Rgb {
        Rgb {
            r: self.r + (other.r - self.r) * t,
            g: self.g + (other.g - self.g) * t,
            b: self.b + (other.b - self.b) * t,
        }
    }

    fn scaled(self, factor: f32) -> Rgb {
        Rgb {
            r: self.r * factor,
            g: self.g * factor,
            b: self.b * factor,
        }
    }

    fn to_bytes(self) -> (u8, u8, u8) {
        (
            (self.r.clamp(0.0, 1.0) * 255.0) as u8,
            (self.g.clamp(0.0, 1.0) * 255.0) as u8,
            (self.b.clamp(0.0, 1.0) * 255.0) as u8,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrbTuning {
    /// Object-space radius the surface noise is sampled at.
    pub radius: f32,
    pub noise_frequency: f32,
    pub noise_strength: f32,
    pub fresnel_power: f32,
    pub camera_distance: f32,
    /// Fraction of the short canvas axis the orb fills at scale 1.
    pub fill: f32,
    pub bloom_strength: f32,
    pub bloom_threshold: f32,
    /// Blur radius of the bloom pass, in braille dots.
    pub bloom_radius: usize,
}

impl Default for OrbTuning {
    fn default() -> Self {
        Self {
            radius: 1.7,
            noise_frequency: 0.9,
            noise_strength: 0.18,
            fresnel_power: 3.0,
            camera_distance: 5.0,
            fill: 0.59,
            bloom_strength: 1.2,
            bloom_threshold: 0.08,
            bloom_radius: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Appearance {
    scale: f32,
    depth: f32,
    time_speed: f32,
    color: Rgb,
}

impl Appearance {
    fn idle() -> Self {
        Self {
            scale: 1.0,
            depth: 0.0,
            time_speed: 1.0,
            color: IDLE_COLOR,
        }
    }

    fn lerp(self, other: Appearance, t: f32) -> Appearance {
        Appearance {
            scale: self.scale + (other.scale - self.scale) * t,
            depth: self.depth + (other.depth - self.depth) * t,
            time_speed: self.time_speed + (other.time_speed - self.time_speed) * t,
            color: self.color.lerp(other.color, t),
        }
    }
}

/// Per-state animation targets. Fields a state leaves unset keep whatever
/// target the previous state was heading toward.
struct Retarget {
    scale: Option<f32>,
    depth: Option<f32>,
    time_speed: Option<f32>,
    color: Option<Rgb>,
    duration: f32,
}

fn retarget_for(state: UiState) -> Retarget {
    match state {
        UiState::Idle => Retarget {
            scale: Some(1.0),
            depth: Some(0.0),
            time_speed: Some(1.0),
            color: Some(IDLE_COLOR),
            duration: 1.0,
        },
        UiState::Listening => Retarget {
            scale: Some(1.1),
            depth: None,
            time_speed: Some(2.0),
            color: None,
            duration: 0.5,
        },
        UiState::Searching => Retarget {
            scale: None,
            depth: None,
            time_speed: Some(3.0),
            color: Some(SEARCH_COLOR),
            duration: 0.5,
        },
        UiState::Results => Retarget {
            scale: Some(0.5),
            depth: Some(-3.0),
            time_speed: Some(0.5),
            color: None,
            duration: 1.0,
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: Appearance,
    to: Appearance,
    elapsed: f32,
    duration: f32,
}

#[derive(Debug, Clone, Default)]
pub struct OrbFrame {
    pub width: u16,
    pub height: u16,
    pub layers: Vec<OrbLayer>,
}

#[derive(Debug, Clone)]
pub struct OrbLayer {
    pub color: (u8, u8, u8),
    pub coords: Vec<(f64, f64)>,
}

/// Animated orb: a noise-displaced disc with a bright rim and a bloom pass,
/// rasterized onto a braille dot grid.
pub struct OrbVisual {
    tuning: OrbTuning,
    state: UiState,
    current: Appearance,
    transition: Option<Transition>,
    pulse: Option<f32>,
    yaw: f32,
    pitch: f32,
    time: f32,
    cols: u16,
    rows: u16,
}

impl OrbVisual {
    pub fn new(tuning: OrbTuning) -> Self {
        Self {
            tuning,
            state: UiState::Idle,
            current: Appearance::idle(),
            transition: None,
            pulse: None,
            yaw: 0.0,
            pitch: 0.0,
            time: 0.0,
            cols: 0,
            rows: 0,
        }
    }

    pub fn set_state(&mut self, state: UiState) {
        if state == self.state {
            return;
        }
        self.state = state;
        let retarget = retarget_for(state);
        let from = self.current;
        let mut to = self.target();
        if let Some(scale) = retarget.scale {
            to.scale = scale;
        }
        if let Some(depth) = retarget.depth {
            to.depth = depth;
        }
        if let Some(time_speed) = retarget.time_speed {
            to.time_speed = time_speed;
        }
        if let Some(color) = retarget.color {
            to.color = color;
        }
        self.transition = Some(Transition {
            from,
            to,
            elapsed: 0.0,
            duration: retarget.duration,
        });
    }

    pub fn rotate_by(&mut self, yaw: f32, pitch: f32) {
        self.yaw += yaw;
        self.pitch += pitch;
    }

    pub fn pulse(&mut self) {
        self.pulse = Some(0.0);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    /// Advances the animation by `dt` seconds of wall time.
    pub fn update(&mut self, dt: f32, auto_rotate: bool) {
        let dt = dt.clamp(0.0, MAX_FRAME_STEP);
        if let Some(transition) = &mut self.transition {
            transition.elapsed += dt;
            let t = (transition.elapsed / transition.duration).min(1.0);
            if t >= 1.0 {
                self.current = transition.to;
                self.transition = None;
            } else {
                self.current = transition.from.lerp(transition.to, ease_out_cubic(t));
            }
        }
        if let Some(elapsed) = &mut self.pulse {
            *elapsed += dt;
            if *elapsed >= PULSE_TOTAL {
                self.pulse = None;
            }
        }
        self.time += dt * self.current.time_speed;
        if auto_rotate {
            self.yaw += AUTO_YAW_RATE * self.current.time_speed * dt * 60.0;
            self.pitch = (self.time * 0.15).sin() * 0.08;
        }
    }

    /// Whether a terminal cell within the canvas area lands on the orb.
    pub fn hit_test(&self, col: u16, row: u16) -> bool {
        let dots_w = self.cols as f32 * 2.0;
        let dots_h = self.rows as f32 * 4.0;
        if dots_w <= 0.0 || dots_h <= 0.0 {
            return false;
        }
        let x = col as f32 * 2.0 + 1.0 - dots_w / 2.0;
        let y = row as f32 * 4.0 + 2.0 - dots_h / 2.0;
        let reach = self.apparent_radius(dots_w, dots_h) * (1.0 + self.tuning.noise_strength);
        (x * x + y * y).sqrt() <= reach
    }

    /// Rasterizes the orb at the current size. Coordinates are braille dots
    /// with the origin at the bottom left, ready for a canvas widget.
    pub fn render(&self) -> OrbFrame {
        let dots_w = self.cols as usize * 2;
        let dots_h = self.rows as usize * 4;
        if dots_w == 0 || dots_h == 0 {
            return OrbFrame::default();
        }
        let radius = self.apparent_radius(dots_w as f32, dots_h as f32);
        if radius <= 0.5 {
            return OrbFrame {
                width: dots_w as u16,
                height: dots_h as u16,
                layers: Vec::new(),
            };
        }

        let profile = self.radius_profile(radius);
        let reach = radius * (1.0 + self.tuning.noise_strength);
        let cx = dots_w as f32 / 2.0;
        let cy = dots_h as f32 / 2.0;
        let mut field = vec![0.0f32; dots_w * dots_h];
        for row in 0..dots_h {
            let y = row as f32 + 0.5 - cy;
            if y.abs() > reach {
                continue;
            }
            for col in 0..dots_w {
                let x = col as f32 + 0.5 - cx;
                let dist = (x * x + y * y).sqrt();
                if dist > reach {
                    continue;
                }
                let theta = y.atan2(x).rem_euclid(TAU);
                let index = (theta / TAU * ANGLE_SAMPLES as f32) as usize % ANGLE_SAMPLES;
                let surface = profile[index];
                if dist <= surface {
                    let edge = (dist / surface).clamp(0.0, 1.0);
                    let fresnel = edge.powf(self.tuning.fresnel_power);
                    field[row * dots_w + col] =
                        fresnel * 1.1 + fresnel.powf(8.0) * 0.4 + (1.0 - fresnel) * 0.18;
                }
            }
        }
        let field = apply_bloom(field, dots_w, dots_h, &self.tuning);
        self.layered(&field, dots_w, dots_h)
    }

    fn target(&self) -> Appearance {
        self.transition.map(|t| t.to).unwrap_or(self.current)
    }

    fn pulse_scale(&self) -> f32 {
        self.pulse.map(pulse_factor).unwrap_or(1.0)
    }

    fn apparent_radius(&self, dots_w: f32, dots_h: f32) -> f32 {
        let half = dots_w.min(dots_h) / 2.0;
        let denom = (self.tuning.camera_distance - self.current.depth).max(0.1);
        let perspective = self.tuning.camera_distance / denom;
        half * self.tuning.fill * self.current.scale * self.pulse_scale() * perspective
    }

    /// Silhouette radius per angle. The view-space rim direction is rotated
    /// back into object space so dragging and auto-rotation swirl the noise.
    fn radius_profile(&self, radius: f32) -> Vec<f32> {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        (0..ANGLE_SAMPLES)
            .map(|k| {
                let theta = k as f32 / ANGLE_SAMPLES as f32 * TAU;
                let (sin_t, cos_t) = theta.sin_cos();
                let (vx, vy, vz) = (cos_t, sin_t, 0.0f32);
                let (vy, vz) = (vy * cos_pitch + vz * sin_pitch, vz * cos_pitch - vy * sin_pitch);
                let (vx, vz) = (vx * cos_yaw - vz * sin_yaw, vx * sin_yaw + vz * cos_yaw);
                let p = [
                    vx * self.tuning.radius,
                    vy * self.tuning.radius,
                    vz * self.tuning.radius,
                ];
                radius * (1.0 + self.surface_noise(p) * self.tuning.noise_strength)
            })
            .collect()
    }

    /// Three octaves of value noise, each remapped through smootherstep,
    /// weighted 0.5/0.3/0.2. Output stays within [-1, 1].
    fn surface_noise(&self, p: [f32; 3]) -> f32 {
        let f = self.tuning.noise_frequency;
        let t = self.time;
        let n1 = smootherstep(
            -1.0,
            1.0,
            value_noise(
                p[0] * f * 0.6 + t * 0.15,
                p[1] * f * 0.6 + t * 0.15,
                p[2] * f * 0.6 + t * 0.15,
            ),
        );
        let n2 = smootherstep(
            -1.0,
            1.0,
            value_noise(
                p[0] * f * 0.8 + t * 0.12,
                p[1] * f * 0.8 + t * 0.12,
                p[2] * f * 0.8 + t * 0.12,
            ),
        );
        let n3 = smootherstep(
            -1.0,
            1.0,
            value_noise(p[0] * f + t * 0.10, p[1] * f + t * 0.10, p[2] * f + t * 0.10),
        );
        (n1 * 0.5 + n2 * 0.3 + n3 * 0.2) * 2.0 - 1.0
    }

    fn layered(&self, field: &[f32], dots_w: usize, dots_h: usize) -> OrbFrame {
        const SHADES: [f32; 4] = [0.35, 0.55, 0.8, 1.0];
        let mut layers: Vec<OrbLayer> = SHADES
            .iter()
            .map(|shade| OrbLayer {
                color: self.current.color.scaled(*shade).to_bytes(),
                coords: Vec::new(),
            })
            .collect();
        for row in 0..dots_h {
            for col in 0..dots_w {
                let value = field[row * dots_w + col];
                if value < VISIBILITY_FLOOR {
                    continue;
                }
                let x = col as f64 + 0.5;
                let y = dots_h as f64 - row as f64 - 0.5;
                layers[shade_bucket(value)].coords.push((x, y));
            }
        }
        layers.retain(|layer| !layer.coords.is_empty());
        OrbFrame {
            width: dots_w as u16,
            height: dots_h as u16,
            layers,
        }
    }
}

fn shade_bucket(value: f32) -> usize {
    if value >= 1.0 {
        3
    } else if value >= 0.66 {
        2
    } else if value >= 0.33 {
        1
    } else {
        0
    }
}

fn ease_out_cubic(t: f32) -> f32 {
    let inv = 1.0 - t;
    1.0 - inv * inv * inv
}

fn smootherstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

/// Click feedback: a quick swell to 1.15x that settles back with a damped
/// wobble. Returns the scale multiplier at `elapsed` seconds.
fn pulse_factor(elapsed: f32) -> f32 {
    if elapsed < PULSE_RISE {
        1.0 + PULSE_PEAK * ease_out_cubic(elapsed / PULSE_RISE)
    } else {
        let s = ((elapsed - PULSE_RISE) / PULSE_SETTLE).min(1.0);
        let wave = (s * TAU * 1.5).cos();
        1.0 + PULSE_PEAK * (1.0 - s) * (1.0 - s) * wave
    }
}

fn lattice(x: i32, y: i32, z: i32) -> f32 {
    let mut h = x
        .wrapping_mul(374_761_393)
        ^ y.wrapping_mul(668_265_263)
        ^ z.wrapping_mul(-1_640_531_535);
    h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    h ^= h >> 16;
    h as f32 / i32::MAX as f32
}

fn value_noise(x: f32, y: f32, z: f32) -> f32 {
    let (x0, y0, z0) = (x.floor(), y.floor(), z.floor());
    let (ix, iy, iz) = (x0 as i32, y0 as i32, z0 as i32);
    let fx = smootherstep(0.0, 1.0, x - x0);
    let fy = smootherstep(0.0, 1.0, y - y0);
    let fz = smootherstep(0.0, 1.0, z - z0);

    let mut corners = [0.0f32; 8];
    for (index, corner) in corners.iter_mut().enumerate() {
        let dx = (index & 1) as i32;
        let dy = ((index >> 1) & 1) as i32;
        let dz = ((index >> 2) & 1) as i32;
        *corner = lattice(ix + dx, iy + dy, iz + dz);
    }
    let front = bilerp(corners[0], corners[1], corners[2], corners[3], fx, fy);
    let back = bilerp(corners[4], corners[5], corners[6], corners[7], fx, fy);
    front + (back - front) * fz
}

fn bilerp(c00: f32, c10: f32, c01: f32, c11: f32, fx: f32, fy: f32) -> f32 {
    let bottom = c00 + (c10 - c00) * fx;
    let top = c01 + (c11 - c01) * fx;
    bottom + (top - bottom) * fy
}

fn apply_bloom(field: Vec<f32>, width: usize, height: usize, tuning: &OrbTuning) -> Vec<f32> {
    if tuning.bloom_radius == 0 || tuning.bloom_strength <= 0.0 {
        return field;
    }
    let bright: Vec<f32> = field
        .iter()
        .map(|value| (value - tuning.bloom_threshold).max(0.0))
        .collect();
    let blurred = blur_pass(&bright, width, height, tuning.bloom_radius, true);
    let blurred = blur_pass(&blurred, width, height, tuning.bloom_radius, false);
    field
        .iter()
        .zip(blurred.iter())
        .map(|(base, glow)| base + glow * tuning.bloom_strength)
        .collect()
}

fn blur_pass(src: &[f32], width: usize, height: usize, radius: usize, horizontal: bool) -> Vec<f32> {
    let mut out = vec![0.0f32; src.len()];
    let span = (radius * 2 + 1) as f32;
    for row in 0..height {
        for col in 0..width {
            let mut total = 0.0;
            for offset in -(radius as isize)..=(radius as isize) {
                let (c, r) = if horizontal {
                    (col as isize + offset, row as isize)
                } else {
                    (col as isize, row as isize + offset)
                };
                if c >= 0 && (c as usize) < width && r >= 0 && (r as usize) < height {
                    total += src[r as usize * width + c as usize];
                }
            }
            out[row * width + col] = total / span;
        }
    }
    out
}
