//! Synthetic maps and scans with known ground truth.
//!
//! Map generators add a sub-millimeter deterministic jitter, the way surveyed
//! maps never sit on exact planes. Exactly planar input is covered by the
//! grid and search tests.

use crate::optimization::Pose4;

/// Deterministic pseudo-random source (64-bit LCG).
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Uniform in `[0, 1)`.
    fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 40) as f32) / ((1u64 << 24) as f32)
    }

    /// Uniform in `[-amplitude, amplitude)`.
    fn jitter(&mut self, amplitude: f32) -> f32 {
        (self.next_f32() * 2.0 - 1.0) * amplitude
    }
}

const JITTER: f32 = 5e-4;

fn steps(length: f32, interval: f32) -> usize {
    ((length / interval).round() as usize) + 1
}

/// Rectangular room with a square pillar, floor at `z = 0`.
///
/// Walls at `x = ±length/2`, `y = ±width/2`, ceiling at `z = height`. The
/// pillar (0.6 m square, full height) stands at `(length/4, -width/4)` so the
/// room has no rotational or mirror symmetry.
pub fn make_room_pcd(length: f32, width: f32, height: f32, interval: f32) -> Vec<[f32; 3]> {
    let mut rng = Lcg::new(0x5eed);
    let mut points = Vec::new();
    let (hx, hy) = (length / 2.0, width / 2.0);
    let mut push = |p: [f32; 3], rng: &mut Lcg| {
        points.push([
            p[0] + rng.jitter(JITTER),
            p[1] + rng.jitter(JITTER),
            p[2] + rng.jitter(JITTER),
        ]);
    };

    let nx = steps(length, interval);
    let ny = steps(width, interval);
    let nz = steps(height, interval);

    // Floor and ceiling.
    for i in 0..nx {
        for j in 0..ny {
            let x = -hx + i as f32 * interval;
            let y = -hy + j as f32 * interval;
            push([x, y, 0.0], &mut rng);
            push([x, y, height], &mut rng);
        }
    }

    // Walls, skipping the floor and ceiling rows.
    for k in 1..nz - 1 {
        let z = k as f32 * interval;
        for j in 0..ny {
            let y = -hy + j as f32 * interval;
            push([-hx, y, z], &mut rng);
            push([hx, y, z], &mut rng);
        }
        for i in 1..nx - 1 {
            let x = -hx + i as f32 * interval;
            push([x, -hy, z], &mut rng);
            push([x, hy, z], &mut rng);
        }
    }

    // Pillar faces.
    let (cx, cy, half) = (length / 4.0, -width / 4.0, 0.3);
    let np = steps(2.0 * half, interval);
    for k in 1..nz - 1 {
        let z = k as f32 * interval;
        for s in 0..np {
            let t = -half + s as f32 * interval;
            push([cx - half, cy + t, z], &mut rng);
            push([cx + half, cy + t, z], &mut rng);
            if s > 0 && s + 1 < np {
                push([cx + t, cy - half, z], &mut rng);
                push([cx + t, cy + half, z], &mut rng);
            }
        }
    }

    points
}

/// Express map points in the base frame of a platform at `ground_truth`.
///
/// Takes every `stride`-th map point and keeps those whose squared range
/// from the platform lies strictly inside `(min_sq, max_sq)`. Feeding the
/// result to an aligner should recover `ground_truth`.
pub fn sample_scan(
    map: &[[f32; 3]],
    ground_truth: &Pose4,
    stride: usize,
    min_sq: f64,
    max_sq: f64,
) -> Vec<[f32; 3]> {
    let (sy, cy) = ground_truth.yaw.sin_cos();
    map.iter()
        .step_by(stride.max(1))
        .filter_map(|p| {
            let dx = p[0] as f64 - ground_truth.x;
            let dy = p[1] as f64 - ground_truth.y;
            let dz = p[2] as f64 - ground_truth.z;
            let range_sq = dx * dx + dy * dy + dz * dz;
            if range_sq <= min_sq || range_sq >= max_sq {
                return None;
            }
            // Inverse yaw rotation.
            Some([
                (cy * dx + sy * dy) as f32,
                (-sy * dx + cy * dy) as f32,
                dz as f32,
            ])
        })
        .collect()
}
