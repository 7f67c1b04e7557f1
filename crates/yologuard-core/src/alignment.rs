//! Face normalization to the 112×112 recognizer input.
//!
//! Crops with landmarks are warped with a 4-DOF similarity transform onto the
//! InsightFace reference points. Crops without landmarks (e.g. from a person
//! detector) are resized to the square input directly.

use crate::frame::FaceCrop;

/// Side length of the normalized face.
pub const ALIGNED_SIZE: usize = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` points onto `dst` points.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
        // Normal equations for unknowns [a, b, tx, ty]; each point pair adds
        //   [sx, -sy, 1, 0] · u = dx
        //   [sy,  sx, 0, 1] · u = dy
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve_linear_4(ata, atb) {
            Some([a, b, tx, ty]) => Similarity { a, b, tx, ty },
            None => Similarity {
                a: 1.0,
                b: 0.0,
                tx: 0.0,
                ty: 0.0,
            },
        }
    }

    /// Inverse-map an output pixel back to source coordinates.
    fn inverse_apply(&self, ox: f32, oy: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let dx = ox - self.tx;
        let dy = oy - self.ty;
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting. `None` for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve_linear_4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample with black outside the image.
fn sample(data: &[u8], width: usize, height: usize, sx: f32, sy: f32) -> f32 {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> f32 {
        if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
            data[y as usize * width + x as usize] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

fn warp(crop: &FaceCrop, transform: &Similarity) -> Vec<u8> {
    let (w, h) = (crop.width as usize, crop.height as usize);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            if let Some((sx, sy)) = transform.inverse_apply(ox as f32, oy as f32) {
                out[oy * ALIGNED_SIZE + ox] =
                    sample(&crop.data, w, h, sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Stretch the whole crop onto the square output.
fn resize_square(crop: &FaceCrop) -> Vec<u8> {
    let (w, h) = (crop.width as usize, crop.height as usize);
    let sx = w as f32 / ALIGNED_SIZE as f32;
    let sy = h as f32 / ALIGNED_SIZE as f32;
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    for oy in 0..ALIGNED_SIZE {
        let src_y = ((oy as f32 + 0.5) * sy - 0.5).clamp(0.0, (h - 1) as f32);
        for ox in 0..ALIGNED_SIZE {
            let src_x = ((ox as f32 + 0.5) * sx - 0.5).clamp(0.0, (w - 1) as f32);
            out[oy * ALIGNED_SIZE + ox] =
                sample(&crop.data, w, h, src_x, src_y).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Produce a 112×112 grayscale face ready for embedding extraction.
pub fn normalize_face(crop: &FaceCrop) -> Vec<u8> {
    if crop.width == 0 || crop.height == 0 {
        return vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    }
    match &crop.landmarks {
        Some(landmarks) => {
            let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS_112);
            warp(crop, &transform)
        }
        None => resize_square(crop),
    }
}
