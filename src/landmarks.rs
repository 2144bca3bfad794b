//! Face-mesh geometry
//!
//! Per-frame measurements derived from landmark positions: eye and mouth
//! aspect ratios, gaze displacement, hand-to-face contact and the cheek
//! color sample that feeds the heart-rate estimator.

use crate::types::{FaceLandmarks, Frame, HandLandmarks, Landmark};

/// Face-oval contour, closed (first index repeated at the end)
pub const FACE_OVAL: [usize; 37] = [
    10, 338, 297, 332, 284, 251, 389, 356, 454, 323, 361, 288, 397, 365, 379, 378, 400, 377, 152,
    148, 176, 149, 150, 136, 172, 58, 132, 93, 234, 127, 162, 21, 54, 103, 67, 109, 10,
];

/// Eye contours as (top, bottom, inner corner, outer corner)
pub const RIGHT_EYE: [usize; 4] = [159, 145, 133, 33];
pub const LEFT_EYE: [usize; 4] = [386, 374, 362, 263];

/// Iris edge points and eye corners used for gaze: (iris a, iris b, corner a, corner b)
pub const RIGHT_GAZE: [usize; 4] = [471, 469, 33, 133];
pub const LEFT_GAZE: [usize; 4] = [476, 474, 263, 362];

/// Mouth as (upper lip, lower lip, left corner, right corner)
pub const MOUTH: [usize; 4] = [0, 17, 61, 291];

/// Cheek quadrilaterals as (top-left, top-right, bottom-right, bottom-left)
pub const LEFT_CHEEK: [usize; 4] = [449, 350, 429, 280];
pub const RIGHT_CHEEK: [usize; 4] = [121, 229, 50, 209];

/// Hand landmark indices of the thumb, index and pinky fingertips
pub const FINGERTIPS: [usize; 3] = [4, 8, 20];

fn points<const N: usize>(face: &FaceLandmarks, indices: [usize; N]) -> Option<[Landmark; N]> {
    let mut out = [Landmark::default(); N];
    for (slot, index) in out.iter_mut().zip(indices) {
        *slot = *face.point(index)?;
    }
    Some(out)
}

/// Vertical over horizontal distance; `None` for a degenerate width
pub fn aspect_ratio(top: &Landmark, bottom: &Landmark, right: &Landmark, left: &Landmark) -> Option<f64> {
    let width = right.distance(left);
    if width <= f64::EPSILON {
        return None;
    }
    Some(top.distance(bottom) / width)
}

/// Mean eye aspect ratio of both eyes
pub fn eye_aspect_ratio(face: &FaceLandmarks) -> Option<f64> {
    let [rt, rb, rr, rl] = points(face, RIGHT_EYE)?;
    let [lt, lb, lr, ll] = points(face, LEFT_EYE)?;
    let right = aspect_ratio(&rt, &rb, &rr, &rl)?;
    let left = aspect_ratio(&lt, &lb, &lr, &ll)?;
    Some((right + left) / 2.0)
}

pub fn lip_ratio(face: &FaceLandmarks) -> Option<f64> {
    let [top, bottom, left, right] = points(face, MOUTH)?;
    aspect_ratio(&top, &bottom, &right, &left)
}

/// Signed iris displacement from the eye center, normalized by eye width.
/// Negative when the iris sits to the right of the eye center.
fn eye_gaze(face: &FaceLandmarks, indices: [usize; 4]) -> Option<f64> {
    let [iris_a, iris_b, corner_a, corner_b] = points(face, indices)?;
    let iris = Landmark::new((iris_a.x + iris_b.x) / 2.0, (iris_a.y + iris_b.y) / 2.0);
    let center = Landmark::new((corner_a.x + corner_b.x) / 2.0, (corner_a.y + corner_b.y) / 2.0);
    let eye_width = (corner_b.x - corner_a.x).abs();
    if eye_width <= f64::EPSILON {
        return None;
    }
    let relative = iris.distance(&center) / eye_width;
    if center.x - iris.x < 0.0 {
        Some(-relative)
    } else {
        Some(relative)
    }
}

/// Mean gaze of both eyes; requires iris-refined landmarks
pub fn gaze(face: &FaceLandmarks) -> Option<f64> {
    if !face.has_iris() {
        return None;
    }
    let left = eye_gaze(face, LEFT_GAZE)?;
    let right = eye_gaze(face, RIGHT_GAZE)?;
    Some((left + right) / 2.0)
}

/// Crossing-number test; points on an edge count as inside
pub fn point_in_polygon(point: &Landmark, polygon: &[Landmark]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (&polygon[i], &polygon[j]);
        if on_segment(point, a, b) {
            return true;
        }
        if (a.y > point.y) != (b.y > point.y) {
            let cross_x = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
            if point.x < cross_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: &Landmark, a: &Landmark, b: &Landmark) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > 1e-12 {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Any thumb, index or pinky fingertip inside the face oval
pub fn hand_on_face(face: &FaceLandmarks, hands: &[HandLandmarks]) -> bool {
    let Some(oval) = points(face, FACE_OVAL) else {
        return false;
    };
    hands
        .iter()
        .filter(|hand| hand.is_complete())
        .flat_map(|hand| FINGERTIPS.iter().filter_map(|&i| hand.points.get(i)))
        .any(|tip| point_in_polygon(tip, &oval))
}

/// Mean green intensity inside the axis-aligned box spanned by a cheek quad
fn region_green(frame: &Frame, quad: &[Landmark; 4]) -> Option<f64> {
    let [top_left, top_right, bottom_right, bottom_left] = quad;
    let w = frame.width as f64;
    let h = frame.height as f64;

    let top = ((top_left.y + top_right.y) / 2.0 * h) as i64;
    let bottom = ((bottom_left.y + bottom_right.y) / 2.0 * h) as i64;
    let side_a = ((top_left.x + bottom_left.x) / 2.0 * w) as i64;
    let side_b = ((top_right.x + bottom_right.x) / 2.0 * w) as i64;

    let clamp_x = |v: i64| v.clamp(0, frame.width as i64) as u32;
    let clamp_y = |v: i64| v.clamp(0, frame.height as i64) as u32;
    let (x0, x1) = (clamp_x(side_a.min(side_b)), clamp_x(side_a.max(side_b)));
    let (y0, y1) = (clamp_y(top.min(bottom)), clamp_y(top.max(bottom)));

    let mut sum = 0.0;
    let mut count = 0usize;
    for y in y0..y1 {
        for x in x0..x1 {
            if let Some([_, g, _]) = frame.pixel(x, y) {
                sum += g as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return None;
    }
    Some(sum / count as f64)
}

/// Heart-rate input sample: mean green intensity of both cheeks.
/// `None` when either cheek crop has zero area.
pub fn cheek_signal(frame: &Frame, face: &FaceLandmarks) -> Option<f64> {
    let left = region_green(frame, &points(face, LEFT_CHEEK)?)?;
    let right = region_green(frame, &points(face, RIGHT_CHEEK)?)?;
    Some((left + right) / 2.0)
}
