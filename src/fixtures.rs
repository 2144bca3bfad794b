//! Synthetic landmark builders shared by the unit tests

use crate::landmarks::{FACE_OVAL, FINGERTIPS, LEFT_CHEEK, RIGHT_CHEEK};
use crate::types::{
    FaceLandmarks, Frame, HandLandmarks, Landmark, FACE_LANDMARK_COUNT_WITH_IRIS,
    HAND_LANDMARK_COUNT,
};

/// A frontal face: open eyes (EAR 0.25), relaxed lips (0.4), centered irises
pub fn face() -> FaceLandmarks {
    let mut points = vec![Landmark::new(0.5, 0.5); FACE_LANDMARK_COUNT_WITH_IRIS];

    let ring = FACE_OVAL.len() - 1;
    for (n, &i) in FACE_OVAL.iter().take(ring).enumerate() {
        let angle = n as f64 / ring as f64 * std::f64::consts::TAU;
        points[i] = Landmark::new(0.5 + 0.3 * angle.cos(), 0.5 + 0.3 * angle.sin());
    }

    // right eye: top, bottom, inner, outer
    points[159] = Landmark::new(0.40, 0.44);
    points[145] = Landmark::new(0.40, 0.46);
    points[133] = Landmark::new(0.44, 0.45);
    points[33] = Landmark::new(0.36, 0.45);
    // left eye
    points[386] = Landmark::new(0.60, 0.44);
    points[374] = Landmark::new(0.60, 0.46);
    points[362] = Landmark::new(0.56, 0.45);
    points[263] = Landmark::new(0.64, 0.45);
    // irises
    points[471] = Landmark::new(0.39, 0.45);
    points[469] = Landmark::new(0.41, 0.45);
    points[476] = Landmark::new(0.59, 0.45);
    points[474] = Landmark::new(0.61, 0.45);
    // mouth
    points[0] = Landmark::new(0.50, 0.60);
    points[17] = Landmark::new(0.50, 0.64);
    points[61] = Landmark::new(0.45, 0.62);
    points[291] = Landmark::new(0.55, 0.62);

    let left_cheek = [(0.62, 0.50), (0.56, 0.50), (0.56, 0.56), (0.62, 0.56)];
    for (&i, (x, y)) in LEFT_CHEEK.iter().zip(left_cheek) {
        points[i] = Landmark::new(x, y);
    }
    let right_cheek = [(0.38, 0.50), (0.44, 0.50), (0.44, 0.56), (0.38, 0.56)];
    for (&i, (x, y)) in RIGHT_CHEEK.iter().zip(right_cheek) {
        points[i] = Landmark::new(x, y);
    }

    FaceLandmarks { points }
}

pub fn face_with(edit: impl FnOnce(&mut FaceLandmarks)) -> FaceLandmarks {
    let mut f = face();
    edit(&mut f);
    f
}

pub fn close_eyes(face: &mut FaceLandmarks) {
    face.points[159].y = 0.449;
    face.points[145].y = 0.451;
    face.points[386].y = 0.449;
    face.points[374].y = 0.451;
}

pub fn press_lips(face: &mut FaceLandmarks) {
    face.points[17].y = 0.62;
}

pub fn shift_irises(face: &mut FaceLandmarks, dx: f64) {
    for i in [471, 469, 476, 474] {
        face.points[i].x += dx;
    }
}

pub fn hand_away() -> HandLandmarks {
    HandLandmarks {
        points: vec![Landmark::new(0.05, 0.05); HAND_LANDMARK_COUNT],
    }
}

pub fn hand_on_face() -> HandLandmarks {
    let mut hand = hand_away();
    hand.points[FINGERTIPS[1]] = Landmark::new(0.5, 0.5);
    hand
}

/// Uniform frame with the given green level
pub fn frame(width: u32, height: u32, green: u8) -> Frame {
    let pixels = (0..width * height).flat_map(|_| [40, green, 60]).collect();
    Frame {
        width,
        height,
        pixels,
    }
}
