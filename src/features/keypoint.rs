/// A detected image feature.
///
/// `angle` is the keypoint orientation in degrees, `octave` the pyramid level
/// it was detected at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub octave: i32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, angle: f32, octave: i32) -> Self {
        Self { x, y, angle, octave }
    }
}
