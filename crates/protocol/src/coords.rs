use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse `wm size` style dimensions ("1080x2340").
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once('x')?;
        let width = w.trim().parse().ok()?;
        let height = h.trim().parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Map a point from video stream pixels to device physical pixels.
///
/// The encoder may downscale (and round to even dimensions), so X and Y are
/// scaled independently. Until both resolutions are known the point is
/// returned unchanged.
pub fn map_point(
    device: Option<Resolution>,
    stream: Option<Resolution>,
    x: i32,
    y: i32,
) -> (i32, i32) {
    let (Some(device), Some(stream)) = (device, stream) else {
        return (x, y);
    };
    if stream.width == 0 || stream.height == 0 {
        return (x, y);
    }

    let scale_x = f64::from(device.width) / f64::from(stream.width);
    let scale_y = f64::from(device.height) / f64::from(stream.height);

    (
        (f64::from(x) * scale_x).round() as i32,
        (f64::from(y) * scale_y).round() as i32,
    )
}
