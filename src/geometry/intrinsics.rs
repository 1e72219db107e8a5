//! Pinhole intrinsics with lens distortion.

use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

/// Number of distortion coefficients in the full model
/// (`k1 k2 p1 p2 k3 k4 k5 k6 s1 s2 s3 s4 tau_x tau_y`).
const DISTORTION_LEN: usize = 14;

/// Accepted lengths for a distortion coefficient list.
const DISTORTION_LENGTHS: [usize; 5] = [4, 5, 8, 12, 14];

const UNDISTORT_ITERATIONS: usize = 20;

/// Intrinsics as supplied by the scene configuration.
///
/// Field-of-view angles are in degrees. A single `fov` is a diagonal field of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntrinsicsSpec {
    Matrix { fx: f64, fy: f64, cx: f64, cy: f64 },
    Diagonal { fov: f64 },
    Axes { hfov: Option<f64>, vfov: Option<f64> },
    Scalar(f64),
}

/// Lens distortion coefficients, zero padded to the full model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distortion {
    coeffs: [f64; DISTORTION_LEN],
}

impl Default for Distortion {
    fn default() -> Self {
        Self {
            coeffs: [0.0; DISTORTION_LEN],
        }
    }
}

impl Distortion {
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if !DISTORTION_LENGTHS.contains(&values.len()) {
            return Err(FusionError::geometry(format!(
                "distortion must have 4, 5, 8, 12 or 14 coefficients, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::geometry("distortion coefficients must be finite"));
        }
        let mut coeffs = [0.0; DISTORTION_LEN];
        coeffs[..values.len()].copy_from_slice(values);
        Ok(Self { coeffs })
    }

    pub fn coefficients(&self) -> &[f64; DISTORTION_LEN] {
        &self.coeffs
    }

    pub fn is_zero(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0.0)
    }

    /// Radial gain and tangential/prism offsets at a normalized point.
    fn terms(&self, x: f64, y: f64) -> (f64, f64, f64) {
        let [k1, k2, p1, p2, k3, k4, k5, k6, s1, s2, s3, s4, _, _] = self.coeffs;
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) + s1 * r2 + s2 * r4;
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y + s3 * r2 + s4 * r4;
        (radial, dx, dy)
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let (radial, dx, dy) = self.terms(x, y);
        (x * radial + dx, y * radial + dy)
    }

    /// Iterative inverse of [`Distortion::apply`].
    fn remove(&self, xd: f64, yd: f64) -> Option<(f64, f64)> {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let (radial, dx, dy) = self.terms(x, y);
            if radial <= 0.0 || !radial.is_finite() {
                return None;
            }
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Some((x, y))
    }
}

/// Immutable pinhole intrinsics: focal lengths, principal point, distortion and resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    distortion: Distortion,
    resolution: [u32; 2],
}

impl CameraIntrinsics {
    /// Build intrinsics from any configuration form.
    ///
    /// Field-of-view forms need the resolution; a matrix without resolution assumes the
    /// principal point sits at the image centre.
    pub fn new(
        spec: &IntrinsicsSpec,
        distortion: Option<&[f64]>,
        resolution: Option<[u32; 2]>,
    ) -> Result<Self> {
        let mut intrinsics = match *spec {
            IntrinsicsSpec::Matrix { fx, fy, cx, cy } => {
                let resolution = resolution.unwrap_or([
                    (2.0 * cx).round().max(0.0) as u32,
                    (2.0 * cy).round().max(0.0) as u32,
                ]);
                Self::from_matrix(fx, fy, cx, cy, resolution)?
            }
            IntrinsicsSpec::Diagonal { fov } | IntrinsicsSpec::Scalar(fov) => {
                Self::from_fov(fov, require_resolution(resolution)?)?
            }
            IntrinsicsSpec::Axes { hfov, vfov } => {
                Self::from_axis_fov(hfov, vfov, require_resolution(resolution)?)?
            }
        };
        if let Some(coeffs) = distortion {
            intrinsics.distortion = Distortion::from_slice(coeffs)?;
        }
        Ok(intrinsics)
    }

    pub fn from_matrix(fx: f64, fy: f64, cx: f64, cy: f64, resolution: [u32; 2]) -> Result<Self> {
        let values = [fx, fy, cx, cy];
        if values.iter().any(|v| !v.is_finite()) || fx <= 0.0 || fy <= 0.0 {
            return Err(FusionError::geometry(format!(
                "focal lengths must be positive and finite, got fx={fx} fy={fy}"
            )));
        }
        if resolution[0] == 0 || resolution[1] == 0 {
            return Err(FusionError::geometry("resolution must be non-zero"));
        }
        Ok(Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::default(),
            resolution,
        })
    }

    /// Intrinsics from a diagonal field of view, applied uniformly to both axes.
    pub fn from_fov(fov_deg: f64, resolution: [u32; 2]) -> Result<Self> {
        let (cx, cy) = half_resolution(resolution)?;
        let diagonal = (cx * cx + cy * cy).sqrt();
        let focal = focal_from_fov(diagonal, fov_deg)?;
        Self::from_matrix(focal, focal, cx, cy, resolution)
    }

    /// Intrinsics from horizontal and/or vertical fields of view. A missing axis borrows
    /// the focal length of the other one.
    pub fn from_axis_fov(
        hfov_deg: Option<f64>,
        vfov_deg: Option<f64>,
        resolution: [u32; 2],
    ) -> Result<Self> {
        let (cx, cy) = half_resolution(resolution)?;
        let fx = hfov_deg.map(|fov| focal_from_fov(cx, fov)).transpose()?;
        let fy = vfov_deg.map(|fov| focal_from_fov(cy, fov)).transpose()?;
        let (fx, fy) = match (fx, fy) {
            (Some(fx), Some(fy)) => (fx, fy),
            (Some(f), None) | (None, Some(f)) => (f, f),
            (None, None) => {
                return Err(FusionError::geometry(
                    "intrinsics need a focal length or a field of view",
                ));
            }
        };
        Self::from_matrix(fx, fy, cx, cy, resolution)
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    pub fn resolution(&self) -> [u32; 2] {
        self.resolution
    }

    pub fn distortion(&self) -> &Distortion {
        &self.distortion
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Pixel to undistorted normalized image coordinates (the `z = 1` camera plane).
    pub fn normalize(&self, pixel: &Point2<f64>) -> Result<Point2<f64>> {
        let xd = (pixel.x - self.cx) / self.fx;
        let yd = (pixel.y - self.cy) / self.fy;
        if self.distortion.is_zero() {
            return Ok(Point2::new(xd, yd));
        }
        let (x, y) = self
            .distortion
            .remove(xd, yd)
            .ok_or_else(|| FusionError::geometry("undistortion diverged"))?;
        Ok(Point2::new(x, y))
    }

    /// Normalized image coordinates to a distorted pixel.
    pub fn denormalize(&self, normalized: &Point2<f64>) -> Point2<f64> {
        let (x, y) = if self.distortion.is_zero() {
            (normalized.x, normalized.y)
        } else {
            self.distortion.apply(normalized.x, normalized.y)
        };
        Point2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }

    pub fn contains_pixel(&self, pixel: &Point2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x <= self.resolution[0] as f64
            && pixel.y <= self.resolution[1] as f64
    }
}

fn require_resolution(resolution: Option<[u32; 2]>) -> Result<[u32; 2]> {
    resolution.ok_or_else(|| {
        FusionError::geometry("resolution required to derive intrinsics from field of view")
    })
}

fn half_resolution(resolution: [u32; 2]) -> Result<(f64, f64)> {
    if resolution[0] == 0 || resolution[1] == 0 {
        return Err(FusionError::geometry("resolution must be non-zero"));
    }
    Ok((resolution[0] as f64 / 2.0, resolution[1] as f64 / 2.0))
}

/// `focal = half_extent / tan(fov / 2)`.
fn focal_from_fov(half_extent: f64, fov_deg: f64) -> Result<f64> {
    if !(fov_deg.is_finite() && fov_deg > 0.0 && fov_deg < 180.0) {
        return Err(FusionError::geometry(format!(
            "field of view must be within (0, 180) degrees, got {fov_deg}"
        )));
    }
    Ok(half_extent / (fov_deg.to_radians() / 2.0).tan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_diagonal_fov_scenario() {
        let intr = CameraIntrinsics::from_fov(80.0, [1280, 720]).unwrap();
        assert_abs_diff_eq!(intr.fx(), 875.0, epsilon = 1.0);
        assert_abs_diff_eq!(intr.fy(), 875.0, epsilon = 1.0);
        assert_eq!(intr.cx(), 640.0);
        assert_eq!(intr.cy(), 360.0);
    }

    #[test]
    fn test_axis_fov() {
        let intr = CameraIntrinsics::from_axis_fov(Some(90.0), None, [1000, 500]).unwrap();
        assert_abs_diff_eq!(intr.fx(), 500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(intr.fy(), 500.0, epsilon = 1e-9);

        let intr = CameraIntrinsics::from_axis_fov(Some(90.0), Some(90.0), [1000, 500]).unwrap();
        assert_abs_diff_eq!(intr.fy(), 250.0, epsilon = 1e-9);
    }

    #[test]
    fn test_spec_forms() {
        let spec: IntrinsicsSpec = serde_json::from_str(r#"{"fov": 80}"#).unwrap();
        assert_eq!(spec, IntrinsicsSpec::Diagonal { fov: 80.0 });
        let spec: IntrinsicsSpec =
            serde_json::from_str(r#"{"fx": 900, "fy": 900, "cx": 640, "cy": 360}"#).unwrap();
        let intr = CameraIntrinsics::new(&spec, None, None).unwrap();
        assert_eq!(intr.resolution(), [1280, 720]);
        let spec: IntrinsicsSpec = serde_json::from_str("70").unwrap();
        assert_eq!(spec, IntrinsicsSpec::Scalar(70.0));
    }

    #[test]
    fn test_missing_data_is_invalid() {
        let spec = IntrinsicsSpec::Axes {
            hfov: None,
            vfov: None,
        };
        assert!(matches!(
            CameraIntrinsics::new(&spec, None, Some([640, 480])),
            Err(FusionError::InvalidGeometry(_))
        ));
        let spec = IntrinsicsSpec::Diagonal { fov: 60.0 };
        assert!(CameraIntrinsics::new(&spec, None, None).is_err());
    }

    #[test]
    fn test_bad_distortion_length() {
        assert!(Distortion::from_slice(&[0.1, 0.2, 0.3]).is_err());
        let d = Distortion::from_slice(&[0.1, 0.01, 0.0, 0.0, 0.001]).unwrap();
        assert_eq!(d.coefficients()[4], 0.001);
        assert_eq!(d.coefficients()[13], 0.0);
    }

    #[test]
    fn test_distortion_round_trip() {
        let d = Distortion::from_slice(&[-0.2, 0.05, 0.001, -0.0005, 0.0]).unwrap();
        let intr = CameraIntrinsics::from_fov(90.0, [1920, 1080])
            .unwrap()
            .with_distortion(d);
        let pixel = Point2::new(1500.0, 200.0);
        let normalized = intr.normalize(&pixel).unwrap();
        let back = intr.denormalize(&normalized);
        assert_abs_diff_eq!(back.x, pixel.x, epsilon = 1e-3);
        assert_abs_diff_eq!(back.y, pixel.y, epsilon = 1e-3);
    }
}
