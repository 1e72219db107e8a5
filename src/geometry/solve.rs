//! Pose recovery from pixel/scene point correspondences.
//!
//! Coplanar scene points go through a normalized DLT homography that is decomposed into
//! rotation and translation. General point sets go through a DLT projection matrix whose
//! rotation block is orthonormalized by SVD.

use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, Point2, Point3, SymmetricEigen, Vector3,
};

use super::intrinsics::CameraIntrinsics;
use super::pose::CameraPose;
use crate::error::{FusionError, Result};

/// Minimum correspondences when all scene points share a plane.
pub const MIN_COPLANAR_POINTS: usize = 4;

/// Minimum correspondences for a general (non-coplanar) point set.
pub const MIN_GENERAL_POINTS: usize = 6;

/// Relative smallest-variance threshold below which the scene points count as coplanar.
const PLANARITY_TOLERANCE: f64 = 1e-6;

/// Solve the camera pose, returning it with the RMS reprojection error in pixels.
pub fn solve_pose(
    intrinsics: &CameraIntrinsics,
    pixels: &[Point2<f64>],
    map_points: &[Point3<f64>],
) -> Result<(CameraPose, f64)> {
    if pixels.len() != map_points.len() {
        return Err(FusionError::geometry(format!(
            "{} camera points but {} map points",
            pixels.len(),
            map_points.len()
        )));
    }
    if pixels.len() < MIN_COPLANAR_POINTS {
        return Err(FusionError::geometry(format!(
            "pose needs at least {MIN_COPLANAR_POINTS} correspondences, got {}",
            pixels.len()
        )));
    }

    let image = pixels
        .iter()
        .map(|p| intrinsics.normalize(p))
        .collect::<Result<Vec<_>>>()?;

    let frame = PlaneFrame::fit(map_points)?;
    let (rotation, translation) = if frame.is_planar {
        solve_planar(&frame, &image, map_points)?
    } else {
        if pixels.len() < MIN_GENERAL_POINTS {
            return Err(FusionError::geometry(format!(
                "non-coplanar pose needs at least {MIN_GENERAL_POINTS} correspondences, got {}",
                pixels.len()
            )));
        }
        solve_general(&image, map_points)?
    };

    let mut squared = 0.0;
    for (pixel, point) in pixels.iter().zip(map_points) {
        let cam = rotation * point.coords + translation;
        if cam.z <= 0.0 {
            return Err(FusionError::geometry(
                "solved pose places correspondences behind the camera",
            ));
        }
        let projected = intrinsics.denormalize(&Point2::new(cam.x / cam.z, cam.y / cam.z));
        squared += (projected - *pixel).norm_squared();
    }
    let rms = (squared / pixels.len() as f64).sqrt();

    Ok((CameraPose::from_extrinsic(&rotation, &translation)?, rms))
}

/// Principal axes of the scene points.
struct PlaneFrame {
    centroid: Vector3<f64>,
    u: Vector3<f64>,
    v: Vector3<f64>,
    normal: Vector3<f64>,
    is_planar: bool,
}

impl PlaneFrame {
    fn fit(points: &[Point3<f64>]) -> Result<Self> {
        let n = points.len() as f64;
        let centroid = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
        let mut scatter = Matrix3::zeros();
        for p in points {
            let d = p.coords - centroid;
            scatter += d * d.transpose();
        }
        let eig = SymmetricEigen::new(scatter);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        let largest = eig.eigenvalues[order[0]];
        let second = eig.eigenvalues[order[1]];
        let smallest = eig.eigenvalues[order[2]].max(0.0);
        if largest <= f64::EPSILON || second <= PLANARITY_TOLERANCE * largest {
            return Err(FusionError::geometry("map points are collinear or coincident"));
        }
        let u = eig.eigenvectors.column(order[0]).normalize();
        let normal = eig.eigenvectors.column(order[2]).normalize();
        let v = normal.cross(&u);
        Ok(Self {
            centroid,
            u,
            v,
            normal,
            is_planar: smallest <= PLANARITY_TOLERANCE * largest,
        })
    }

    fn plane_coords(&self, point: &Point3<f64>) -> Point2<f64> {
        let d = point.coords - self.centroid;
        Point2::new(d.dot(&self.u), d.dot(&self.v))
    }

    fn basis(&self) -> Matrix3<f64> {
        Matrix3::from_columns(&[self.u, self.v, self.normal])
    }
}

fn solve_planar(
    frame: &PlaneFrame,
    image: &[Point2<f64>],
    map_points: &[Point3<f64>],
) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    let plane: Vec<Point2<f64>> = map_points.iter().map(|p| frame.plane_coords(p)).collect();
    let h = homography(&plane, image)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let mut scale = 2.0 / (h1.norm() + h2.norm());
    // plane centroid maps to (0, 0) and has to sit in front of the camera
    if scale * h3.z < 0.0 {
        scale = -scale;
    }
    let r1 = h1 * scale;
    let r2 = h2 * scale;
    let r3 = r1.cross(&r2);
    let rotation_in_plane = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let rotation = rotation_in_plane * frame.basis().transpose();
    let translation = h3 * scale - rotation * frame.centroid;
    Ok((rotation, translation))
}

fn solve_general(
    image: &[Point2<f64>],
    map_points: &[Point3<f64>],
) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    let t_image = normalizing_transform_2d(image);
    let t_scene = normalizing_transform_3d(map_points);

    let mut a = DMatrix::zeros(2 * image.len(), 12);
    for (i, (x, p)) in image.iter().zip(map_points).enumerate() {
        let x = t_image.transform_point(x);
        let p = t_scene.transform_point(p);
        let row = [p.x, p.y, p.z, 1.0];
        for k in 0..4 {
            a[(2 * i, k)] = row[k];
            a[(2 * i, 8 + k)] = -x.x * row[k];
            a[(2 * i + 1, 4 + k)] = row[k];
            a[(2 * i + 1, 8 + k)] = -x.y * row[k];
        }
    }
    let p = null_vector(&a);
    let normalized = Matrix3x4::from_row_slice(p.as_slice());
    let inv_image = t_image
        .try_inverse()
        .ok_or_else(|| FusionError::geometry("degenerate image points"))?;
    let mut projection = inv_image * normalized * t_scene;

    let m: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        projection = -projection;
    }
    let m: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
    let svd = m.svd(true, true);
    let scale = svd.singular_values.mean();
    if scale <= f64::EPSILON {
        return Err(FusionError::geometry("degenerate projection matrix"));
    }
    let rotation = orthonormalize(&m)?;
    let translation = projection.column(3).into_owned() / scale;
    Ok((rotation, translation))
}

/// Homography mapping `src` to `dst`, with Hartley normalization on both sides.
fn homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let t_src = normalizing_transform_2d(src);
    let t_dst = normalizing_transform_2d(dst);
    let mut a = DMatrix::zeros(2 * src.len(), 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = t_src.transform_point(s);
        let d = t_dst.transform_point(d);
        let row = [s.x, s.y, 1.0];
        for k in 0..3 {
            a[(2 * i, k)] = -row[k];
            a[(2 * i, 6 + k)] = d.x * row[k];
            a[(2 * i + 1, 3 + k)] = -row[k];
            a[(2 * i + 1, 6 + k)] = d.y * row[k];
        }
    }
    let h = null_vector(&a);
    let normalized = Matrix3::from_row_slice(h.as_slice());
    let inv_dst = t_dst
        .try_inverse()
        .ok_or_else(|| FusionError::geometry("degenerate image points"))?;
    Ok(inv_dst * normalized * t_src)
}

/// Unit vector minimizing `|A x|`.
fn null_vector(a: &DMatrix<f64>) -> DVector<f64> {
    let eig = SymmetricEigen::new(a.transpose() * a);
    let idx = eig.eigenvalues.imin();
    eig.eigenvectors.column(idx).into_owned()
}

fn orthonormalize(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => Ok(u * v_t),
        _ => Err(FusionError::geometry("rotation decomposition failed")),
    }
}

fn normalizing_transform_2d(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean > f64::EPSILON { 2f64.sqrt() / mean } else { 1.0 };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn normalizing_transform_3d(points: &[Point3<f64>]) -> Matrix4<f64> {
    let n = points.len() as f64;
    let c = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
    let mean = points.iter().map(|p| (p.coords - c).norm()).sum::<f64>() / n;
    let s = if mean > f64::EPSILON { 3f64.sqrt() / mean } else { 1.0 };
    #[rustfmt::skip]
    let t = Matrix4::new(
        s, 0.0, 0.0, -s * c.x,
        0.0, s, 0.0, -s * c.y,
        0.0, 0.0, s, -s * c.z,
        0.0, 0.0, 0.0, 1.0,
    );
    t
}
