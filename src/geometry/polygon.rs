//! Ground-plane polygons and segments.

use nalgebra::Point2;

use crate::error::{FusionError, Result};

/// Simple polygon in scene `x/y` with a cached bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Point2<f64>>,
    min: Point2<f64>,
    max: Point2<f64>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point2<f64>>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(FusionError::geometry(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        if vertices.iter().any(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(FusionError::geometry("polygon vertices must be finite"));
        }
        let mut min = vertices[0];
        let mut max = vertices[0];
        for p in &vertices[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Ok(Self { vertices, min, max })
    }

    pub fn vertices(&self) -> &[Point2<f64>] {
        &self.vertices
    }

    /// Even-odd containment test.
    pub fn contains(&self, point: &Point2<f64>) -> bool {
        if point.x < self.min.x || point.x > self.max.x || point.y < self.min.y || point.y > self.max.y
        {
            return false;
        }
        let mut inside = false;
        let mut j = self.vertices.len() - 1;
        for (i, vi) in self.vertices.iter().enumerate() {
            let vj = &self.vertices[j];
            if (vi.y > point.y) != (vj.y > point.y) {
                let x = vj.x + (point.y - vj.y) * (vi.x - vj.x) / (vi.y - vj.y);
                if point.x < x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Directed segment, used for tripwires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}

impl Segment {
    pub fn new(start: Point2<f64>, end: Point2<f64>) -> Self {
        Self { start, end }
    }

    /// Direction in which the movement `from -> to` crosses this segment: `1` when it
    /// goes from the right of the segment to its left, `-1` the other way, `None` when it
    /// does not cross. Touching an endpoint does not count.
    pub fn crossing(&self, from: &Point2<f64>, to: &Point2<f64>) -> Option<i8> {
        let o1 = orientation(&self.start, &self.end, from);
        let o2 = orientation(&self.start, &self.end, to);
        let o3 = orientation(from, to, &self.start);
        let o4 = orientation(from, to, &self.end);
        if o1 * o2 < 0.0 && o3 * o4 < 0.0 {
            Some(if o2 > 0.0 { 1 } else { -1 })
        } else {
            None
        }
    }
}

/// Twice the signed area of `a b c`; positive when `c` is left of `a -> b`.
fn orientation(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(4.0, 4.0),
            Point2::new(0.0, 4.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_contains() {
        let poly = square();
        assert!(poly.contains(&Point2::new(2.0, 2.0)));
        assert!(!poly.contains(&Point2::new(5.0, 2.0)));
        assert!(!poly.contains(&Point2::new(2.0, -0.1)));
    }

    #[test]
    fn test_concave() {
        let poly = Polygon::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(4.0, 4.0),
            Point2::new(2.0, 1.0),
            Point2::new(0.0, 4.0),
        ])
        .unwrap();
        assert!(poly.contains(&Point2::new(1.0, 0.5)));
        assert!(!poly.contains(&Point2::new(2.0, 3.0)));
    }

    #[test]
    fn test_too_few_vertices() {
        assert!(Polygon::new(vec![Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)]).is_err());
    }

    #[test]
    fn test_segment_crossing_direction() {
        let wire = Segment::new(Point2::new(0.0, 0.0), Point2::new(0.0, 10.0));
        // wire points +y, its left is -x
        assert_eq!(
            wire.crossing(&Point2::new(1.0, 5.0), &Point2::new(-1.0, 5.0)),
            Some(1)
        );
        assert_eq!(
            wire.crossing(&Point2::new(-1.0, 5.0), &Point2::new(1.0, 5.0)),
            Some(-1)
        );
        assert_eq!(
            wire.crossing(&Point2::new(1.0, 11.0), &Point2::new(-1.0, 11.0)),
            None
        );
    }
}
