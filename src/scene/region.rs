//! Regions and tripwires in scene coordinates.

use nalgebra::Point2;

use crate::error::{FusionError, Result};
use crate::geometry::{Polygon, Segment};

use super::config::{AreaConfig, RegionConfig, TripwireConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum Area {
    Polygon(Polygon),
    Circle { center: Point2<f64>, radius: f64 },
    /// The whole scene.
    Scene,
}

impl Area {
    pub fn contains(&self, point: &Point2<f64>) -> bool {
        match self {
            Self::Polygon(polygon) => polygon.contains(point),
            Self::Circle { center, radius } => (point - center).norm() <= *radius,
            Self::Scene => true,
        }
    }
}

/// Named area used for occupancy events.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub uid: String,
    pub name: String,
    pub area: Area,
}

impl Region {
    pub fn from_config(config: &RegionConfig) -> Result<Self> {
        let area = match &config.area {
            AreaConfig::Poly { points } => {
                let vertices = points.iter().map(|p| Point2::new(p[0], p[1])).collect();
                Area::Polygon(Polygon::new(vertices)?)
            }
            AreaConfig::Circle { center, radius } => {
                if !(radius.is_finite() && *radius > 0.0) {
                    return Err(FusionError::geometry(format!(
                        "circle radius must be positive, got {radius}"
                    )));
                }
                Area::Circle {
                    center: Point2::new(center[0], center[1]),
                    radius: *radius,
                }
            }
            AreaConfig::Scene => Area::Scene,
        };
        Ok(Self {
            uid: config.uid.clone(),
            name: config.name.clone(),
            area,
        })
    }

    pub fn contains(&self, point: &Point2<f64>) -> bool {
        self.area.contains(point)
    }
}

/// Polyline that raises an event when crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tripwire {
    pub uid: String,
    pub name: String,
    segments: Vec<Segment>,
}

impl Tripwire {
    pub fn from_config(config: &TripwireConfig) -> Result<Self> {
        if config.points.len() < 2 {
            return Err(FusionError::geometry(format!(
                "tripwire {} needs at least 2 points",
                config.uid
            )));
        }
        let segments = config
            .points
            .windows(2)
            .map(|w| Segment::new(Point2::new(w[0][0], w[0][1]), Point2::new(w[1][0], w[1][1])))
            .collect();
        Ok(Self {
            uid: config.uid.clone(),
            name: config.name.clone(),
            segments,
        })
    }

    /// Direction of the first segment crossed by the movement `from -> to`.
    pub fn crossing(&self, from: &Point2<f64>, to: &Point2<f64>) -> Option<i8> {
        self.segments.iter().find_map(|s| s.crossing(from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_and_scene() {
        let circle = Region::from_config(&RegionConfig {
            uid: "r1".into(),
            name: "door".into(),
            area: AreaConfig::Circle {
                center: [1.0, 1.0],
                radius: 2.0,
            },
        })
        .unwrap();
        assert!(circle.contains(&Point2::new(2.0, 2.0)));
        assert!(!circle.contains(&Point2::new(4.0, 1.0)));

        assert!(Area::Scene.contains(&Point2::new(1e6, -1e6)));
    }

    #[test]
    fn test_degenerate_shapes_fail() {
        let poly = RegionConfig {
            uid: "r2".into(),
            name: "bad".into(),
            area: AreaConfig::Poly {
                points: vec![[0.0, 0.0], [1.0, 1.0]],
            },
        };
        assert!(Region::from_config(&poly).is_err());

        let wire = TripwireConfig {
            uid: "t1".into(),
            name: "line".into(),
            points: vec![[0.0, 0.0]],
        };
        assert!(Tripwire::from_config(&wire).is_err());
    }

    #[test]
    fn test_tripwire_polyline() {
        let wire = Tripwire::from_config(&TripwireConfig {
            uid: "t1".into(),
            name: "gate".into(),
            points: vec![[0.0, 0.0], [0.0, 2.0], [2.0, 2.0]],
        })
        .unwrap();
        assert!(wire.crossing(&Point2::new(-1.0, 1.0), &Point2::new(1.0, 1.0)).is_some());
        assert!(wire.crossing(&Point2::new(1.0, 1.0), &Point2::new(1.0, 3.0)).is_some());
        assert!(wire.crossing(&Point2::new(1.0, 0.5), &Point2::new(1.5, 0.5)).is_none());
    }
}
