//! Crown polygon geometry: planar area, point containment, WKT.

use crate::error::StageError;

/// A delineated tree crown: a closed exterior ring in map coordinates plus
/// the integer segmentation label it came from. Immutable once emitted by
/// the delineator.
#[derive(Debug, Clone)]
pub struct CrownPolygon {
    /// Segmentation label (1-based, unique per unit).
    pub label: u32,
    /// Exterior ring; first and last vertex coincide.
    pub ring: Vec<(f64, f64)>,
}

impl CrownPolygon {
    pub fn new(label: u32, ring: Vec<(f64, f64)>) -> Self {
        Self { label, ring }
    }

    /// Planar area by the shoelace formula (orientation-independent).
    pub fn area(&self) -> f64 {
        shoelace_area(&self.ring).abs()
    }

    /// Even-odd ray-cast containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let ring = &self.ring;
        if ring.len() < 4 {
            return false;
        }
        let mut inside = false;
        for w in ring.windows(2) {
            let (x1, y1) = w[0];
            let (x2, y2) = w[1];
            if (y1 > y) != (y2 > y) {
                let x_cross = x1 + (y - y1) / (y2 - y1) * (x2 - x1);
                if x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Axis-aligned bounding box: [min_x, min_y, max_x, max_y].
    pub fn bounds(&self) -> [f64; 4] {
        let mut b = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        for &(x, y) in &self.ring {
            b[0] = b[0].min(x);
            b[1] = b[1].min(y);
            b[2] = b[2].max(x);
            b[3] = b[3].max(y);
        }
        b
    }

    /// Format as a WKT POLYGON with a single exterior ring.
    pub fn to_wkt(&self) -> String {
        if self.ring.is_empty() {
            return "POLYGON EMPTY".to_string();
        }
        let coords: Vec<String> = self
            .ring
            .iter()
            .map(|(x, y)| format!("{} {}", x, y))
            .collect();
        format!("POLYGON(({}))", coords.join(","))
    }

    /// Parse a single-ring WKT POLYGON as written by [`CrownPolygon::to_wkt`].
    pub fn from_wkt(label: u32, wkt: &str) -> Result<Self, StageError> {
        let bad = |msg: &str| StageError::UnsupportedFormat(format!("WKT polygon: {}", msg));

        let body = wkt
            .trim()
            .strip_prefix("POLYGON((")
            .and_then(|s| s.strip_suffix("))"))
            .ok_or_else(|| bad("expected POLYGON((...))"))?;

        let mut ring = Vec::new();
        for pair in body.split(',') {
            let mut it = pair.split_whitespace();
            let x: f64 = it
                .next()
                .ok_or_else(|| bad("missing x"))?
                .parse()
                .map_err(|_| bad("non-numeric x"))?;
            let y: f64 = it
                .next()
                .ok_or_else(|| bad("missing y"))?
                .parse()
                .map_err(|_| bad("non-numeric y"))?;
            ring.push((x, y));
        }
        if ring.len() < 4 {
            return Err(bad("ring has fewer than 4 vertices"));
        }
        if ring.first() != ring.last() {
            return Err(bad("ring is not closed"));
        }
        Ok(Self { label, ring })
    }
}

/// Signed shoelace area of a closed ring.
pub fn shoelace_area(ring: &[(f64, f64)]) -> f64 {
    if ring.len() < 4 {
        return 0.0;
    }
    let mut acc = 0.0;
    for w in ring.windows(2) {
        let (x1, y1) = w[0];
        let (x2, y2) = w[1];
        acc += x1 * y2 - x2 * y1;
    }
    acc / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> CrownPolygon {
        CrownPolygon::new(
            1,
            vec![(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0), (0.0, 0.0)],
        )
    }

    #[test]
    fn test_square_area() {
        assert!((unit_square().area() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_area_is_orientation_independent() {
        let mut reversed = unit_square();
        reversed.ring.reverse();
        assert!((reversed.area() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_containment() {
        let sq = unit_square();
        assert!(sq.contains(1.0, 1.0));
        assert!(!sq.contains(3.0, 1.0));
        assert!(!sq.contains(-0.5, 1.0));
    }

    #[test]
    fn test_l_shape_containment() {
        // L-shaped ring exercises the even-odd rule beyond convex cases.
        let poly = CrownPolygon::new(
            2,
            vec![
                (0.0, 0.0),
                (3.0, 0.0),
                (3.0, 1.0),
                (1.0, 1.0),
                (1.0, 3.0),
                (0.0, 3.0),
                (0.0, 0.0),
            ],
        );
        assert!(poly.contains(0.5, 2.0));
        assert!(poly.contains(2.0, 0.5));
        assert!(!poly.contains(2.0, 2.0));
        assert!((poly.area() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_wkt_round_trip() {
        let sq = unit_square();
        let wkt = sq.to_wkt();
        let back = CrownPolygon::from_wkt(7, &wkt).unwrap();
        assert_eq!(back.label, 7);
        assert_eq!(back.ring, sq.ring);
    }

    #[test]
    fn test_wkt_rejects_garbage() {
        assert!(matches!(
            CrownPolygon::from_wkt(1, "LINESTRING(0 0,1 1)"),
            Err(StageError::UnsupportedFormat(_))
        ));
        assert!(CrownPolygon::from_wkt(1, "POLYGON((0 0,1 x))").is_err());
    }

    #[test]
    fn test_bounds() {
        let b = unit_square().bounds();
        assert_eq!(b, [0.0, 0.0, 2.0, 2.0]);
    }
}
