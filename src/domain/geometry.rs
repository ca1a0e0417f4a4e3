//! Polygon and box geometry
//!
//! Pure functions over integer-pixel polygons and float boxes. Everything
//! here is deterministic and allocation-free.

use crate::domain::types::BBox;

/// Integer pixel vertex (x, y)
pub type Point = (i32, i32);

/// Tolerance for boundary tests on float query points
const EPS: f64 = 1e-9;

#[inline]
fn as_f64(p: Point) -> (f64, f64) {
    (p.0 as f64, p.1 as f64)
}

/// Point lies on segment a-b (inclusive of endpoints)
fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > EPS {
        return false;
    }
    p.0 >= a.0.min(b.0) - EPS
        && p.0 <= a.0.max(b.0) + EPS
        && p.1 >= a.1.min(b.1) - EPS
        && p.1 <= a.1.max(b.1) + EPS
}

/// Point-in-polygon by ray casting. Points on an edge or vertex count as inside.
pub fn contains(points: &[Point], x: f64, y: f64) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }

    let p = (x, y);
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = as_f64(points[i]);
        let b = as_f64(points[j]);

        if on_segment(a, b, p) {
            return true;
        }

        if (a.1 > y) != (b.1 > y) {
            let x_cross = (b.0 - a.0) * (y - a.1) / (b.1 - a.1) + a.0;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Shoelace sum; positive for counter-clockwise winding in a y-up frame
fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let (x0, y0) = as_f64(points[i]);
        let (x1, y1) = as_f64(points[(i + 1) % n]);
        sum += x0 * y1 - x1 * y0;
    }
    sum / 2.0
}

/// Polygon area (shoelace formula), independent of winding
pub fn area(points: &[Point]) -> f64 {
    signed_area(points).abs()
}

/// Area-weighted centroid. Zero-area polygons return (0, 0).
pub fn centroid(points: &[Point]) -> (f64, f64) {
    let a = signed_area(points);
    if a.abs() < EPS {
        return (0.0, 0.0);
    }

    let n = points.len();
    let (mut cx, mut cy) = (0.0, 0.0);
    for i in 0..n {
        let (x0, y0) = as_f64(points[i]);
        let (x1, y1) = as_f64(points[(i + 1) % n]);
        let cross = x0 * y1 - x1 * y0;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    (cx / (6.0 * a), cy / (6.0 * a))
}

/// Axis-aligned bounds (x1, y1, x2, y2) of the vertices
pub fn bounds(points: &[Point]) -> (i32, i32, i32, i32) {
    let Some(&(fx, fy)) = points.first() else {
        return (0, 0, 0, 0);
    };
    points.iter().fold((fx, fy, fx, fy), |(x1, y1, x2, y2), &(x, y)| {
        (x1.min(x), y1.min(y), x2.max(x), y2.max(y))
    })
}

/// Intersection over union. 0 when the boxes are disjoint or the union is empty.
pub fn iou(a: &BBox, b: &BBox) -> f64 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
