//! Freehand path representation and its portable text encoding.
//!
//! An [`InProgressPath`] is the stroke a local user is currently drawing. Its
//! samples live in an immutable shared buffer: growing the path allocates a
//! new buffer, so a frame that still holds the previous path never observes
//! the new sample and two strokes can never share geometry.

use crate::color::StrokeColor;
use crate::tools::ToolSettings;
use kurbo::{BezPath, Point, Rect};
use std::sync::Arc;
use thiserror::Error;

/// Error decoding SVG path data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid SVG path data {data:?}: {reason}")]
pub struct PathParseError {
    pub data: String,
    pub reason: String,
}

/// Result type for path decoding.
pub type PathResult<T> = Result<T, PathParseError>;

/// The stroke being drawn by the local user.
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressPath {
    points: Arc<[Point]>,
    /// Color bound when the stroke started.
    pub color: StrokeColor,
    /// Width bound when the stroke started.
    pub thickness: f64,
}

impl InProgressPath {
    /// A path with no samples, drawn with the given tool.
    pub fn empty(tool: ToolSettings) -> Self {
        Self {
            points: Arc::from(Vec::new()),
            color: tool.color,
            thickness: tool.thickness,
        }
    }

    /// A path anchored at `anchor`. A non-finite anchor yields an empty path.
    pub fn anchored(anchor: Point, tool: ToolSettings) -> Self {
        if !anchor.is_finite() {
            log::debug!("Discarding non-finite stroke anchor {:?}", anchor);
            return Self::empty(tool);
        }
        Self {
            points: Arc::from(vec![anchor]),
            color: tool.color,
            thickness: tool.thickness,
        }
    }

    /// Copy of this path with `point` appended.
    ///
    /// Non-finite samples are dropped and the copy is returned unchanged.
    /// On an empty path the sample becomes the anchor.
    pub fn with_point(&self, point: Point) -> Self {
        if !point.is_finite() {
            log::debug!("Discarding non-finite stroke sample {:?}", point);
            return self.clone_detached();
        }
        let mut points = Vec::with_capacity(self.points.len() + 1);
        points.extend_from_slice(&self.points);
        points.push(point);
        Self {
            points: Arc::from(points),
            color: self.color,
            thickness: self.thickness,
        }
    }

    /// Copy that does not share its sample buffer with `self`.
    fn clone_detached(&self) -> Self {
        Self {
            points: Arc::from(self.points.to_vec()),
            color: self.color,
            thickness: self.thickness,
        }
    }

    /// Sampled points in drawing order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Shared handle to the sample buffer.
    pub fn shared_points(&self) -> &Arc<[Point]> {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Bounding box of the samples, or `Rect::ZERO` for an empty path.
    pub fn bounds(&self) -> Rect {
        let Some(first) = self.points.first() else {
            return Rect::ZERO;
        };
        self.points
            .iter()
            .skip(1)
            .fold(Rect::from_points(*first, *first), |rect, p| rect.union_pt(*p))
    }

    /// Move to the anchor, then a line to every following sample.
    pub fn to_bez_path(&self) -> BezPath {
        polyline(&self.points)
    }

    /// Encode as SVG path data.
    pub fn to_svg(&self) -> String {
        self.to_bez_path().to_svg()
    }

    /// Copy reduced with Ramer-Douglas-Peucker at the given tolerance.
    /// Negative or NaN tolerances act as zero.
    pub fn simplify(&self, tolerance: f64) -> Self {
        let tolerance = if tolerance.is_nan() { 0.0 } else { tolerance.max(0.0) };
        Self {
            points: Arc::from(rdp_simplify(&self.points, tolerance)),
            color: self.color,
            thickness: self.thickness,
        }
    }
}

/// Build a move/line path through `points`.
pub fn polyline(points: &[Point]) -> BezPath {
    let mut path = BezPath::new();
    let Some((first, rest)) = points.split_first() else {
        return path;
    };
    path.move_to(*first);
    for point in rest {
        path.line_to(*point);
    }
    path
}

/// Decode SVG path data into a drawable path.
pub fn parse_svg_path(data: &str) -> PathResult<BezPath> {
    BezPath::from_svg(data).map_err(|e| PathParseError {
        data: data.to_string(),
        reason: e.to_string(),
    })
}

/// Ramer-Douglas-Peucker line simplification.
fn rdp_simplify(points: &[Point], tolerance: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];

    let mut max_dist = 0.0;
    let mut max_index = 0;
    for (i, point) in points.iter().enumerate().take(points.len() - 1).skip(1) {
        let dist = perpendicular_distance(*point, first, last);
        if dist > max_dist {
            max_dist = dist;
            max_index = i;
        }
    }

    // max_index == 0 means no interior point was farther than zero.
    if max_index > 0 && max_dist > tolerance {
        let mut left = rdp_simplify(&points[..=max_index], tolerance);
        let right = rdp_simplify(&points[max_index..], tolerance);
        // The split point ends `left` and starts `right`.
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

fn perpendicular_distance(point: Point, line_start: Point, line_end: Point) -> f64 {
    let line = line_end - line_start;
    let len_sq = line.hypot2();
    if len_sq < f64::EPSILON {
        return point.distance(line_start);
    }
    (point - line_start).cross(line).abs() / len_sq.sqrt()
}
