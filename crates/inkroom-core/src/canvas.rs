//! Incremental canvas composition.
//!
//! Touch samples become an [`InProgressPath`] through [`begin_stroke`] and
//! [`extend_stroke`]. Both return fresh values and never touch their input,
//! so the path shown in the last frame and the path being extended can
//! never alias. [`render`] then composes the committed strokes and the live
//! path into a [`Frame`]: committed strokes bottom to top in the order the
//! store reported them, the live path always on top.
//!
//! Coordinates are canvas pixels, exactly as delivered by touch events.

use crate::color::StrokeColor;
use crate::path::InProgressPath;
use crate::stroke::{Sequence, Stroke, StrokeId};
use crate::tools::ToolSettings;
use kurbo::{BezPath, Point};

/// Start a new stroke at `point` with the current tool.
pub fn begin_stroke(point: Point, tool: ToolSettings) -> InProgressPath {
    InProgressPath::anchored(point, tool)
}

/// The stroke `path` continued with a line to `point`.
pub fn extend_stroke(path: &InProgressPath, point: Point) -> InProgressPath {
    path.with_point(point)
}

/// Whether the path has no samples. Empty strokes are never committed.
pub fn is_empty(path: &InProgressPath) -> bool {
    path.is_empty()
}

/// Where a draw operation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Committed { id: StrokeId, sequence: Sequence },
    InProgress,
}

/// One stroked path. Every op is drawn with round caps and round joins.
#[derive(Debug, Clone)]
pub struct DrawOp {
    pub path: BezPath,
    pub color: StrokeColor,
    pub width: f64,
    pub layer: Layer,
}

/// Ordered draw operations for one frame, bottom to top.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    ops: Vec<DrawOp>,
}

impl Frame {
    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total number of path segments across all ops.
    pub fn segment_count(&self) -> usize {
        self.ops.iter().map(|op| op.path.segments().count()).sum()
    }

    /// The live stroke's op, if one was drawn.
    pub fn in_progress(&self) -> Option<&DrawOp> {
        self.ops.last().filter(|op| op.layer == Layer::InProgress)
    }
}

/// Compose committed strokes and the live path into a frame.
///
/// Strokes that cannot be drawn (bad path data, unusable width) are skipped
/// and logged.
pub fn render(committed: &[Stroke], in_progress: &InProgressPath) -> Frame {
    let mut ops = Vec::with_capacity(committed.len() + 1);

    for stroke in committed {
        if !(stroke.thickness.is_finite() && stroke.thickness > 0.0) {
            log::warn!(
                "Skipping stroke {} with unusable thickness {}",
                stroke.id,
                stroke.thickness
            );
            continue;
        }
        match stroke.bez_path() {
            Ok(path) => ops.push(DrawOp {
                path,
                color: stroke.color,
                width: stroke.thickness,
                layer: Layer::Committed {
                    id: stroke.id.clone(),
                    sequence: stroke.sequence,
                },
            }),
            Err(e) => log::warn!("Skipping stroke {}: {}", stroke.id, e),
        }
    }

    if !in_progress.is_empty() {
        ops.push(DrawOp {
            path: in_progress.to_bez_path(),
            color: in_progress.color,
            width: in_progress.thickness,
            layer: Layer::InProgress,
        });
    }

    Frame { ops }
}
