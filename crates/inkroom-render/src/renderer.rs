//! Renderer trait abstraction.

use inkroom_core::canvas::Frame;
use inkroom_core::tools::BACKGROUND_COLOR;
use kurbo::{BezPath, Cap, Join, PathEl, Point, Size, Stroke};
use peniko::Color;
use thiserror::Error;

/// Renderer errors.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Render failed: {0}")]
    RenderFailed(String),
}

/// Result type for renderer operations.
pub type RenderResult<T> = Result<T, RendererError>;

/// Context for a single render frame.
pub struct RenderContext<'a> {
    /// The composed frame to draw.
    pub frame: &'a Frame,
    /// Viewport size in physical pixels.
    pub viewport_size: Size,
    /// Device pixel ratio (for HiDPI).
    pub scale_factor: f64,
    /// Background color.
    pub background_color: Color,
}

impl<'a> RenderContext<'a> {
    /// Create a new render context.
    pub fn new(frame: &'a Frame, viewport_size: Size) -> Self {
        Self {
            frame,
            viewport_size,
            scale_factor: 1.0,
            background_color: BACKGROUND_COLOR.into(),
        }
    }

    /// Set the scale factor for HiDPI.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Set the background color.
    pub fn with_background(mut self, color: Color) -> Self {
        self.background_color = color;
        self
    }
}

/// Trait for rendering backends.
pub trait Renderer: Send + Sync {
    /// Build the output for a frame. Called once per frame; replaces
    /// whatever the previous call produced.
    fn build_scene(&mut self, ctx: &RenderContext) -> RenderResult<()>;

    /// Get the background color (for clearing).
    fn background_color(&self, ctx: &RenderContext) -> Color {
        ctx.background_color
    }
}

/// Outline style shared by every stroke: round caps and round joins.
pub fn stroke_style(width: f64) -> Stroke {
    Stroke::new(width).with_caps(Cap::Round).with_join(Join::Round)
}

/// The point of a path made of a lone move, which draws as a dot.
pub fn dot_center(path: &BezPath) -> Option<Point> {
    match path.elements() {
        [PathEl::MoveTo(p)] => Some(*p),
        _ => None,
    }
}
