//! Vello-based renderer implementation.

use crate::renderer::{RenderContext, RenderResult, Renderer, dot_center, stroke_style};
use inkroom_core::canvas::DrawOp;
use kurbo::{Affine, Circle, Rect};
use peniko::{Color, Fill};
use vello::Scene;

/// Vello-based renderer for GPU-accelerated 2D graphics.
pub struct VelloRenderer {
    /// The Vello scene being built.
    scene: Scene,
}

impl Default for VelloRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl VelloRenderer {
    /// Create a new Vello renderer.
    pub fn new() -> Self {
        Self { scene: Scene::new() }
    }

    /// Get the built scene for rendering.
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Take ownership of the scene (resets internal scene).
    pub fn take_scene(&mut self) -> Scene {
        std::mem::take(&mut self.scene)
    }

    fn render_op(&mut self, op: &DrawOp, transform: Affine) {
        let color = Color::from(op.color);
        match dot_center(&op.path) {
            // A lone move has no outline to stroke; draw the cap it would have.
            Some(center) => {
                self.scene.fill(
                    Fill::NonZero,
                    transform,
                    color,
                    None,
                    &Circle::new(center, op.width / 2.0),
                );
            }
            None => {
                self.scene
                    .stroke(&stroke_style(op.width), transform, color, None, &op.path);
            }
        }
    }
}

impl Renderer for VelloRenderer {
    fn build_scene(&mut self, ctx: &RenderContext) -> RenderResult<()> {
        self.scene.reset();

        let background = Rect::new(0.0, 0.0, ctx.viewport_size.width, ctx.viewport_size.height);
        self.scene.fill(
            Fill::NonZero,
            Affine::IDENTITY,
            ctx.background_color,
            None,
            &background,
        );

        let transform = Affine::scale(ctx.scale_factor);
        for op in ctx.frame.ops() {
            self.render_op(op, transform);
        }
        Ok(())
    }
}
