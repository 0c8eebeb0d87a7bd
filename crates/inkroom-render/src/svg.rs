//! SVG document renderer.
//!
//! Produces a standalone SVG document per frame. Useful for exporting a board
//! and for inspecting frames without a GPU.

use crate::renderer::{RenderContext, RenderResult, Renderer, RendererError, dot_center};
use inkroom_core::canvas::DrawOp;
use inkroom_core::color::StrokeColor;
use kurbo::Point;
use std::fmt::Write;

/// Renders frames into SVG markup.
#[derive(Debug, Default)]
pub struct SvgRenderer {
    document: String,
}

impl SvgRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last document built.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Take ownership of the document (resets the internal buffer).
    pub fn take_document(&mut self) -> String {
        std::mem::take(&mut self.document)
    }

    fn write_op(&mut self, op: &DrawOp) -> std::fmt::Result {
        let color = SvgColor(op.color);
        match dot_center(&op.path) {
            Some(Point { x, y }) => writeln!(
                self.document,
                r#"<circle cx="{}" cy="{}" r="{}" fill="{}"{}/>"#,
                x,
                y,
                op.width / 2.0,
                color,
                color.opacity("fill-opacity"),
            ),
            None => writeln!(
                self.document,
                r#"<path d="{}" stroke="{}" stroke-width="{}"{}/>"#,
                op.path.to_svg(),
                color,
                op.width,
                color.opacity("stroke-opacity"),
            ),
        }
    }

    fn write_document(&mut self, ctx: &RenderContext) -> std::fmt::Result {
        let width = ctx.viewport_size.width;
        let height = ctx.viewport_size.height;
        let background = SvgColor(StrokeColor::from(ctx.background_color));

        writeln!(
            self.document,
            concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" "#,
                r#"width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#
            ),
            w = width,
            h = height,
        )?;
        writeln!(
            self.document,
            r#"<rect width="100%" height="100%" fill="{}"{}/>"#,
            background,
            background.opacity("fill-opacity"),
        )?;
        writeln!(
            self.document,
            concat!(
                r#"<g transform="scale({})" fill="none" "#,
                r#"stroke-linecap="round" stroke-linejoin="round">"#
            ),
            ctx.scale_factor
        )?;
        for op in ctx.frame.ops() {
            self.write_op(op)?;
        }
        writeln!(self.document, "</g>")?;
        writeln!(self.document, "</svg>")
    }
}

impl Renderer for SvgRenderer {
    fn build_scene(&mut self, ctx: &RenderContext) -> RenderResult<()> {
        self.document.clear();
        self.write_document(ctx)
            .map_err(|e| RendererError::RenderFailed(e.to_string()))?;
        log::trace!("Built SVG frame with {} ops", ctx.frame.len());
        Ok(())
    }
}

/// A color as an SVG paint plus optional opacity attribute.
#[derive(Clone, Copy)]
struct SvgColor(StrokeColor);

impl SvgColor {
    fn opacity(self, attribute: &str) -> String {
        if self.0.is_opaque() {
            String::new()
        } else {
            format!(r#" {}="{:.3}""#, attribute, f64::from(self.0.a) / 255.0)
        }
    }
}

impl std::fmt::Display for SvgColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.0.r, self.0.g, self.0.b)
    }
}
