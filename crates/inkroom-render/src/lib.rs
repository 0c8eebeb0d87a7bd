//! InkRoom Render Library
//!
//! Backends that turn a composed [`Frame`](inkroom_core::canvas::Frame) into
//! output. The SVG renderer is always available; the GPU renderer uses Vello
//! and sits behind the `vello-renderer` feature.

mod renderer;
mod svg;

#[cfg(feature = "vello-renderer")]
mod vello_impl;

pub use renderer::{RenderContext, RenderResult, Renderer, RendererError, dot_center, stroke_style};
pub use svg::SvgRenderer;

#[cfg(feature = "vello-renderer")]
pub use vello_impl::VelloRenderer;
