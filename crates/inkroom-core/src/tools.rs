//! Drawing tool settings.

use crate::color::StrokeColor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canvas background. Painting with it is how the eraser works.
pub const BACKGROUND_COLOR: StrokeColor = StrokeColor::rgb(0x11, 0x13, 0x17);

/// Colors offered by the toolbar.
pub const PALETTE: [StrokeColor; 7] = [
    StrokeColor::rgb(0xFF, 0xFF, 0xFF),
    StrokeColor::rgb(0xFF, 0x3B, 0x30),
    StrokeColor::rgb(0xFF, 0x95, 0x00),
    StrokeColor::rgb(0xFF, 0xCC, 0x00),
    StrokeColor::rgb(0x34, 0xC7, 0x59),
    StrokeColor::rgb(0x00, 0x7A, 0xFF),
    StrokeColor::rgb(0xAF, 0x52, 0xDE),
];

/// Stroke widths offered by the toolbar.
pub const THICKNESSES: [f64; 4] = [3.0, 6.0, 10.0, 15.0];

/// Width used until the user picks one.
pub const DEFAULT_THICKNESS: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("stroke thickness must be positive and finite, got {0}")]
    InvalidThickness(f64),
}

/// Color and width applied to the next stroke.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    pub color: StrokeColor,
    pub thickness: f64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            color: StrokeColor::WHITE,
            thickness: DEFAULT_THICKNESS,
        }
    }
}

impl ToolSettings {
    pub fn new(color: StrokeColor, thickness: f64) -> Result<Self, ToolError> {
        validate_thickness(thickness)?;
        Ok(Self { color, thickness })
    }

    /// Overpaint with the background color.
    pub fn eraser(thickness: f64) -> Result<Self, ToolError> {
        Self::new(BACKGROUND_COLOR, thickness)
    }

    pub fn is_eraser(&self) -> bool {
        self.color == BACKGROUND_COLOR
    }

    pub fn with_color(self, color: StrokeColor) -> Self {
        Self { color, ..self }
    }

    pub fn with_thickness(self, thickness: f64) -> Result<Self, ToolError> {
        validate_thickness(thickness)?;
        Ok(Self { thickness, ..self })
    }
}

/// Check that a stroke width is usable.
pub fn validate_thickness(thickness: f64) -> Result<(), ToolError> {
    if thickness.is_finite() && thickness > 0.0 {
        Ok(())
    } else {
        Err(ToolError::InvalidThickness(thickness))
    }
}
