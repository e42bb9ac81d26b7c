//! Per-user colors.
//!
//! Every user gets a stable hue derived from their opaque id. The color is
//! snapshotted into each annotation/highlight the user writes, so the
//! persisted form is the CSS string the web client renders directly:
//!
//! ```text
//! user id ──fnv1a64──► hue (0..360) ──► Color { h, 70%, 60% }
//!                                          │
//!                    ┌─────────────────────┼─────────────────────┐
//!                    ▼                     ▼                     ▼
//!            "hsl(h, 70%, 60%)"   "hsla(h, 70%, 60%, 0.3)"   [r, g, b, a]
//!              (annotations)          (highlights)           (renderers)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Saturation used for every derived user color.
pub const USER_SATURATION: u8 = 70;
/// Lightness used for every derived user color.
pub const USER_LIGHTNESS: u8 = 60;
/// Opacity applied to highlight fills.
pub const HIGHLIGHT_ALPHA: f32 = 0.3;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// HSL color with optional alpha, persisted as a CSS color string.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    /// Hue in degrees, 0..360
    pub hue: u16,
    /// Saturation in percent
    pub saturation: u8,
    /// Lightness in percent
    pub lightness: u8,
    /// Opacity in 0.0..=1.0 (None = opaque, rendered as `hsl(...)`)
    pub alpha: Option<f32>,
}

impl Color {
    pub fn hsl(hue: u16, saturation: u8, lightness: u8) -> Self {
        Self {
            hue: hue % 360,
            saturation: saturation.min(100),
            lightness: lightness.min(100),
            alpha: None,
        }
    }

    /// Same color at the given opacity.
    pub fn with_alpha(self, alpha: f32) -> Self {
        Self {
            alpha: Some(alpha.clamp(0.0, 1.0)),
            ..self
        }
    }

    /// Same color, fully opaque.
    pub fn opaque(self) -> Self {
        Self { alpha: None, ..self }
    }

    /// CSS form: `hsl(h, s%, l%)` or `hsla(h, s%, l%, a)`.
    pub fn to_css(&self) -> String {
        match self.alpha {
            Some(a) => format!(
                "hsla({}, {}%, {}%, {a})",
                self.hue, self.saturation, self.lightness
            ),
            None => format!("hsl({}, {}%, {}%)", self.hue, self.saturation, self.lightness),
        }
    }

    /// Parse the CSS form produced by [`Color::to_css`].
    pub fn parse_css(css: &str) -> Result<Self, ColorParseError> {
        let css = css.trim();
        let (body, has_alpha) = if let Some(rest) = css.strip_prefix("hsla(") {
            (rest, true)
        } else if let Some(rest) = css.strip_prefix("hsl(") {
            (rest, false)
        } else {
            return Err(ColorParseError(css.to_string()));
        };
        let body = body
            .strip_suffix(')')
            .ok_or_else(|| ColorParseError(css.to_string()))?;

        let parts: Vec<&str> = body.split(',').map(str::trim).collect();
        let expected = if has_alpha { 4 } else { 3 };
        if parts.len() != expected {
            return Err(ColorParseError(css.to_string()));
        }

        let bad = || ColorParseError(css.to_string());
        let hue: f32 = parts[0].parse().map_err(|_| bad())?;
        let saturation: u8 = parts[1].trim_end_matches('%').parse().map_err(|_| bad())?;
        let lightness: u8 = parts[2].trim_end_matches('%').parse().map_err(|_| bad())?;

        let mut color = Color::hsl(hue.rem_euclid(360.0) as u16, saturation, lightness);
        if has_alpha {
            let alpha: f32 = parts[3].parse().map_err(|_| bad())?;
            color = color.with_alpha(alpha);
        }
        Ok(color)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_css())
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_css()
    }
}

impl TryFrom<String> for Color {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse_css(&value)
    }
}

/// A color string that is not in `hsl(...)`/`hsla(...)` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid color: {0:?}")]
pub struct ColorParseError(pub String);

/// Derive the stable color for a user id.
///
/// The hue comes from a 64-bit FNV-1a hash of the id bytes, so it is the
/// same on every platform and every run.
pub fn color_for_user_id(id: &str) -> Color {
    let hue = (fnv1a64(id.as_bytes()) % 360) as u16;
    Color::hsl(hue, USER_SATURATION, USER_LIGHTNESS)
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}
