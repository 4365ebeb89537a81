//! Colours, feature styles and the per-project style library.
//!
//! Features reference their style by value (`foreground`, `background`, `thickness`).
//! The [`StyleLibrary`] hands out one shared [`Style`] per distinct combination, so a
//! layer with thousands of features drawn in the same colours holds a single style.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ProjectError;

/// RGBA colour with `u8` channels (straight alpha).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
    /// Alpha channel (opacity)
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Color {
        Color::rgba(r, g, b, 255)
    }

    pub fn to_rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Formats as `#rrggbbaa`.
impl Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

impl FromStr for Color {
    type Err = ProjectError;

    /// Parses `#rrggbb` or `#rrggbbaa`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        let invalid = || ProjectError::Storage(format!("invalid color: {s:?}"));
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(invalid());
        }

        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        let a = if hex.len() == 8 { channel(6)? } else { 255 };
        Ok(Color::rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a feature is drawn: stroke colour, fill colour and stroke width in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Style {
    pub foreground: Color,
    pub background: Color,
    pub thickness: u32,
}

impl Style {
    pub fn new(foreground: Color, background: Color, thickness: u32) -> Self {
        Self { foreground, background, thickness }
    }
}

impl Default for Style {
    fn default() -> Self {
        Self::new(Color::BLACK, Color::WHITE, 1)
    }
}

/// Builds and stores styles, one shared instance per distinct style.
#[derive(Debug, Default)]
pub struct StyleLibrary {
    styles: RwLock<HashMap<Style, Arc<Style>>>,
}

impl StyleLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared style for this combination, creating it on first use.
    pub fn style_for(&self, foreground: Color, background: Color, thickness: u32) -> Arc<Style> {
        let key = Style::new(foreground, background, thickness);

        if let Ok(styles) = self.styles.read() {
            if let Some(style) = styles.get(&key) {
                return style.clone();
            }
        }

        match self.styles.write() {
            Ok(mut styles) => styles.entry(key).or_insert_with(|| Arc::new(key)).clone(),
            // A poisoned library still answers, it only stops sharing.
            Err(_) => Arc::new(key),
        }
    }

    pub fn len(&self) -> usize {
        self.styles.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_hex_round_trip() {
        let c = Color::rgba(0x12, 0xab, 0x00, 0x80);
        assert_eq!(c.to_string(), "#12ab0080");
        assert_eq!("#12ab0080".parse::<Color>().unwrap(), c);
        assert_eq!("#ffffff".parse::<Color>().unwrap(), Color::WHITE);
        assert!("#12345".parse::<Color>().is_err());
        assert!("#zzzzzz".parse::<Color>().is_err());
    }

    #[test]
    fn library_shares_identical_styles() {
        let lib = StyleLibrary::new();
        let a = lib.style_for(Color::BLACK, Color::WHITE, 2);
        let b = lib.style_for(Color::BLACK, Color::WHITE, 2);
        let c = lib.style_for(Color::BLACK, Color::WHITE, 3);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(lib.len(), 2);
    }
}
