//! Shared UI geometry types.
//!
//! These types describe what the engine reports about on-screen nodes and are
//! independent of how a node was found.

use serde::{Deserialize, Serialize};

/// The bounding box of a UI node in screen pixels.
///
/// Coordinates are engine-reported with the origin at the top-left corner of
/// the screen; `left <= right` and `top <= bottom` are the engine's guarantee,
/// not checked here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// The x-coordinate of the left edge.
    pub left: i32,
    /// The y-coordinate of the top edge.
    pub top: i32,
    /// The x-coordinate of the right edge.
    pub right: i32,
    /// The y-coordinate of the bottom edge.
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Returns the center point, where a tap on the node should land.
    pub fn center(&self) -> (i32, i32) {
        (self.left + self.width() / 2, self.top + self.height() / 2)
    }

    /// The whole-screen region, as understood by the region screenshot entry
    /// point.
    pub fn full_screen() -> Self {
        Self::default()
    }
}

/// A point on screen where a finger lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}
