//! Page Driver
//!
//! The executor's only wire dependency: a small capability set against a live
//! page. Any automation backend (CDP browser, headless browser, simulated DOM)
//! can supply it.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use simulated::{SimulatedElement, SimulatedPage, SimulatedPageBuilder};

/// Opaque handle to an element in the driven page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

/// Point in viewport coordinates
pub type Point = (f64, f64);

/// Bounding box of an element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// X coordinate (left edge)
    pub x: f64,
    /// Y coordinate (top edge)
    pub y: f64,
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl BoundingBox {
    /// Get the center point
    pub fn center(&self) -> Point {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Whether the point falls inside the box (edges inclusive)
    pub fn contains(&self, (px, py): Point) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }
}

/// Pointer event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PointerKind {
    Moved,
    Pressed,
    Released,
}

/// Synthetic pointer event dispatched to the page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub x: f64,
    pub y: f64,
}

impl PointerEvent {
    pub fn moved(x: f64, y: f64) -> Self {
        Self {
            kind: PointerKind::Moved,
            x,
            y,
        }
    }

    pub fn pressed(x: f64, y: f64) -> Self {
        Self {
            kind: PointerKind::Pressed,
            x,
            y,
        }
    }

    pub fn released(x: f64, y: f64) -> Self {
        Self {
            kind: PointerKind::Released,
            x,
            y,
        }
    }
}

/// `document.readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    /// Parse the string the page reports
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(ReadyState::Loading),
            "interactive" => Some(ReadyState::Interactive),
            "complete" => Some(ReadyState::Complete),
            _ => None,
        }
    }
}

/// Capability set the executor needs from a page.
///
/// Selectors are CSS selector lists; backends may support any subset of CSS
/// as long as the configured selectors resolve. Methods must not block the
/// thread: every call is a suspension point for the cooperative executor.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Identifier of the current page context (changes when a fresh document
    /// environment is created, e.g. a new tab or a hard reload without init
    /// scripts)
    async fn context_id(&self) -> Result<String>;

    /// First element matching the selector, if any
    async fn query(&self, selector: &str) -> Result<Option<ElementHandle>>;

    /// All elements matching the selector, in document order
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>>;

    /// Rendered box of the element, `None` when it is not rendered
    async fn bounding_box(&self, element: ElementHandle) -> Result<Option<BoundingBox>>;

    /// Visible text of the element
    async fn read_text(&self, element: ElementHandle) -> Result<String>;

    /// Attribute value of the element
    async fn attribute(&self, element: ElementHandle, name: &str) -> Result<Option<String>>;

    /// Visible text of the whole document
    async fn page_text(&self) -> Result<String>;

    /// Dispatch a synthetic pointer event at viewport coordinates
    async fn dispatch_pointer(&self, event: PointerEvent) -> Result<()>;

    /// Scroll the viewport vertically
    async fn scroll_by(&self, delta_y: f64) -> Result<()>;

    /// Current `document.readyState`
    async fn ready_state(&self) -> Result<ReadyState>;

    /// Register a script to run before any page script in every new document
    async fn add_init_script(&self, script: &str) -> Result<()>;

    /// Evaluate an expression in the current document
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_center_and_contains() {
        let b = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(b.center(), (60.0, 40.0));
        assert!(b.contains((10.0, 20.0)));
        assert!(b.contains((110.0, 60.0)));
        assert!(!b.contains((111.0, 40.0)));
    }

    #[test]
    fn test_ready_state_parse() {
        assert_eq!(ReadyState::parse("complete"), Some(ReadyState::Complete));
        assert_eq!(ReadyState::parse("loading"), Some(ReadyState::Loading));
        assert_eq!(ReadyState::parse("bogus"), None);
    }
}
