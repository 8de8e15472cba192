//! UI hierarchy simplification.
//!
//! Turns a raw uiautomator XML dump into a compact, model-readable list of
//! elements. Each element gets a stable 1-based index assigned in document
//! order, so the same on-screen layout always yields the same indices within
//! a step. Nodes that are disabled, invisible, zero-area, outside the
//! viewport, or neither interactive nor labeled are filtered out; this is a
//! size reduction only, with no semantic rewriting.

use serde::{Deserialize, Serialize};

/// Longest text fragment carried into the element listing
const MAX_TEXT_LEN: usize = 200;

/// Result type for simplification
pub type SimplifyResult<T> = Result<T, SimplifyError>;

/// Errors raised while parsing a UI hierarchy dump
#[derive(Debug)]
pub enum SimplifyError {
    /// The dump is not well-formed XML
    Malformed(String),
}

impl std::fmt::Display for SimplifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimplifyError::Malformed(msg) => write!(f, "Malformed UI dump: {}", msg),
        }
    }
}

impl std::error::Error for SimplifyError {}

impl From<roxmltree::Error> for SimplifyError {
    fn from(e: roxmltree::Error) -> Self {
        SimplifyError::Malformed(e.to_string())
    }
}

/// Screen area used for the off-screen filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: i32,
    pub height: i32,
}

impl Default for Viewport {
    fn default() -> Self {
        // Common phone resolution, used when `wm size` is unavailable.
        Self {
            width: 1080,
            height: 1920,
        }
    }
}

/// Pixel rectangle in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    /// Parse the uiautomator `[x1,y1][x2,y2]` bounds format
    pub fn parse(s: &str) -> Option<Self> {
        let mut coords = [0i32; 4];
        let mut n = 0;
        for part in s.split(['[', ']', ',']) {
            if part.is_empty() {
                continue;
            }
            if n == 4 {
                return None;
            }
            coords[n] = part.trim().parse().ok()?;
            n += 1;
        }
        if n != 4 {
            return None;
        }
        Some(Self {
            left: coords[0],
            top: coords[1],
            right: coords[2],
            bottom: coords[3],
        })
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Center point, the coordinate taps and swipes are aimed at
    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn is_zero_area(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// True if the rectangle overlaps the viewport at all
    pub fn intersects(&self, viewport: Viewport) -> bool {
        self.top < viewport.height && self.bottom > 0 && self.left < viewport.width && self.right > 0
    }
}

/// One interactive or labeled element of the simplified hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// 1-based index, stable within one observation
    pub index: u32,

    /// Widget class name (full Android class path)
    pub class: String,

    /// Visible text, truncated
    pub text: String,

    /// Accessibility description, truncated
    pub content_desc: String,

    /// Resource identifier, if any
    pub resource_id: String,

    /// Screen rectangle
    pub bounds: Bounds,

    pub clickable: bool,
    pub long_clickable: bool,
    pub scrollable: bool,
    /// Text-entry widget (EditText family)
    pub editable: bool,
    pub checkable: bool,
    pub checked: bool,
    pub selected: bool,
    pub password: bool,
}

impl Element {
    /// Short class name used in listings (`android.widget.Button` -> `Button`)
    pub fn short_class(&self) -> &str {
        self.class.rsplit('.').next().unwrap_or(&self.class)
    }
}

fn attr_true(node: roxmltree::Node<'_, '_>, name: &str) -> bool {
    node.attribute(name) == Some("true")
}

fn truncated(s: &str) -> String {
    if s.chars().count() > MAX_TEXT_LEN {
        let cut: String = s.chars().take(MAX_TEXT_LEN).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

/// True for nodes worth showing to the model: enabled, displayed, and either
/// interactive or carrying a label.
fn is_actionable(node: roxmltree::Node<'_, '_>) -> bool {
    if node.attribute("displayed") == Some("false") || !attr_true(node, "enabled") {
        return false;
    }
    let interactive = attr_true(node, "clickable")
        || attr_true(node, "long-clickable")
        || attr_true(node, "scrollable")
        || attr_true(node, "focusable");
    let labeled = node.attribute("text").is_some_and(|t| !t.is_empty())
        || node.attribute("content-desc").is_some_and(|d| !d.is_empty());
    interactive || labeled
}

/// Simplify a raw uiautomator dump into an ordered element list.
///
/// Traversal is document order, so repeated calls over the same dump produce
/// identical indices. Malformed XML is the only failure mode.
pub fn simplify(xml: &str, viewport: Viewport) -> SimplifyResult<Vec<Element>> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut elements = Vec::new();
    let mut index = 1u32;

    for node in doc.descendants() {
        if !node.is_element() || !node.has_tag_name("node") {
            continue;
        }
        let Some(bounds) = node.attribute("bounds").and_then(Bounds::parse) else {
            continue;
        };
        if bounds.is_zero_area() || !bounds.intersects(viewport) {
            continue;
        }
        if !is_actionable(node) {
            continue;
        }

        let class = node.attribute("class").unwrap_or("").to_string();
        elements.push(Element {
            index,
            editable: class.ends_with("EditText"),
            text: truncated(node.attribute("text").unwrap_or("")),
            content_desc: truncated(node.attribute("content-desc").unwrap_or("")),
            resource_id: node.attribute("resource-id").unwrap_or("").to_string(),
            bounds,
            clickable: attr_true(node, "clickable"),
            long_clickable: attr_true(node, "long-clickable"),
            scrollable: attr_true(node, "scrollable"),
            checkable: attr_true(node, "checkable"),
            checked: attr_true(node, "checked"),
            selected: attr_true(node, "selected"),
            password: attr_true(node, "password"),
            class,
        });
        index += 1;
    }

    Ok(elements)
}

/// Render the element list in the line format sent to the model:
/// `[3] Button {text='OK', id='com.app:id/ok', clickable, bounds=[0,0][100,50]}`
pub fn render_elements(elements: &[Element]) -> String {
    let mut out = String::new();
    for el in elements {
        let mut parts: Vec<String> = Vec::new();
        if !el.text.is_empty() {
            parts.push(format!("text='{}'", el.text));
        }
        if !el.content_desc.is_empty() {
            parts.push(format!("desc='{}'", el.content_desc));
        }
        if !el.resource_id.is_empty() {
            parts.push(format!("id='{}'", el.resource_id));
        }
        if el.password {
            parts.push("is_password".to_string());
        }
        if el.checkable {
            parts.push("checkable".to_string());
            parts.push(if el.checked { "checked" } else { "unchecked" }.to_string());
        }
        if el.selected {
            parts.push("selected".to_string());
        }
        if el.clickable {
            parts.push("clickable".to_string());
        }
        if el.scrollable {
            parts.push("scrollable".to_string());
        }
        if el.editable {
            parts.push("editable".to_string());
        }
        let b = el.bounds;
        parts.push(format!(
            "bounds=[{},{}][{},{}]",
            b.left, b.top, b.right, b.bottom
        ));

        out.push_str(&format!(
            "[{}] {} {{{}}}\n",
            el.index,
            el.short_class(),
            parts.join(", ")
        ));
    }
    out
}

/// Look up an element by its listing index
pub fn find_element(elements: &[Element], index: u32) -> Option<&Element> {
    elements.iter().find(|el| el.index == index)
}
