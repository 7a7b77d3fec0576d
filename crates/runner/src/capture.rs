//! Screenshot capture
//!
//! Without a selector the viewport screenshot is used as is. With a selector
//! the element is screenshotted directly when it fits in the viewport, and
//! otherwise assembled from viewport-sized tiles:
//!
//! ```text
//!   cols = ceil(w / vw)            rows = ceil(h / vh)
//!   tile (row, col) scrolled to    dx = min(vw*col + left, max(0, right - vw))
//!                                  dy = min(vh*row + top,  max(0, bottom - vh))
//!   last column shifted by         xOffset = fitsH ? left : max(0, cols*vw - w)
//!   last row shifted by            yOffset = fitsV ? top  : max(0, rows*vh - h)
//! ```

use image::{DynamicImage, ImageOutputFormat, RgbaImage};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{RunnerError, RunnerResult};

pub(crate) const HIDE_SCROLL_SCRIPT: &str = r#"
var style = document.createElement('style');
style.setAttribute('type', 'text/css');
style.appendChild(document.createTextNode(arguments[0]));
document.head.appendChild(style);
window.__CREEVEY_RESTORE_SCROLL__ = function () {
  if (document.head.contains(style)) {
    document.head.removeChild(style);
  }
  delete window.__CREEVEY_RESTORE_SCROLL__;
};
window.scrollTo(0, 0);
"#;

pub(crate) const RESTORE_SCROLL_SCRIPT: &str = r#"
if (window.__CREEVEY_RESTORE_SCROLL__) {
  window.__CREEVEY_RESTORE_SCROLL__();
}
"#;

pub(crate) const ELEMENT_RECT_SCRIPT: &str = r#"
var element = document.querySelector(arguments[0]);
var rect = element ? element.getBoundingClientRect() : null;
return {
  elementRect: rect && { left: rect.left, top: rect.top, width: rect.width, height: rect.height },
  windowSize: { width: window.innerWidth, height: window.innerHeight }
};
"#;

pub(crate) const SCROLL_TO_SCRIPT: &str = "window.scrollTo(arguments[0], arguments[1]);";

const HIDE_SCROLL_STYLES: &str = "
html {
  overflow: -moz-scrollbars-none !important;
  -ms-overflow-style: none !important;
}
html::-webkit-scrollbar {
  width: 0 !important;
  height: 0 !important;
}
";

/// Element bounding box in CSS pixels, relative to the viewport
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ElementRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn fits(&self, viewport: ViewportSize) -> bool {
        self.right() <= viewport.width as f64 && self.bottom() <= viewport.height as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Measurement {
    element_rect: Option<ElementRect>,
    window_size: ViewportSize,
}

/// Tile grid of a composite capture
#[derive(Debug, Clone, PartialEq)]
pub struct TileLayout {
    pub viewport: ViewportSize,
    pub rect: ElementRect,
    pub cols: u32,
    pub rows: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
}

impl TileLayout {
    pub fn new(viewport: ViewportSize, rect: ElementRect) -> RunnerResult<Self> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(RunnerError::Capture("viewport has zero size".to_string()));
        }
        let width = rect.width.round() as u32;
        let height = rect.height.round() as u32;
        if width == 0 || height == 0 {
            return Err(RunnerError::Capture("element has zero size".to_string()));
        }

        let (vw, vh) = (viewport.width as f64, viewport.height as f64);
        let cols = (rect.width / vw).ceil() as u32;
        let rows = (rect.height / vh).ceil() as u32;

        let x_offset = if vw >= rect.right() {
            rect.left
        } else {
            (cols as f64 * vw - rect.width).max(0.0)
        };
        let y_offset = if vh >= rect.bottom() {
            rect.top
        } else {
            (rows as f64 * vh - rect.height).max(0.0)
        };

        Ok(Self {
            viewport,
            rect,
            cols,
            rows,
            x_offset: x_offset.round() as u32,
            y_offset: y_offset.round() as u32,
            width,
            height,
        })
    }

    /// Scroll position for one tile, clamped to the element's far edges
    pub fn scroll_target(&self, row: u32, col: u32) -> (f64, f64) {
        let (vw, vh) = (self.viewport.width as f64, self.viewport.height as f64);
        let dx = (vw * col as f64 + self.rect.left).min((self.rect.right() - vw).max(0.0));
        let dy = (vh * row as f64 + self.rect.top).min((self.rect.bottom() - vh).max(0.0));
        (dx, dy)
    }

    pub fn tile_count(&self) -> usize {
        (self.cols * self.rows) as usize
    }
}

/// Assemble tiles (row-major) into one image of the element's size
pub fn stitch(layout: &TileLayout, tiles: &[RgbaImage]) -> RunnerResult<RgbaImage> {
    if tiles.len() != layout.tile_count() {
        return Err(RunnerError::Capture(format!(
            "expected {} tiles, got {}",
            layout.tile_count(),
            tiles.len()
        )));
    }
    let ViewportSize { width: vw, height: vh } = layout.viewport;
    if let Some(tile) = tiles.iter().find(|t| t.width() < vw || t.height() < vh) {
        return Err(RunnerError::Capture(format!(
            "tile of {}x{} is smaller than the {}x{} viewport",
            tile.width(),
            tile.height(),
            vw,
            vh
        )));
    }

    let mut output = RgbaImage::new(layout.width, layout.height);
    for y in 0..layout.height {
        let row = y / vh;
        let last_row = row + 1 == layout.rows;
        for x in 0..layout.width {
            let col = x / vw;
            let last_col = col + 1 == layout.cols;
            let tile = &tiles[(row * layout.cols + col) as usize];

            let sx = x % vw + if last_col { layout.x_offset } else { 0 };
            let sy = y % vh + if last_row { layout.y_offset } else { 0 };
            // rounding of fractional rects can push one pixel past the tile edge
            let sx = sx.min(tile.width() - 1);
            let sy = sy.min(tile.height() - 1);

            output.put_pixel(x, y, *tile.get_pixel(sx, sy));
        }
    }
    Ok(output)
}

pub(crate) fn encode_png(image: RgbaImage) -> RunnerResult<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image).write_to(&mut bytes, ImageOutputFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Hidden scrollbars; must be released with [`ScrollGuard::restore`]
struct ScrollGuard<'a> {
    driver: &'a dyn Driver,
}

impl<'a> ScrollGuard<'a> {
    async fn hide(driver: &'a dyn Driver) -> RunnerResult<ScrollGuard<'a>> {
        if let Err(e) = driver
            .execute(HIDE_SCROLL_SCRIPT, vec![json!(HIDE_SCROLL_STYLES)])
            .await
        {
            restore_scroll(driver).await;
            return Err(e);
        }
        Ok(Self { driver })
    }

    async fn restore(self) {
        restore_scroll(self.driver).await;
    }
}

/// Best-effort teardown of hidden scrollbars; safe to call when nothing is hidden
pub(crate) async fn restore_scroll(driver: &dyn Driver) {
    if let Err(e) = driver.execute(RESTORE_SCROLL_SCRIPT, Vec::new()).await {
        warn!("Failed to restore page scroll: {}", e);
    }
}

/// Capture the viewport, or the element matching `selector`
pub async fn capture(driver: &dyn Driver, selector: Option<&str>) -> RunnerResult<Vec<u8>> {
    let Some(selector) = selector else {
        return driver.screenshot().await;
    };

    let guard = ScrollGuard::hide(driver).await?;
    let result = capture_element(driver, selector).await;
    guard.restore().await;
    result
}

async fn capture_element(driver: &dyn Driver, selector: &str) -> RunnerResult<Vec<u8>> {
    let measurement: Measurement =
        serde_json::from_value(driver.execute(ELEMENT_RECT_SCRIPT, vec![json!(selector)]).await?)?;
    let rect = measurement
        .element_rect
        .ok_or_else(|| RunnerError::Capture(format!("element '{}' not found", selector)))?;
    let viewport = measurement.window_size;

    if rect.fits(viewport) {
        let element = driver.find_element(selector).await?;
        return driver.element_screenshot(&element).await;
    }

    let layout = TileLayout::new(viewport, rect)?;
    debug!(
        "Composite capture of '{}': {}x{} tiles, offsets ({}, {})",
        selector, layout.cols, layout.rows, layout.x_offset, layout.y_offset
    );

    let mut tiles = Vec::with_capacity(layout.tile_count());
    for row in 0..layout.rows {
        for col in 0..layout.cols {
            let (dx, dy) = layout.scroll_target(row, col);
            driver
                .execute(SCROLL_TO_SCRIPT, vec![Value::from(dx), Value::from(dy)])
                .await?;
            let png = driver.screenshot().await?;
            tiles.push(image::load_from_memory(&png)?.to_rgba8());
        }
    }

    encode_png(stitch(&layout, &tiles)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use test_case::test_case;

    fn viewport(width: u32, height: u32) -> ViewportSize {
        ViewportSize { width, height }
    }

    fn rect(left: f64, top: f64, width: f64, height: f64) -> ElementRect {
        ElementRect {
            left,
            top,
            width,
            height,
        }
    }

    #[test_case(viewport(100, 50), rect(0.0, 0.0, 200.0, 50.0), (2, 1), (0, 0) ; "double width element")]
    #[test_case(viewport(100, 100), rect(0.0, 10.0, 100.0, 250.0), (1, 3), (0, 50) ; "last row clamped")]
    #[test_case(viewport(100, 100), rect(20.0, 30.0, 50.0, 40.0), (1, 1), (20, 30) ; "element inside viewport")]
    #[test_case(viewport(100, 100), rect(10.0, 0.0, 150.0, 80.0), (2, 1), (50, 0) ; "last column clamped")]
    fn test_layout_grid_and_offsets(
        view: ViewportSize,
        element: ElementRect,
        grid: (u32, u32),
        offset: (u32, u32),
    ) {
        let layout = TileLayout::new(view, element).unwrap();
        assert_eq!((layout.cols, layout.rows), grid);
        assert_eq!((layout.x_offset, layout.y_offset), offset);
        assert_eq!(layout.tile_count(), (grid.0 * grid.1) as usize);
    }

    #[test_case(0, 0, (0.0, 10.0) ; "first tile")]
    #[test_case(0, 1, (100.0, 10.0) ; "second column")]
    #[test_case(2, 0, (0.0, 160.0) ; "last row stops at bottom edge")]
    fn test_scroll_target(row: u32, col: u32, expected: (f64, f64)) {
        // 200x250 element starting 10px down in a 100x100 viewport
        let layout = TileLayout::new(viewport(100, 100), rect(0.0, 10.0, 200.0, 250.0)).unwrap();
        assert_eq!(layout.scroll_target(row, col), expected);
    }

    #[test]
    fn test_zero_sized_element_is_rejected() {
        assert!(TileLayout::new(viewport(100, 100), rect(0.0, 0.0, 0.0, 20.0)).is_err());
    }

    #[test]
    fn test_stitch_copies_pixels_at_seam() {
        let layout = TileLayout::new(viewport(4, 2), rect(0.0, 0.0, 8.0, 2.0)).unwrap();
        let left = RgbaImage::from_fn(4, 2, |x, _| Rgba([x as u8, 0, 0, 255]));
        let right = RgbaImage::from_fn(4, 2, |x, _| Rgba([10 + x as u8, 0, 0, 255]));

        let output = stitch(&layout, &[left, right]).unwrap();
        assert_eq!(output.dimensions(), (8, 2));
        let row: Vec<u8> = (0..8).map(|x| output.get_pixel(x, 1)[0]).collect();
        assert_eq!(row, vec![0, 1, 2, 3, 10, 11, 12, 13]);
    }

    #[test]
    fn test_stitch_rejects_small_tiles() {
        let layout = TileLayout::new(viewport(4, 2), rect(0.0, 0.0, 8.0, 2.0)).unwrap();
        let tiles = vec![RgbaImage::new(3, 2), RgbaImage::new(4, 2)];
        assert!(matches!(stitch(&layout, &tiles), Err(RunnerError::Capture(_))));
    }
}
