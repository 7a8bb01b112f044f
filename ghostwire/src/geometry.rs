//! Coordinate mapping between capture pixels, window-local points and screen points.
//!
//! Everything here is pure. Screen space is the display-absolute point space the
//! input APIs take; window space is relative to a window's top-left corner.

use serde::{Deserialize, Serialize};

/// A window wider than this share of its display is treated as fullscreen.
pub const FULLSCREEN_WIDTH_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Rounded to whole points, used to compare positions coming from different sources.
    pub fn rounded(&self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.y >= self.y
            && point.x < self.x + self.width
            && point.y < self.y + self.height
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// Whether a window covers (almost) the whole width of its display.
pub fn is_effectively_fullscreen(window: &Rect, display: &Rect) -> bool {
    display.width > 0.0 && window.width > display.width * FULLSCREEN_WIDTH_RATIO
}

/// Maps a normalised grounding point (0..1 on both axes) to screen space.
///
/// A fullscreen capture covers the whole display, so the point scales by the
/// display with no window offset. Otherwise it scales by the captured window and
/// is shifted by the window's on-screen origin.
pub fn grounding_to_screen(normalized: Point, window: &Rect, display: &Rect) -> Point {
    let nx = normalized.x.clamp(0.0, 1.0);
    let ny = normalized.y.clamp(0.0, 1.0);
    if is_effectively_fullscreen(window, display) {
        Point::new(display.x + nx * display.width, display.y + ny * display.height)
    } else {
        Point::new(window.x + nx * window.width, window.y + ny * window.height)
    }
}

/// Maps a capture-image pixel to screen space through its normalised position.
pub fn image_to_screen(pixel: Point, image: Size, window: &Rect, display: &Rect) -> Option<Point> {
    if image.width <= 0.0 || image.height <= 0.0 {
        return None;
    }
    let normalized = Point::new(pixel.x / image.width, pixel.y / image.height);
    Some(grounding_to_screen(normalized, window, display))
}

/// Maps a point in a web renderer's viewport to screen space.
///
/// `content_offset` is where the viewport starts inside the window (toolbar and tab
/// strip height for a browser).
pub fn renderer_to_screen(viewport_point: Point, content_offset: Point, window: &Rect) -> Point {
    Point::new(
        window.x + content_offset.x + viewport_point.x,
        window.y + content_offset.y + viewport_point.y,
    )
}

pub fn screen_to_window(point: Point, window: &Rect) -> Point {
    Point::new(point.x - window.x, point.y - window.y)
}

pub fn window_to_screen(point: Point, window: &Rect) -> Point {
    Point::new(point.x + window.x, point.y + window.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISPLAY: Rect = Rect::new(0.0, 0.0, 1728.0, 1117.0);

    #[test]
    fn fullscreen_window_scales_by_display_without_offset() {
        let window = Rect::new(10.0, 25.0, 1700.0, 1080.0);
        let point = grounding_to_screen(Point::new(0.5, 0.5), &window, &DISPLAY);
        assert_eq!(point, Point::new(864.0, 558.5));
    }

    #[test]
    fn regular_window_scales_by_window_and_adds_origin() {
        let window = Rect::new(200.0, 100.0, 800.0, 600.0);
        let point = grounding_to_screen(Point::new(0.25, 0.5), &window, &DISPLAY);
        assert_eq!(point, Point::new(400.0, 400.0));
    }

    #[test]
    fn fullscreen_threshold_is_exclusive() {
        let exactly_ninety = Rect::new(0.0, 0.0, DISPLAY.width * 0.9, 500.0);
        assert!(!is_effectively_fullscreen(&exactly_ninety, &DISPLAY));
        let wider = Rect::new(0.0, 0.0, DISPLAY.width * 0.91, 500.0);
        assert!(is_effectively_fullscreen(&wider, &DISPLAY));
    }

    #[test]
    fn image_pixels_go_through_normalised_space() {
        let window = Rect::new(100.0, 50.0, 640.0, 480.0);
        // A 2x capture of the window.
        let image = Size::new(1280.0, 960.0);
        let point = image_to_screen(Point::new(640.0, 480.0), image, &window, &DISPLAY);
        assert_eq!(point, Some(Point::new(420.0, 290.0)));
        assert_eq!(
            image_to_screen(Point::new(1.0, 1.0), Size::default(), &window, &DISPLAY),
            None
        );
    }

    #[test]
    fn renderer_points_are_offset_by_window_and_chrome() {
        let window = Rect::new(200.0, 100.0, 1200.0, 800.0);
        let point = renderer_to_screen(Point::new(140.0, 65.0), Point::new(0.0, 80.0), &window);
        assert_eq!(point, Point::new(340.0, 245.0));
        assert_eq!(screen_to_window(point, &window), Point::new(140.0, 145.0));
        assert_eq!(window_to_screen(Point::new(140.0, 145.0), &window), point);
    }

    #[test]
    fn rect_intersection_ignores_empty_rects() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&Rect::new(5.0, 5.0, 10.0, 10.0)));
        assert!(!a.intersects(&Rect::new(10.0, 0.0, 10.0, 10.0)));
        assert!(!a.intersects(&Rect::new(2.0, 2.0, 0.0, 4.0)));
        assert!(a.contains(Point::new(0.0, 9.9)));
        assert!(!a.contains(Point::new(10.0, 5.0)));
    }
}
