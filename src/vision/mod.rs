//! C2-C6: template storage, template matching, OCR, grid overlay and the
//! unified element-locate facade built on top of them.

pub mod element_detector;
pub mod ocr;
pub mod grid;
pub mod template_matcher;
pub mod template_store;

/// A single detection result unified across match sources (spec §3 Element).
#[derive(Debug, Clone, PartialEq)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn overlaps_by_more_than_half(&self, other: &BBox) -> bool {
        let half_w = self.width().min(other.width()) / 2;
        let half_h = self.height().min(other.height()) / 2;
        let dx = (self.center().0 - other.center().0).abs();
        let dy = (self.center().1 - other.center().1).abs();
        dx < half_w && dy < half_h
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSource {
    Template,
    Ocr,
    Contour,
    Grid,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub source: ElementSource,
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Element {
    pub fn center(&self) -> (i32, i32) {
        self.bbox.center()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_center_and_validity() {
        let b = BBox::new(10, 20, 110, 120);
        assert_eq!(b.center(), (60, 70));
        assert!(b.is_valid());
        assert!(!BBox::new(10, 10, 10, 20).is_valid());
    }

    #[test]
    fn overlap_detection_respects_half_dimension_rule() {
        let a = BBox::new(0, 0, 100, 100);
        let b = BBox::new(40, 40, 140, 140);
        assert!(a.overlaps_by_more_than_half(&b));
        let c = BBox::new(90, 90, 190, 190);
        assert!(!a.overlaps_by_more_than_half(&c));
    }
}
