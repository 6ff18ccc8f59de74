//! C5 Grid Overlay: bidirectional map between screen coordinates and A1..Hn
//! labels, used as the fallback locate method and by quest-script
//! `target_text` validation (spec §4.13).

#[derive(Debug, Clone, Copy)]
pub struct GridOverlay {
    pub screen_w: i32,
    pub screen_h: i32,
    pub cols: u32,
    pub rows: u32,
}

impl GridOverlay {
    pub fn new(screen_w: i32, screen_h: i32, cols: u32, rows: u32) -> Self {
        Self {
            screen_w,
            screen_h,
            cols,
            rows,
        }
    }

    fn cell_w(&self) -> i32 {
        self.screen_w / self.cols as i32
    }

    fn cell_h(&self) -> i32 {
        self.screen_h / self.rows as i32
    }

    /// Label like "C3" for the cell containing (x, y). Columns are letters
    /// A..; rows are 1-based numbers.
    pub fn label_at(&self, x: i32, y: i32) -> Option<String> {
        if x < 0 || y < 0 || x >= self.screen_w || y >= self.screen_h {
            return None;
        }
        let col = (x / self.cell_w()).min(self.cols as i32 - 1);
        let row = (y / self.cell_h()).min(self.rows as i32 - 1);
        Some(format!("{}{}", Self::col_letter(col as u32), row + 1))
    }

    /// Center pixel coordinates of a labeled cell, e.g. `"C3"`.
    pub fn center_of(&self, label: &str) -> Option<(i32, i32)> {
        let (col_part, row_part) = label.split_at(label.find(|c: char| c.is_ascii_digit())?);
        let col = Self::letter_col(col_part)?;
        let row: u32 = row_part.parse().ok()?;
        if col >= self.cols || row == 0 || row > self.rows {
            return None;
        }
        let cw = self.cell_w();
        let ch = self.cell_h();
        let x = col as i32 * cw + cw / 2;
        let y = (row as i32 - 1) * ch + ch / 2;
        Some((x, y))
    }

    fn col_letter(mut col: u32) -> String {
        // Supports single or multi-letter columns (A..Z, AA.., ...).
        let mut letters = Vec::new();
        loop {
            letters.push((b'A' + (col % 26) as u8) as char);
            if col < 26 {
                break;
            }
            col = col / 26 - 1;
        }
        letters.iter().rev().collect()
    }

    fn letter_col(letters: &str) -> Option<u32> {
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let mut col = 0u32;
        for c in letters.chars() {
            col = col * 26 + (c as u32 - 'A' as u32 + 1);
        }
        Some(col - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_and_center_round_trip() {
        let grid = GridOverlay::new(1080, 1920, 8, 6);
        let label = grid.label_at(0, 0).unwrap();
        assert_eq!(label, "A1");
        let center = grid.center_of("A1").unwrap();
        assert_eq!(center, (1080 / 8 / 2, 1920 / 6 / 2));
    }

    #[test]
    fn out_of_bounds_point_has_no_label() {
        let grid = GridOverlay::new(1080, 1920, 8, 6);
        assert!(grid.label_at(-1, 0).is_none());
        assert!(grid.label_at(0, 1920).is_none());
    }

    #[test]
    fn invalid_labels_return_none() {
        let grid = GridOverlay::new(1080, 1920, 8, 6);
        assert!(grid.center_of("Z9").is_none());
        assert!(grid.center_of("A0").is_none());
    }
}
