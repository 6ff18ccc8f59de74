//! C19 Building Finder: find and tap buildings on the scrollable city map.
//! Building names only render while the player is pressing and dragging the
//! screen; releasing hides them again. Grounded in full on
//! `original_source/SLGrobot/vision/building_finder.py`.
//!
//! The press-drag-read worker is this engine's one deliberate concurrency
//! exception (spec §5): the swipe blocks for `hold_duration_ms`, so it runs
//! on a blocking-pool task while this task sleeps for `screenshot_delay_ms`
//! and then screenshots mid-hold, joining the swipe task afterward.

use crate::device::DevicePort;
use crate::vision::ocr::{OcrPort, OcrResult};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CityLayoutConfig {
    pub hold_point: (i32, i32),
    pub hold_duration_ms: u64,
    pub screenshot_delay_ms: u64,
    pub drag_offset: i32,
    pub tap_offset_x: i32,
    pub tap_offset_y: i32,
}

impl Default for CityLayoutConfig {
    fn default() -> Self {
        Self {
            hold_point: (540, 960),
            hold_duration_ms: 3000,
            screenshot_delay_ms: 1400,
            drag_offset: 150,
            tap_offset_x: 150,
            tap_offset_y: 150,
        }
    }
}

impl CityLayoutConfig {
    /// Compensates for the map continuing to drift between the mid-hold
    /// screenshot and the finger release.
    fn drift(&self) -> i32 {
        let remaining = 1.0 - (self.screenshot_delay_ms as f64 / self.hold_duration_ms as f64);
        (self.drag_offset as f64 * remaining) as i32
    }
}

/// Parses a markdown table laid out in a "chess board" pattern (buildings on
/// alternating cells matching the isometric view) into
/// `{building_name: (offset_x, offset_y)}` pixel offsets relative to
/// `reference_building`.
pub fn parse_city_layout(
    path: &Path,
    reference_building: &str,
    pixels_per_unit: f64,
) -> anyhow::Result<HashMap<String, (f64, f64)>> {
    let text = std::fs::read_to_string(path)?;
    parse_city_layout_str(&text, reference_building, pixels_per_unit, &path.display().to_string())
}

fn parse_city_layout_str(
    text: &str,
    reference_building: &str,
    pixels_per_unit: f64,
    source_label: &str,
) -> anyhow::Result<HashMap<String, (f64, f64)>> {
    let separator = Regex::new(r"^\|[\s\-|]+\|$").unwrap();
    let mut table_rows: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if !stripped.starts_with('|') {
            continue;
        }
        if separator.is_match(stripped) {
            continue;
        }
        let mut cells: Vec<String> = stripped.split('|').map(|c| c.trim().to_string()).collect();
        if cells.first().map(|c| c.is_empty()).unwrap_or(false) {
            cells.remove(0);
        }
        if cells.last().map(|c| c.is_empty()).unwrap_or(false) {
            cells.pop();
        }
        table_rows.push(cells);
    }

    if table_rows.is_empty() {
        warn!("no table rows found in {source_label}");
        return Ok(HashMap::new());
    }

    let digits = Regex::new(r"^\d+$").unwrap();
    let mut buildings: HashMap<String, (i32, i32)> = HashMap::new();
    let mut reference: Option<(i32, i32)> = None;
    for (row_idx, row) in table_rows.iter().enumerate() {
        for (col_idx, cell) in row.iter().enumerate() {
            let name = cell.trim();
            if name.is_empty() || digits.is_match(name) {
                continue;
            }
            buildings.insert(name.to_string(), (row_idx as i32, col_idx as i32));
            if name == reference_building {
                reference = Some((row_idx as i32, col_idx as i32));
            }
        }
    }

    let (ref_row, ref_col) = match reference {
        Some(r) => r,
        None => {
            warn!("reference building '{reference_building}' not found in {source_label}");
            match buildings.iter().next() {
                Some((_, pos)) => *pos,
                None => return Ok(HashMap::new()),
            }
        }
    };

    let mut result = HashMap::new();
    for (name, (r, c)) in &buildings {
        result.insert(
            name.clone(),
            ((*c - ref_col) as f64 * pixels_per_unit, (*r - ref_row) as f64 * pixels_per_unit),
        );
    }
    info!("parsed city layout: {} buildings, reference='{reference_building}'", result.len());
    Ok(result)
}

/// Fuzzy-matches OCR text against known building names: exact, then
/// substring (OCR text contains a name), then reverse-substring (a name
/// contains truncated OCR text).
fn match_building_name(ocr_text: &str, layout: &HashMap<String, (f64, f64)>, building_names: &[String]) -> Option<String> {
    let text = ocr_text.trim();
    if text.is_empty() {
        return None;
    }
    if layout.contains_key(text) {
        return Some(text.to_string());
    }
    for name in building_names {
        if text.contains(name.as_str()) {
            return Some(name.clone());
        }
    }
    if text.chars().count() >= 2 {
        for name in building_names {
            if name.contains(text) {
                return Some(name.clone());
            }
        }
    }
    None
}

/// Expanding spiral swipe pattern: right, down, left×2, up×2, right×3, ...
fn spiral_pattern(step_size: f64, max_steps: u32) -> Vec<(f64, f64)> {
    const DIRECTIONS: [(f64, f64); 4] = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
    let mut pattern = Vec::new();
    let mut steps_in_leg = 1u32;
    let mut dir_idx = 0usize;
    let mut turns = 0u32;
    while (pattern.len() as u32) < max_steps {
        let (ddx, ddy) = DIRECTIONS[dir_idx % 4];
        for _ in 0..steps_in_leg {
            if (pattern.len() as u32) >= max_steps {
                break;
            }
            pattern.push((ddx * step_size, ddy * step_size));
        }
        dir_idx += 1;
        turns += 1;
        if turns % 2 == 0 {
            steps_in_leg += 1;
        }
    }
    pattern
}

pub struct BuildingFinder {
    device: Arc<DevicePort>,
    ocr: Arc<OcrPort>,
    layout: HashMap<String, (f64, f64)>,
    building_names: Vec<String>,
    config: CityLayoutConfig,
}

impl BuildingFinder {
    pub fn new(
        device: Arc<DevicePort>,
        ocr: Arc<OcrPort>,
        layout: HashMap<String, (f64, f64)>,
        config: CityLayoutConfig,
    ) -> Self {
        let building_names = layout.keys().cloned().collect();
        Self { device, ocr, layout, building_names, config }
    }

    /// 1. Check if already visible. 2. If not and `scroll`, navigate via
    /// layout then retry. 3. Fall back to spiral search.
    pub async fn find_and_tap(&self, target_name: &str, scroll: bool, max_attempts: u32) -> anyhow::Result<bool> {
        info!("BuildingFinder: looking for '{target_name}'");

        if let Some((x, y)) = self.press_drag_read(target_name).await? {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.device.tap(x, y)?;
            info!("BuildingFinder: tapped '{target_name}' at ({x},{y}) (visible without scrolling)");
            return Ok(true);
        }

        if !scroll {
            info!("BuildingFinder: '{target_name}' not visible, scroll=false");
            return Ok(false);
        }

        if self.layout.contains_key(target_name) && self.navigate_to(target_name).await? {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Some((x, y)) = self.press_drag_read(target_name).await? {
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.device.tap(x, y)?;
                info!("BuildingFinder: tapped '{target_name}' at ({x},{y}) (after layout navigation)");
                return Ok(true);
            }
        }

        info!("BuildingFinder: '{target_name}' not found via layout, trying spiral search");
        self.spiral_search(target_name, max_attempts.saturating_mul(4)).await
    }

    pub async fn read_all_buildings(&self) -> anyhow::Result<Vec<(String, i32, i32)>> {
        let results = self.read_all_buildings_raw().await?;
        Ok(results
            .into_iter()
            .map(|r| {
                let (cx, cy) = r.center();
                let name = match_building_name(&r.text, &self.layout, &self.building_names).unwrap_or(r.text);
                (name, cx, cy)
            })
            .collect())
    }

    async fn press_drag_read(&self, target_name: &str) -> anyhow::Result<Option<(i32, i32)>> {
        let results = self.read_all_buildings_raw().await?;
        let drift = self.config.drift();
        let target_lower = target_name.to_lowercase();

        for result in &results {
            if result.text.to_lowercase().contains(&target_lower) {
                let tap_x = result.bbox.x1 + self.config.tap_offset_x + drift;
                let tap_y = result.bbox.y1 + self.config.tap_offset_y + drift;
                info!("BuildingFinder: found '{target_name}' in OCR text='{}' drift={drift}", result.text);
                return Ok(Some((tap_x, tap_y)));
            }
        }
        for result in &results {
            if let Some(matched) = match_building_name(&result.text, &self.layout, &self.building_names) {
                if matched.to_lowercase().contains(&target_lower) {
                    let tap_x = result.bbox.x1 + self.config.tap_offset_x + drift;
                    let tap_y = result.bbox.y1 + self.config.tap_offset_y + drift;
                    info!("BuildingFinder: fuzzy matched '{target_name}' via '{}' -> '{matched}'", result.text);
                    return Ok(Some((tap_x, tap_y)));
                }
            }
        }
        debug!("BuildingFinder: '{target_name}' not found in {} OCR results", results.len());
        Ok(None)
    }

    async fn read_all_buildings_raw(&self) -> anyhow::Result<Vec<OcrResult>> {
        let (hx, hy) = self.config.hold_point;
        let dx = self.config.drag_offset;
        let hold_duration_ms = self.config.hold_duration_ms;
        let device = self.device.clone();

        let swipe_task = tokio::task::spawn_blocking(move || device.swipe(hx, hy, hx + dx, hy + dx, hold_duration_ms));

        tokio::time::sleep(Duration::from_millis(self.config.screenshot_delay_ms)).await;

        let frame = match self.device.capture() {
            Ok(f) => f,
            Err(e) => {
                warn!("BuildingFinder: screenshot during hold failed: {e}");
                let _ = swipe_task.await;
                return Ok(Vec::new());
            }
        };
        let all_text = self.ocr.recognize(&frame.mat)?;
        let _ = swipe_task.await;
        Ok(all_text)
    }

    fn estimate_position(&self, visible: &[OcrResult]) -> (f64, f64) {
        let (screen_cx, screen_cy) = (540.0, 960.0);
        let estimates: Vec<(f64, f64)> = visible
            .iter()
            .filter_map(|r| {
                let (cx, cy) = r.center();
                let name = match_building_name(&r.text, &self.layout, &self.building_names)?;
                let &(layout_x, layout_y) = self.layout.get(&name)?;
                Some((layout_x - (cx as f64 - screen_cx), layout_y - (cy as f64 - screen_cy)))
            })
            .collect();
        if estimates.is_empty() {
            return (0.0, 0.0);
        }
        let n = estimates.len() as f64;
        (
            estimates.iter().map(|(x, _)| x).sum::<f64>() / n,
            estimates.iter().map(|(_, y)| y).sum::<f64>() / n,
        )
    }

    async fn navigate_to(&self, target_name: &str) -> anyhow::Result<bool> {
        let visible = self.read_all_buildings_raw().await?;
        let current = self.estimate_position(&visible);
        let Some(&target) = self.layout.get(target_name) else {
            warn!("BuildingFinder: '{target_name}' not in layout");
            return Ok(false);
        };
        let dx = target.0 - current.0;
        let dy = target.1 - current.1;
        if dx.abs() < 50.0 && dy.abs() < 50.0 {
            debug!("BuildingFinder: target already nearby, skip scroll");
            return Ok(true);
        }
        self.scroll_by(-dx, -dy).await?;
        info!("BuildingFinder: navigated toward '{target_name}' delta=({dx:.0},{dy:.0})");
        Ok(true)
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
        const MAX_SWIPE: f64 = 400.0;
        let (sx, sy) = (540.0_f64, 960.0_f64);
        let mut remaining_dx = dx;
        let mut remaining_dy = dy;
        while remaining_dx.abs() > 20.0 || remaining_dy.abs() > 20.0 {
            let step_dx = remaining_dx.clamp(-MAX_SWIPE, MAX_SWIPE);
            let step_dy = remaining_dy.clamp(-MAX_SWIPE, MAX_SWIPE);
            let ex = ((sx + step_dx) as i32).clamp(100, 980);
            let ey = ((sy + step_dy) as i32).clamp(300, 1600);
            self.device.swipe(sx as i32, sy as i32, ex, ey, 400)?;
            tokio::time::sleep(Duration::from_millis(300)).await;
            remaining_dx -= step_dx;
            remaining_dy -= step_dy;
        }
        Ok(())
    }

    async fn spiral_search(&self, target_name: &str, max_steps: u32) -> anyhow::Result<bool> {
        const STEP_SIZE: f64 = 300.0;
        for (dx, dy) in spiral_pattern(STEP_SIZE, max_steps) {
            self.scroll_by(dx, dy).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Some((x, y)) = self.press_drag_read(target_name).await? {
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.device.tap(x, y)?;
                info!("BuildingFinder: tapped '{target_name}' at ({x},{y}) (found via spiral search)");
                return Ok(true);
            }
        }
        warn!("BuildingFinder: '{target_name}' not found after {max_steps} spiral steps");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TABLE: &str = "\
| 1 | 2 | 3 |\n\
|---|---|---|\n\
| 农场 |   | 城堡 |\n\
|   | 兵营 |   |\n";

    #[test]
    fn parses_layout_relative_to_reference_building() {
        let layout = parse_city_layout_str(SAMPLE_TABLE, "城堡", 400.0, "test").unwrap();
        assert_eq!(layout.get("城堡"), Some(&(0.0, 0.0)));
        assert_eq!(layout.get("农场"), Some(&(-800.0, 0.0)));
        assert_eq!(layout.get("兵营"), Some(&(-400.0, 400.0)));
    }

    #[test]
    fn falls_back_to_first_building_when_reference_missing() {
        let layout = parse_city_layout_str(SAMPLE_TABLE, "不存在", 400.0, "test").unwrap();
        assert_eq!(layout.len(), 3);
    }

    #[test]
    fn match_building_name_prefers_exact_then_substring_then_reverse() {
        let layout: HashMap<String, (f64, f64)> =
            [("兵营".to_string(), (0.0, 0.0)), ("城堡".to_string(), (0.0, 0.0))].into_iter().collect();
        let names: Vec<String> = layout.keys().cloned().collect();
        assert_eq!(match_building_name("兵营", &layout, &names), Some("兵营".to_string()));
        assert_eq!(match_building_name("我的兵营啊", &layout, &names), Some("兵营".to_string()));
        assert_eq!(match_building_name("兵", &layout, &names), Some("兵营".to_string()));
        assert_eq!(match_building_name("", &layout, &names), None);
    }

    #[test]
    fn spiral_pattern_expands_legs_every_two_turns() {
        let pattern = spiral_pattern(1.0, 7);
        // R, D, L, L, U, U, R
        assert_eq!(
            pattern,
            vec![(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (-1.0, 0.0), (0.0, -1.0), (0.0, -1.0), (1.0, 0.0)]
        );
    }

    #[test]
    fn drift_compensates_for_remaining_hold_time() {
        let cfg = CityLayoutConfig::default();
        // remaining = 1 - 1400/3000 = 0.5333..., drag_offset=150 -> ~80
        assert_eq!(cfg.drift(), 80);
    }
}
