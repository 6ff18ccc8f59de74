//! C9 Finger Detector: two-stage template+masked-NCC verification across
//! orientation variants, with per-orientation fingertip offsets. Grounded on
//! spec §4.6.

use crate::vision::template_store::{Template, TemplateStore};
use opencv::core::{Mat, MatTraitConst, Point, Rect};
use opencv::imgproc;
use opencv::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Normal,
    FlipH,
    FlipV,
    FlipBoth,
    Cw117,
}

impl Orientation {
    pub const ALL: [Orientation; 5] = [
        Orientation::Normal,
        Orientation::FlipH,
        Orientation::FlipV,
        Orientation::FlipBoth,
        Orientation::Cw117,
    ];

    /// Fingertip offset relative to the matched template center, specific to
    /// each orientation. The CW117 variant uses its own precomputed offset
    /// rather than a rotation of the baseline (spec §4.6).
    pub fn fingertip_offset(&self) -> (i32, i32) {
        const BASE: (i32, i32) = (-25, 43);
        match self {
            Orientation::Normal => BASE,
            Orientation::FlipH => (-BASE.0, BASE.1),
            Orientation::FlipV => (BASE.0, -BASE.1),
            Orientation::FlipBoth => (-BASE.0, -BASE.1),
            Orientation::Cw117 => (-27, -42),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerMatch {
    pub orientation: Orientation,
    pub ccorr_confidence: f32,
    pub ncc_confidence: f32,
    pub center: (i32, i32),
    pub fingertip: (i32, i32),
}

pub struct FingerDetector<'a> {
    pub templates: &'a TemplateStore,
    pub ccorr_min: f32,
    pub ncc_min: f32,
}

impl<'a> FingerDetector<'a> {
    pub fn detect(&self, frame: &Mat) -> anyhow::Result<Option<FingerMatch>> {
        let Some(base) = self.templates.get("icons/tutorial_finger") else {
            return Ok(None);
        };

        let mut best: Option<FingerMatch> = None;
        for orientation in Orientation::ALL {
            let variant = Self::make_variant(&base, orientation)?;
            let Some(candidate) = Self::stage1(frame, &variant, self.ccorr_min)? else {
                continue;
            };
            let ncc = Self::stage2(frame, &variant, candidate.1)?;
            if ncc < self.ncc_min {
                continue;
            }
            let (ox, oy) = orientation.fingertip_offset();
            let fingertip = (
                (candidate.1 .0 + ox).clamp(0, frame.cols() - 1),
                (candidate.1 .1 + oy).clamp(0, frame.rows() - 1),
            );
            let found = FingerMatch {
                orientation,
                ccorr_confidence: candidate.0,
                ncc_confidence: ncc,
                center: candidate.1,
                fingertip,
            };
            if best.as_ref().map(|b| found.ccorr_confidence > b.ccorr_confidence).unwrap_or(true) {
                best = Some(found);
            }
        }
        Ok(best)
    }

    fn make_variant(base: &Template, orientation: Orientation) -> anyhow::Result<Template> {
        let (image, mask) = match orientation {
            Orientation::Normal => (base.image.clone(), base.mask.clone()),
            Orientation::FlipH => (flip(&base.image, 1)?, base.mask.as_ref().map(|m| flip(m, 1)).transpose()?),
            Orientation::FlipV => (flip(&base.image, 0)?, base.mask.as_ref().map(|m| flip(m, 0)).transpose()?),
            Orientation::FlipBoth => (flip(&base.image, -1)?, base.mask.as_ref().map(|m| flip(m, -1)).transpose()?),
            Orientation::Cw117 => (rotate(&base.image, 117.0)?, base.mask.as_ref().map(|m| rotate(m, 117.0)).transpose()?),
        };
        Ok(Template {
            name: base.name.clone(),
            image,
            mask,
        })
    }

    /// Stage 1: masked CCORR_NORMED sensitive scan.
    fn stage1(frame: &Mat, template: &Template, threshold: f32) -> anyhow::Result<Option<(f32, (i32, i32))>> {
        let mut result = Mat::default();
        match &template.mask {
            Some(mask) => imgproc::match_template(
                frame,
                &template.image,
                &mut result,
                imgproc::TM_CCORR_NORMED,
                mask,
            )?,
            None => imgproc::match_template(
                frame,
                &template.image,
                &mut result,
                imgproc::TM_CCORR_NORMED,
                &opencv::core::no_array(),
            )?,
        }
        let mut max_val = 0.0;
        let mut max_loc = Point::default();
        opencv::core::min_max_loc(
            &result,
            None,
            Some(&mut max_val),
            None,
            Some(&mut max_loc),
            &opencv::core::no_array(),
        )?;
        if max_val < threshold as f64 {
            return Ok(None);
        }
        let tw = template.image.cols();
        let th = template.image.rows();
        let center = (max_loc.x + tw / 2, max_loc.y + th / 2);
        Ok(Some((max_val as f32, center)))
    }

    /// Stage 2: hand-rolled normalized cross-correlation restricted to the
    /// opaque template pixels, at the candidate center. Discriminates a real
    /// hand glyph from a background gradient the sensitive stage-1 scan lets
    /// through.
    fn stage2(frame: &Mat, template: &Template, center: (i32, i32)) -> anyhow::Result<f32> {
        let tw = template.image.cols();
        let th = template.image.rows();
        let x1 = center.0 - tw / 2;
        let y1 = center.1 - th / 2;
        if x1 < 0 || y1 < 0 || x1 + tw > frame.cols() || y1 + th > frame.rows() {
            return Ok(0.0);
        }
        let rect = Rect::new(x1, y1, tw, th);
        let patch = Mat::roi(frame, rect)?;

        let mut patch_gray = Mat::default();
        imgproc::cvt_color(
            &patch,
            &mut patch_gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        let mut template_gray = Mat::default();
        imgproc::cvt_color(
            &template.image,
            &mut template_gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let mask = template.mask.clone().unwrap_or_else(|| {
            Mat::new_rows_cols_with_default(
                th,
                tw,
                opencv::core::CV_8UC1,
                opencv::core::Scalar::all(255.0),
            )
            .unwrap()
        });

        let t_data: Vec<u8> = template_gray.data_bytes()?.to_vec();
        let p_data: Vec<u8> = patch_gray.data_bytes()?.to_vec();
        let m_data: Vec<u8> = mask.data_bytes()?.to_vec();

        let mut t_sum = 0.0_f64;
        let mut p_sum = 0.0_f64;
        let mut n = 0usize;
        for i in 0..t_data.len().min(p_data.len()).min(m_data.len()) {
            if m_data[i] > 0 {
                t_sum += t_data[i] as f64;
                p_sum += p_data[i] as f64;
                n += 1;
            }
        }
        if n == 0 {
            return Ok(0.0);
        }
        let t_mean = t_sum / n as f64;
        let p_mean = p_sum / n as f64;

        let mut num = 0.0_f64;
        let mut t_sq = 0.0_f64;
        let mut p_sq = 0.0_f64;
        for i in 0..t_data.len().min(p_data.len()).min(m_data.len()) {
            if m_data[i] > 0 {
                let td = t_data[i] as f64 - t_mean;
                let pd = p_data[i] as f64 - p_mean;
                num += td * pd;
                t_sq += td * td;
                p_sq += pd * pd;
            }
        }
        let denom = (t_sq * p_sq).sqrt();
        if denom <= 0.0 {
            return Ok(0.0);
        }
        Ok((num / denom) as f32)
    }
}

fn flip(mat: &Mat, code: i32) -> anyhow::Result<Mat> {
    let mut out = Mat::default();
    opencv::core::flip(mat, &mut out, code)?;
    Ok(out)
}

fn rotate(mat: &Mat, degrees: f64) -> anyhow::Result<Mat> {
    let center = opencv::core::Point2f::new(mat.cols() as f32 / 2.0, mat.rows() as f32 / 2.0);
    let rot = imgproc::get_rotation_matrix_2d(center, degrees, 1.0)?;
    let mut out = Mat::default();
    imgproc::warp_affine(
        mat,
        &mut out,
        &rot,
        opencv::core::Size::new(mat.cols(), mat.rows()),
        imgproc::INTER_LINEAR,
        opencv::core::BORDER_CONSTANT,
        opencv::core::Scalar::default(),
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_fingertip_offset() {
        assert_eq!(Orientation::Normal.fingertip_offset(), (-25, 43));
    }

    #[test]
    fn cw117_has_its_own_precomputed_offset_not_a_rotation() {
        assert_eq!(Orientation::Cw117.fingertip_offset(), (-27, -42));
    }

    #[test]
    fn flip_variants_mirror_baseline_offset() {
        assert_eq!(Orientation::FlipH.fingertip_offset(), (25, 43));
        assert_eq!(Orientation::FlipV.fingertip_offset(), (-25, -43));
        assert_eq!(Orientation::FlipBoth.fingertip_offset(), (25, -43));
    }
}
