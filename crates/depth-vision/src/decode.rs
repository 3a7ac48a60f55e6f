use crate::error::{config_err, ensure_unit, Result, VisionError};
use crate::{non_max_suppression, BBox, Detection, DetectionSet, ModelSpace};

/// Raw detector head output.
///
/// One row per candidate: `[cx, cy, w, h, obj, cls0..clsN]`, box in model-input pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    data: Vec<f32>,
    num_classes: usize,
}

impl RawOutput {
    pub fn new(data: Vec<f32>, num_candidates: usize, num_classes: usize) -> Result<Self> {
        let stride = 5 + num_classes;
        if data.len() != num_candidates * stride {
            return Err(VisionError::ModelOutput(format!(
                "{} values for {} candidates of stride {}",
                data.len(), num_candidates, stride
            )));
        }
        Ok(Self { data, num_classes })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(5 + self.num_classes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeConfig {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    /// Allow-list of class indices; `None` keeps every class.
    pub classes: Option<Vec<usize>>,
    /// One suppression pass across all classes.
    pub agnostic: bool,
    pub max_detections: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self { conf_threshold: 0.25, iou_threshold: 0.45, classes: None, agnostic: false, max_detections: 300 }
    }
}

impl DecodeConfig {
    pub fn validate_thresholds(&self) -> Result<()> {
        ensure_unit("conf_threshold", self.conf_threshold)?;
        ensure_unit("iou_threshold", self.iou_threshold)
    }

    /// Full check against a class-name table of `num_classes` entries.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        self.validate_thresholds()?;
        if self.max_detections == 0 {
            return Err(config_err("max_detections must be > 0"));
        }
        if let Some(bad) = self.classes.iter().flatten().find(|c| **c >= num_classes) {
            return Err(config_err(format!("class filter index {bad} outside the {num_classes} known classes")));
        }
        Ok(())
    }
}

/// Confidence filter, class assignment, optional class filter, then NMS.
///
/// Returns an empty set when nothing passes; only invalid thresholds fail.
pub fn decode(raw: &RawOutput, cfg: &DecodeConfig) -> Result<DetectionSet<ModelSpace>> {
    cfg.validate_thresholds()?;

    let mut cands = Vec::new();
    for row in raw.rows() {
        let (cx, cy, w, h, obj) = (row[0], row[1], row[2], row[3], row[4]);

        // first maximum wins on ties
        let mut best_c = 0usize;
        let mut best_p = f32::NEG_INFINITY;
        for (c, p) in row[5..].iter().enumerate() {
            if *p > best_p { best_p = *p; best_c = c; }
        }

        let conf = obj * best_p;
        if !(conf >= cfg.conf_threshold) { continue; }
        if let Some(allow) = &cfg.classes {
            if !allow.contains(&best_c) { continue; }
        }
        cands.push(Detection { bbox: BBox::from_cxcywh(cx, cy, w, h), confidence: conf.min(1.0), class_id: best_c });
    }

    Ok(non_max_suppression(cands, cfg.iou_threshold, cfg.agnostic, cfg.max_detections))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(rows: &[&[f32]], nc: usize) -> RawOutput {
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        RawOutput::new(data, rows.len(), nc).unwrap()
    }

    #[test]
    fn shape_is_checked() {
        let err = RawOutput::new(vec![0.0; 13], 2, 2).unwrap_err();
        assert!(matches!(err, VisionError::ModelOutput(_)));
    }

    #[test]
    fn single_candidate_passes_through() {
        let out = decode(&raw(&[&[55.0, 72.0, 10.0, 20.0, 0.9, 1.0]], 1), &DecodeConfig::default()).unwrap();
        assert_eq!(out.len(), 1);
        let d = out[0];
        assert_eq!((d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2), (50.0, 62.0, 60.0, 82.0));
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert_eq!(d.class_id, 0);
    }

    #[test]
    fn confidence_is_objectness_times_best_class() {
        let out = decode(&raw(&[&[10.0, 10.0, 4.0, 4.0, 0.5, 0.2, 0.8, 0.8]], 3), &DecodeConfig::default()).unwrap();
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].confidence - 0.4).abs() < 1e-6);

        // 0.5 * 0.4 = 0.2 < 0.25
        let none = decode(&raw(&[&[10.0, 10.0, 4.0, 4.0, 0.5, 0.4]], 1), &DecodeConfig::default()).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn class_allow_list() {
        let r = raw(
            &[
                &[10.0, 10.0, 4.0, 4.0, 0.9, 0.9, 0.1],
                &[50.0, 50.0, 4.0, 4.0, 0.9, 0.1, 0.9],
            ],
            2,
        );
        let cfg = DecodeConfig { classes: Some(vec![1]), ..DecodeConfig::default() };
        let out = decode(&r, &cfg).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let r = raw(&[], 1);
        for cfg in [
            DecodeConfig { conf_threshold: 1.5, ..DecodeConfig::default() },
            DecodeConfig { iou_threshold: -0.1, ..DecodeConfig::default() },
            DecodeConfig { conf_threshold: f32::NAN, ..DecodeConfig::default() },
        ] {
            assert!(matches!(decode(&r, &cfg), Err(VisionError::Configuration(_))));
        }
    }

    #[test]
    fn validate_checks_class_filter() {
        let cfg = DecodeConfig { classes: Some(vec![0, 4]), ..DecodeConfig::default() };
        assert!(cfg.validate(5).is_ok());
        assert!(cfg.validate(4).is_err());
        assert!(DecodeConfig { max_detections: 0, ..DecodeConfig::default() }.validate(1).is_err());
    }

    #[test]
    fn raising_threshold_never_adds_detections() {
        let rows: Vec<Vec<f32>> = (0..40)
            .map(|i| {
                let x = (i % 7) as f32 * 9.0;
                let y = (i / 7) as f32 * 11.0;
                let obj = ((i * 37) % 100) as f32 / 100.0;
                vec![x + 20.0, y + 20.0, 24.0, 24.0, obj, 1.0 - obj / 3.0, obj / 2.0]
            })
            .collect();
        let refs: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
        let r = raw(&refs, 2);

        let mut prev = usize::MAX;
        for step in 0..=20 {
            let cfg = DecodeConfig { conf_threshold: step as f32 / 20.0, ..DecodeConfig::default() };
            let n = decode(&r, &cfg).unwrap().len();
            assert!(n <= prev, "threshold {} kept {n} > {prev}", cfg.conf_threshold);
            prev = n;
        }
    }
}
