use crate::{BBox, Detection};

/// Intersection over union of two corner boxes. Zero-area boxes overlap nothing.
pub fn iou<S>(a: &BBox<S>, b: &BBox<S>) -> f32 {
    let (area_a, area_b) = (a.area(), b.area());
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { (inter / union).clamp(0.0, 1.0) }
}

/// Greedy suppression in descending confidence order.
///
/// A candidate is dropped when its IoU with an already kept box of the same class
/// (any class when `agnostic`) exceeds `iou_th`. Equal confidences keep input order.
/// Output is sorted by confidence and holds at most `max_det` boxes.
pub fn non_max_suppression<S>(
    mut dets: Vec<Detection<S>>,
    iou_th: f32,
    agnostic: bool,
    max_det: usize,
) -> Vec<Detection<S>> {
    dets.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Detection<S>> = Vec::new();

    'outer: for d in dets {
        if kept.len() >= max_det { break; }
        for k in &kept {
            if !agnostic && k.class_id != d.class_id { continue; }
            if iou(&d.bbox, &k.bbox) > iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
    }
    kept
}
