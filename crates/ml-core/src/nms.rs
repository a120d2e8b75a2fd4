//! Class-aware non-max suppression.

use crate::types::{Detection, Rect};

/// Intersection over union of two pixel boxes.
///
/// Boxes without overlap, or degenerate boxes, yield `0.0`.
pub fn iou(a: &Rect, b: &Rect) -> f32 {
    let inter = a.intersection_area(b);
    if inter == 0 {
        return 0.0;
    }
    let union = a.area().saturating_add(b.area()).saturating_sub(inter);
    if union <= 0 {
        return 0.0;
    }
    inter as f32 / union as f32
}

/// Greedy NMS over candidates of the same class.
///
/// Candidates are stably sorted by descending confidence; a kept candidate
/// suppresses every later candidate of its class whose IoU exceeds
/// `iou_threshold`. The returned order is the keep order.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if candidates.is_empty() {
        return candidates;
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; candidates.len()];
    let mut keep = Vec::with_capacity(candidates.len());

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].class_id != candidates[i].class_id {
                continue;
            }
            if iou(&candidates[i].rect, &candidates[j].rect) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(i);
    }

    let mut slots: Vec<Option<Detection>> = candidates.into_iter().map(Some).collect();
    keep.into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(rect: Rect, class_id: i64, confidence: f32) -> Detection {
        Detection::new(rect, class_id, confidence)
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let r = Rect::new(10, 10, 50, 50);
        assert_eq!(iou(&r, &r), 1.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 15, 10);
        // 50 / (100 + 100 - 50)
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn suppresses_lower_confidence_overlap_of_same_class() {
        let kept = non_max_suppression(
            vec![
                det(Rect::new(0, 0, 100, 100), 1, 0.6),
                det(Rect::new(2, 2, 100, 100), 1, 0.9),
                det(Rect::new(300, 300, 350, 350), 1, 0.5),
            ],
            0.45,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.5]);
    }

    #[test]
    fn identical_boxes_of_different_classes_both_survive() {
        let rect = Rect::new(20, 20, 80, 80);
        let kept = non_max_suppression(vec![det(rect, 0, 0.9), det(rect, 3, 0.8)], 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].class_id, 0);
        assert_eq!(kept[1].class_id, 3);
    }

    #[test]
    fn overlap_equal_to_threshold_is_kept() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 15, 10);
        let threshold = iou(&a, &b);
        let kept = non_max_suppression(vec![det(a, 0, 0.9), det(b, 0, 0.8)], threshold);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(non_max_suppression(Vec::new(), 0.5).is_empty());
    }
}
