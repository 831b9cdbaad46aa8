use crate::metadata::SceneSpan;

/// 不低于该时长（秒）的场景才会采样
pub const MIN_SAMPLE_DURATION: f64 = 0.1;
/// 两个采样点之间期望的最小间隔（秒）
pub const MIN_FRAME_SPACING: f64 = 0.5;
pub const DEFAULT_FRAMES_PER_SCENE: usize = 3;

/// 单个场景的采样计划
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPlan {
    pub scene: SceneSpan,
    pub frame_count: usize,
    /// 严格递增，且都落在 `(start, end)` 开区间内
    pub timestamps: Vec<f64>,
}

impl SamplingPlan {
    /// 根据场景时长计算采样帧数和时间点
    ///
    /// - 时长 <= 0.1s：不采样
    /// - 时长 < N * 0.5s：降为 `max(1, floor(duration * 2))` 帧
    /// - 其余情况采样 N 帧
    ///
    /// 区间被等分为 `frame_count + 1` 段，取内部的分割点，避免落在切点上。
    pub fn for_scene(scene: SceneSpan, requested: usize) -> Self {
        let duration = scene.duration();
        if duration <= MIN_SAMPLE_DURATION {
            return Self::skip(scene);
        }

        let frame_count = if duration < requested as f64 * MIN_FRAME_SPACING {
            ((duration * 2.0).floor() as usize).max(1)
        } else {
            requested
        };

        let interval = duration / (frame_count + 1) as f64;
        let timestamps = (1..=frame_count)
            .map(|i| scene.start_seconds + i as f64 * interval)
            .collect();

        Self {
            scene,
            frame_count,
            timestamps,
        }
    }

    fn skip(scene: SceneSpan) -> Self {
        Self {
            scene,
            frame_count: 0,
            timestamps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: f64, end: f64) -> SceneSpan {
        SceneSpan::new(start, end).unwrap()
    }

    #[test]
    fn test_ten_second_scene_uses_full_count() {
        let plan = SamplingPlan::for_scene(span(0.0, 10.0), 3);
        assert_eq!(plan.frame_count, 3);
        assert_eq!(plan.timestamps, vec![2.5, 5.0, 7.5]);

        let shifted = SamplingPlan::for_scene(span(100.0, 110.0), 3);
        assert_eq!(shifted.timestamps, vec![102.5, 105.0, 107.5]);
    }

    #[test]
    fn test_tiny_scene_is_skipped() {
        let plan = SamplingPlan::for_scene(span(4.0, 4.05), 3);
        assert_eq!(plan.frame_count, 0);
        assert!(plan.timestamps.is_empty());
        assert!(plan.is_empty());

        let boundary = SamplingPlan::for_scene(span(0.0, 0.1), 3);
        assert_eq!(boundary.frame_count, 0);
    }

    #[test]
    fn test_short_scene_reduces_count() {
        let plan = SamplingPlan::for_scene(span(0.0, 1.0), 3);
        assert_eq!(plan.frame_count, 2);
        assert_eq!(plan.timestamps.len(), 2);

        let very_short = SamplingPlan::for_scene(span(0.0, 0.3), 3);
        assert_eq!(very_short.frame_count, 1);
        assert!((very_short.timestamps[0] - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_exact_spacing_keeps_requested_count() {
        // 1.5 >= 3 * 0.5，不降帧
        let plan = SamplingPlan::for_scene(span(0.0, 1.5), 3);
        assert_eq!(plan.frame_count, 3);
    }

    #[test]
    fn test_timestamps_strictly_inside_and_increasing() {
        let starts = [0.0, 0.7, 13.37, 3599.9];
        let durations = [0.05, 0.1, 0.11, 0.49, 0.5, 1.0, 2.75, 10.0, 600.0];
        for &start in &starts {
            for &duration in &durations {
                for requested in 0..=8 {
                    let scene = span(start, start + duration);
                    let plan = SamplingPlan::for_scene(scene, requested);
                    assert_eq!(plan.timestamps.len(), plan.frame_count);
                    if scene.duration() <= MIN_SAMPLE_DURATION {
                        assert_eq!(plan.frame_count, 0);
                    }
                    for pair in plan.timestamps.windows(2) {
                        assert!(pair[0] < pair[1]);
                    }
                    for &t in &plan.timestamps {
                        assert!(t > scene.start_seconds && t < scene.end_seconds);
                    }
                }
            }
        }
    }
}
