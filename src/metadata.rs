use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timecode::format_timecode;

/// 场景时间区间（秒），保证 `end_seconds > start_seconds`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneSpan {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl SceneSpan {
    /// 区间为空、倒置或含 NaN 时返回 None
    pub fn new(start_seconds: f64, end_seconds: f64) -> Option<Self> {
        if start_seconds.is_finite() && end_seconds.is_finite() && end_seconds > start_seconds {
            Some(Self {
                start_seconds,
                end_seconds,
            })
        } else {
            None
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// 一张已落盘的 JPEG 帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFrame {
    /// 场景编号（从 1 开始，请求内稳定）
    pub scene_id: usize,
    /// 场景内序号（从 1 开始）
    pub sequence_index: usize,
    pub file_name: String,
}

/// 单个场景的输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneResult {
    pub scene_id: usize,
    /// 开始时间码 `HH:MM:SS.mmm`
    pub start: String,
    /// 结束时间码 `HH:MM:SS.mmm`
    pub end: String,
    pub duration_seconds: f64,
    pub frames: Vec<ExtractedFrame>,
}

impl SceneResult {
    pub fn new(scene_id: usize, span: &SceneSpan, frames: Vec<ExtractedFrame>) -> Self {
        Self {
            scene_id,
            start: format_timecode(span.start_seconds),
            end: format_timecode(span.end_seconds),
            duration_seconds: (span.duration() * 1000.0).round() / 1000.0,
            frames,
        }
    }
}

/// `/analyze` 的响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub request_id: String,
    /// 帧文件的访问前缀，例如 `/frames/<request_id>/`
    pub frames_base_url: String,
    /// 工作目录的创建时间，过期清理从此刻起计算保留时长
    pub created_at: DateTime<Utc>,
    pub scene_count: usize,
    pub scenes: Vec<SceneResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_span_rejects_empty_interval() {
        assert!(SceneSpan::new(1.0, 1.0).is_none());
        assert!(SceneSpan::new(2.0, 1.0).is_none());
        assert!(SceneSpan::new(0.0, f64::NAN).is_none());
        assert!(SceneSpan::new(0.0, 0.05).is_some());
    }

    #[test]
    fn test_scene_result_formats_timecodes() {
        let span = SceneSpan::new(62.5, 70.12345).unwrap();
        let result = SceneResult::new(4, &span, Vec::new());
        assert_eq!(result.start, "00:01:02.500");
        assert_eq!(result.end, "00:01:10.123");
        assert!((result.duration_seconds - 7.623).abs() < 1e-9);
    }
}
