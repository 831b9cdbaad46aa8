use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ParseError, Result};
use crate::metadata::SceneSpan;
use crate::timecode::{format_timecode, parse_timecode};
use crate::tool::run_tool;

/// 一次请求内打开的视频
#[derive(Debug, Clone)]
pub struct VideoHandle {
    pub path: PathBuf,
    /// 总时长（秒）
    pub duration: f64,
}

/// 镜头边界检测能力
///
/// 实现方只需要给出时长和切点区间，排序、去重叠和整段回退由
/// [`SceneBoundaryDetector`] 统一处理。
pub trait ShotBoundaryDetector: Send + Sync {
    /// 打开视频并读取总时长
    fn probe(&self, path: &Path) -> impl Future<Output = Result<VideoHandle>> + Send;

    /// 返回 `(开始时间码, 结束时间码)` 列表；没有切点时返回空列表
    fn detect_scenes(
        &self,
        video: &VideoHandle,
        threshold: f64,
    ) -> impl Future<Output = Result<Vec<(String, String)>>> + Send;
}

/// 对检测结果做规范化：升序、无重叠，没有切点时回退为整段视频
pub struct SceneBoundaryDetector<D> {
    inner: D,
}

impl<D: ShotBoundaryDetector> SceneBoundaryDetector<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub async fn open(&self, path: &Path) -> Result<VideoHandle> {
        self.inner.probe(path).await
    }

    pub async fn detect(&self, video: &VideoHandle, threshold: f64) -> Result<Vec<SceneSpan>> {
        let raw = self.inner.detect_scenes(video, threshold).await?;
        debug!("检测器返回 {} 个区间: {}", raw.len(), video.path.display());
        let spans = normalize_spans(&raw, video.duration)?;
        if raw.is_empty() {
            warn!("⚠️  [场景检测] 未检测到切点，整段视频作为一个场景: {}", video.path.display());
        }
        Ok(spans)
    }
}

/// 解析时间码、丢弃空区间、按开始时间排序并裁掉重叠部分
///
/// 结果为空时回退为 `[0, total_duration]`；时长也为 0 则返回 `NoScenesDetected`。
pub fn normalize_spans(raw: &[(String, String)], total_duration: f64) -> Result<Vec<SceneSpan>> {
    let mut spans = Vec::with_capacity(raw.len());
    for (start, end) in raw {
        let start = parse_timecode(start)
            .map_err(|e| ParseError::DetectionFailed(format!("检测器输出无法解析: {}", e)))?;
        let end = parse_timecode(end)
            .map_err(|e| ParseError::DetectionFailed(format!("检测器输出无法解析: {}", e)))?;
        match SceneSpan::new(start, end) {
            Some(span) => spans.push(span),
            None => debug!("丢弃空区间: {:.3}-{:.3}", start, end),
        }
    }

    spans.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));

    let mut normalized: Vec<SceneSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        let start = match normalized.last() {
            Some(prev) => span.start_seconds.max(prev.end_seconds),
            None => span.start_seconds,
        };
        if let Some(span) = SceneSpan::new(start, span.end_seconds) {
            normalized.push(span);
        }
    }

    if normalized.is_empty() {
        return SceneSpan::new(0.0, total_duration)
            .map(|whole| vec![whole])
            .ok_or(ParseError::NoScenesDetected);
    }

    Ok(normalized)
}

/// 基于 ffmpeg `scene` 评分的内容差异检测器
///
/// 阈值沿用 0-100 的刻度（默认 30），换算成 ffmpeg 的 0-1 评分。
#[derive(Debug, Clone)]
pub struct FfmpegSceneDetector {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// 分析前的缩放倍数，越大越快
    pub downscale_factor: u32,
    /// 两个切点之间的最短间隔（秒）
    pub min_scene_duration: f64,
    pub probe_timeout: Duration,
}

impl Default for FfmpegSceneDetector {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            downscale_factor: 2,
            min_scene_duration: 0.5,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl FfmpegSceneDetector {
    fn filter_graph(&self, threshold: f64) -> String {
        let score = (threshold / 100.0).clamp(0.0, 1.0);
        let select = format!("select='gt(scene,{:.4})',showinfo", score);
        if self.downscale_factor > 1 {
            format!("scale=iw/{}:-2,{}", self.downscale_factor, select)
        } else {
            select
        }
    }
}

impl FfmpegSceneDetector {
    /// 读取视频流最后一个数据包的结束时间；不解码，也不设超时
    async fn scan_packet_duration(&self, path: &Path) -> Result<f64> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "packet=pts_time,duration_time"])
            .args(["-of", "csv=p=0"])
            .arg(path);

        let output = run_tool(command, None)
            .await
            .map_err(|e| ParseError::DetectionFailed(format!("ffprobe {}", e.summary())))?;
        Ok(parse_packet_end(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl ShotBoundaryDetector for FfmpegSceneDetector {
    async fn probe(&self, path: &Path) -> Result<VideoHandle> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=codec_type,duration:format=duration"])
            .args(["-of", "json"])
            .arg(path);

        let output = run_tool(command, Some(self.probe_timeout))
            .await
            .map_err(|e| ParseError::DetectionFailed(format!("ffprobe {}", e.summary())))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration = match parse_probe_output(&stdout)? {
            Some(duration) => duration,
            None => {
                // 容器未记录时长（例如浏览器录制的 WebM），逐包扫描视频流
                warn!("⚠️  [场景检测] 容器未记录时长，扫描数据包: {}", path.display());
                self.scan_packet_duration(path).await?
            }
        };
        Ok(VideoHandle {
            path: path.to_path_buf(),
            duration,
        })
    }

    async fn detect_scenes(&self, video: &VideoHandle, threshold: f64) -> Result<Vec<(String, String)>> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-nostats", "-i"])
            .arg(&video.path)
            .args(["-an", "-sn", "-dn", "-vf", &self.filter_graph(threshold)])
            .args(["-f", "null", "-"]);

        let output = run_tool(command, None)
            .await
            .map_err(|e| ParseError::DetectionFailed(format!("ffmpeg {}", e.summary())))?;

        // showinfo 的输出在 stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        let cuts = parse_showinfo_cuts(&stderr)?;
        let scenes = cuts_to_timecodes(&cuts, video.duration, self.min_scene_duration);
        info!(
            "✅ [场景检测] {} 个切点 -> {} 个场景: {}",
            cuts.len(),
            scenes.len(),
            video.path.display()
        );
        Ok(scenes)
    }
}

/// 返回探测到的正时长；容器和视频流都没有时长时返回 None
fn parse_probe_output(stdout: &str) -> Result<Option<f64>> {
    let json: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| ParseError::DetectionFailed(format!("ffprobe 输出无法解析: {}", e)))?;

    let video = json["streams"]
        .as_array()
        .and_then(|streams| streams.iter().find(|s| s["codec_type"] == "video"))
        .ok_or_else(|| ParseError::DetectionFailed("未找到视频流".to_string()))?;

    let positive = |value: &serde_json::Value| {
        value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
    };
    Ok(positive(&json["format"]["duration"]).or_else(|| positive(&video["duration"])))
}

/// `pts_time,duration_time` 的 CSV 输出中最晚的结束时间，没有数据包时为 0
fn parse_packet_end(csv: &str) -> f64 {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(',');
            let pts = fields.next()?.parse::<f64>().ok()?;
            let duration = fields
                .next()
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0);
            Some(pts + duration)
        })
        .filter(|end| end.is_finite())
        .fold(0.0, f64::max)
}

/// 从 showinfo 输出中提取被选中帧的 `pts_time`
fn parse_showinfo_cuts(stderr: &str) -> Result<Vec<f64>> {
    let pts_regex = Regex::new(r"pts_time:\s*([0-9]+(?:\.[0-9]+)?)")
        .map_err(|e| ParseError::DetectionFailed(e.to_string()))?;

    Ok(stderr
        .lines()
        .filter(|line| line.contains("Parsed_showinfo"))
        .filter_map(|line| pts_regex.captures(line))
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect())
}

/// 把切点转换成相邻区间；间隔小于 `min_scene_duration` 的切点被合并
fn cuts_to_timecodes(cuts: &[f64], duration: f64, min_scene_duration: f64) -> Vec<(String, String)> {
    let mut points: Vec<f64> = cuts
        .iter()
        .copied()
        .filter(|&t| t > 0.0 && t < duration)
        .collect();
    points.sort_by(|a, b| a.total_cmp(b));

    let mut boundaries = vec![0.0];
    for t in points {
        let last = boundaries[boundaries.len() - 1];
        if t - last >= min_scene_duration {
            boundaries.push(t);
        }
    }

    if boundaries.len() == 1 {
        return Vec::new();
    }
    boundaries.push(duration);

    boundaries
        .windows(2)
        .map(|w| (format_timecode(w[0]), format_timecode(w[1])))
        .collect()
}

/// 运行时可选的检测器实现
pub enum DetectorBackend {
    Ffmpeg(FfmpegSceneDetector),
    #[cfg(feature = "native")]
    Native(crate::native_detector::NativeSceneDetector),
}

impl ShotBoundaryDetector for DetectorBackend {
    async fn probe(&self, path: &Path) -> Result<VideoHandle> {
        match self {
            DetectorBackend::Ffmpeg(detector) => detector.probe(path).await,
            #[cfg(feature = "native")]
            DetectorBackend::Native(detector) => detector.probe(path).await,
        }
    }

    async fn detect_scenes(&self, video: &VideoHandle, threshold: f64) -> Result<Vec<(String, String)>> {
        match self {
            DetectorBackend::Ffmpeg(detector) => detector.detect_scenes(video, threshold).await,
            #[cfg(feature = "native")]
            DetectorBackend::Native(detector) => detector.detect_scenes(video, threshold).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(start: &str, end: &str) -> (String, String) {
        (start.to_string(), end.to_string())
    }

    #[test]
    fn test_no_cuts_falls_back_to_whole_video() {
        let spans = normalize_spans(&[], 120.0).unwrap();
        assert_eq!(spans, vec![SceneSpan::new(0.0, 120.0).unwrap()]);
    }

    #[test]
    fn test_zero_duration_without_cuts_fails() {
        let err = normalize_spans(&[], 0.0).unwrap_err();
        assert!(matches!(err, ParseError::NoScenesDetected));
    }

    #[test]
    fn test_spans_are_sorted_and_overlaps_trimmed() {
        let raw = vec![
            pair("00:00:10.000", "00:00:20.000"),
            pair("00:00:00.000", "00:00:10.500"),
            pair("00:00:20.000", "00:00:20.000"),
            pair("00:00:15.000", "00:00:18.000"),
        ];
        let spans = normalize_spans(&raw, 20.0).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], SceneSpan::new(0.0, 10.5).unwrap());
        assert_eq!(spans[1], SceneSpan::new(10.5, 20.0).unwrap());
    }

    #[test]
    fn test_unparseable_timecode_is_detection_failure() {
        let raw = vec![pair("garbage", "00:00:01.000")];
        let err = normalize_spans(&raw, 5.0).unwrap_err();
        assert_eq!(err.kind(), "DetectionFailed");
    }

    #[test]
    fn test_parse_showinfo_cuts() {
        let stderr = r"
[Parsed_showinfo_2 @ 0x55d1c] n:   0 pts:  61440 pts_time:4.8     duration:512
[Parsed_showinfo_2 @ 0x55d1c] n:   1 pts: 153600 pts_time:12.0125 duration:512
frame=  300 fps=0.0 q=-0.0 size=N/A time=00:00:20.00
";
        let cuts = parse_showinfo_cuts(stderr).unwrap();
        assert_eq!(cuts, vec![4.8, 12.0125]);
    }

    #[test]
    fn test_cuts_to_timecodes_merges_close_cuts() {
        let scenes = cuts_to_timecodes(&[5.0, 5.2, 12.0, 0.0, 30.0], 20.0, 0.5);
        assert_eq!(
            scenes,
            vec![
                pair("00:00:00.000", "00:00:05.000"),
                pair("00:00:05.000", "00:00:12.000"),
                pair("00:00:12.000", "00:00:20.000"),
            ]
        );
        assert!(cuts_to_timecodes(&[], 20.0, 0.5).is_empty());
    }

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{"programs":[],"streams":[{"codec_type":"video"}],"format":{"duration":"120.040000"}}"#;
        assert!((parse_probe_output(json).unwrap().unwrap() - 120.04).abs() < 1e-9);

        let audio_only = r#"{"streams":[],"format":{"duration":"3.0"}}"#;
        assert!(parse_probe_output(audio_only).is_err());
    }

    #[test]
    fn test_missing_container_duration_falls_back() {
        // 浏览器录制的 WebM：容器没有时长，视频流有
        let stream_only = r#"{"streams":[{"codec_type":"video","duration":"12.500000"}],"format":{}}"#;
        assert_eq!(parse_probe_output(stream_only).unwrap(), Some(12.5));

        // 两处都没有时长，需要扫描数据包
        let neither = r#"{"streams":[{"codec_type":"video"}],"format":{}}"#;
        assert_eq!(parse_probe_output(neither).unwrap(), None);

        let packets = "0.000000,0.033000\n4.000000,0.033000\n9.967000,0.033000\nN/A,N/A\n";
        let duration = parse_packet_end(packets);
        assert!((duration - 10.0).abs() < 1e-9);

        let scenes = cuts_to_timecodes(&[4.0, 9.0], duration, 0.5);
        let spans = normalize_spans(&scenes, duration).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[2], SceneSpan::new(9.0, 10.0).unwrap());

        assert_eq!(parse_packet_end(""), 0.0);
    }

    #[test]
    fn test_filter_graph_downscales() {
        let detector = FfmpegSceneDetector::default();
        assert_eq!(
            detector.filter_graph(30.0),
            "scale=iw/2:-2,select='gt(scene,0.3000)',showinfo"
        );
    }
}
