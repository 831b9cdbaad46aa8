//! 进程内镜头检测（feature = "native"）
//!
//! 用 ffmpeg-next 顺序解码，逐帧比较 HSV 通道的平均差异，得分超过阈值即视为切点。
//! 得分刻度为 0-255，和默认检测器使用同一个阈值含义（默认 30）。

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use image::RgbImage;
use tracing::{debug, info};

use crate::error::{ParseError, Result};
use crate::scene_detector::{ShotBoundaryDetector, VideoHandle};
use crate::timecode::format_timecode;

#[derive(Debug, Clone)]
pub struct NativeSceneDetector {
    /// 解码后缩放倍数
    pub downscale_factor: u32,
    /// 两个切点之间的最短间隔（秒）
    pub min_scene_duration: f64,
}

impl Default for NativeSceneDetector {
    fn default() -> Self {
        Self {
            downscale_factor: 2,
            min_scene_duration: 0.5,
        }
    }
}

fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().map_err(|e| ParseError::DetectionFailed(format!("初始化 FFmpeg 失败: {}", e)))?;
    // 只保留错误级别的日志
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

fn ffmpeg_error(context: &str) -> impl Fn(ffmpeg::Error) -> ParseError + '_ {
    move |e| ParseError::DetectionFailed(format!("{}: {}", context, e))
}

impl NativeSceneDetector {
    fn probe_blocking(path: &Path) -> Result<VideoHandle> {
        init_ffmpeg()?;
        let ictx = ffmpeg::format::input(&path).map_err(ffmpeg_error("无法打开视频文件"))?;
        if ictx.streams().best(ffmpeg::media::Type::Video).is_none() {
            return Err(ParseError::DetectionFailed("未找到视频流".to_string()));
        }
        let duration = (ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64).max(0.0);
        Ok(VideoHandle {
            path: path.to_path_buf(),
            duration,
        })
    }

    fn detect_blocking(&self, video: &VideoHandle, threshold: f64) -> Result<Vec<(String, String)>> {
        init_ffmpeg()?;
        let mut ictx = ffmpeg::format::input(&video.path).map_err(ffmpeg_error("无法打开视频文件"))?;

        let (stream_index, time_base, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| ParseError::DetectionFailed("未找到视频流".to_string()))?;
            (stream.index(), stream.time_base(), stream.parameters())
        };

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(ffmpeg_error("无法创建解码器上下文"))?;
        let mut decoder = decoder_context
            .decoder()
            .video()
            .map_err(ffmpeg_error("无法创建视频解码器"))?;

        let factor = self.downscale_factor.max(1);
        let width = (decoder.width() / factor).max(1);
        let height = (decoder.height() / factor).max(1);
        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(ffmpeg_error("无法创建缩放器"))?;

        let seconds_per_tick = f64::from(time_base.numerator()) / f64::from(time_base.denominator().max(1));
        let mut tracker = CutTracker::new(threshold, self.min_scene_duration);

        let mut drain = |decoder: &mut ffmpeg::decoder::Video, tracker: &mut CutTracker| -> Result<()> {
            let mut decoded = ffmpeg::frame::Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let time = decoded.timestamp().map(|ts| ts as f64 * seconds_per_tick).unwrap_or(0.0);
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                scaler.run(&decoded, &mut rgb_frame).map_err(ffmpeg_error("缩放失败"))?;
                tracker.push(time, frame_to_image(&rgb_frame));
            }
            Ok(())
        };

        for (stream, packet) in ictx.packets() {
            if stream.index() != stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                // 损坏的数据包直接跳过
                continue;
            }
            drain(&mut decoder, &mut tracker)?;
        }
        decoder.send_eof().map_err(ffmpeg_error("解码器刷新失败"))?;
        drain(&mut decoder, &mut tracker)?;

        debug!("解码帧数: {}, 切点: {:?}", tracker.frames_seen, tracker.cuts);
        if tracker.cuts.is_empty() {
            return Ok(Vec::new());
        }

        let mut boundaries = vec![0.0];
        boundaries.extend(tracker.cuts.iter().copied().filter(|&t| t > 0.0 && t < video.duration));
        boundaries.push(video.duration);
        Ok(boundaries
            .windows(2)
            .map(|w| (format_timecode(w[0]), format_timecode(w[1])))
            .collect())
    }
}

impl ShotBoundaryDetector for NativeSceneDetector {
    async fn probe(&self, path: &Path) -> Result<VideoHandle> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::probe_blocking(&path))
            .await
            .map_err(|e| ParseError::DetectionFailed(format!("探测任务异常: {}", e)))?
    }

    async fn detect_scenes(&self, video: &VideoHandle, threshold: f64) -> Result<Vec<(String, String)>> {
        let detector = self.clone();
        let handle = video.clone();
        let scenes = tokio::task::spawn_blocking(move || detector.detect_blocking(&handle, threshold))
            .await
            .map_err(|e| ParseError::DetectionFailed(format!("检测任务异常: {}", e)))??;
        info!("✅ [场景检测] 进程内检测得到 {} 个场景: {}", scenes.len(), video.path.display());
        Ok(scenes)
    }
}

/// 逐帧累积切点
struct CutTracker {
    threshold: f64,
    min_scene_duration: f64,
    previous: Option<RgbImage>,
    last_cut: f64,
    cuts: Vec<f64>,
    frames_seen: usize,
}

impl CutTracker {
    fn new(threshold: f64, min_scene_duration: f64) -> Self {
        Self {
            threshold,
            min_scene_duration,
            previous: None,
            last_cut: 0.0,
            cuts: Vec::new(),
            frames_seen: 0,
        }
    }

    fn push(&mut self, time: f64, frame: RgbImage) {
        self.frames_seen += 1;
        if let Some(previous) = &self.previous {
            let score = content_score(previous, &frame);
            if score >= self.threshold && time - self.last_cut >= self.min_scene_duration {
                self.cuts.push(time);
                self.last_cut = time;
            }
        }
        self.previous = Some(frame);
    }
}

/// 两帧 HSV 三个通道平均差异的均值（0-255）
fn content_score(a: &RgbImage, b: &RgbImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 255.0;
    }
    let pixels = (a.width() as f64 * a.height() as f64).max(1.0);
    let (mut dh, mut ds, mut dv) = (0.0, 0.0, 0.0);
    for (p1, p2) in a.pixels().zip(b.pixels()) {
        let (h1, s1, v1) = rgb_to_hsv(p1[0], p1[1], p1[2]);
        let (h2, s2, v2) = rgb_to_hsv(p2[0], p2[1], p2[2]);
        // 色调按色环取最短距离
        let mut hue = (h1 - h2).abs();
        if hue > 180.0 {
            hue = 360.0 - hue;
        }
        dh += hue / 180.0 * 255.0;
        ds += (s1 - s2).abs() * 255.0;
        dv += (v1 - v2).abs() * 255.0;
    }
    (dh + ds + dv) / (3.0 * pixels)
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

/// RGB24 帧转 `RgbImage`，按行跨度读取
fn frame_to_image(frame: &ffmpeg::frame::Video) -> RgbImage {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut img = RgbImage::new(width, height);
    for y in 0..height {
        let row = y as usize * stride;
        for x in 0..width {
            let idx = row + x as usize * 3;
            if idx + 2 < data.len() {
                img.put_pixel(x, y, image::Rgb([data[idx], data[idx + 1], data[idx + 2]]));
            }
        }
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(32, 18, image::Rgb([r, g, b]))
    }

    #[test]
    fn test_identical_frames_score_zero() {
        assert_eq!(content_score(&solid(10, 200, 30), &solid(10, 200, 30)), 0.0);
    }

    #[test]
    fn test_hard_cut_scores_above_default_threshold() {
        let score = content_score(&solid(255, 0, 0), &solid(0, 0, 255));
        assert!(score > 30.0, "score = {}", score);
    }

    #[test]
    fn test_tracker_respects_min_scene_duration() {
        let mut tracker = CutTracker::new(30.0, 0.5);
        tracker.push(0.0, solid(255, 0, 0));
        tracker.push(0.04, solid(0, 0, 255));
        tracker.push(0.08, solid(255, 0, 0));
        tracker.push(1.0, solid(0, 0, 255));
        assert_eq!(tracker.cuts, vec![1.0]);
    }
}
