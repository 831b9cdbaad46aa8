use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::error::{ParseError, Result};
use crate::frame_extractor::{FrameExtractor, FrameRasterizer};
use crate::metadata::{SceneResult, SceneSpan};
use crate::sampler::{SamplingPlan, DEFAULT_FRAMES_PER_SCENE};
use crate::scene_detector::{SceneBoundaryDetector, ShotBoundaryDetector, VideoHandle};
use crate::storage::RequestWorkspace;

/// 单次处理的参数
#[derive(Debug, Clone, Copy)]
pub struct ProcessConfig {
    /// 场景检测阈值，越大场景越少越长
    pub threshold: f64,
    /// 每个场景期望的采样帧数
    pub frames_per_scene: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            threshold: 30.0,
            frames_per_scene: DEFAULT_FRAMES_PER_SCENE,
        }
    }
}

/// 场景处理的终态
#[derive(Debug)]
pub enum SceneOutcome {
    Populated(SceneResult),
    /// 没有可用的帧，会被从结果中去掉
    Empty,
}

/// 检测 -> 采样计划 -> 抽帧
pub struct ScenePipeline<D, R> {
    detector: SceneBoundaryDetector<D>,
    extractor: FrameExtractor<R>,
}

impl<D: ShotBoundaryDetector, R: FrameRasterizer> ScenePipeline<D, R> {
    pub fn new(detector: D, rasterizer: R) -> Self {
        Self {
            detector: SceneBoundaryDetector::new(detector),
            extractor: FrameExtractor::new(rasterizer),
        }
    }

    /// 处理一个本地视频文件，帧写入 `workspace` 目录
    ///
    /// 没有帧的场景直接丢弃；只有全部场景都没有帧时才返回 `NoFramesExtracted`。
    pub async fn process(
        &self,
        video_path: &Path,
        workspace: &RequestWorkspace,
        config: ProcessConfig,
    ) -> Result<Vec<SceneResult>> {
        if config.frames_per_scene == 0 {
            return Err(ParseError::InvalidInput("frames_per_scene 必须大于 0".to_string()));
        }

        let total_start = Instant::now();
        info!("🎬 [场景管线] 开始处理视频: {} (请求 {})", video_path.display(), workspace.request_id);

        let video = self.detector.open(video_path).await.map_err(|e| {
            error!("❌ [场景管线] 打开视频失败: {}", e);
            e
        })?;
        info!("  • 视频时长: {:.2}秒", video.duration);

        let detect_start = Instant::now();
        let spans = self.detector.detect(&video, config.threshold).await.map_err(|e| {
            error!("❌ [场景管线] 场景检测失败: {}", e);
            e
        })?;
        info!(
            "✅ [场景管线] 场景检测完成，{} 个场景，耗时: {:.2}秒",
            spans.len(),
            detect_start.elapsed().as_secs_f64()
        );

        let extract_start = Instant::now();
        let mut results = Vec::with_capacity(spans.len());
        for (index, span) in spans.iter().enumerate() {
            let scene_id = index + 1;
            match self
                .process_scene(&video, span, scene_id, workspace, config.frames_per_scene)
                .await
            {
                SceneOutcome::Populated(result) => results.push(result),
                SceneOutcome::Empty => debug!("场景 {} 无可用帧，已丢弃", scene_id),
            }
        }

        if results.is_empty() {
            error!("❌ [场景管线] {} 个场景均未抽取到帧", spans.len());
            return Err(ParseError::NoFramesExtracted);
        }

        let frame_total: usize = results.iter().map(|r| r.frames.len()).sum();
        info!(
            "✅ [场景管线] 抽帧完成，耗时: {:.2}秒",
            extract_start.elapsed().as_secs_f64()
        );
        info!(
            "🎉 [场景管线] 处理完成：{}/{} 个场景，{} 帧，总耗时: {:.2}秒",
            results.len(),
            spans.len(),
            frame_total,
            total_start.elapsed().as_secs_f64()
        );

        Ok(results)
    }

    async fn process_scene(
        &self,
        video: &VideoHandle,
        span: &SceneSpan,
        scene_id: usize,
        workspace: &RequestWorkspace,
        frames_per_scene: usize,
    ) -> SceneOutcome {
        let plan = SamplingPlan::for_scene(*span, frames_per_scene);
        if plan.is_empty() {
            let skipped = ParseError::SceneTooShort {
                scene_id,
                duration: span.duration(),
            };
            info!("{}", skipped);
            return SceneOutcome::Empty;
        }
        if plan.frame_count < frames_per_scene {
            info!(
                "场景 {}: 时长 {:.3}s，采样帧数从 {} 降为 {}",
                scene_id,
                span.duration(),
                frames_per_scene,
                plan.frame_count
            );
        }

        let frames = self
            .extractor
            .extract(video, &plan, &workspace.directory, scene_id)
            .await;
        if frames.is_empty() {
            return SceneOutcome::Empty;
        }
        SceneOutcome::Populated(SceneResult::new(scene_id, span, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageLifecycle;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedDetector {
        duration: f64,
        scenes: Vec<(&'static str, &'static str)>,
    }

    impl ShotBoundaryDetector for FixedDetector {
        async fn probe(&self, path: &Path) -> Result<VideoHandle> {
            Ok(VideoHandle {
                path: path.to_path_buf(),
                duration: self.duration,
            })
        }

        async fn detect_scenes(&self, _video: &VideoHandle, _threshold: f64) -> Result<Vec<(String, String)>> {
            Ok(self
                .scenes
                .iter()
                .map(|(s, e)| (s.to_string(), e.to_string()))
                .collect())
        }
    }

    struct BrokenDetector;

    impl ShotBoundaryDetector for BrokenDetector {
        async fn probe(&self, _path: &Path) -> Result<VideoHandle> {
            Err(ParseError::DetectionFailed("无法解码".into()))
        }

        async fn detect_scenes(&self, _video: &VideoHandle, _threshold: f64) -> Result<Vec<(String, String)>> {
            unreachable!()
        }
    }

    /// 写一个假的 JPEG；`fail_all` 时全部失败
    struct TouchRasterizer {
        fail_all: bool,
        calls: AtomicUsize,
    }

    impl TouchRasterizer {
        fn new(fail_all: bool) -> Self {
            Self {
                fail_all,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FrameRasterizer for TouchRasterizer {
        async fn rasterize(&self, _source: &Path, timestamp: f64, output: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Err(ParseError::FrameExtractionFailed {
                    timestamp,
                    reason: "退出码 1".into(),
                });
            }
            tokio::fs::write(output, b"jpeg").await?;
            Ok(())
        }
    }

    fn setup() -> (tempfile::TempDir, StorageLifecycle, RequestWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLifecycle::new(dir.path(), Duration::from_secs(60)).unwrap();
        let workspace = storage.allocate().unwrap();
        (dir, storage, workspace)
    }

    fn input() -> PathBuf {
        PathBuf::from("clip.mp4")
    }

    #[tokio::test]
    async fn test_no_cuts_yields_single_scene() {
        let (_dir, _storage, workspace) = setup();
        let pipeline = ScenePipeline::new(
            FixedDetector { duration: 120.0, scenes: Vec::new() },
            TouchRasterizer::new(false),
        );

        let scenes = pipeline.process(&input(), &workspace, ProcessConfig::default()).await.unwrap();

        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].scene_id, 1);
        assert_eq!(scenes[0].start, "00:00:00.000");
        assert_eq!(scenes[0].end, "00:02:00.000");
        assert_eq!(scenes[0].frames.len(), 3);
        for frame in &scenes[0].frames {
            assert!(workspace.directory.join(&frame.file_name).exists());
        }
    }

    #[tokio::test]
    async fn test_short_scene_is_dropped_and_ids_stay_stable() {
        let (_dir, _storage, workspace) = setup();
        let pipeline = ScenePipeline::new(
            FixedDetector {
                duration: 20.05,
                scenes: vec![
                    ("00:00:10.000", "00:00:10.050"),
                    ("00:00:00.000", "00:00:10.000"),
                    ("00:00:10.050", "00:00:11.050"),
                    ("00:00:11.050", "00:00:20.050"),
                ],
            },
            TouchRasterizer::new(false),
        );

        let scenes = pipeline.process(&input(), &workspace, ProcessConfig::default()).await.unwrap();

        let ids: Vec<_> = scenes.iter().map(|s| s.scene_id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(scenes[1].frames.len(), 2);
        assert_eq!(scenes[1].frames[0].file_name, "scene_03_01.jpg");
        assert_eq!(scenes[2].frames.len(), 3);
    }

    #[tokio::test]
    async fn test_all_empty_scenes_fail_request() {
        let (_dir, _storage, workspace) = setup();
        let rasterizer = TouchRasterizer::new(true);
        let pipeline = ScenePipeline::new(
            FixedDetector {
                duration: 30.0,
                scenes: vec![("00:00:00.000", "00:00:15.000"), ("00:00:15.000", "00:00:30.000")],
            },
            rasterizer,
        );

        let err = pipeline
            .process(&input(), &workspace, ProcessConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NoFramesExtracted));
        assert_eq!(pipeline.extractor_calls(), 6);
    }

    #[tokio::test]
    async fn test_zero_duration_without_cuts() {
        let (_dir, _storage, workspace) = setup();
        let pipeline = ScenePipeline::new(
            FixedDetector { duration: 0.0, scenes: Vec::new() },
            TouchRasterizer::new(false),
        );
        let err = pipeline
            .process(&input(), &workspace, ProcessConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NoScenesDetected));
    }

    #[tokio::test]
    async fn test_detection_failure_propagates() {
        let (_dir, _storage, workspace) = setup();
        let pipeline = ScenePipeline::new(BrokenDetector, TouchRasterizer::new(false));
        let err = pipeline
            .process(&input(), &workspace, ProcessConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DetectionFailed");
    }

    #[tokio::test]
    async fn test_zero_frames_per_scene_is_rejected_before_detection() {
        let (_dir, _storage, workspace) = setup();
        let pipeline = ScenePipeline::new(BrokenDetector, TouchRasterizer::new(false));
        let config = ProcessConfig {
            frames_per_scene: 0,
            ..ProcessConfig::default()
        };
        let err = pipeline.process(&input(), &workspace, config).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        assert_eq!(pipeline.extractor.rasterizer().calls.load(Ordering::SeqCst), 0);
    }

    impl ScenePipeline<FixedDetector, TouchRasterizer> {
        fn extractor_calls(&self) -> usize {
            self.extractor.rasterizer().calls.load(Ordering::SeqCst)
        }
    }
}
