use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ParseError, Result};
use crate::metadata::ExtractedFrame;
use crate::sampler::SamplingPlan;
use crate::scene_detector::VideoHandle;
use crate::tool::run_tool;

/// 单帧抽取的默认超时
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);

/// 帧文件名：`scene_<场景>_<序号>.jpg`，两位补零
///
/// 调用方据此拼接帧的访问路径，命名规则不能改变。
pub fn frame_file_name(scene_id: usize, sequence_index: usize) -> String {
    format!("scene_{:02}_{:02}.jpg", scene_id, sequence_index)
}

/// 把视频某一时刻渲染成 JPEG 的能力
pub trait FrameRasterizer: Send + Sync {
    /// 成功即返回 Ok；是否真的落盘由 [`FrameExtractor`] 再检查
    fn rasterize(
        &self,
        source: &Path,
        timestamp: f64,
        output: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// 调用 ffmpeg 命令行抽取单帧
#[derive(Debug, Clone)]
pub struct FfmpegRasterizer {
    pub ffmpeg: PathBuf,
    pub timeout: Duration,
    /// 输出宽度，None 保持原始分辨率
    pub scale_width: Option<u32>,
    /// `-q:v`，2-31，越小质量越高
    pub quality: u8,
}

impl Default for FfmpegRasterizer {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            timeout: EXTRACT_TIMEOUT,
            scale_width: Some(640),
            quality: 3,
        }
    }
}

impl FfmpegRasterizer {
    fn build_args(&self, source: &Path, timestamp: f64, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", timestamp),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            self.quality.to_string(),
        ];
        if let Some(width) = self.scale_width {
            args.push("-vf".to_string());
            args.push(format!("scale={}:-2", width));
        }
        args.push("-y".to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl FrameRasterizer for FfmpegRasterizer {
    async fn rasterize(&self, source: &Path, timestamp: f64, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.ffmpeg);
        command.args(self.build_args(source, timestamp, output));

        run_tool(command, Some(self.timeout))
            .await
            .map(|_| ())
            .map_err(|e| ParseError::FrameExtractionFailed {
                timestamp,
                reason: e.summary(),
            })
    }
}

/// 按采样计划逐个时间点抽帧，单点失败不影响其余时间点
pub struct FrameExtractor<R> {
    rasterizer: R,
}

impl<R: FrameRasterizer> FrameExtractor<R> {
    pub fn new(rasterizer: R) -> Self {
        Self { rasterizer }
    }

    pub fn rasterizer(&self) -> &R {
        &self.rasterizer
    }

    /// 顺序抽取，返回真正落盘的帧（可能少于计划数，也可能为空）
    pub async fn extract(
        &self,
        video: &VideoHandle,
        plan: &SamplingPlan,
        output_dir: &Path,
        scene_id: usize,
    ) -> Vec<ExtractedFrame> {
        let mut frames = Vec::with_capacity(plan.frame_count);

        for (i, &timestamp) in plan.timestamps.iter().enumerate() {
            let sequence_index = i + 1;
            let file_name = frame_file_name(scene_id, sequence_index);
            let output = output_dir.join(&file_name);

            let outcome = match self.rasterizer.rasterize(&video.path, timestamp, &output).await {
                Ok(()) => {
                    if file_exists(&output).await {
                        Ok(())
                    } else {
                        Err(ParseError::FrameExtractionFailed {
                            timestamp,
                            reason: "工具返回成功但输出文件不存在".to_string(),
                        })
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!("💾 已抽取帧: {} ({:.3}s)", file_name, timestamp);
                    frames.push(ExtractedFrame {
                        scene_id,
                        sequence_index,
                        file_name,
                    });
                }
                Err(e) => {
                    warn!("⚠️  [抽帧] 场景 {}: {}", scene_id, e);
                    // 失败时可能留下半个文件
                    if file_exists(&output).await {
                        let _ = tokio::fs::remove_file(&output).await;
                    }
                }
            }
        }

        info!(
            "场景 {}: 抽取 {}/{} 帧",
            scene_id,
            frames.len(),
            plan.frame_count
        );
        frames
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
