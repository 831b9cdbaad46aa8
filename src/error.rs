//! 场景拆解流程的错误类型
//!
//! 单帧、单场景的失败只在内部记录（`SceneTooShort`、`FrameExtractionFailed`），
//! 其余类型会终止整个请求，由边界层翻译成面向用户的消息。

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    /// 底层镜头检测无法运行（文件损坏、无法解码等）
    #[error("场景检测失败: {0}")]
    DetectionFailed(String),

    /// 没有检测到任何边界，且视频时长为 0，无法构造整段回退场景
    #[error("未检测到任何场景")]
    NoScenesDetected,

    /// 场景过短，不做采样（仅内部使用）
    #[error("场景 {scene_id} 过短 ({duration:.3}s)，跳过")]
    SceneTooShort { scene_id: usize, duration: f64 },

    /// 单个时间点抽帧失败（仅内部使用）
    #[error("在 {timestamp:.3}s 处抽帧失败: {reason}")]
    FrameExtractionFailed { timestamp: f64, reason: String },

    /// 所有场景都没有抽到帧
    #[error("所有场景均未抽取到帧")]
    NoFramesExtracted,

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("无效的时间码: {0}")]
    InvalidTimecode(String),

    #[error("无效的参数: {0}")]
    InvalidInput(String),
}

impl ParseError {
    /// 稳定的错误代码，边界层据此映射响应
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::DetectionFailed(_) => "DetectionFailed",
            ParseError::NoScenesDetected => "NoScenesDetected",
            ParseError::SceneTooShort { .. } => "SceneTooShort",
            ParseError::FrameExtractionFailed { .. } => "FrameExtractionFailed",
            ParseError::NoFramesExtracted => "NoFramesExtracted",
            ParseError::Storage(_) => "StorageError",
            ParseError::InvalidTimecode(_) => "InvalidTimecode",
            ParseError::InvalidInput(_) => "InvalidInput",
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ParseError::SceneTooShort { .. } | ParseError::FrameExtractionFailed { .. }
        )
    }
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::Storage(err.to_string())
    }
}
