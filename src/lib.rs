pub mod config;
pub mod error;
pub mod frame_extractor;
pub mod handler;
pub mod metadata;
#[cfg(feature = "native")]
pub mod native_detector;
pub mod processor;
pub mod sampler;
pub mod scene_detector;
pub mod storage;
pub mod timecode;
pub mod tool;

pub use config::{ConfigLoader, ExtendedConfig};
pub use error::{ParseError, Result};
pub use frame_extractor::{FfmpegRasterizer, FrameExtractor, FrameRasterizer};
pub use handler::{router, AppState};
pub use metadata::{AnalyzeResponse, ExtractedFrame, SceneResult, SceneSpan};
#[cfg(feature = "native")]
pub use native_detector::NativeSceneDetector;
pub use processor::{ProcessConfig, ScenePipeline};
pub use sampler::SamplingPlan;
pub use scene_detector::{DetectorBackend, FfmpegSceneDetector, SceneBoundaryDetector, ShotBoundaryDetector, VideoHandle};
pub use storage::{RequestWorkspace, StorageLifecycle};
