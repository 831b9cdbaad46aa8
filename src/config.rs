use anyhow::{bail, Context, Result};
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::frame_extractor::FfmpegRasterizer;
use crate::processor::ProcessConfig;
use crate::scene_detector::{DetectorBackend, FfmpegSceneDetector};

/// 每个场景最多允许请求的帧数
pub const MAX_FRAMES_PER_SCENE: usize = 20;

const SECTION: &str = "scene_sampler";

/// 完整的服务配置
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    /// 单次处理的默认参数
    pub process: ProcessConfig,
    /// 检测器实现：ffmpeg 或 native
    pub detector: String,
    /// 两个切点之间的最短间隔（秒）
    pub min_scene_duration: f64,
    /// 检测前的缩放倍数
    pub downscale_factor: u32,
    /// 输出帧宽度，0 表示保持原始分辨率
    pub frame_width: u32,
    pub jpeg_quality: u8,
    pub extract_timeout_secs: u64,
    /// 工作目录的根目录
    pub base_dir: PathBuf,
    /// 工作目录保留时长（秒）
    pub ttl_secs: u64,
    pub max_upload_mb: usize,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            process: ProcessConfig::default(),
            detector: "ffmpeg".to_string(),
            min_scene_duration: 0.5,
            downscale_factor: 2,
            frame_width: 640,
            jpeg_quality: 3,
            extract_timeout_secs: 30,
            base_dir: env::temp_dir().join("video_uploads"),
            ttl_secs: 3600,
            max_upload_mb: 500,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            log_level: "info".to_string(),
        }
    }
}

impl ExtendedConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn build_detector(&self) -> Result<DetectorBackend> {
        match self.detector.as_str() {
            "ffmpeg" => Ok(DetectorBackend::Ffmpeg(FfmpegSceneDetector {
                ffmpeg: self.ffmpeg_path.clone(),
                ffprobe: self.ffprobe_path.clone(),
                downscale_factor: self.downscale_factor,
                min_scene_duration: self.min_scene_duration,
                ..FfmpegSceneDetector::default()
            })),
            #[cfg(feature = "native")]
            "native" => Ok(DetectorBackend::Native(crate::native_detector::NativeSceneDetector {
                downscale_factor: self.downscale_factor,
                min_scene_duration: self.min_scene_duration,
            })),
            other => bail!("不支持的检测器: {}", other),
        }
    }

    pub fn build_rasterizer(&self) -> FfmpegRasterizer {
        FfmpegRasterizer {
            ffmpeg: self.ffmpeg_path.clone(),
            timeout: Duration::from_secs(self.extract_timeout_secs),
            scale_width: (self.frame_width > 0).then_some(self.frame_width),
            quality: self.jpeg_quality,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.process.threshold.is_finite() || self.process.threshold <= 0.0 {
            bail!("threshold 必须为正数: {}", self.process.threshold);
        }
        if self.process.frames_per_scene == 0 || self.process.frames_per_scene > MAX_FRAMES_PER_SCENE {
            bail!(
                "frames_per_scene 必须在 1-{} 之间: {}",
                MAX_FRAMES_PER_SCENE,
                self.process.frames_per_scene
            );
        }
        if self.downscale_factor == 0 {
            bail!("downscale_factor 不能为 0");
        }
        if !(2..=31).contains(&self.jpeg_quality) {
            bail!("jpeg_quality 必须在 2-31 之间: {}", self.jpeg_quality);
        }
        if self.extract_timeout_secs == 0 {
            bail!("extract_timeout_secs 不能为 0");
        }
        Ok(())
    }
}

/// 配置加载器
///
/// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
pub struct ConfigLoader {
    file: Option<Ini>,
    env: Box<dyn Fn(&str) -> Option<String>>,
}

impl ConfigLoader {
    /// 读取显式指定的配置文件，未指定时依次尝试默认位置
    pub fn new(config_file: Option<&Path>) -> Result<Self> {
        let file = match config_file {
            Some(path) => Some(Self::load_ini(path)?),
            None => Self::default_location().map(|p| Self::load_ini(&p)).transpose()?,
        };
        Ok(Self::from_sources(file, |key| env::var(key).ok()))
    }

    pub fn from_sources(file: Option<Ini>, env: impl Fn(&str) -> Option<String> + 'static) -> Self {
        Self {
            file,
            env: Box::new(env),
        }
    }

    /// 加载完整配置
    pub fn load_extended_config(config_file: Option<&Path>) -> Result<ExtendedConfig> {
        Self::new(config_file)?.resolve(None, None)
    }

    pub fn resolve(&self, threshold: Option<f64>, frames_per_scene: Option<usize>) -> Result<ExtendedConfig> {
        let defaults = ExtendedConfig::default();
        let config = ExtendedConfig {
            process: ProcessConfig {
                threshold: threshold
                    .or(self.lookup("SCENE_SAMPLER_THRESHOLD", SECTION, "threshold"))
                    .unwrap_or(defaults.process.threshold),
                frames_per_scene: frames_per_scene
                    .or(self.lookup("SCENE_SAMPLER_FRAMES_PER_SCENE", SECTION, "frames_per_scene"))
                    .unwrap_or(defaults.process.frames_per_scene),
            },
            detector: self
                .lookup("SCENE_SAMPLER_DETECTOR", SECTION, "detector")
                .unwrap_or(defaults.detector),
            min_scene_duration: self
                .lookup("SCENE_SAMPLER_MIN_SCENE_DURATION", SECTION, "min_scene_duration")
                .unwrap_or(defaults.min_scene_duration),
            downscale_factor: self
                .lookup("SCENE_SAMPLER_DOWNSCALE_FACTOR", SECTION, "downscale_factor")
                .unwrap_or(defaults.downscale_factor),
            frame_width: self
                .lookup("SCENE_SAMPLER_FRAME_WIDTH", SECTION, "frame_width")
                .unwrap_or(defaults.frame_width),
            jpeg_quality: self
                .lookup("SCENE_SAMPLER_JPEG_QUALITY", SECTION, "jpeg_quality")
                .unwrap_or(defaults.jpeg_quality),
            extract_timeout_secs: self
                .lookup("SCENE_SAMPLER_EXTRACT_TIMEOUT", SECTION, "extract_timeout_secs")
                .unwrap_or(defaults.extract_timeout_secs),
            base_dir: self
                .lookup::<String>("SCENE_SAMPLER_BASE_DIR", "storage", "base_dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_dir),
            ttl_secs: self
                .lookup("SCENE_SAMPLER_TTL_SECS", "storage", "ttl_secs")
                .unwrap_or(defaults.ttl_secs),
            max_upload_mb: self
                .lookup("SCENE_SAMPLER_MAX_UPLOAD_MB", "storage", "max_upload_mb")
                .unwrap_or(defaults.max_upload_mb),
            ffmpeg_path: self
                .lookup::<String>("SCENE_SAMPLER_FFMPEG", "tools", "ffmpeg")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: self
                .lookup::<String>("SCENE_SAMPLER_FFPROBE", "tools", "ffprobe")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_path),
            log_level: self
                .lookup("LOG_LEVEL", "logging", "level")
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// 环境变量优先，其次配置文件的指定节，最后 [DEFAULT] 节；空值视为未设置
    fn lookup<T: FromStr>(&self, env_key: &str, section: &str, key: &str) -> Option<T> {
        let from_env = (self.env)(env_key).filter(|v| !v.trim().is_empty());
        let from_file = || {
            self.file.as_ref().and_then(|ini| {
                ini.get(section, key)
                    .or_else(|| ini.get("DEFAULT", key))
                    .filter(|v| !v.trim().is_empty())
            })
        };
        from_env.or_else(from_file).and_then(|v| v.trim().parse().ok())
    }

    fn load_ini(path: &Path) -> Result<Ini> {
        if !path.exists() {
            bail!("配置文件不存在: {}", path.display());
        }
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", path.display(), e))?;
        Ok(ini)
    }

    fn default_location() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("scene-sampler.ini"),
            PathBuf::from(".scene-sampler.ini"),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".scene-sampler.ini"));
        }
        candidates.push(PathBuf::from("/etc/scene-sampler.ini"));
        candidates.into_iter().find(|p| p.exists())
    }

    /// 写出一份默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = ExtendedConfig::default();
        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };
        set(SECTION, "threshold", defaults.process.threshold.to_string());
        set(SECTION, "frames_per_scene", defaults.process.frames_per_scene.to_string());
        set(SECTION, "detector", defaults.detector.clone());
        set(SECTION, "min_scene_duration", defaults.min_scene_duration.to_string());
        set(SECTION, "downscale_factor", defaults.downscale_factor.to_string());
        set(SECTION, "frame_width", defaults.frame_width.to_string());
        set(SECTION, "jpeg_quality", defaults.jpeg_quality.to_string());
        set(SECTION, "extract_timeout_secs", defaults.extract_timeout_secs.to_string());
        set("storage", "base_dir", defaults.base_dir.to_string_lossy().to_string());
        set("storage", "ttl_secs", defaults.ttl_secs.to_string());
        set("storage", "max_upload_mb", defaults.max_upload_mb.to_string());
        set("tools", "ffmpeg", defaults.ffmpeg_path.to_string_lossy().to_string());
        set("tools", "ffprobe", defaults.ffprobe_path.to_string_lossy().to_string());
        set("logging", "level", defaults.log_level.clone());

        ini.write(config_path)
            .with_context(|| format!("写入配置文件失败: {}", config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn loader(ini: Option<&str>, env: &[(&str, &str)]) -> ConfigLoader {
        let file = ini.map(|content| {
            let mut ini = Ini::new();
            ini.read(content.to_string()).unwrap();
            ini
        });
        let env: HashMap<String, String> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ConfigLoader::from_sources(file, move |key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = loader(None, &[]).resolve(None, None).unwrap();
        assert_eq!(config.process.threshold, 30.0);
        assert_eq!(config.process.frames_per_scene, 3);
        assert_eq!(config.ttl_secs, 3600);
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.detector, "ffmpeg");
    }

    #[test]
    fn test_priority_cli_env_file() {
        let ini = "[scene_sampler]\nthreshold = 20\nframes_per_scene = 5\njpeg_quality = 4\n[storage]\nttl_secs = 60\n";
        let loader = loader(Some(ini), &[("SCENE_SAMPLER_THRESHOLD", "25"), ("SCENE_SAMPLER_TTL_SECS", "")]);

        let config = loader.resolve(None, None).unwrap();
        assert_eq!(config.process.threshold, 25.0);
        assert_eq!(config.process.frames_per_scene, 5);
        assert_eq!(config.jpeg_quality, 4);
        assert_eq!(config.ttl_secs, 60);

        let config = loader.resolve(Some(40.0), Some(2)).unwrap();
        assert_eq!(config.process.threshold, 40.0);
        assert_eq!(config.process.frames_per_scene, 2);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(loader(None, &[]).resolve(Some(-1.0), None).is_err());
        assert!(loader(None, &[]).resolve(None, Some(0)).is_err());
        assert!(loader(None, &[("SCENE_SAMPLER_JPEG_QUALITY", "1")]).resolve(None, None).is_err());
    }

    #[test]
    fn test_default_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene-sampler.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let config = ConfigLoader::from_sources(Some(ConfigLoader::load_ini(&path).unwrap()), |_| None)
            .resolve(None, None)
            .unwrap();
        assert_eq!(config.process.threshold, 30.0);
        assert_eq!(config.max_upload_mb, 500);
    }

    #[test]
    fn test_rasterizer_keeps_source_size_when_width_is_zero() {
        let config = loader(None, &[("SCENE_SAMPLER_FRAME_WIDTH", "0")]).resolve(None, None).unwrap();
        assert_eq!(config.build_rasterizer().scale_width, None);
        assert!(config.build_detector().is_ok());
    }
}
