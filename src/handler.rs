use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MAX_FRAMES_PER_SCENE;
use crate::error::ParseError;
use crate::frame_extractor::FrameRasterizer;
use crate::metadata::AnalyzeResponse;
use crate::processor::{ProcessConfig, ScenePipeline};
use crate::scene_detector::ShotBoundaryDetector;
use crate::storage::{RequestWorkspace, StorageLifecycle};

/// 允许上传的视频扩展名
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "wmv", "m4v"];

/// 所有 handler 共享的状态
pub struct AppState<D, R> {
    pub pipeline: ScenePipeline<D, R>,
    pub storage: StorageLifecycle,
    /// 请求未携带参数时使用的默认值
    pub defaults: ProcessConfig,
}

/// 构建路由
pub fn router<D, R>(state: Arc<AppState<D, R>>, max_upload_bytes: usize) -> Router
where
    D: ShotBoundaryDetector + 'static,
    R: FrameRasterizer + 'static,
{
    let frames = ServeDir::new(state.storage.base_dir());

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/analyze", post(handle_analyze::<D, R>))
        .route(
            "/requests/:id",
            get(handle_request_status::<D, R>).delete(handle_delete_request::<D, R>),
        )
        .nest_service("/frames", frames)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// 稳定的错误代码
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BadRequest".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "InternalError".to_string(),
            message: message.into(),
        }
    }
}

impl From<ParseError> for ApiError {
    fn from(err: ParseError) -> Self {
        // 非致命错误只应在管线内部消化，走到这里说明是内部错误
        let status = if !err.is_fatal() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            match err.kind() {
                "DetectionFailed" | "NoScenesDetected" | "NoFramesExtracted" => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                "InvalidInput" | "InvalidTimecode" => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        Self {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ResponseJson(ErrorResponse {
            success: false,
            error: self.code,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// 健康检查 Handler
pub async fn health_check() -> &'static str {
    "OK"
}

/// 上传视频并拆解场景
///
/// multipart 字段：`video`（文件，必填）、`threshold`、`frames_per_scene`（可选）。
pub async fn handle_analyze<D, R>(
    State(state): State<Arc<AppState<D, R>>>,
    multipart: Multipart,
) -> Result<ResponseJson<AnalyzeResponse>, ApiError>
where
    D: ShotBoundaryDetector + 'static,
    R: FrameRasterizer + 'static,
{
    // 处理新请求前顺带清理过期目录
    let storage = state.storage.clone();
    match tokio::task::spawn_blocking(move || storage.evict_expired()).await {
        Ok(report) if report.failed > 0 => warn!("⚠️  {} 个过期目录清理失败", report.failed),
        Ok(_) => {}
        Err(e) => warn!("⚠️  清理任务异常: {}", e),
    }

    let storage = state.storage.clone();
    let workspace = tokio::task::spawn_blocking(move || storage.allocate())
        .await
        .map_err(|e| ApiError::internal(format!("分配工作目录任务异常: {}", e)))??;
    info!("收到分析请求: {}", workspace.request_id);

    match analyze(&state, &workspace, multipart).await {
        Ok(response) => {
            info!(
                "处理完成: 请求 {}，{} 个场景",
                response.request_id, response.scene_count
            );
            Ok(ResponseJson(response))
        }
        Err(e) => {
            error!("请求 {} 处理失败: {} ({})", workspace.request_id, e.message, e.code);
            let storage = state.storage.clone();
            let request_id = workspace.request_id;
            match tokio::task::spawn_blocking(move || storage.delete_now(request_id)).await {
                Ok(Ok(_)) => {}
                Ok(Err(cleanup)) => warn!("⚠️  清理失败请求的目录出错: {}", cleanup),
                Err(join) => warn!("⚠️  清理任务异常: {}", join),
            }
            Err(e)
        }
    }
}

async fn analyze<D, R>(
    state: &AppState<D, R>,
    workspace: &RequestWorkspace,
    mut multipart: Multipart,
) -> Result<AnalyzeResponse, ApiError>
where
    D: ShotBoundaryDetector,
    R: FrameRasterizer,
{
    let mut config = state.defaults;
    let mut video_path = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("无法解析上传内容: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "video" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let extension = validate_video_name(&file_name)?;
                let path = workspace.directory.join(format!("source.{}", extension));

                let mut file = tokio::fs::File::create(&path).await.map_err(ParseError::from)?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("上传中断: {}", e)))?
                {
                    file.write_all(&chunk).await.map_err(ParseError::from)?;
                }
                file.flush().await.map_err(ParseError::from)?;
                video_path = Some(path);
            }
            "threshold" => {
                let text = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                config.threshold = parse_threshold(&text)?;
            }
            "frames_per_scene" => {
                let text = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                config.frames_per_scene = parse_frames_per_scene(&text)?;
            }
            _ => {}
        }
    }

    let video_path = video_path.ok_or_else(|| ApiError::bad_request("未提供视频文件 (字段 video)"))?;

    let scenes = state.pipeline.process(&video_path, workspace, config).await?;
    let request_id = workspace.request_id.to_string();
    Ok(AnalyzeResponse {
        frames_base_url: format!("/frames/{}/", request_id),
        request_id,
        created_at: workspace.created_at,
        scene_count: scenes.len(),
        scenes,
    })
}

/// 返回小写扩展名
fn validate_video_name(file_name: &str) -> Result<String, ApiError> {
    if file_name.trim().is_empty() {
        return Err(ApiError::bad_request("文件名为空"));
    }
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(ApiError::bad_request(format!(
            "不支持的文件类型: {}，允许: {}",
            file_name,
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

fn parse_threshold(text: &str) -> Result<f64, ApiError> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(ParseError::InvalidInput(format!("threshold 无效: {}", text)).into()),
    }
}

fn parse_frames_per_scene(text: &str) -> Result<usize, ApiError> {
    match text.trim().parse::<usize>() {
        Ok(value) if (1..=MAX_FRAMES_PER_SCENE).contains(&value) => Ok(value),
        _ => Err(ParseError::InvalidInput(format!(
            "frames_per_scene 必须在 1-{} 之间: {}",
            MAX_FRAMES_PER_SCENE, text
        ))
        .into()),
    }
}

fn parse_request_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request(format!("无效的请求 ID: {}", id)))
}

#[derive(Debug, Serialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub exists: bool,
}

/// 查询工作目录是否仍然存在
pub async fn handle_request_status<D, R>(
    State(state): State<Arc<AppState<D, R>>>,
    UrlPath(id): UrlPath<String>,
) -> Result<(StatusCode, ResponseJson<RequestStatus>), ApiError>
where
    D: ShotBoundaryDetector + 'static,
    R: FrameRasterizer + 'static,
{
    let request_id = parse_request_id(&id)?;
    let exists = state.storage.exists(request_id);
    let status = if exists { StatusCode::OK } else { StatusCode::NOT_FOUND };
    Ok((
        status,
        ResponseJson(RequestStatus {
            request_id: request_id.to_string(),
            exists,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub request_id: String,
    /// deleted 或 already_absent
    pub status: String,
}

/// 主动删除工作目录，重复删除不是错误
pub async fn handle_delete_request<D, R>(
    State(state): State<Arc<AppState<D, R>>>,
    UrlPath(id): UrlPath<String>,
) -> Result<ResponseJson<DeleteResponse>, ApiError>
where
    D: ShotBoundaryDetector + 'static,
    R: FrameRasterizer + 'static,
{
    let request_id = parse_request_id(&id)?;
    let storage = state.storage.clone();
    let deletion = tokio::task::spawn_blocking(move || storage.delete_now(request_id))
        .await
        .map_err(|e| ApiError::internal(format!("删除任务异常: {}", e)))??;

    Ok(ResponseJson(DeleteResponse {
        request_id: request_id.to_string(),
        status: deletion.as_str().to_string(),
    }))
}
