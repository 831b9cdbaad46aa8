//! 请求工作目录的分配与回收
//!
//! 每个请求在基础目录下拥有一个以 UUID 命名的子目录，帧文件只写在这里。
//! 过期回收在处理新请求前顺带执行，没有后台定时器；同一基础目录可能被多个
//! 请求和清理同时访问，清理过程中目录出现或消失都按正常情况处理。

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ParseError, Result};

/// 单个请求的工作目录
#[derive(Debug, Clone)]
pub struct RequestWorkspace {
    pub request_id: Uuid,
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// 一次清理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub failed: usize,
    /// 非 UUID 命名、未过期或已被他人删除的条目
    pub skipped: usize,
}

/// `delete_now` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    AlreadyAbsent,
}

impl Deletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deletion::Deleted => "deleted",
            Deletion::AlreadyAbsent => "already_absent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageLifecycle {
    base_dir: PathBuf,
    ttl: Duration,
}

impl StorageLifecycle {
    /// 创建基础目录（已存在则直接使用）
    pub fn new(base_dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| ParseError::Storage(format!("创建基础目录失败 {}: {}", base_dir.display(), e)))?;
        Ok(Self { base_dir, ttl })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn workspace_dir(&self, request_id: Uuid) -> PathBuf {
        self.base_dir.join(request_id.to_string())
    }

    /// 分配一个新的工作目录
    ///
    /// 标识是随机的 128 位 UUID；`create_dir` 不会复用已存在的目录，
    /// 万一碰撞会以错误返回而不是写进别人的目录。
    pub fn allocate(&self) -> Result<RequestWorkspace> {
        let request_id = Uuid::new_v4();
        let directory = self.workspace_dir(request_id);
        fs::create_dir(&directory)
            .map_err(|e| ParseError::Storage(format!("创建工作目录失败 {}: {}", directory.display(), e)))?;

        debug!("分配工作目录: {}", directory.display());
        Ok(RequestWorkspace {
            request_id,
            directory,
            created_at: Utc::now(),
        })
    }

    pub fn exists(&self, request_id: Uuid) -> bool {
        self.workspace_dir(request_id).is_dir()
    }

    /// 立即删除指定工作目录；目录不存在时返回 `AlreadyAbsent`
    pub fn delete_now(&self, request_id: Uuid) -> Result<Deletion> {
        let directory = self.workspace_dir(request_id);
        match fs::remove_dir_all(&directory) {
            Ok(()) => {
                info!("🗑️  已删除工作目录: {}", request_id);
                Ok(Deletion::Deleted)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Deletion::AlreadyAbsent),
            Err(e) => Err(ParseError::Storage(format!("删除工作目录失败 {}: {}", request_id, e))),
        }
    }

    /// 按配置的 TTL 清理
    pub fn evict_expired(&self) -> EvictionReport {
        self.evict_older_than(self.ttl)
    }

    /// 删除创建时间早于 `max_age` 的工作目录，单个失败不影响其余条目
    pub fn evict_older_than(&self, max_age: Duration) -> EvictionReport {
        self.sweep(|age| age > max_age)
    }

    /// 删除全部工作目录（进程退出前调用）
    pub fn purge_all(&self) -> EvictionReport {
        self.sweep(|_| true)
    }

    fn sweep(&self, expired: impl Fn(Duration) -> bool) -> EvictionReport {
        self.sweep_with(expired, |path| fs::remove_dir_all(path))
    }

    /// `remove` 负责删除单个工作目录
    fn sweep_with(
        &self,
        expired: impl Fn(Duration) -> bool,
        remove: impl Fn(&Path) -> std::io::Result<()>,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();

        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("⚠️  无法读取基础目录 {}: {}", self.base_dir.display(), e);
                return report;
            }
        };

        let now = SystemTime::now();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("读取目录项失败: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };

            let name = entry.file_name();
            let is_workspace = name.to_str().map(|n| Uuid::parse_str(n).is_ok()).unwrap_or(false);
            if !is_workspace {
                report.skipped += 1;
                continue;
            }

            // 条目可能在扫描过程中被删除
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => metadata,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };

            let created = metadata.created().or_else(|_| metadata.modified()).unwrap_or(now);
            let age = now.duration_since(created).unwrap_or(Duration::ZERO);
            if !expired(age) {
                report.skipped += 1;
                continue;
            }

            match remove(entry.path().as_path()) {
                Ok(()) => {
                    debug!("清理过期工作目录: {:?} (存在 {}s)", name, age.as_secs());
                    report.removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => report.skipped += 1,
                Err(e) => {
                    warn!("⚠️  清理 {:?} 失败: {}", name, e);
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 {
            info!("🧹 已清理 {} 个过期工作目录", report.removed);
        }
        report
    }
}
