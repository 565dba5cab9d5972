use thiserror::Error;

/// 配置加载相关错误
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("未找到配置文件: {0}")]
    NotFound(String),

    #[error("配置不存在")]
    NoProfile,

    #[error("配置加载失败: {0}")]
    LoadFailed(String),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
