//! 错误类型定义模块
//!
//! 定义 MikuDB 公共类型的统一错误类型 MikuError 和 Result 别名。

use thiserror::Error;

/// MikuDB 错误类型
#[derive(Error, Debug)]
pub enum MikuError {
    /// ObjectId 无效
    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    /// 命名空间无效
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(String),
}

/// MikuDB Result 类型别名
pub type MikuResult<T> = Result<T, MikuError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Namespace;

    #[test]
    fn test_namespace_errors_surface_as_validation_variants() {
        let err = Namespace::parse("nodot").unwrap_err();
        assert!(matches!(
            err,
            MikuError::InvalidNamespace(_) | MikuError::Validation(_)
        ));
        assert!(!err.to_string().is_empty());
    }
}
