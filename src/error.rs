use std::fmt;
use std::path::PathBuf;

/// 索引层统一错误
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// 底层文件系统 / 目录失败
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 生命周期状态不满足（未 open、已 drop、分区已关闭……）
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// segment 校验失败（magic / version / state / 长度 / checksum / 反序列化）
    #[error("corrupt segment {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// 多个释放动作失败：第一个为主错误，其余挂在 suppressed
    #[error("{primary}{}", SuppressedSuffix(suppressed))]
    Aggregate {
        primary: Box<IndexError>,
        suppressed: Vec<IndexError>,
    },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

struct SuppressedSuffix<'a>(&'a [IndexError]);

impl fmt::Display for SuppressedSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " ({} suppressed:", self.0.len())?;
        for e in self.0 {
            write!(f, " [{}]", e)?;
        }
        write!(f, ")")
    }
}

impl IndexError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        IndexError::IllegalState(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        IndexError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 把清理阶段的次要错误挂到当前错误上（保持当前错误为主因）。
    pub fn with_suppressed(self, more: Vec<IndexError>) -> Self {
        if more.is_empty() {
            return self;
        }
        match self {
            IndexError::Aggregate {
                primary,
                mut suppressed,
            } => {
                suppressed.extend(more);
                IndexError::Aggregate {
                    primary,
                    suppressed,
                }
            }
            other => IndexError::Aggregate {
                primary: Box::new(other),
                suppressed: more,
            },
        }
    }

    /// 主因（Aggregate 时取 primary）
    pub fn primary(&self) -> &IndexError {
        match self {
            IndexError::Aggregate { primary, .. } => primary.primary(),
            other => other,
        }
    }

    pub fn suppressed(&self) -> &[IndexError] {
        match self {
            IndexError::Aggregate { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self.primary(), IndexError::IllegalState(_))
    }
}

/// "全部关闭、报告一个"：对每个资源都尝试释放，首个失败为主错误，其余挂为 suppressed。
pub fn close_all<T, I, F>(resources: I, mut close: F) -> Result<()>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<()>,
{
    let mut errors: Vec<IndexError> = Vec::new();
    for r in resources {
        if let Err(e) = close(r) {
            errors.push(e);
        }
    }
    let mut iter = errors.into_iter();
    match iter.next() {
        None => Ok(()),
        Some(first) => Err(first.with_suppressed(iter.collect())),
    }
}

/// 静默释放：只在 debug 日志里留痕（用于已经有主错误在传播的回滚路径）。
pub fn close_all_silently<T, I, F>(resources: I, close: F)
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<()>,
{
    if let Err(e) = close_all(resources, close) {
        tracing::debug!("Ignoring release failure during cleanup: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(msg: &str) -> IndexError {
        IndexError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }

    #[test]
    fn close_all_attempts_everything_and_keeps_first_error_primary() {
        let mut attempted = Vec::new();
        let r = close_all(1..=4, |i| {
            attempted.push(i);
            if i % 2 == 0 {
                Err(io(&format!("boom-{i}")))
            } else {
                Ok(())
            }
        });

        assert_eq!(attempted, vec![1, 2, 3, 4]);
        let err = r.unwrap_err();
        assert!(err.primary().to_string().contains("boom-2"));
        assert_eq!(err.suppressed().len(), 1);
        assert!(err.suppressed()[0].to_string().contains("boom-4"));
    }

    #[test]
    fn with_suppressed_flattens_into_existing_aggregate() {
        let e = io("a").with_suppressed(vec![io("b")]);
        let e = e.with_suppressed(vec![io("c")]);
        assert!(e.primary().to_string().contains("a"));
        assert_eq!(e.suppressed().len(), 2);
        assert!(e.to_string().contains("2 suppressed"));
    }

    #[test]
    fn illegal_state_survives_aggregation() {
        let e = IndexError::illegal_state("index must be open before use")
            .with_suppressed(vec![io("x")]);
        assert!(e.is_illegal_state());
    }
}
