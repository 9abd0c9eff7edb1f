use serde::{Deserialize, Serialize};

/// 自定义错误信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// 查询语句无法解析，对当前查询是致命错误
    ParseError(String),
    /// 不支持的抽样方法
    UnsupportedMethod(String),
    /// 协调器不认识的抽样方法名
    InvalidMethod(String),
    /// 缺少必须的参数，比如 FastConverge 的主列
    MissingParameter(String),
    /// 构建 scramble 表时外部执行器失败
    ScramblingExecutionFailed(String),
    /// 外部执行器返回的错误
    ExecutionError(String),
    /// 合并部分聚合结果时的内部不一致
    PlanCompositionError(String),
    /// 计划执行被取消
    Cancelled,
    /// 无效数据
    InvalidData(String),
    /// 文件IO错误
    IO(String),
    //配置错误
    ConfigError(String),
    /// 配置监听错误
    ConfigWatcherError(String),
    /// 锁错误
    MutexError(String),
}

/// 自定义错误类型
pub type Result<T> = std::result::Result<T, Error>;

/// 实现标准库std::error::Error特征
impl std::error::Error for Error {}

/// 实现格式输出
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ParseError(msg) => write!(f, "parse error: {msg}"),
            Error::UnsupportedMethod(msg) => write!(f, "unsupported scrambling method: {msg}"),
            Error::InvalidMethod(msg) => write!(f, "invalid scrambling method: {msg}"),
            Error::MissingParameter(msg) => write!(f, "missing parameter: {msg}"),
            Error::ScramblingExecutionFailed(msg) => write!(f, "scrambling failed: {msg}"),
            Error::ExecutionError(msg) => write!(f, "execution error: {msg}"),
            Error::PlanCompositionError(msg) => write!(f, "plan composition error: {msg}"),
            Error::Cancelled => write!(f, "plan execution cancelled"),
            Error::InvalidData(msg) => write!(f, "invalid data:{msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ConfigError(msg) => write!(f, "error: config error:{msg}"),
            Error::ConfigWatcherError(msg) => write!(f, "error: config watcher error:{msg}"),
            Error::MutexError(msg) => write!(f, "error: mutex error:{msg}"),
        }
    }
}

/// 构建一个 Error::InvalidData
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => {
        $crate::db_error::Error::InvalidData(format!($($args)*))
    };
}

/// 构建一个 Error::PlanCompositionError
#[macro_export]
macro_rules! errplan {
    ($($args:tt)*) => {
        $crate::db_error::Error::PlanCompositionError(format!($($args)*))
    };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::ConfigWatcherError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::ExecutionError(format!("worker task failed: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::MutexError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn test_errdata() {
        let err = errdata!("bad {}", "row");
        assert_eq!(err, Error::InvalidData("bad row".to_string()));
    }

    #[test]
    fn test_errplan() {
        let err = errplan!("column count {} != {}", 2, 3);
        assert_eq!(err.to_string(), "plan composition error: column count 2 != 3");
    }
}
