use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db_error::{Error, Result};
use crate::sql::Dialect;

/// 默认的配置文件位置，可以用 `MINI_AQP_CONFIG` 覆盖
pub fn get_config_path() -> PathBuf {
    std::env::var_os("MINI_AQP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigWrapper {
    pub config: Config,
}

/// 构建 scramble 表时的选项，对应 options 映射中的四个键
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrambleOptions {
    // 分层列名
    pub tier_column_name: String,
    // 分块列名
    pub block_column_name: String,
    // 默认 scramble 表名后缀
    pub scramble_table_suffix: String,
    // 每个分块的目标行数
    pub scramble_table_block_size: f64,
}

impl Default for ScrambleOptions {
    fn default() -> Self {
        Self {
            tier_column_name: "verdictdbtier".to_string(),
            block_column_name: "verdictdbblock".to_string(),
            scramble_table_suffix: "_scrambled".to_string(),
            scramble_table_block_size: 1e6,
        }
    }
}

impl ScrambleOptions {
    /// 转成协调器使用的 options 映射
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("tierColumnName".to_string(), self.tier_column_name.clone()),
            ("blockColumnName".to_string(), self.block_column_name.clone()),
            ("scrambleTableSuffix".to_string(), self.scramble_table_suffix.clone()),
            ("scrambleTableBlockSize".to_string(), format!("{:e}", self.scramble_table_block_size)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // 选择抽样方案时，相对最低代价允许多花的比例
    pub relative_target_cost: f64,

    // 每个表引用期望读取的行比例
    pub target_sampling_ratio: f64,

    // scramble 表放在哪个 schema，为空时与原表相同
    pub scramble_schema: Option<String>,

    // 中间表所在 schema
    pub scratchpad_schema: String,

    // 计划执行的并发 worker 数
    pub worker_count: usize,

    // 分区执行时把分块切成几段
    pub ola_partitions: usize,

    // 目标数据库方言
    pub dialect: Dialect,

    // FastConverge：频率低于该比例的主列取值视为稀有组
    pub rare_group_fraction: f64,

    pub scramble: ScrambleOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relative_target_cost: 0.1,
            target_sampling_ratio: 0.1,
            scramble_schema: None,
            scratchpad_schema: "verdictdb_temp".to_string(),
            worker_count: 4,
            ola_partitions: 4,
            dialect: Dialect::Postgres,
            rare_group_fraction: 0.001,
            scramble: ScrambleOptions::default(),
        }
    }
}

pub struct ConfigBuilder {
    pub inner: Config,
}

impl ConfigBuilder {
    pub fn relative_target_cost(mut self, ratio: f64) -> Self {
        self.inner.relative_target_cost = ratio;
        self
    }
    pub fn target_sampling_ratio(mut self, ratio: f64) -> Self {
        self.inner.target_sampling_ratio = ratio;
        self
    }
    pub fn scramble_schema(mut self, schema: impl Into<String>) -> Self {
        self.inner.scramble_schema = Some(schema.into());
        self
    }
    pub fn scratchpad_schema(mut self, schema: impl Into<String>) -> Self {
        self.inner.scratchpad_schema = schema.into();
        self
    }
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.inner.worker_count = workers;
        self
    }
    pub fn ola_partitions(mut self, partitions: usize) -> Self {
        self.inner.ola_partitions = partitions;
        self
    }
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.inner.dialect = dialect;
        self
    }
    pub fn block_size(mut self, block_size: f64) -> Self {
        self.inner.scramble.scramble_table_block_size = block_size;
        self
    }

    fn validate(&self) -> Result<()> {
        let c = &self.inner;
        if !(c.relative_target_cost >= 0.0) {
            return Err(Error::ConfigError(format!(
                "relative_target_cost must be non-negative, got {}",
                c.relative_target_cost
            )));
        }
        if !(c.target_sampling_ratio > 0.0 && c.target_sampling_ratio <= 1.0) {
            return Err(Error::ConfigError(format!(
                "target_sampling_ratio must be in (0, 1], got {}",
                c.target_sampling_ratio
            )));
        }
        if c.worker_count == 0 || c.ola_partitions == 0 {
            return Err(Error::ConfigError("worker_count and ola_partitions must be positive".into()));
        }
        if !(c.scramble.scramble_table_block_size >= 1.0) {
            return Err(Error::ConfigError(format!(
                "scramble_table_block_size must be at least 1, got {}",
                c.scramble.scramble_table_block_size
            )));
        }
        if !(0.0..1.0).contains(&c.rare_group_fraction) {
            return Err(Error::ConfigError(format!(
                "rare_group_fraction must be in [0, 1), got {}",
                c.rare_group_fraction
            )));
        }
        Ok(())
    }

    pub fn build(self) -> Result<Config> {
        self.validate()?;
        Ok(self.inner)
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder { inner: Config::default() }
    }

    /// 从 toml 文件读取配置，根表为 `[config]`
    pub fn load_from(path: &Path) -> Result<Config> {
        // 1、读取配置文件
        let content = std::fs::read_to_string(path)?;
        // 2、解析配置文件
        let wrapper: ConfigWrapper = toml::from_str(&content)?;
        // 3、校验后返回
        ConfigBuilder { inner: wrapper.config }.build()
    }

    pub fn load_config() -> Result<Config> {
        Self::load_from(&get_config_path())
    }

    pub fn scramble_options(&self) -> HashMap<String, String> {
        self.scramble.to_map()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    /// 单元测试：
    /// 测试配置模块的构建方法
    #[test]
    fn build_test() -> Result<()> {
        let config = Config::builder()
            .relative_target_cost(0.0)
            .worker_count(2)
            .dialect(Dialect::Hive)
            .build()?;
        assert_eq!(config.relative_target_cost, 0.0);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.dialect, Dialect::Hive);
        assert_eq!(config.scramble.tier_column_name, "verdictdbtier");
        Ok(())
    }

    #[test]
    fn build_invalid_test() {
        assert!(Config::builder().relative_target_cost(-1.0).build().is_err());
        assert!(Config::builder().target_sampling_ratio(0.0).build().is_err());
        assert!(Config::builder().worker_count(0).build().is_err());
        assert!(Config::builder().block_size(0.5).build().is_err());
    }

    /// 单元测试：
    /// 测试配置模块的加载方法
    #[test]
    fn load_test() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[config]
relative_target_cost = 0.5
dialect = "hive"
scramble_schema = "scrambles"

[config.scramble]
scramble_table_block_size = 500.0
"#
        )?;
        let config = Config::load_from(file.path())?;
        assert_eq!(config.relative_target_cost, 0.5);
        assert_eq!(config.dialect, Dialect::Hive);
        assert_eq!(config.scramble_schema.as_deref(), Some("scrambles"));
        assert_eq!(config.scramble.scramble_table_block_size, 500.0);
        // 未配置的键取默认值
        assert_eq!(config.scramble.block_column_name, "verdictdbblock");
        assert_eq!(config.worker_count, 4);
        Ok(())
    }

    #[test]
    fn options_map_test() {
        let options = Config::default().scramble_options();
        assert_eq!(options["scrambleTableBlockSize"], "1e6");
        assert_eq!(options["scrambleTableSuffix"], "_scrambled");
    }
}
