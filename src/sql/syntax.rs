use serde::{Deserialize, Serialize};

use crate::db_error::Result;
use crate::errdata;

/// 方言相关的 SQL 渲染细节
///
/// 改写算法与方言无关，只有文本渲染需要区分目标引擎。
pub trait SqlSyntax: Send + Sync {
    fn name(&self) -> &'static str;

    /// 标识符的引号
    fn quote_string(&self) -> &'static str;

    /// [0, 1) 均匀随机数
    fn rand_function(&self) -> &'static str;

    /// 对任意列求一个非负整型哈希
    fn hash_function(&self, column_sql: &str) -> String;

    /// 非负取模
    fn modulo(&self, left: &str, right: &str) -> String {
        format!("mod({left}, {right})")
    }

    /// 未指定 schema 时使用的默认值
    fn fallback_default_schema(&self) -> &'static str;

    /// 标识符中出现的引号写两次
    fn quote(&self, name: &str) -> String {
        let q = self.quote_string();
        format!("{q}{}{q}", name.replace(q, &format!("{q}{q}")))
    }
}

pub struct PostgresSyntax;

impl SqlSyntax for PostgresSyntax {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_string(&self) -> &'static str {
        "\""
    }

    fn rand_function(&self) -> &'static str {
        "random()"
    }

    fn hash_function(&self, column_sql: &str) -> String {
        // hashtext 返回 int4，先转成 bigint 再取绝对值，避免 INT_MIN 溢出
        format!("abs(cast(hashtext(cast({column_sql} as text)) as bigint))")
    }

    fn fallback_default_schema(&self) -> &'static str {
        "public"
    }
}

pub struct HiveSyntax;

impl SqlSyntax for HiveSyntax {
    fn name(&self) -> &'static str {
        "hive"
    }

    fn quote_string(&self) -> &'static str {
        "`"
    }

    fn rand_function(&self) -> &'static str {
        "rand()"
    }

    fn hash_function(&self, column_sql: &str) -> String {
        format!("conv(substr(md5(cast({column_sql} as string)),17,8),16,10)")
    }

    fn modulo(&self, left: &str, right: &str) -> String {
        format!("pmod({left}, {right})")
    }

    fn fallback_default_schema(&self) -> &'static str {
        "default"
    }
}

pub struct H2Syntax;

impl SqlSyntax for H2Syntax {
    fn name(&self) -> &'static str {
        "h2"
    }

    fn quote_string(&self) -> &'static str {
        "\""
    }

    fn rand_function(&self) -> &'static str {
        "rand()"
    }

    fn hash_function(&self, column_sql: &str) -> String {
        format!("abs(ora_hash({column_sql}))")
    }

    fn fallback_default_schema(&self) -> &'static str {
        "PUBLIC"
    }
}

/// 配置文件里的方言名
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Hive,
    H2,
}

impl Dialect {
    pub fn syntax(&self) -> Box<dyn SqlSyntax> {
        match self {
            Dialect::Postgres => Box::new(PostgresSyntax),
            Dialect::Hive => Box::new(HiveSyntax),
            Dialect::H2 => Box::new(H2Syntax),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "hive" => Ok(Dialect::Hive),
            "h2" => Ok(Dialect::H2),
            other => Err(errdata!("unknown dialect {other}")),
        }
    }
}
