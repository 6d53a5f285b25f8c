//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{BillingError, Result};
use crate::observability::ObservabilityConfig;

/// 流水线配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 规则文件目录（每个步骤一个 JSON 规则文件）
    pub rules_dir: PathBuf,
    /// 第 3 步中到期日相对账单日期的天数
    pub due_days: i64,
    /// 所有规则集共享的默认变量，规则集自身的变量会覆盖同名项
    pub variables: BTreeMap<String, Value>,
}

impl PipelineConfig {
    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.due_days < 0 {
            return Err(BillingError::invalid_config(
                "pipeline.due_days",
                format!("不能为负数: {}", self.due_days),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            due_days: 30,
            variables: BTreeMap::new(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub pipeline: PipelineConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（BILLING_ 前缀，层级用双下划线，如 BILLING_PIPELINE__DUE_DAYS -> pipeline.due_days）
    pub fn load(service_name: &str) -> Result<Self> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from_dir(service_name, Path::new(&config_dir))
    }

    /// 从指定目录加载配置
    pub fn load_from_dir(service_name: &str, config_dir: &Path) -> Result<Self> {
        let env = std::env::var("BILLING_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("BILLING")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
