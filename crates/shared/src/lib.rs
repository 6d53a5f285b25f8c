//! 共享库
//!
//! 包含计费工具共用的月份表、配置、错误处理、可观测性初始化以及测试数据生成器。

pub mod calendar;
pub mod config;
pub mod error;
pub mod observability;
pub mod test_utils;
