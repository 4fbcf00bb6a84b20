//! # 共享基础设施
//!
//! 系统各组件共用的常量、类型别名和时间工具。

pub mod constants;
pub mod time;
pub mod types;

pub use constants::*;
pub use time::*;
pub use types::*;
