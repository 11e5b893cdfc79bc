//! 配置管理
//!
//! 配置按 默认值 → TOML文件 → `DISPATCH_` 环境变量 的顺序叠加，加载后逐节校验。
//! 广播退避、身份新鲜窗口等时序参数全部来自配置，不写死在代码里。

pub mod models;

#[cfg(test)]
mod tests;

pub use models::*;
