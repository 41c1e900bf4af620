//! 基本型
//!
//! - `fixed`: 固定小数点数値型と飽和演算
//! - `ids`: フェーズ・コア種別・パイプライン段などの列挙型

mod fixed;
mod ids;

pub use fixed::*;
pub use ids::{
    CoreRole, ErrorFunction, InputStage, NetType, OutputStage, Phase, StopCriterion, UpdateRule,
};
