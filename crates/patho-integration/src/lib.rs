//! # 影像任务集成模块
//!
//! 与外部影像处理协作：
//! - 切图任务队列，失败重试，重复切图直接确认
//! - Deep Zoom 元数据解析与展示
//! - 感兴趣区域裁剪

pub mod deepzoom;
pub mod region;
pub mod tiling;

pub use deepzoom::{dzi_path_for, tiles_dir_for, DeepZoomDescriptor, DeepZoomView};
pub use region::{ImageRegionCropper, RegionCropper, RegionRect};
pub use tiling::{
    CommandTileGenerator, TaskOutcome, TileGenerator, TilingQueue, TilingTask, TilingWorker,
};
