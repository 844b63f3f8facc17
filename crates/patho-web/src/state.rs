//! 应用共享状态

use crate::auth::AuthService;
use patho_integration::{RegionCropper, TilingQueue};
use patho_report::ReportGenerator;
use patho_storage::StorageManager;
use patho_workflow::{DiagnosisListing, PathologyService};
use std::sync::Arc;

/// 上传和媒体访问设置
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_upload_bytes: usize,
    /// 媒体文件对外的 URL 前缀，用于拼接瓦片地址
    pub media_url: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: 2 * 1024 * 1024 * 1024,
            media_url: "/media".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: PathologyService,
    pub listing: DiagnosisListing,
    pub storage: StorageManager,
    pub tiling: TilingQueue,
    pub cropper: Arc<dyn RegionCropper>,
    pub reports: ReportGenerator,
    pub auth: Arc<AuthService>,
    pub uploads: UploadSettings,
}
