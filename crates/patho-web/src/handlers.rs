//! HTTP处理器

use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::state::AppState;
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use patho_core::{
    validation::validate_description, DiagnosisInput, DiagnosisPatch, Identity, LabelCategory,
    LabelInput, PathoError, PathologyPicture, PatientInput, PatientUpdate, ValidationErrors,
};
use patho_database::Page;
use patho_integration::{dzi_path_for, tiles_dir_for, DeepZoomDescriptor, RegionRect};
use patho_storage::{StorageManager, UploadWriter, ORIGIN_IMAGES_DIR};
use patho_workflow::ListQuery;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "Pathology Review API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "api": "/api/v1",
            "report": "/pathology/generatedoc"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 分页列表响应
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub offset: usize,
    pub limit: usize,
    pub next: Option<usize>,
    pub previous: Option<usize>,
    pub results: Vec<T>,
}

impl<T> From<Page<T>> for ListResponse<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            count: page.total,
            offset: page.offset,
            limit: page.limit,
            next: page.next_offset(),
            previous: page.previous_offset(),
            results: page.items,
        }
    }
}

// 患者

#[derive(Debug, Default, Deserialize)]
pub struct PatientQueryParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn create_patient(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<PatientInput>,
) -> ApiResult<impl IntoResponse> {
    let patient = state.service.create_patient(&input).await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

pub async fn list_patients(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PatientQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let policy = state.listing.policy();
    let limit = policy.page_size(params.limit)?;
    let offset = policy.offset(params.offset)?;
    let page = state
        .service
        .search_patients(params.name.as_deref(), offset, limit)
        .await?;
    Ok(Json(ListResponse::from(page)))
}

pub async fn get_patient(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_patient(id).await?))
}

pub async fn update_patient(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(update): ApiJson<PatientUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_patient(id, &update).await?))
}

/// 删除患者及其全部图片
pub async fn delete_patient(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let pictures = state.service.delete_patient(id).await?;
    for picture in &pictures {
        remove_picture_files(&state.storage, picture).await;
    }
    info!("Deleted patient {} with {} pictures", id, pictures.len());
    Ok(StatusCode::NO_CONTENT)
}

pub async fn patient_pictures(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    state.service.get_patient(id).await?;
    Ok(Json(state.service.pictures_for_patient(id).await?))
}

// 病理图片

fn multipart_error(e: MultipartError) -> PathoError {
    PathoError::invalid("body", e.body_text())
}

/// 上传表单，文件字段边接收边写入存储
#[derive(Default)]
struct UploadForm {
    patient_id: Option<String>,
    description: String,
    file: Option<UploadWriter>,
}

impl UploadForm {
    async fn read(
        &mut self,
        storage: &StorageManager,
        multipart: &mut Multipart,
    ) -> Result<(), PathoError> {
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "patient_id" => {
                    self.patient_id = Some(field.text().await.map_err(multipart_error)?)
                }
                "description" => {
                    self.description = field.text().await.map_err(multipart_error)?
                }
                "file" => {
                    if let Some(previous) = self.file.take() {
                        previous.abort().await?;
                    }
                    let file_name = field.file_name().unwrap_or("upload").to_string();
                    let writer = self
                        .file
                        .insert(storage.begin_upload(ORIGIN_IMAGES_DIR, &file_name).await?);
                    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                        writer.write_chunk(&chunk).await?;
                    }
                }
                other => debug!("Ignoring multipart field {}", other),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<i64, PathoError> {
        let mut errors = ValidationErrors::new();
        let patient_id = match self.patient_id.as_deref().map(str::trim) {
            None | Some("") => {
                errors.add("patient_id", "is required");
                None
            }
            Some(raw) => match raw.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    errors.add("patient_id", "must be an integer");
                    None
                }
            },
        };
        match &self.file {
            None => errors.add("file", "is required"),
            Some(writer) if writer.size() == 0 => errors.add("file", "must not be empty"),
            _ => {}
        }
        errors.into_result()?;
        validate_description(&self.description)?;
        patient_id.ok_or_else(|| PathoError::invalid("patient_id", "is required"))
    }

    /// 删除已写入的部分文件
    async fn discard(self) {
        if let Some(writer) = self.file {
            let relative = writer.relative_path().to_string();
            if let Err(e) = writer.abort().await {
                warn!("Failed to remove rejected upload {}: {}", relative, e);
            }
        }
    }
}

/// 上传病理图片
///
/// multipart 字段：`patient_id`、`description`（可选）、`file`。
/// 图片登记后立即进入切图队列。
pub async fn upload_picture(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut form = UploadForm::default();
    let accepted = async {
        form.read(&state.storage, &mut multipart).await?;
        let patient_id = form.validate()?;
        state.service.get_patient(patient_id).await?;
        Ok::<_, PathoError>(patient_id)
    }
    .await;
    let patient_id = match accepted {
        Ok(id) => id,
        Err(e) => {
            form.discard().await;
            return Err(e.into());
        }
    };

    let description = std::mem::take(&mut form.description);
    let Some(writer) = form.file.take() else {
        return Err(PathoError::invalid("file", "is required").into());
    };
    let relative = writer.relative_path().to_string();
    let stored = match writer.finish().await {
        Ok(stored) => stored,
        Err(e) => {
            if let Err(cleanup) = state.storage.remove_file(&relative).await {
                warn!("Failed to remove unfinished upload {}: {}", relative, cleanup);
            }
            return Err(e.into());
        }
    };

    let picture = match state
        .service
        .register_picture(patient_id, &stored.relative_path, &stored.checksum, &description)
        .await
    {
        Ok(picture) => picture,
        Err(e) => {
            if let Err(cleanup) = state.storage.remove_file(&stored.relative_path).await {
                warn!("Failed to remove unregistered upload {}: {}", stored.relative_path, cleanup);
            }
            return Err(e.into());
        }
    };

    if let Err(e) = state.tiling.enqueue(picture.id, &picture.file).await {
        error!("Failed to enqueue tiling for picture {}: {}", picture.id, e);
    }

    info!(
        "Uploaded picture {} for patient {} ({} bytes)",
        picture.id, patient_id, stored.size
    );
    Ok((StatusCode::CREATED, Json(picture)))
}

pub async fn get_picture(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_picture(id).await?))
}

pub async fn delete_picture(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let picture = state.service.delete_picture(id).await?;
    remove_picture_files(&state.storage, &picture).await;
    Ok(StatusCode::NO_CONTENT)
}

/// 切片的 Deep Zoom 元数据，供前端查看器使用
pub async fn picture_dzi(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let picture = state.service.get_picture(id).await?;
    if !picture.is_cutted {
        return Err(PathoError::Conflict(format!("picture {} has not been tiled yet", id)).into());
    }

    let raw = state.storage.get_file(&dzi_path_for(&picture.file)).await?;
    let xml = String::from_utf8(raw)
        .map_err(|e| PathoError::Tiling(format!("dzi is not UTF-8: {}", e)))?;
    let descriptor = DeepZoomDescriptor::parse(&xml)?;

    let tiles_url = format!(
        "{}/{}",
        state.uploads.media_url.trim_end_matches('/'),
        tiles_dir_for(&picture.file)
    );
    Ok(Json(descriptor.to_view(&tiles_url)))
}

async fn remove_picture_files(storage: &StorageManager, picture: &PathologyPicture) {
    let results = [
        storage.remove_file(&picture.file).await,
        storage.remove_file(&dzi_path_for(&picture.file)).await,
        storage.remove_dir(&tiles_dir_for(&picture.file)).await,
    ];
    for result in results {
        if let Err(e) = result {
            warn!("Failed to clean up files of picture {}: {}", picture.id, e);
        }
    }
}

// 诊断

/// 诊断列表，医生只看到分配给自己的诊断
pub async fn list_diagnoses(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = state.listing.list(&identity, &query).await?;
    Ok(Json(ListResponse::from(page)))
}

pub async fn create_diagnosis(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<DiagnosisInput>,
) -> ApiResult<impl IntoResponse> {
    let diagnosis = state.service.create_diagnosis(&input).await?;
    Ok((StatusCode::CREATED, Json(diagnosis)))
}

pub async fn get_diagnosis(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_diagnosis(id).await?))
}

pub async fn patch_diagnosis(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(patch): ApiJson<DiagnosisPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.patch_diagnosis(id, &patch).await?))
}

/// 从诊断所引用的切片上裁剪感兴趣区域
pub async fn crop_region(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(rect): ApiJson<RegionRect>,
) -> ApiResult<impl IntoResponse> {
    let diagnosis = state.service.get_diagnosis(id).await?;
    let picture = state.service.get_picture(diagnosis.picture_id).await?;
    let region = state.cropper.crop(&picture.file, rect).await?;
    Ok(Json(state.service.set_region_picture(id, &region).await?))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub clinician_id: Uuid,
}

fn assignees_body(diagnosis_id: i64, assignees: Vec<Uuid>) -> Json<serde_json::Value> {
    Json(json!({
        "diagnosis_id": diagnosis_id,
        "assignees": assignees
    }))
}

pub async fn list_assignees(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(assignees_body(id, state.service.assignees(id).await?))
}

pub async fn assign_clinician(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<AssignRequest>,
) -> ApiResult<impl IntoResponse> {
    let assignees = state
        .service
        .assign_clinician(id, request.clinician_id)
        .await?;
    Ok(assignees_body(id, assignees))
}

pub async fn unassign_clinician(
    State(state): State<AppState>,
    ApiPath((id, clinician_id)): ApiPath<(i64, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    state.service.unassign_clinician(id, clinician_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// 标注

pub async fn list_labels(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.labels(id).await?))
}

pub async fn add_label(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<LabelInput>,
) -> ApiResult<impl IntoResponse> {
    let label = state.service.add_label(id, &input, &identity).await?;
    Ok((StatusCode::CREATED, Json(label)))
}

pub async fn findings(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let report = state.service.findings(id).await?;
    let names: Vec<&str> = report
        .findings
        .iter()
        .map(LabelCategory::display_name)
        .collect();
    Ok(Json(json!({
        "diagnosis_id": report.diagnosis_id,
        "findings": report.findings,
        "finding_names": names,
        "label_count": report.label_count,
    })))
}

/// 当前请求方
pub async fn current_identity(Extension(identity): Extension<Identity>) -> impl IntoResponse {
    match identity {
        Identity::Anonymous => Json(json!({ "anonymous": true })),
        Identity::Clinician(clinician) => Json(json!({
            "anonymous": false,
            "clinician": clinician
        })),
    }
}
