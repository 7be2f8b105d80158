use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::owned_node;
use crate::auth::RequireOwner;
use crate::catalog::{MultipartInit, NewDataset, NodeUpdate};
use crate::server::AppState;
use crate::server::dto::{
    AbortUploadRequest, CompleteUploadRequest, CreateNodeParams, CreateNodeRequest,
    DatasetNodeResponse, NodeWithDepth, SignPartRequest, SignPartResponse, TreeNode,
    UpdateNodeRequest,
};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::storage::StorageError;
use crate::store::Store;
use crate::types::{Dataset, DatasetMetadata, DatasetType, Node, NodeKind};

pub async fn list_tree(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let roots = store
        .list_children(None)
        .api_err("Failed to list nodes")?;

    let mut tree = Vec::new();
    for root in roots.into_iter().filter(|n| n.owner_id == owner.0) {
        let mut children_of: HashMap<String, Vec<Node>> = HashMap::new();
        let descendants = store
            .list_descendants(&root.id)
            .api_err("Failed to list nodes")?;
        for (node, _) in descendants {
            children_of
                .entry(node.parent_id.clone().unwrap_or_default())
                .or_default()
                .push(node);
        }
        tree.push(assemble(store, root, &mut children_of)?);
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(tree)))
}

fn assemble(
    store: &dyn Store,
    node: Node,
    children_of: &mut HashMap<String, Vec<Node>>,
) -> Result<TreeNode, ApiError> {
    let dataset = match node.kind {
        NodeKind::Dataset => store
            .get_dataset_by_node(&node.id)
            .api_err("Failed to get dataset")?,
        NodeKind::Folder => None,
    };
    let children = children_of
        .remove(&node.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| assemble(store, child, children_of))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TreeNode {
        node,
        dataset,
        children,
    })
}

/// `POST /nodes`: a JSON folder, a multipart form carrying one dataset file,
/// or a `?multipart=` upload action.
pub async fn create_node(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateNodeParams>,
    request: Request,
) -> Result<Response, ApiError> {
    if let Some(action) = params.multipart.as_deref() {
        return multipart_action(&state, &owner, action, request).await;
    }

    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_form {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        return create_dataset(state, owner, multipart).await;
    }

    let req: CreateNodeRequest = json_body(request, &state).await?;
    if req.kind == Some(NodeKind::Dataset) {
        return Err(ApiError::bad_request(
            "Dataset nodes must be created with a multipart file upload",
        ));
    }
    if let Some(parent) = &req.parent {
        owned_node(&state, &owner, parent)?;
    }
    let node = state
        .datasets
        .create_folder(&owner.0, &req.name, req.parent.as_deref())?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(node))).into_response())
}

async fn json_body<T: DeserializeOwned>(
    request: Request,
    state: &Arc<AppState>,
) -> Result<T, ApiError> {
    let Json(body) = Json::<T>::from_request(request, state).await.map_err(|e| {
        ApiError::bad_request("Invalid request body").with_details(json!(e.body_text()))
    })?;
    Ok(body)
}

#[derive(Default)]
struct DatasetForm {
    name: Option<String>,
    parent: Option<String>,
    dataset_type: Option<DatasetType>,
    srid: Option<i32>,
    bbox: Option<[f64; 4]>,
    metadata: DatasetMetadata,
    files: Vec<(String, Option<String>, Bytes)>,
}

fn parse_bbox(raw: &str) -> Option<[f64; 4]> {
    let raw = raw.trim();
    let values: Vec<f64> = if raw.starts_with('[') {
        serde_json::from_str(raw).ok()?
    } else {
        raw.split(',')
            .map(|v| v.trim().parse().ok())
            .collect::<Option<Vec<_>>>()?
    };
    values.try_into().ok()
}

async fn read_form(mut multipart: Multipart) -> Result<DatasetForm, ApiError> {
    let mut form = DatasetForm::default();
    let bad = |e: axum::extract::multipart::MultipartError| ApiError::bad_request(e.body_text());

    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("Uploaded file has no file name"))?;
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(bad)?;
                form.files.push((file_name, content_type, data));
            }
            _ => {
                let value = field.text().await.map_err(bad)?;
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                match name.as_str() {
                    "type" if value != "dataset" => {
                        return Err(ApiError::bad_request(
                            "Multipart uploads create dataset nodes only",
                        ));
                    }
                    "name" => form.name = Some(value.to_string()),
                    "parent" | "parent_id" => form.parent = Some(value.to_string()),
                    "dataset_type" => {
                        form.dataset_type = Some(
                            DatasetType::parse(&value.to_ascii_lowercase())
                                .ok_or_else(|| ApiError::bad_request("Invalid dataset_type"))?,
                        );
                    }
                    "srid" => {
                        form.srid = Some(
                            value
                                .parse()
                                .map_err(|_| ApiError::bad_request("srid must be an integer"))?,
                        );
                    }
                    "bbox" => {
                        form.bbox = Some(parse_bbox(value).ok_or_else(|| {
                            ApiError::bad_request("bbox must be four numbers: west,south,east,north")
                        })?);
                    }
                    "metadata" => {
                        form.metadata = serde_json::from_str(value).map_err(|e| {
                            ApiError::bad_request(format!("metadata must be a JSON object: {e}"))
                        })?;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(form)
}

async fn create_dataset(
    state: Arc<AppState>,
    owner: RequireOwner,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = read_form(multipart).await?;
    if form.files.len() != 1 {
        return Err(ApiError::bad_request("Exactly one file must be uploaded"));
    }
    let Some((file_name, content_type, data)) = form.files.pop() else {
        return Err(ApiError::bad_request("Exactly one file must be uploaded"));
    };
    if let Some(parent) = &form.parent {
        owned_node(&state, &owner, parent)?;
    }

    let mut metadata = form.metadata;
    if form.srid.is_some() {
        metadata.srid = form.srid;
    }
    if form.bbox.is_some() {
        metadata.bbox = form.bbox;
    }
    if metadata.content_type.is_none() {
        metadata.content_type = content_type;
    }

    let new = NewDataset {
        name: form.name.unwrap_or_else(|| file_name.clone()),
        parent_id: form.parent,
        dataset_type: form.dataset_type,
        metadata,
        file_name,
    };

    let created = tokio::task::spawn_blocking(move || {
        state
            .datasets
            .create_dataset(&owner.0, new, &mut &data[..])
    })
    .await
    .map_err(|e| ApiError::internal(format!("Upload task failed: {e}")))??;

    let dataset = created
        .dataset
        .ok_or_else(|| ApiError::internal("Dataset was not created"))?;
    let body = DatasetNodeResponse {
        node: created.node,
        dataset,
    };
    Ok((StatusCode::CREATED, Json(ApiResponse::success(body))).into_response())
}

/// Dataset behind an upload key, if the caller owns it.
fn owned_upload(state: &AppState, owner: &RequireOwner, key: &str) -> Result<Dataset, ApiError> {
    let dataset = state
        .store
        .get_dataset_by_storage_key(key)
        .api_err("Failed to get dataset")?
        .or_not_found("Dataset not found for key")?;
    owned_node(state, owner, &dataset.node_id)?;
    Ok(dataset)
}

/// Runs a multipart storage call on the blocking pool.
async fn upload_task<T, F>(state: &Arc<AppState>, task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> crate::error::Result<T> + Send + 'static,
{
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || task(&state))
        .await
        .map_err(|e| ApiError::internal(format!("Upload task failed: {e}")))?;
    Ok(result?)
}

async fn multipart_action(
    state: &Arc<AppState>,
    owner: &RequireOwner,
    action: &str,
    request: Request,
) -> Result<Response, ApiError> {
    match action {
        "init" => {
            let req: MultipartInit = json_body(request, state).await?;
            if let Some(parent) = &req.parent {
                owned_node(state, owner, parent)?;
            }
            let owner_id = owner.0.clone();
            let started =
                upload_task(state, move |state| state.multipart.init(&owner_id, req)).await?;
            Ok((StatusCode::CREATED, Json(ApiResponse::success(started))).into_response())
        }
        "sign" => {
            let req: SignPartRequest = json_body(request, state).await?;
            owned_upload(state, owner, &req.key)?;
            let url = upload_task(state, move |state| {
                state
                    .multipart
                    .sign(&req.upload_id, &req.key, req.part_number)
            })
            .await?;
            Ok(Json(ApiResponse::success(SignPartResponse { url })).into_response())
        }
        "complete" => {
            let req: CompleteUploadRequest = json_body(request, state).await?;
            owned_upload(state, owner, &req.key)?;
            let dataset = upload_task(state, move |state| {
                state.multipart.complete(&req.upload_id, &req.key, req.parts)
            })
            .await?;
            Ok(Json(ApiResponse::success(dataset)).into_response())
        }
        "abort" => {
            let req: AbortUploadRequest = json_body(request, state).await?;
            owned_upload(state, owner, &req.key)?;
            upload_task(state, move |state| {
                state.multipart.abort(&req.upload_id, &req.key)
            })
            .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        other => Err(ApiError::bad_request(format!(
            "Invalid multipart action '{other}', expected init, sign, complete or abort"
        ))),
    }
}

pub async fn get_node(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_node(&state, &owner, &id)?;
    let node = state.datasets.get_node(&id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(node)))
}

pub async fn update_node(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> impl IntoResponse {
    owned_node(&state, &owner, &id)?;
    if let Some(Some(parent)) = &req.parent {
        owned_node(&state, &owner, parent)?;
    }

    let node = state.datasets.update_node(
        &id,
        NodeUpdate {
            name: req.name,
            parent_id: req.parent,
        },
    )?;
    Ok::<_, ApiError>(Json(ApiResponse::success(node)))
}

pub async fn delete_node(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_node(&state, &owner, &id)?;
    tokio::task::spawn_blocking(move || state.datasets.delete_node(&id))
        .await
        .map_err(|e| ApiError::internal(format!("Delete task failed: {e}")))??;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_descendants(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_node(&state, &owner, &id)?;
    let nodes: Vec<NodeWithDepth> = state
        .store
        .list_descendants(&id)
        .api_err("Failed to list descendants")?
        .into_iter()
        .map(|(node, depth)| NodeWithDepth { node, depth })
        .collect();
    Ok::<_, ApiError>(Json(ApiResponse::success(nodes)))
}

pub async fn list_ancestors(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_node(&state, &owner, &id)?;
    let nodes: Vec<NodeWithDepth> = state
        .store
        .list_ancestors(&id)
        .api_err("Failed to list ancestors")?
        .into_iter()
        .map(|(node, depth)| NodeWithDepth { node, depth })
        .collect();
    Ok::<_, ApiError>(Json(ApiResponse::success(nodes)))
}

fn content_disposition(file_name: &str) -> String {
    let escaped: String = file_name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    format!("attachment; filename=\"{escaped}\"")
}

pub async fn download(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let node = owned_node(&state, &owner, &id)?;
    let dataset = state
        .store
        .get_dataset_by_node(&node.id)
        .api_err("Failed to get dataset")?
        .or_not_found("Dataset not found")?;

    let storage = state.storage.clone();
    let key = dataset.storage_key.clone();
    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, StorageError> {
        let mut reader = storage.download_object(&key)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| ApiError::internal(format!("Download task failed: {e}")))??;

    let content_type = dataset
        .metadata
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok::<_, ApiError>((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, content_disposition(&dataset.file_name)),
        ],
        body,
    ))
}
