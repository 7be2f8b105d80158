use serde::{Deserialize, Deserializer, Serialize};

use crate::storage::CompletedPart;
use crate::types::{Dataset, Node, NodeKind};

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    #[serde(default, alias = "parent_id")]
    pub parent: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<NodeKind>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateNodeParams {
    /// `init`, `sign`, `complete` or `abort`.
    #[serde(default)]
    pub multipart: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "parent_id", deserialize_with = "double_option")]
    pub parent: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SignPartRequest {
    pub upload_id: String,
    pub key: String,
    pub part_number: u32,
}

#[derive(Debug, Serialize)]
pub struct SignPartResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Deserialize)]
pub struct AbortUploadRequest {
    pub upload_id: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct DatasetNodeResponse {
    pub node: Node,
    pub dataset: Dataset,
}

/// A node of `GET /nodes`, with its subtree.
#[derive(Debug, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: Node,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Serialize)]
pub struct NodeWithDepth {
    #[serde(flatten)]
    pub node: Node,
    pub depth: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct TileParams {
    #[serde(default)]
    pub terrain: Option<bool>,
    #[serde(default)]
    pub raster_dem: Option<bool>,
    /// `terrain`, `raster` or `rgb`.
    #[serde(default)]
    pub visualization: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegenerateResponse {
    pub dataset_id: String,
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_parent_null_vs_absent() {
        let req: UpdateNodeRequest = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(req.parent, None);

        let req: UpdateNodeRequest = serde_json::from_str(r#"{"parent":null}"#).unwrap();
        assert_eq!(req.parent, Some(None));

        let req: UpdateNodeRequest = serde_json::from_str(r#"{"parent_id":"p1"}"#).unwrap();
        assert_eq!(req.parent, Some(Some("p1".to_string())));
    }
}
