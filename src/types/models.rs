use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Dataset,
}

string_enum!(NodeKind {
    Folder => "folder",
    Dataset => "dataset",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: NodeKind,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the transitive closure of the node tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureEdge {
    pub ancestor_id: String,
    pub descendant_id: String,
    pub depth: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Vector,
    Raster,
    Text,
}

string_enum!(DatasetType {
    Vector => "vector",
    Raster => "raster",
    Text => "text",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Geojson,
    Shapefile,
    Kml,
    Gpkg,
    Geotiff,
    Cog,
    Png,
    Jpeg,
    Pdf,
    Txt,
    Bin,
}

string_enum!(FileFormat {
    Geojson => "geojson",
    Shapefile => "shapefile",
    Kml => "kml",
    Gpkg => "gpkg",
    Geotiff => "geotiff",
    Cog => "cog",
    Png => "png",
    Jpeg => "jpeg",
    Pdf => "pdf",
    Txt => "txt",
    Bin => "bin",
});

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "geojson" => Some(Self::Geojson),
            "shp" => Some(Self::Shapefile),
            "kml" => Some(Self::Kml),
            "gpkg" => Some(Self::Gpkg),
            "tif" | "tiff" => Some(Self::Geotiff),
            "cog" => Some(Self::Cog),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }

    pub const fn dataset_type(self) -> DatasetType {
        match self {
            Self::Geojson | Self::Shapefile | Self::Kml | Self::Gpkg => DatasetType::Vector,
            Self::Geotiff | Self::Cog | Self::Png | Self::Jpeg => DatasetType::Raster,
            Self::Pdf | Self::Txt | Self::Bin => DatasetType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Pending,
    Uploaded,
    Failed,
}

string_enum!(DatasetStatus {
    Pending => "pending",
    Uploaded => "uploaded",
    Failed => "failed",
});

/// Format-specific dataset metadata. Unrecognised keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    pub format: FileFormat,
    pub file_name: String,
    pub file_size: i64,
    pub storage_key: String,
    pub metadata: DatasetMetadata,
    pub status: DatasetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileSetStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

string_enum!(TileSetStatus {
    Pending => "pending",
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileSet {
    pub id: String,
    pub dataset_id: String,
    pub status: TileSetStatus,
    pub storage_key: String,
    pub file_size: i64,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// `[west, south, east, north]` in EPSG:4326.
    pub bounds: Option<[f64; 4]>,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeWithDataset {
    #[serde(flatten)]
    pub node: Node,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
}
