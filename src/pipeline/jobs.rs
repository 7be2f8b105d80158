//! Background execution of the COG workflow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, mpsc};

use super::{MAX_ERROR_MESSAGE_LEN, cog_workflow, processed_key, truncate_message};
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::pipeline::operations::{COG_FILE_NAME, SOURCE_FILE_NAME};
use crate::storage::ObjectStorage;
use crate::store::Store;
use crate::types::{Dataset, TileSet, TileSetStatus};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Hands a dataset to background processing.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, dataset_id: &str) -> Result<()>;
}

/// Whole-job retries with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Collaborators of a COG job run.
#[derive(Clone)]
pub struct JobDeps {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn ObjectStorage>,
    pub notifier: Arc<dyn Notifier>,
}

/// Blocking job body, invoked with a dataset id.
pub type JobRunner = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

#[derive(Debug)]
struct QueuedJob {
    dataset_id: String,
    attempt: u32,
}

/// In-process job queue: a dispatcher task feeding a bounded number of
/// blocking workers, re-enqueuing failed jobs per the [`RetryPolicy`].
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
}

impl JobQueue {
    /// Starts the dispatcher on the current tokio runtime.
    pub fn start(runner: JobRunner, policy: RetryPolicy, concurrency: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedJob>();
        let retry_sender = sender.downgrade();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let runner = runner.clone();
                let retry_sender = retry_sender.clone();

                tokio::spawn(async move {
                    let dataset_id = job.dataset_id.clone();
                    let attempt = job.attempt;
                    let result =
                        tokio::task::spawn_blocking(move || runner(&dataset_id)).await;
                    drop(permit);

                    let error = match result {
                        Ok(Ok(())) => return,
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("job panicked: {e}"),
                    };

                    if attempt >= policy.max_retries {
                        tracing::error!(
                            dataset_id = %job.dataset_id,
                            attempt,
                            "COG job failed, retries exhausted: {error}"
                        );
                        return;
                    }

                    tracing::warn!(
                        dataset_id = %job.dataset_id,
                        attempt,
                        delay_secs = policy.delay.as_secs(),
                        "COG job failed, scheduling retry: {error}"
                    );
                    tokio::time::sleep(policy.delay).await;
                    if let Some(sender) = retry_sender.upgrade() {
                        let _ = sender.send(QueuedJob {
                            dataset_id: job.dataset_id,
                            attempt: attempt + 1,
                        });
                    }
                });
            }
        });

        Self { sender }
    }

    /// Queue running [`run_cog_job`] against `deps`.
    pub fn for_cog_jobs(deps: JobDeps, policy: RetryPolicy, concurrency: usize) -> Self {
        let deps = Arc::new(deps);
        Self::start(
            Arc::new(move |dataset_id: &str| run_cog_job(&deps, dataset_id)),
            policy,
            concurrency,
        )
    }
}

impl TaskQueue for JobQueue {
    fn enqueue(&self, dataset_id: &str) -> Result<()> {
        self.sender
            .send(QueuedJob {
                dataset_id: dataset_id.to_string(),
                attempt: 0,
            })
            .map_err(|_| Error::processing("job queue is not running"))?;
        tracing::info!(dataset_id, "enqueued COG job");
        Ok(())
    }
}

fn workflow_payloads(
    bucket: &str,
    dataset: &Dataset,
    tileset: &TileSet,
    work_dir: &std::path::Path,
) -> Map<String, Value> {
    let source_path = work_dir.join(SOURCE_FILE_NAME);
    let cog_path = work_dir.join(COG_FILE_NAME);
    let upload_key = processed_key(&tileset.id);

    let mut payloads = Map::new();
    payloads.insert(
        "download".to_string(),
        json!({
            "download_url": format!("s3://{bucket}/{}", dataset.storage_key),
            "download_to_path": source_path.display().to_string(),
        }),
    );
    payloads.insert(
        "generate_cog".to_string(),
        json!({
            "input_path": source_path.display().to_string(),
            "work_dir": work_dir.display().to_string(),
        }),
    );
    payloads.insert(
        "upload".to_string(),
        json!({
            "upload_url": format!("s3://{bucket}/{upload_key}"),
            "upload_from_path": cog_path.display().to_string(),
        }),
    );
    payloads.insert(
        "update_tileset".to_string(),
        json!({
            "tileset_id": tileset.id,
            "storage_key": upload_key,
        }),
    );
    payloads
}

/// Runs the COG workflow for one dataset.
///
/// A missing dataset is logged and treated as done. On failure the tile set is
/// marked failed with a truncated message and the error is returned so the
/// queue can retry; every retry starts again from the download.
pub fn run_cog_job(deps: &JobDeps, dataset_id: &str) -> Result<()> {
    tracing::info!(dataset_id, "starting COG generation");

    let Some(dataset) = deps.store.get_dataset(dataset_id)? else {
        tracing::error!(dataset_id, "dataset not found, aborting COG generation");
        return Ok(());
    };

    let tileset = deps.store.begin_tileset_processing(&dataset.id)?;
    tracing::info!(dataset_id, tileset_id = %tileset.id, "tile set processing");

    let result = tempfile::Builder::new()
        .prefix("cog_")
        .tempdir()
        .map_err(Error::from)
        .and_then(|work_dir| {
            let payloads =
                workflow_payloads(deps.storage.bucket(), &dataset, &tileset, work_dir.path());
            let workflow = cog_workflow(
                deps.storage.clone(),
                deps.store.clone(),
                deps.notifier.clone(),
            );
            workflow.execute(payloads).map_err(Error::from)
        });

    match result {
        Ok(_) => {
            tracing::info!(dataset_id, tileset_id = %tileset.id, "COG generation complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(dataset_id, tileset_id = %tileset.id, "COG generation failed: {e}");
            let mut failed = deps.store.get_tileset(&tileset.id)?.unwrap_or(tileset);
            failed.status = TileSetStatus::Failed;
            failed.error_message = truncate_message(&e.to_string(), MAX_ERROR_MESSAGE_LEN);
            failed.updated_at = Utc::now();
            deps.store.update_tileset(&failed)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StoreNotifier;
    use crate::raster::{self, Crs, GeoTransform, Raster, SampleType};
    use crate::storage::{FsObjectStorage, ObjectMetadata, Presigner};
    use crate::store::SqliteStore;
    use crate::types::{
        DatasetMetadata, DatasetStatus, DatasetType, FileFormat, Node, NodeKind,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn deps(temp: &TempDir) -> (JobDeps, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let storage = Arc::new(FsObjectStorage::new(
            temp.path().join("objects"),
            "mapvault",
            Presigner::new("secret", "http://localhost:8080", 3600),
        ));
        let deps = JobDeps {
            store: store.clone(),
            storage,
            notifier: Arc::new(StoreNotifier::new(store.clone())),
        };
        (deps, store)
    }

    fn seed_dataset(store: &SqliteStore) -> Dataset {
        let now = Utc::now();
        let node = Node {
            id: "n1".to_string(),
            name: "ortho1".to_string(),
            parent_id: None,
            kind: NodeKind::Dataset,
            owner_id: "alice".to_string(),
            created_at: now,
            updated_at: now,
        };
        let dataset = Dataset {
            id: "d1".to_string(),
            node_id: "n1".to_string(),
            dataset_type: DatasetType::Raster,
            format: FileFormat::Geotiff,
            file_name: "ortho.tif".to_string(),
            file_size: 0,
            storage_key: "datasets/d1/file.tif".to_string(),
            metadata: DatasetMetadata::default(),
            status: DatasetStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        store.create_dataset_node(&node, &dataset).unwrap();
        dataset
    }

    fn upload_source(temp: &TempDir, deps: &JobDeps) {
        let raster = Raster {
            width: 32,
            height: 32,
            bands: 3,
            sample_type: SampleType::U8,
            crs: Crs::Wgs84,
            transform: GeoTransform {
                origin_x: 10.0,
                origin_y: 50.0,
                pixel_width: 0.01,
                pixel_height: 0.01,
            },
            nodata: None,
            data: (0..32 * 32 * 3).map(|i| f64::from(i % 256)).collect(),
        };
        let path = temp.path().join("upload.tif");
        raster::write_cog(&raster, &path).unwrap();
        let mut file = std::fs::File::open(path).unwrap();
        deps.storage
            .upload_object(&mut file, "datasets/d1/file.tif", &ObjectMetadata::new())
            .unwrap();
    }

    #[test]
    fn test_run_cog_job_success() {
        let temp = TempDir::new().unwrap();
        let (deps, store) = deps(&temp);
        seed_dataset(&store);
        upload_source(&temp, &deps);

        run_cog_job(&deps, "d1").unwrap();

        let tileset = store.get_tileset_by_dataset("d1").unwrap().unwrap();
        assert_eq!(tileset.status, TileSetStatus::Ready);
        assert_eq!(tileset.storage_key, processed_key(&tileset.id));
        assert!(tileset.file_size > 0);
        assert!(tileset.error_message.is_empty());
        let [w, _, _, n] = tileset.bounds.unwrap();
        assert!((w - 10.0).abs() < 1e-9 && (n - 50.0).abs() < 1e-9);

        let info = deps.storage.get_object_info(&tileset.storage_key).unwrap();
        assert_eq!(info.size as i64, tileset.file_size);
        assert_eq!(store.list_notifications("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_run_cog_job_failure_marks_failed() {
        let temp = TempDir::new().unwrap();
        let (deps, store) = deps(&temp);
        seed_dataset(&store);

        let err = run_cog_job(&deps, "d1").unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let tileset = store.get_tileset_by_dataset("d1").unwrap().unwrap();
        assert_eq!(tileset.status, TileSetStatus::Failed);
        assert!(tileset.error_message.contains("datasets/d1/file.tif"));

        // A later run restarts from processing
        upload_source(&temp, &deps);
        run_cog_job(&deps, "d1").unwrap();
        let tileset = store.get_tileset_by_dataset("d1").unwrap().unwrap();
        assert_eq!(tileset.status, TileSetStatus::Ready);
        assert!(tileset.error_message.is_empty());
    }

    #[test]
    fn test_missing_dataset_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let (deps, store) = deps(&temp);
        run_cog_job(&deps, "ghost").unwrap();
        assert!(store.get_tileset_by_dataset("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_retries_then_gives_up() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let runner: JobRunner = Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::processing("boom"))
        });
        let queue = JobQueue::start(
            runner,
            RetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(10),
            },
            2,
        );

        queue.enqueue("d1").unwrap();
        for _ in 0..200 {
            if attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queue_runs_successful_job_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let runner: JobRunner = Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let queue = JobQueue::start(runner, RetryPolicy::default(), 1);

        queue.enqueue("d1").unwrap();
        queue.enqueue("d2").unwrap();
        for _ in 0..200 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
