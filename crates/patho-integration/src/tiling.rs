//! 切图任务
//!
//! 图片上传后把切图任务投递到队列，后台 worker 调用外部切图程序生成
//! Deep Zoom 金字塔，成功后翻转图片的 `is_cutted` 标记。
//! 临时失败延迟后重新入队，超过最大次数后放弃，等待人工处理。

use crate::deepzoom::{dzi_path_for, output_base_for};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patho_core::{PathoError, Result};
use patho_storage::StorageManager;
use patho_workflow::PathologyService;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 切图任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingTask {
    pub picture_id: i64,
    /// 存储根目录下的图片路径
    pub file: String,
    pub enqueued_at: DateTime<Utc>,
    /// 已失败的次数
    pub attempts: u32,
    pub max_attempts: u32,
}

impl TilingTask {
    pub fn new(picture_id: i64, file: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            picture_id,
            file: file.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 记录一次失败，返回是否还可以重试
    pub fn increment_attempt(&mut self) -> bool {
        self.attempts += 1;
        self.attempts < self.max_attempts
    }
}

/// 切图程序
#[async_trait]
pub trait TileGenerator: Send + Sync {
    /// 读取 `source`，生成 `<output_base>.dzi` 和 `<output_base>_files/`
    async fn generate(&self, source: &Path, output_base: &Path) -> Result<()>;
}

/// 通过外部命令切图，参数中的 `{input}` 和 `{output}` 会被替换
#[derive(Debug, Clone)]
pub struct CommandTileGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandTileGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand_args(&self, source: &Path, output_base: &Path) -> Vec<String> {
        let input = source.to_string_lossy();
        let output = output_base.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl Default for CommandTileGenerator {
    /// libvips 的 dzsave
    fn default() -> Self {
        Self::new(
            "vips",
            vec![
                "dzsave".to_string(),
                "{input}".to_string(),
                "{output}".to_string(),
            ],
        )
    }
}

#[async_trait]
impl TileGenerator for CommandTileGenerator {
    async fn generate(&self, source: &Path, output_base: &Path) -> Result<()> {
        let args = self.expand_args(source, output_base);
        debug!("Running tiler: {} {:?}", self.program, args);

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| PathoError::Tiling(format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PathoError::Tiling(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// 切图队列的发送端
#[derive(Debug, Clone)]
pub struct TilingQueue {
    sender: mpsc::Sender<TilingTask>,
    max_attempts: u32,
}

impl TilingQueue {
    pub fn channel(capacity: usize, max_attempts: u32) -> (Self, mpsc::Receiver<TilingTask>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                max_attempts,
            },
            receiver,
        )
    }

    pub async fn enqueue(&self, picture_id: i64, file: &str) -> Result<()> {
        let task = TilingTask::new(picture_id, file, self.max_attempts);
        self.sender
            .send(task)
            .await
            .map_err(|_| PathoError::Tiling("tiling queue is closed".to_string()))?;
        info!("Enqueued tiling for picture {}", picture_id);
        Ok(())
    }

    fn downgrade(&self) -> mpsc::WeakSender<TilingTask> {
        self.sender.downgrade()
    }
}

/// 单个任务的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// 已经切过图，直接确认
    AlreadyTiled,
    /// 图片已被删除
    Dropped,
    Retry(TilingTask),
    GaveUp,
}

/// 后台切图 worker
pub struct TilingWorker {
    service: PathologyService,
    storage: StorageManager,
    generator: Arc<dyn TileGenerator>,
    retry_delay: Duration,
    requeue: mpsc::WeakSender<TilingTask>,
}

impl TilingWorker {
    pub fn new(
        service: PathologyService,
        storage: StorageManager,
        generator: Arc<dyn TileGenerator>,
        retry_delay: Duration,
        queue: &TilingQueue,
    ) -> Self {
        Self {
            service,
            storage,
            generator,
            retry_delay,
            requeue: queue.downgrade(),
        }
    }

    /// 消费队列直到所有发送端关闭
    pub async fn run(self, mut receiver: mpsc::Receiver<TilingTask>) {
        info!("Tiling worker started");
        while let Some(task) = receiver.recv().await {
            if let TaskOutcome::Retry(task) = self.process(task).await {
                self.schedule_retry(task);
            }
        }
        info!("Tiling worker stopped");
    }

    fn schedule_retry(&self, task: TilingTask) {
        // 在延迟前持有发送端，队列不会在重试等待期间关闭
        let Some(sender) = self.requeue.upgrade() else {
            error!(
                "Tiling queue closed, dropping retry for picture {}",
                task.picture_id
            );
            return;
        };
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let picture_id = task.picture_id;
            if sender.send(task).await.is_err() {
                error!("Tiling queue closed, dropping retry for picture {}", picture_id);
            }
        });
    }

    pub async fn process(&self, mut task: TilingTask) -> TaskOutcome {
        match self.tile(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if task.increment_attempt() {
                    warn!(
                        "Tiling picture {} failed (attempt {}/{}): {}",
                        task.picture_id, task.attempts, task.max_attempts, e
                    );
                    TaskOutcome::Retry(task)
                } else {
                    error!(
                        "Tiling picture {} failed after {} attempts, manual intervention required: {}",
                        task.picture_id, task.attempts, e
                    );
                    TaskOutcome::GaveUp
                }
            }
        }
    }

    async fn tile(&self, task: &TilingTask) -> Result<TaskOutcome> {
        let picture = match self.service.get_picture(task.picture_id).await {
            Ok(picture) => picture,
            Err(PathoError::NotFound(_)) => {
                warn!("Picture {} no longer exists, dropping tiling task", task.picture_id);
                return Ok(TaskOutcome::Dropped);
            }
            Err(e) => return Err(e),
        };

        if picture.is_cutted {
            debug!("Picture {} already tiled", picture.id);
            return Ok(TaskOutcome::AlreadyTiled);
        }

        let source = self.storage.resolve(&picture.file)?;
        let output_base = self.storage.resolve(&output_base_for(&picture.file))?;
        self.generator.generate(&source, &output_base).await?;

        let dzi = dzi_path_for(&picture.file);
        if !self.storage.exists(&dzi).await? {
            return Err(PathoError::Tiling(format!(
                "tiler finished without producing {}",
                dzi
            )));
        }

        self.service.mark_picture_tiled(picture.id).await?;
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deepzoom::DeepZoomDescriptor;
    use patho_core::{PatientInput, SystemClock};
    use patho_database::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 `failures` 次失败，之后写出 dzi 文件
    struct FlakyGenerator {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyGenerator {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TileGenerator for FlakyGenerator {
        async fn generate(&self, _source: &Path, output_base: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PathoError::Tiling("tiler crashed".to_string()));
            }
            let descriptor = DeepZoomDescriptor {
                tile_size: 254,
                overlap: 1,
                format: "jpeg".to_string(),
                width: 1000,
                height: 800,
            };
            let dzi = format!("{}.dzi", output_base.display());
            tokio::fs::write(dzi, descriptor.to_xml()).await?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        service: PathologyService,
        storage: StorageManager,
        picture_id: i64,
        file: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        let service = PathologyService::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));

        let stored = storage
            .store_upload("origin", "slide.tif", b"fake slide")
            .await
            .unwrap();
        let patient = service
            .create_patient(&PatientInput {
                name: "赵六".to_string(),
                sex: "F".to_string(),
                age: None,
            })
            .await
            .unwrap();
        let picture = service
            .register_picture(patient.id, &stored.relative_path, &stored.checksum, "")
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            service,
            storage,
            picture_id: picture.id,
            file: stored.relative_path,
        }
    }

    fn worker(fx: &Fixture, generator: Arc<FlakyGenerator>, queue: &TilingQueue) -> TilingWorker {
        TilingWorker::new(
            fx.service.clone(),
            fx.storage.clone(),
            generator,
            Duration::from_millis(10),
            queue,
        )
    }

    #[test]
    fn test_task_attempts() {
        let mut task = TilingTask::new(1, "origin/a.tif", 3);
        assert!(task.increment_attempt());
        assert!(task.increment_attempt());
        assert!(!task.increment_attempt());
        assert_eq!(task.attempts, 3);

        let single = TilingTask::new(1, "origin/a.tif", 0);
        assert_eq!(single.max_attempts, 1);
    }

    #[test]
    fn test_command_args_expand() {
        let generator = CommandTileGenerator::default();
        let args = generator.expand_args(Path::new("/m/origin/a.tif"), Path::new("/m/origin/a"));
        assert_eq!(args, vec!["dzsave", "/m/origin/a.tif", "/m/origin/a"]);
    }

    #[tokio::test]
    async fn test_success_marks_picture_and_is_idempotent() {
        let fx = fixture().await;
        let (queue, _rx) = TilingQueue::channel(8, 3);
        let generator = Arc::new(FlakyGenerator::new(0));
        let worker = worker(&fx, generator.clone(), &queue);

        let task = TilingTask::new(fx.picture_id, fx.file.clone(), 3);
        assert_eq!(worker.process(task.clone()).await, TaskOutcome::Completed);
        assert!(fx.service.get_picture(fx.picture_id).await.unwrap().is_cutted);
        assert!(fx.storage.exists(&dzi_path_for(&fx.file)).await.unwrap());

        assert_eq!(worker.process(task).await, TaskOutcome::AlreadyTiled);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let fx = fixture().await;
        let (queue, _rx) = TilingQueue::channel(8, 3);
        let generator = Arc::new(FlakyGenerator::new(u32::MAX));
        let worker = worker(&fx, generator.clone(), &queue);

        let mut task = TilingTask::new(fx.picture_id, fx.file.clone(), 3);
        for expected_attempts in 1..=2 {
            match worker.process(task).await {
                TaskOutcome::Retry(next) => {
                    assert_eq!(next.attempts, expected_attempts);
                    task = next;
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(worker.process(task).await, TaskOutcome::GaveUp);
        assert_eq!(generator.calls(), 3);
        assert!(!fx.service.get_picture(fx.picture_id).await.unwrap().is_cutted);
    }

    #[tokio::test]
    async fn test_deleted_picture_is_dropped() {
        let fx = fixture().await;
        let (queue, _rx) = TilingQueue::channel(8, 3);
        let generator = Arc::new(FlakyGenerator::new(0));
        let worker = worker(&fx, generator.clone(), &queue);

        fx.service.delete_picture(fx.picture_id).await.unwrap();
        let task = TilingTask::new(fx.picture_id, fx.file.clone(), 3);
        assert_eq!(worker.process(task).await, TaskOutcome::Dropped);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_retries_through_queue() {
        let fx = fixture().await;
        let (queue, rx) = TilingQueue::channel(8, 3);
        let generator = Arc::new(FlakyGenerator::new(1));
        let handle = tokio::spawn(worker(&fx, generator.clone(), &queue).run(rx));

        queue.enqueue(fx.picture_id, &fx.file).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !fx.service.get_picture(fx.picture_id).await.unwrap().is_cutted {
            assert!(tokio::time::Instant::now() < deadline, "tiling did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(generator.calls(), 2);

        drop(queue);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
