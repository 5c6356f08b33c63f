use super::*;
use crate::models::{ProviderError, StorageConfig};
use crate::provider::{Finetunable, FinetuneJob};
use crate::storage::{ConfigStore, LoadedDataset, LogOutcome};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Records submissions and answers status checks from a scripted status.
struct MockProvider {
    submissions: Mutex<Vec<FinetuneRequest>>,
    status: Mutex<JobStatus>,
    listed: Mutex<Vec<FinetuneJob>>,
    polls: AtomicUsize,
    list_calls: AtomicUsize,
    reject_submissions: AtomicBool,
}

impl MockProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            status: Mutex::new(JobStatus::Running),
            listed: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            reject_submissions: AtomicBool::new(false),
        })
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn submitted(&self) -> Vec<FinetuneRequest> {
        self.submissions.lock().unwrap().clone()
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Finetunable for MockProvider {
    async fn list_finetuned(&self, _limit: usize) -> Result<Vec<FinetuneJob>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.listed.lock().unwrap().clone())
    }

    async fn get_finetuned(&self, job_id: &str) -> Result<FinetuneJob> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        let suffix = self
            .submissions
            .lock()
            .unwrap()
            .last()
            .map(|request| request.suffix.clone())
            .unwrap_or_default();
        Ok(FinetuneJob {
            id: job_id.to_string(),
            status,
            fine_tuned_model: (status == JobStatus::Succeeded)
                .then(|| format!("ft:gpt-3.5-turbo-1106:acme:{suffix}:9aZk2LmQ")),
            created_at: None,
        })
    }

    async fn finetune(&self, request: FinetuneRequest) -> Result<FinetuneJob> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(ProviderError::ApiError {
                status: 500,
                message: "training capacity exhausted".to_string(),
            }
            .into());
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request);
        Ok(FinetuneJob {
            id: format!("ftjob-{}", submissions.len()),
            status: JobStatus::Queued,
            fine_tuned_model: None,
            created_at: None,
        })
    }
}

fn engine(dir: &Path, provider: Arc<MockProvider>) -> DistillationEngine {
    let storage = FilesystemAdapter::open(&StorageConfig {
        dir: dir.to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let mut providers = ProviderRegistry::new();
    providers.insert("openai", provider);
    DistillationEngine::new(DistillationConfig::default(), Box::new(storage), providers).unwrap()
}

fn descriptor() -> FunctionDescriptor {
    let mut inputs = BTreeMap::new();
    inputs.insert("text".to_string(), "str".to_string());
    FunctionDescriptor::new(
        "is_positive",
        "Decide whether the review is positive.",
        inputs,
        "bool",
        FunctionKind::Symbolic,
    )
}

fn example(i: usize) -> FunctionExample {
    FunctionExample::new(
        vec![json!(format!("review number {i}"))],
        BTreeMap::new(),
        json!(i % 3 != 0),
    )
}

fn model_name_for(descriptor: &FunctionDescriptor, run_index: u32) -> String {
    let suffix = tag::finetune_suffix(&descriptor.finetune_hash(), 0, run_index).unwrap();
    format!("ft:gpt-3.5-turbo-1106:acme:{suffix}:Xy12abCD")
}

#[tokio::test]
async fn test_patches_trigger_finetune_then_promotion() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();
    let func_hash = d.hash();

    let selection = engine.select_models(&d).await.unwrap();
    assert!(!selection.distilled.is_trained());
    assert_eq!(provider.list_calls(), 1);

    for i in 0..150 {
        assert!(engine
            .record_patch_and_maybe_finetune(&d, example(i), false)
            .await
            .unwrap());
    }
    assert!(provider.submitted().is_empty());

    for i in 150..210 {
        engine
            .record_patch_and_maybe_finetune(&d, example(i), false)
            .await
            .unwrap();
    }
    assert_eq!(engine.dataset_size(DatasetKind::Patch, &func_hash), Some(210));

    // Submitted as soon as 201 > 200; later calls only check the poll interval.
    let submitted = provider.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].base_model, "gpt-3.5-turbo-1106");
    assert_eq!(
        submitted[0].suffix,
        tag::finetune_suffix(&d.finetune_hash(), 0, 0).unwrap()
    );
    assert_eq!(submitted[0].records.len(), 201);
    assert_eq!(provider.polls(), 0);

    let run = engine
        .function_config(&func_hash)
        .unwrap()
        .current_training_run
        .clone()
        .unwrap();
    assert_eq!(run.job_id, "ftjob-1");
    assert_eq!(run.trained_on_datapoints, 201);

    engine
        .maybe_finetune_at(&d, run.last_checked + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(provider.polls(), 0);

    provider.set_status(JobStatus::Succeeded);
    engine
        .maybe_finetune_at(&d, run.last_checked + Duration::minutes(31))
        .await
        .unwrap();
    assert_eq!(provider.polls(), 1);

    let config = engine.function_config(&func_hash).unwrap().clone();
    assert_eq!(config.distilled_model.model_name, model_name_for(&d, 0));
    assert_eq!(config.nr_of_training_runs, 1);
    assert!(config.current_training_run.is_none());
    assert_eq!(config.current_model_stats.trained_on_datapoints, 201);
    assert!(config.current_model_stats.running_faults.is_empty());
    assert_eq!(config.finetune_threshold(200), 400);

    let persisted = ConfigStore::new(temp_dir.path()).read(&func_hash).unwrap().unwrap();
    assert_eq!(persisted, config);

    let choice = engine.choose_model(&d, 50).await.unwrap();
    assert!(choice.is_distilled());
    assert_eq!(choice.model().model_name, model_name_for(&d, 0));
}

#[tokio::test]
async fn test_reopened_engine_uses_persisted_config() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let d = descriptor();
    {
        let mut engine = engine(temp_dir.path(), provider.clone());
        engine.select_models(&d).await.unwrap();
        engine.record_outcome(&d, true).await.unwrap();
        for i in 0..5 {
            engine.record_patch(&d.hash(), &example(i));
        }
        engine.flush();
    }
    assert_eq!(provider.list_calls(), 1);

    let mut engine = engine(temp_dir.path(), provider.clone());
    assert_eq!(engine.dataset_size(DatasetKind::Patch, &d.hash()), Some(5));
    engine.select_models(&d).await.unwrap();
    assert_eq!(provider.list_calls(), 1);
    let config = engine.function_config(&d.hash()).unwrap();
    assert_eq!(config.current_model_stats.running_faults, vec![1]);
}

#[tokio::test]
async fn test_alignment_dedup_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = engine(temp_dir.path(), MockProvider::new());
    let func_hash = descriptor().hash();

    let args = vec![json!("great product")];
    assert!(engine.record_symbolic_alignment(&func_hash, args.clone(), BTreeMap::new(), json!(true)));
    assert!(!engine.record_symbolic_alignment(&func_hash, args, BTreeMap::new(), json!(true)));

    assert_eq!(engine.dataset_size(DatasetKind::SymbolicAlignment, &func_hash), Some(1));
    let stored = std::fs::read_to_string(temp_dir.path().join(format!("{func_hash}.alignments"))).unwrap();
    assert_eq!(stored.lines().count(), 1);

    let examples = engine.get_examples(&func_hash, DatasetKind::SymbolicAlignment, DEFAULT_EXAMPLE_COUNT);
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].output, json!(true));
}

#[tokio::test]
async fn test_skip_data_storage_keeps_examples_in_memory() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = engine(temp_dir.path(), MockProvider::new());
    let d = descriptor();
    let func_hash = d.hash();

    engine
        .set_policy(
            &d,
            FunctionPolicy {
                skip_data_storage: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert!(!engine.record_symbolic_alignment(&func_hash, vec![json!("ok")], BTreeMap::new(), json!(false)));
    assert!(!engine.record_patch(&func_hash, &example(1)));
    assert!(!temp_dir.path().join(format!("{func_hash}.alignments")).exists());
    assert_eq!(engine.dataset_size(DatasetKind::SymbolicAlignment, &func_hash), None);
    assert_eq!(
        engine
            .get_examples(&func_hash, DatasetKind::SymbolicAlignment, 20)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_embedding_alignments_are_stored_by_polarity() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let mut d = descriptor();
    d.kind = FunctionKind::Embeddable;
    let func_hash = d.hash();

    let new_examples = engine.record_embedding_alignment(
        &func_hash,
        vec![json!("a cat")],
        BTreeMap::new(),
        vec![json!("a kitten"), json!("a feline")],
        vec![json!("a truck")],
    );
    assert_eq!(new_examples, 3);
    assert_eq!(engine.dataset_size(DatasetKind::PositiveEmbedding, &func_hash), Some(2));
    assert_eq!(engine.dataset_size(DatasetKind::NegativeEmbedding, &func_hash), Some(1));
    assert_eq!(
        engine
            .get_examples(&func_hash, DatasetKind::NegativeEmbedding, 20)
            .len(),
        1
    );

    // Embeddable functions are never fine-tuned or reconciled.
    engine.maybe_finetune(&d).await.unwrap();
    assert_eq!(provider.list_calls(), 0);
    assert!(provider.submitted().is_empty());
}

#[tokio::test]
async fn test_teacher_override_is_not_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = engine(temp_dir.path(), MockProvider::new());
    let d = descriptor();

    let err = engine
        .set_policy(
            &d,
            FunctionPolicy {
                teacher_override: vec!["no-such-model".to_string()],
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, DistilleryError::UnsupportedModel(name) if name == "no-such-model"));

    engine
        .set_policy(
            &d,
            FunctionPolicy {
                teacher_override: vec!["gpt-4-32k".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
    let selection = engine.select_models(&d).await.unwrap();
    let names: Vec<&str> = selection.teachers.iter().map(|t| t.model_name.as_str()).collect();
    assert_eq!(names, vec!["gpt-4-32k"]);

    let persisted = ConfigStore::new(temp_dir.path()).read(&d.hash()).unwrap().unwrap();
    assert_eq!(persisted.teacher_models.len(), 2);
}

#[tokio::test]
async fn test_invalid_environment_id_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = engine(temp_dir.path(), MockProvider::new());
    let err = engine
        .set_policy(
            &descriptor(),
            FunctionPolicy {
                environment_id: Some(36),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, DistilleryError::Config(_)));
}

#[tokio::test]
async fn test_reconciles_fresh_config_from_provider() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let d = descriptor();
    *provider.listed.lock().unwrap() = vec![
        FinetuneJob {
            id: "ftjob-a".to_string(),
            status: JobStatus::Succeeded,
            fine_tuned_model: Some(model_name_for(&d, 1)),
            created_at: Some(1_700_000_000),
        },
        FinetuneJob {
            id: "ftjob-b".to_string(),
            status: JobStatus::Succeeded,
            fine_tuned_model: Some(model_name_for(&d, 2)),
            created_at: Some(1_700_100_000),
        },
        FinetuneJob {
            id: "ftjob-c".to_string(),
            status: JobStatus::Succeeded,
            fine_tuned_model: Some("ft:gpt-3.5-turbo-1106:acme:0000000000:zz".to_string()),
            created_at: Some(1_700_200_000),
        },
        FinetuneJob {
            id: "ftjob-d".to_string(),
            status: JobStatus::Failed,
            fine_tuned_model: None,
            created_at: Some(1_700_300_000),
        },
    ];

    let mut engine = engine(temp_dir.path(), provider.clone());
    let selection = engine.select_models(&d).await.unwrap();
    assert_eq!(selection.distilled.model_name, model_name_for(&d, 2));

    let config = engine.function_config(&d.hash()).unwrap();
    assert_eq!(config.nr_of_training_runs, 3);
    assert_eq!(config.current_model_stats.trained_on_datapoints, 800);
    assert_eq!(config.finetune_threshold(200), 1600);

    let persisted = ConfigStore::new(temp_dir.path()).read(&d.hash()).unwrap().unwrap();
    assert_eq!(&persisted, config);
}

#[tokio::test]
async fn test_skip_finetune_fetch_avoids_provider() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();
    engine
        .set_policy(
            &d,
            FunctionPolicy {
                skip_finetune_fetch: true,
                ..Default::default()
            },
        )
        .unwrap();
    engine.select_models(&d).await.unwrap();
    assert_eq!(provider.list_calls(), 0);
}

#[tokio::test]
async fn test_fault_reversion_through_engine() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let d = descriptor();
    *provider.listed.lock().unwrap() = vec![FinetuneJob {
        id: "ftjob-a".to_string(),
        status: JobStatus::Succeeded,
        fine_tuned_model: Some(model_name_for(&d, 0)),
        created_at: None,
    }];
    let mut engine = engine(temp_dir.path(), provider);
    let func_hash = d.hash();
    assert!(engine.select_models(&d).await.unwrap().distilled.is_trained());

    for _ in 0..5 {
        engine.record_outcome(&d, false).await.unwrap();
    }
    for _ in 0..5 {
        engine.record_outcome(&d, true).await.unwrap();
    }
    // 5/5 in the window is not above the threshold.
    assert!(engine.select_models(&d).await.unwrap().distilled.is_trained());

    // Window is now 4 clean + 6 faults.
    engine.record_outcome(&d, true).await.unwrap();
    let selection = engine.select_models(&d).await.unwrap();
    assert!(!selection.distilled.is_trained());

    let persisted = ConfigStore::new(temp_dir.path()).read(&func_hash).unwrap().unwrap();
    assert!(!persisted.distilled_model.is_trained());
    assert_eq!(persisted.current_model_stats.trained_on_datapoints, 0);
    assert!(persisted.current_model_stats.running_faults.is_empty());

    let choice = engine.choose_model(&d, 50).await.unwrap();
    assert_eq!(choice, ModelChoice::Teacher(selection.teachers[0].clone()));
}

#[tokio::test]
async fn test_failed_job_returns_to_idle_and_resubmits() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();
    let func_hash = d.hash();

    for i in 0..201 {
        engine.record_patch(&func_hash, &example(i));
    }
    let start = Utc::now();
    engine.maybe_finetune_at(&d, start).await.unwrap();
    assert_eq!(provider.submitted().len(), 1);

    provider.set_status(JobStatus::Failed);
    engine
        .maybe_finetune_at(&d, start + Duration::minutes(45))
        .await
        .unwrap();
    let config = engine.function_config(&func_hash).unwrap();
    assert!(!config.is_training());
    assert_eq!(config.nr_of_training_runs, 0);
    assert!(!config.distilled_model.is_trained());

    engine
        .maybe_finetune_at(&d, start + Duration::minutes(46))
        .await
        .unwrap();
    let submitted = provider.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].suffix, submitted[1].suffix);
}

#[tokio::test]
async fn test_running_job_only_refreshes_last_checked() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();
    let func_hash = d.hash();

    for i in 0..201 {
        engine.record_patch(&func_hash, &example(i));
    }
    let start = Utc::now();
    engine.maybe_finetune_at(&d, start).await.unwrap();

    let later = start + Duration::minutes(31);
    engine.maybe_finetune_at(&d, later).await.unwrap();
    assert_eq!(provider.polls(), 1);

    let persisted = ConfigStore::new(temp_dir.path()).read(&func_hash).unwrap().unwrap();
    let run = persisted.current_training_run.unwrap();
    assert_eq!(run.last_checked, later);
    assert_eq!(run.job_id, "ftjob-1");
}

#[tokio::test]
async fn test_rejected_submission_stays_idle() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.reject_submissions.store(true, Ordering::SeqCst);
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();

    for i in 0..201 {
        engine.record_patch(&d.hash(), &example(i));
    }
    engine.maybe_finetune(&d).await.unwrap();
    assert!(!engine.function_config(&d.hash()).unwrap().is_training());
}

#[tokio::test]
async fn test_skip_finetune_execution() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let mut engine = engine(temp_dir.path(), provider.clone());
    let d = descriptor();
    engine
        .set_policy(
            &d,
            FunctionPolicy {
                skip_finetune_execution: true,
                ..Default::default()
            },
        )
        .unwrap();

    for i in 0..250 {
        engine
            .record_patch_and_maybe_finetune(&d, example(i), false)
            .await
            .unwrap();
    }
    assert!(provider.submitted().is_empty());
}

#[tokio::test]
async fn test_choose_model_by_prompt_size() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = engine(temp_dir.path(), MockProvider::new());
    let d = descriptor();

    let small = engine.choose_model(&d, 100).await.unwrap();
    assert_eq!(small.model().model_name, "gpt-4");

    let large = engine.choose_model(&d, 20_000).await.unwrap();
    assert_eq!(large.model().model_name, "gpt-4-32k");

    let err = engine.choose_model(&d, 1_000_000).await.unwrap_err();
    assert!(matches!(err, DistilleryError::PromptTooLong { tokens: 1_000_000 }));
}

/// Storage whose config writes always fail.
struct ReadOnlyConfigs {
    inner: FilesystemAdapter,
}

impl PersistenceAdapter for ReadOnlyConfigs {
    fn load_existing_datasets(&mut self) -> Result<DatasetSizeIndex> {
        Err(DistilleryError::Internal("scan unavailable".to_string()))
    }

    fn log_symbolic_align(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome {
        self.inner.log_symbolic_align(func_hash, example)
    }

    fn log_embeddable_align(&mut self, func_hash: &str, example: &FunctionExample, positive: bool) -> LogOutcome {
        self.inner.log_embeddable_align(func_hash, example, positive)
    }

    fn log_symbolic_patch(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome {
        self.inner.log_symbolic_patch(func_hash, example)
    }

    fn flush(&mut self) -> HashMap<String, usize> {
        self.inner.flush()
    }

    fn load_function_config(&mut self, _func_hash: &str, default: &FunctionConfig) -> (FunctionConfig, bool) {
        (default.clone(), true)
    }

    fn update_function_config(&mut self, _func_hash: &str, _config: &FunctionConfig) -> Result<()> {
        Err(DistilleryError::io(
            "writing function config",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        ))
    }

    fn load_dataset(&self, kind: DatasetKind, func_hash: &str, mode: LoadMode) -> Result<LoadedDataset> {
        self.inner.load_dataset(kind, func_hash, mode)
    }
}

#[tokio::test]
async fn test_persistence_failures_are_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let inner = FilesystemAdapter::open(&StorageConfig {
        dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let provider = MockProvider::new();
    let mut providers = ProviderRegistry::new();
    providers.insert("openai", provider.clone());
    let mut engine = DistillationEngine::new(
        DistillationConfig::default(),
        Box::new(ReadOnlyConfigs { inner }),
        providers,
    )
    .unwrap();

    let d = descriptor();
    for i in 0..201 {
        engine
            .record_patch_and_maybe_finetune(&d, example(i), i % 2 == 0)
            .await
            .unwrap();
    }
    assert_eq!(provider.submitted().len(), 1);
    assert!(engine.function_config(&d.hash()).unwrap().is_training());
}

#[tokio::test]
async fn test_missing_provider_is_a_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FilesystemAdapter::open(&StorageConfig {
        dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let mut engine =
        DistillationEngine::new(DistillationConfig::default(), Box::new(storage), ProviderRegistry::new())
            .unwrap();

    let err = engine.select_models(&descriptor()).await.unwrap_err();
    assert!(matches!(err, DistilleryError::MissingProvider(name) if name == "openai"));
}

#[tokio::test]
async fn test_outcome_before_selection_still_reconciles() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let d = descriptor();
    *provider.listed.lock().unwrap() = vec![FinetuneJob {
        id: "ftjob-a".to_string(),
        status: JobStatus::Succeeded,
        fine_tuned_model: Some(model_name_for(&d, 1)),
        created_at: None,
    }];
    let mut engine = engine(temp_dir.path(), provider.clone());

    engine.record_outcome(&d, false).await.unwrap();
    assert_eq!(provider.list_calls(), 1);

    let selection = engine.select_models(&d).await.unwrap();
    assert_eq!(selection.distilled.model_name, model_name_for(&d, 1));
    assert_eq!(provider.list_calls(), 1);

    let persisted = ConfigStore::new(temp_dir.path()).read(&d.hash()).unwrap().unwrap();
    assert_eq!(persisted.distilled_model.model_name, model_name_for(&d, 1));
    assert_eq!(persisted.nr_of_training_runs, 2);
    assert_eq!(persisted.current_model_stats.running_faults, vec![0]);
}

#[tokio::test]
async fn test_idle_poll_does_not_need_provider() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    let d = descriptor();
    let start = Utc::now();
    {
        let mut engine = engine(temp_dir.path(), provider.clone());
        for i in 0..201 {
            engine.record_patch(&d.hash(), &example(i));
        }
        engine.maybe_finetune_at(&d, start).await.unwrap();
        engine.flush();
    }
    assert_eq!(provider.submitted().len(), 1);

    let storage = FilesystemAdapter::open(&StorageConfig {
        dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let mut engine =
        DistillationEngine::new(DistillationConfig::default(), Box::new(storage), ProviderRegistry::new())
            .unwrap();

    engine
        .maybe_finetune_at(&d, start + Duration::minutes(10))
        .await
        .unwrap();
    assert!(engine.function_config(&d.hash()).unwrap().is_training());

    let err = engine
        .maybe_finetune_at(&d, start + Duration::minutes(31))
        .await
        .unwrap_err();
    assert!(matches!(err, DistilleryError::MissingProvider(name) if name == "openai"));
}
