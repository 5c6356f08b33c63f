//! Distillation engine.
//!
//! Flow for one patched function:
//! caller asks which model to use → caller runs the call → caller reports the
//! outcome → the engine stores the example, updates fault telemetry, decides
//! whether to start or poll a fine-tune, and persists the function config.
//!
//! Operations take `&mut self`, so two calls never interleave inside one
//! engine and the dedup check-then-mark in storage has no suspension point.

mod ring;
pub mod tag;

#[cfg(test)]
mod tests;

pub use ring::ExampleRing;

use crate::models::{
    Config, ConfigError, DatasetKind, DatasetSizeIndex, DistillationConfig, DistilleryError,
    FunctionConfig, FunctionDescriptor, FunctionExample, FunctionKind, FunctionPolicy,
    ModelConfig, Result,
};
use crate::provider::{FinetuneRecord, FinetuneRequest, JobStatus, ProviderRegistry};
use crate::storage::{FilesystemAdapter, LoadMode, PersistenceAdapter};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Default number of examples returned by [`DistillationEngine::get_examples`].
pub const DEFAULT_EXAMPLE_COUNT: usize = 20;

/// Jobs requested from the provider when reconciling a fresh config.
const RECONCILE_JOB_LIMIT: usize = 100;

/// Models available to one function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    /// Empty model name means no distilled model is deployed yet
    pub distilled: ModelConfig,
    /// Ordered by increasing context length
    pub teachers: Vec<ModelConfig>,
}

/// The model a prompt should be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Distilled(ModelConfig),
    Teacher(ModelConfig),
}

impl ModelChoice {
    pub fn model(&self) -> &ModelConfig {
        match self {
            Self::Distilled(model) | Self::Teacher(model) => model,
        }
    }

    pub fn is_distilled(&self) -> bool {
        matches!(self, Self::Distilled(_))
    }
}

#[derive(Debug, Default)]
struct FunctionState {
    config: Option<FunctionConfig>,
    policy: FunctionPolicy,
    /// `policy.teacher_override` resolved against the configured teachers
    teacher_override: Vec<ModelConfig>,
    threshold_announced: bool,
}

/// Orchestrates model selection, example capture and the fine-tune lifecycle.
///
/// # Example
///
/// ```ignore
/// use distillery::{Config, DistillationEngine};
///
/// let config = Config::from_file("distillery.toml".as_ref())?;
/// let mut engine = DistillationEngine::from_config(&config)?;
///
/// let choice = engine.choose_model(&descriptor, prompt_tokens).await?;
/// // ... run the call against choice.model() ...
/// engine.record_patch_and_maybe_finetune(&descriptor, example, was_fault).await?;
/// engine.flush();
/// ```
pub struct DistillationEngine {
    settings: DistillationConfig,
    storage: Box<dyn PersistenceAdapter>,
    providers: ProviderRegistry,
    functions: HashMap<String, FunctionState>,
    dataset_sizes: DatasetSizeIndex,
    ring: ExampleRing,
}

impl DistillationEngine {
    /// Create an engine over the given storage and providers.
    ///
    /// Existing dataset sizes are scanned up front; if the scan fails they are
    /// loaded lazily per function instead.
    pub fn new(
        settings: DistillationConfig,
        mut storage: Box<dyn PersistenceAdapter>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        check_environment_id(settings.environment_id)?;

        let dataset_sizes = match storage.load_existing_datasets() {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "Failed to scan existing datasets, sizes will load on demand");
                DatasetSizeIndex::new()
            }
        };

        info!(
            student = %settings.student.model_name,
            teachers = settings.teachers.len(),
            known_functions = dataset_sizes.functions().len(),
            "Distillation engine ready"
        );

        Ok(Self {
            ring: ExampleRing::new(settings.example_buffer_bytes),
            settings,
            storage,
            providers,
            functions: HashMap::new(),
            dataset_sizes,
        })
    }

    /// Validate `config`, open filesystem storage and build the provider clients.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let storage = FilesystemAdapter::open(&config.storage)?;
        let providers = ProviderRegistry::from_config(config)?;
        Self::new(config.distillation.clone(), Box::new(storage), providers)
    }

    pub fn settings(&self) -> &DistillationConfig {
        &self.settings
    }

    /// Cached config of a function, if it has been loaded.
    pub fn function_config(&self, func_hash: &str) -> Option<&FunctionConfig> {
        self.functions.get(func_hash)?.config.as_ref()
    }

    /// Known dataset size, or `None` if it has not been read yet.
    pub fn dataset_size(&self, kind: DatasetKind, func_hash: &str) -> Option<usize> {
        self.dataset_sizes.get(kind, func_hash)
    }

    pub fn policy(&self, func_hash: &str) -> FunctionPolicy {
        self.functions
            .get(func_hash)
            .map(|state| state.policy.clone())
            .unwrap_or_default()
    }

    /// Register per-function switches.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedModel` if a teacher override names a model that is
    /// not a configured teacher, and a config error for an environment id
    /// with no single-character encoding.
    pub fn set_policy(&mut self, descriptor: &FunctionDescriptor, policy: FunctionPolicy) -> Result<()> {
        if let Some(environment_id) = policy.environment_id {
            check_environment_id(environment_id)?;
        }

        let teacher_override = policy
            .teacher_override
            .iter()
            .map(|name| {
                self.settings
                    .teacher(name)
                    .cloned()
                    .ok_or_else(|| DistilleryError::UnsupportedModel(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let func_hash = descriptor.hash();
        debug!(func_hash = %func_hash, policy = ?policy, "Policy registered");
        let state = self.functions.entry(func_hash).or_default();
        state.policy = policy;
        state.teacher_override = teacher_override;
        Ok(())
    }

    /// Distilled model and teachers for a function.
    ///
    /// Only contacts a provider when the function has no persisted config and
    /// reconciliation is enabled.
    pub async fn select_models(&mut self, descriptor: &FunctionDescriptor) -> Result<ModelSelection> {
        let func_hash = descriptor.hash();
        self.load_config(descriptor).await?;

        let config = self.cached_config(&func_hash);
        let distilled = config.distilled_model.clone();
        let persisted_teachers = config.teacher_models.clone();

        let teachers = match self.functions.get(&func_hash) {
            Some(state) if !state.teacher_override.is_empty() => state.teacher_override.clone(),
            _ => persisted_teachers,
        };

        Ok(ModelSelection { distilled, teachers })
    }

    /// Pick the model for a prompt of `prompt_tokens` approximate tokens.
    ///
    /// The distilled model wins when it is trained and the prompt fits its
    /// context; otherwise the first teacher that fits.
    pub async fn choose_model(
        &mut self,
        descriptor: &FunctionDescriptor,
        prompt_tokens: usize,
    ) -> Result<ModelChoice> {
        let selection = self.select_models(descriptor).await?;

        if selection.distilled.is_trained() && selection.distilled.fits(prompt_tokens) {
            return Ok(ModelChoice::Distilled(selection.distilled));
        }

        selection
            .teachers
            .into_iter()
            .find(|teacher| teacher.fits(prompt_tokens))
            .map(ModelChoice::Teacher)
            .ok_or(DistilleryError::PromptTooLong {
                tokens: prompt_tokens,
            })
    }

    /// Store a caller-asserted example. Returns true if it was not seen before.
    pub fn record_symbolic_alignment(
        &mut self,
        func_hash: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        output: Value,
    ) -> bool {
        let example = FunctionExample::new(args, kwargs, output);
        let is_new = self.store_alignment(func_hash, &example, DatasetKind::SymbolicAlignment);
        self.ring
            .push(DatasetKind::SymbolicAlignment, func_hash, &example);
        is_new
    }

    /// Store embedding alignments: each positive and negative counterpart
    /// becomes one example. Returns how many were new.
    pub fn record_embedding_alignment(
        &mut self,
        func_hash: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        positives: Vec<Value>,
        negatives: Vec<Value>,
    ) -> usize {
        let labelled = positives
            .into_iter()
            .map(|value| (DatasetKind::PositiveEmbedding, value))
            .chain(
                negatives
                    .into_iter()
                    .map(|value| (DatasetKind::NegativeEmbedding, value)),
            );

        let mut new_examples = 0;
        for (kind, counterpart) in labelled {
            let example = FunctionExample::new(args.clone(), kwargs.clone(), counterpart);
            if self.store_alignment(func_hash, &example, kind) {
                new_examples += 1;
            }
            self.ring.push(kind, func_hash, &example);
        }
        new_examples
    }

    /// Recent distinct examples for prompting, within the prompt token budget.
    pub fn get_examples(&self, func_hash: &str, kind: DatasetKind, max: usize) -> Vec<FunctionExample> {
        self.ring
            .examples(kind, func_hash, max, self.settings.prompt_token_budget)
    }

    fn skips_storage(&self, func_hash: &str) -> bool {
        self.functions
            .get(func_hash)
            .is_some_and(|state| state.policy.skip_data_storage)
    }

    fn store_alignment(&mut self, func_hash: &str, example: &FunctionExample, kind: DatasetKind) -> bool {
        if self.skips_storage(func_hash) {
            debug!(func_hash = %func_hash, kind = %kind, "Storage skipped by policy");
            return false;
        }

        // The counter must be known before the write, or loading it later
        // would count this record twice.
        self.ensure_dataset_size(kind, func_hash);

        let outcome = match kind {
            DatasetKind::SymbolicAlignment => self.storage.log_symbolic_align(func_hash, example),
            DatasetKind::PositiveEmbedding => {
                self.storage.log_embeddable_align(func_hash, example, true)
            }
            DatasetKind::NegativeEmbedding => {
                self.storage.log_embeddable_align(func_hash, example, false)
            }
            DatasetKind::Patch => self.storage.log_symbolic_patch(func_hash, example),
        };

        if outcome.saved {
            self.dataset_sizes.increment(kind, func_hash);
        }
        outcome.is_new
    }

    /// Store an example observed in live traffic. Returns true if it is new.
    pub fn record_patch(&mut self, func_hash: &str, example: &FunctionExample) -> bool {
        if self.skips_storage(func_hash) {
            debug!(func_hash = %func_hash, "Patch storage skipped by policy");
            return false;
        }

        self.ensure_dataset_size(DatasetKind::Patch, func_hash);
        let outcome = self.storage.log_symbolic_patch(func_hash, example);
        // Buffered patches count towards the threshold before they are flushed.
        if outcome.is_new {
            self.dataset_sizes.increment(DatasetKind::Patch, func_hash);
        }
        outcome.is_new
    }

    /// Push one fault flag and revert the distilled model if the recent fault
    /// rate is too high. Persistence failures are logged.
    ///
    /// The config is loaded (and reconciled if new) first, so a function whose
    /// first call reports an outcome still picks up its provider-side model.
    pub async fn record_outcome(&mut self, descriptor: &FunctionDescriptor, was_fault: bool) -> Result<()> {
        let func_hash = descriptor.hash();
        self.load_config(descriptor).await?;

        let config = self.cached_config(&func_hash);
        let model_name = config.distilled_model.model_name.clone();

        if config.record_fault(was_fault) && !model_name.is_empty() {
            warn!(
                func_hash = %func_hash,
                model = %model_name,
                "Distilled model reverted after repeated faults"
            );
        }
        self.persist(&func_hash);
        Ok(())
    }

    /// Store a production example, record its outcome and advance the
    /// fine-tune lifecycle. Returns whether the example was new.
    pub async fn record_patch_and_maybe_finetune(
        &mut self,
        descriptor: &FunctionDescriptor,
        example: FunctionExample,
        was_fault: bool,
    ) -> Result<bool> {
        let func_hash = descriptor.hash();
        self.load_config(descriptor).await?;

        let is_new = self.record_patch(&func_hash, &example);
        self.record_outcome(descriptor, was_fault).await?;
        self.maybe_finetune(descriptor).await?;
        Ok(is_new)
    }

    /// Poll a running job, or start one once the datasets outgrow the threshold.
    pub async fn maybe_finetune(&mut self, descriptor: &FunctionDescriptor) -> Result<()> {
        self.maybe_finetune_at(descriptor, Utc::now()).await
    }

    /// [`maybe_finetune`](Self::maybe_finetune) with an explicit clock.
    pub async fn maybe_finetune_at(
        &mut self,
        descriptor: &FunctionDescriptor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let func_hash = descriptor.hash();
        if descriptor.kind == FunctionKind::Embeddable || self.policy(&func_hash).skip_finetune_execution {
            return Ok(());
        }

        self.load_config(descriptor).await?;
        if self.cached_config(&func_hash).is_training() {
            return self.poll_status(descriptor, now).await;
        }

        let alignments = self.ensure_dataset_size(DatasetKind::SymbolicAlignment, &func_hash);
        let patches = self.ensure_dataset_size(DatasetKind::Patch, &func_hash);
        let base_threshold = self.settings.base_threshold;
        let threshold = self.cached_config(&func_hash).finetune_threshold(base_threshold);
        let datapoints = alignments + patches;

        if datapoints <= threshold {
            return Ok(());
        }

        let state = self.functions.entry(func_hash.clone()).or_default();
        if !state.threshold_announced {
            state.threshold_announced = true;
            info!(
                function = %descriptor.name,
                func_hash = %func_hash,
                alignments = alignments,
                patches = patches,
                threshold = threshold,
                "Fine-tune threshold crossed"
            );
        }

        self.start_finetune(descriptor, datapoints, now).await
    }

    /// Submit the function's datasets to the student's provider.
    ///
    /// Provider failures are logged and leave the function idle; a missing
    /// provider is a configuration error and propagates.
    async fn start_finetune(
        &mut self,
        descriptor: &FunctionDescriptor,
        datapoints: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let func_hash = descriptor.hash();
        let environment_id = self.environment_id(&func_hash);
        let run_index = self.cached_config(&func_hash).nr_of_training_runs;

        let suffix = match tag::finetune_suffix(&descriptor.finetune_hash(), environment_id, run_index) {
            Ok(suffix) => suffix,
            Err(e) => {
                warn!(func_hash = %func_hash, error = %e, "Cannot tag another fine-tune run");
                return Ok(());
            }
        };

        let mut examples = Vec::new();
        for kind in [DatasetKind::SymbolicAlignment, DatasetKind::Patch] {
            match self.storage.load_dataset(kind, &func_hash, LoadMode::Dataset) {
                Ok(loaded) => examples.extend(loaded.records.unwrap_or_default()),
                Err(e) => {
                    warn!(func_hash = %func_hash, kind = %kind, error = %e, "Failed to load dataset for fine-tuning");
                    return Ok(());
                }
            }
        }
        if examples.is_empty() {
            debug!(func_hash = %func_hash, "No stored examples, fine-tune not started");
            return Ok(());
        }

        let student = &self.settings.student;
        let provider = self.providers.get(&student.provider)?;
        let request = FinetuneRequest {
            base_model: student.model_name.clone(),
            suffix: suffix.clone(),
            records: examples
                .iter()
                .map(|example| FinetuneRecord::from_example(descriptor, student, example))
                .collect(),
        };

        match provider.finetune(request).await {
            Ok(job) => {
                info!(
                    function = %descriptor.name,
                    func_hash = %func_hash,
                    job_id = %job.id,
                    suffix = %suffix,
                    datapoints = datapoints,
                    "Fine-tune submitted"
                );
                self.cached_config(&func_hash)
                    .begin_training(job.id, datapoints, now);
                self.persist(&func_hash);
            }
            Err(e) => {
                warn!(
                    func_hash = %func_hash,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Fine-tune submission failed"
                );
            }
        }
        Ok(())
    }

    /// Check a running job once the poll interval has passed.
    async fn poll_status(&mut self, descriptor: &FunctionDescriptor, now: DateTime<Utc>) -> Result<()> {
        let func_hash = descriptor.hash();
        let interval = Duration::minutes(self.settings.poll_interval_mins);

        let due = self
            .cached_config(&func_hash)
            .current_training_run
            .as_ref()
            .is_some_and(|run| now - run.last_checked > interval);
        if !due {
            return Ok(());
        }

        let provider = self.providers.get(&self.settings.student.provider)?;
        let Some(run) = self.cached_config(&func_hash).current_training_run.as_mut() else {
            return Ok(());
        };
        run.last_checked = now;
        let job_id = run.job_id.clone();

        let job = match provider.get_finetuned(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(func_hash = %func_hash, job_id = %job_id, error = %e, "Fine-tune status check failed");
                self.persist(&func_hash);
                return Ok(());
            }
        };

        if !job.status.is_terminal() {
            debug!(func_hash = %func_hash, job_id = %job_id, status = ?job.status, "Fine-tune still running");
            self.persist(&func_hash);
            return Ok(());
        }

        let config = self.cached_config(&func_hash);
        match (job.status, job.fine_tuned_model) {
            (JobStatus::Succeeded, Some(model_name)) => {
                info!(
                    function = %descriptor.name,
                    func_hash = %func_hash,
                    job_id = %job_id,
                    model = %model_name,
                    "Distilled model promoted"
                );
                config.complete_training(model_name);
            }
            (JobStatus::Succeeded, None) => {
                warn!(func_hash = %func_hash, job_id = %job_id, "Job succeeded without a model name");
                config.fail_training();
            }
            (status, _) => {
                warn!(func_hash = %func_hash, job_id = %job_id, status = ?status, "Fine-tune job did not succeed");
                config.fail_training();
            }
        }
        self.persist(&func_hash);
        Ok(())
    }

    /// Write every buffered example. Returns records written per function.
    pub fn flush(&mut self) -> HashMap<String, usize> {
        let written = self.storage.flush();
        debug!(functions = written.len(), "Flushed buffered examples");
        written
    }

    fn environment_id(&self, func_hash: &str) -> u32 {
        self.functions
            .get(func_hash)
            .and_then(|state| state.policy.environment_id)
            .unwrap_or(self.settings.environment_id)
    }

    /// Known size, loading it from storage on first use. Load failures count
    /// as zero and are retried next time.
    fn ensure_dataset_size(&mut self, kind: DatasetKind, func_hash: &str) -> usize {
        if let Some(size) = self.dataset_sizes.get(kind, func_hash) {
            return size;
        }
        match self.storage.load_dataset(kind, func_hash, LoadMode::Length) {
            Ok(loaded) => {
                let size = loaded.length.unwrap_or_default();
                self.dataset_sizes.set(kind, func_hash, size);
                size
            }
            Err(e) => {
                warn!(func_hash = %func_hash, kind = %kind, error = %e, "Failed to read dataset size");
                0
            }
        }
    }

    /// Cached config, read from storage (or defaulted) without reconciliation.
    /// Public operations call [`load_config`](Self::load_config) before this.
    fn cached_config(&mut self, func_hash: &str) -> &mut FunctionConfig {
        let state = self.functions.entry(func_hash.to_string()).or_default();
        let config = match state.config.take() {
            Some(config) => config,
            None => {
                let default = FunctionConfig::new(&self.settings.student, self.settings.teachers.clone());
                self.storage.load_function_config(func_hash, &default).0
            }
        };
        state.config.insert(config)
    }

    /// Load a function's config into the cache, reconciling a freshly
    /// defaulted one against the provider's fine-tuned models.
    async fn load_config(&mut self, descriptor: &FunctionDescriptor) -> Result<()> {
        let func_hash = descriptor.hash();
        if self.function_config(&func_hash).is_some() {
            return Ok(());
        }

        let default = FunctionConfig::new(&self.settings.student, self.settings.teachers.clone());
        let (mut config, default_used) = self.storage.load_function_config(&func_hash, &default);

        let reconcile = default_used
            && descriptor.kind == FunctionKind::Symbolic
            && !self.policy(&func_hash).skip_finetune_fetch;
        if reconcile {
            if let Some(remote) = self.reconcile(descriptor).await? {
                config = remote;
                if let Err(e) = self.storage.update_function_config(&func_hash, &config) {
                    warn!(func_hash = %func_hash, error = %e, "Failed to persist reconciled config");
                }
            }
        }

        self.functions.entry(func_hash).or_default().config = Some(config);
        Ok(())
    }

    /// Rebuild a config from the newest run of this function the provider
    /// finished, if any.
    async fn reconcile(&self, descriptor: &FunctionDescriptor) -> Result<Option<FunctionConfig>> {
        let func_hash = descriptor.hash();
        let student = &self.settings.student;
        let provider = self.providers.get(&student.provider)?;
        let function_tag = tag::function_tag(&descriptor.finetune_hash(), self.environment_id(&func_hash))?;

        let jobs = match provider.list_finetuned(RECONCILE_JOB_LIMIT).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(func_hash = %func_hash, error = %e, "Failed to list fine-tuned models");
                return Ok(None);
            }
        };

        let latest = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Succeeded)
            .filter_map(|job| {
                let model_name = job.fine_tuned_model.as_deref()?;
                let prior_index = tag::recover_run_index(model_name, &function_tag)?;
                Some((prior_index, model_name))
            })
            .max_by_key(|(prior_index, _)| *prior_index);

        Ok(latest.map(|(prior_index, model_name)| {
            info!(
                func_hash = %func_hash,
                model = %model_name,
                training_runs = prior_index + 1,
                "Reconciled config from provider"
            );
            FunctionConfig::reconstructed(
                student.renamed(model_name),
                self.settings.teachers.clone(),
                prior_index,
                self.settings.base_threshold,
            )
        }))
    }

    fn persist(&mut self, func_hash: &str) {
        let Some(config) = self
            .functions
            .get(func_hash)
            .and_then(|state| state.config.as_ref())
        else {
            return;
        };
        match self.storage.update_function_config(func_hash, config) {
            Ok(()) => debug!(func_hash = %func_hash, "Function config persisted"),
            Err(e) => warn!(func_hash = %func_hash, error = %e, "Failed to persist function config"),
        }
    }
}

fn check_environment_id(environment_id: u32) -> Result<()> {
    if environment_id > tag::MAX_ENCODABLE {
        return Err(ConfigError::Invalid(format!(
            "environment id {environment_id} exceeds {}",
            tag::MAX_ENCODABLE
        ))
        .into());
    }
    Ok(())
}
