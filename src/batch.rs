use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::GeocodeCache;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::GeocoderConfig;
use crate::control::{ControlState, RunControl};
use crate::errors::{AppError, AppResult};
use crate::model::{AddressRecord, Dataset, GeocodeResult, OutcomeStatus};
use crate::providers::ProviderChain;
use crate::retry::{RetryController, RetryPolicy};
use crate::strategy::{PostalFieldResolver, RecordResolution, ResolutionStrategy};
use crate::telemetry::EventLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub success: usize,
    pub postal_fallback: usize,
    pub cache_hits: usize,
    pub errors: usize,
    pub processed: usize,
    pub total: usize,
}

impl RunStats {
    fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Rebuilds counters from the result slots below `cursor`.
    pub fn from_dataset(dataset: &Dataset, cursor: usize) -> Self {
        let mut stats = Self::with_total(dataset.len());
        for index in 0..cursor.min(dataset.len()) {
            match dataset.result(index) {
                Some(result) => stats.record(result),
                None => {
                    stats.errors += 1;
                    stats.processed += 1;
                }
            }
        }
        stats
    }

    pub fn record(&mut self, result: &GeocodeResult) {
        self.processed += 1;
        match result.status {
            OutcomeStatus::Cache => self.cache_hits += 1,
            OutcomeStatus::Success if result.is_postal_fallback() => self.postal_fallback += 1,
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Failed | OutcomeStatus::Error => self.errors += 1,
        }
    }

    pub fn resolved(&self) -> usize {
        self.success + self.postal_fallback + self.cache_hits
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.resolved() as f64 / self.processed as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub cursor: usize,
    pub stats: RunStats,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub dataset_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: ControlState,
    pub cursor: usize,
    pub total: usize,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives one dataset through the resolution strategy, one record at a time.
pub struct BatchController {
    strategy: ResolutionStrategy,
    control: RunControl,
    checkpoints: Arc<CheckpointStore>,
    events: EventLog,
    postal_fields: PostalFieldResolver,
    checkpoint_every: usize,
    rate_limit: Duration,
    pause_poll: Duration,
    state: RunState,
}

impl BatchController {
    pub fn new(
        config: &GeocoderConfig,
        providers: ProviderChain,
        cache: Arc<GeocodeCache>,
        events: EventLog,
    ) -> Self {
        let control = RunControl::new();
        let retry = RetryController::new(
            cache,
            config.bounding_box,
            RetryPolicy::from_config(config),
            control.clone(),
        );
        let strategy = ResolutionStrategy::new(
            retry,
            providers,
            config.max_retries,
            config.region.clone(),
            config.country.clone(),
        );
        Self {
            strategy,
            control,
            checkpoints: Arc::new(CheckpointStore::new()),
            events,
            postal_fields: PostalFieldResolver::default(),
            checkpoint_every: config.checkpoint_every.max(1),
            rate_limit: config.rate_limit_delay(),
            pause_poll: config.pause_poll_interval(),
            state: RunState::default(),
        }
    }

    pub fn with_postal_fields(mut self, resolver: PostalFieldResolver) -> Self {
        self.postal_fields = resolver;
        self
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.checkpoints)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        self.strategy.retry().cache()
    }

    /// Starts a fresh run over `dataset`, discarding earlier results.
    pub async fn run(&mut self, dataset: &mut Dataset) -> AppResult<RunSummary> {
        self.ensure_startable()?;
        dataset.clear_results();
        self.checkpoints.clear();
        self.state = RunState {
            stats: RunStats::with_total(dataset.len()),
            dataset_fingerprint: Some(dataset.fingerprint().to_string()),
            ..RunState::default()
        };
        self.drive(dataset).await
    }

    /// Continues a run from a checkpoint taken over the same dataset.
    pub async fn resume_from(
        &mut self,
        dataset: &mut Dataset,
        checkpoint: &Checkpoint,
    ) -> AppResult<RunSummary> {
        self.ensure_startable()?;
        if checkpoint.dataset.fingerprint() != dataset.fingerprint() {
            return Err(AppError::DatasetMismatch);
        }
        let cursor = checkpoint.cursor.min(dataset.len());
        dataset.adopt_results(&checkpoint.dataset, cursor);
        self.state = RunState {
            cursor,
            stats: RunStats::from_dataset(dataset, cursor),
            last_checkpoint_at: Some(checkpoint.created_at),
            dataset_fingerprint: Some(dataset.fingerprint().to_string()),
        };
        self.events.info(
            format!("Retomando processamento do índice {cursor}"),
            format!("{} de {} registros já processados", cursor, dataset.len()),
        );
        self.drive(dataset).await
    }

    fn ensure_startable(&self) -> AppResult<()> {
        let state = self.control.state();
        if state.is_active() {
            return Err(AppError::InvalidTransition {
                command: "start",
                from: state,
            });
        }
        Ok(())
    }

    async fn drive(&mut self, dataset: &mut Dataset) -> AppResult<RunSummary> {
        let started_at = Utc::now();
        let total = dataset.len();
        self.control.begin()?;

        let postal_field = self
            .postal_fields
            .resolve(dataset.columns())
            .map(str::to_string);
        self.events.info(
            "Sistema iniciado",
            format!(
                "{} registros, cache com {} entradas, provedores: {}",
                total,
                self.cache().len(),
                self.strategy.providers().names().join(", ")
            ),
        );
        if postal_field.is_none() {
            self.events
                .warning("Nenhuma coluna de CEP encontrada", "fallback por CEP desativado");
        }

        while self.state.cursor < total {
            match self.control.state() {
                ControlState::Stopped => {
                    self.events
                        .warning("Processamento interrompido pelo usuário", "");
                    break;
                }
                ControlState::Paused => {
                    self.events.info("Processamento pausado", "");
                    self.take_checkpoint(dataset);
                    if self.control.wait_while_paused(self.pause_poll).await == ControlState::Stopped
                    {
                        self.events
                            .warning("Processamento interrompido durante pausa", "");
                        break;
                    }
                    self.events.info("Processamento retomado", "");
                }
                _ => {}
            }

            let index = self.state.cursor;
            let Some(record) = dataset.record(index) else {
                break;
            };
            self.events.debug(
                format!("Processando registro {}", index + 1),
                format!(
                    "Endereço: {}",
                    record.full_address.as_deref().unwrap_or("Sem endereço")
                ),
            );

            let resolution = match self.resolve_contained(record, postal_field.as_deref()).await {
                Ok(resolution) => resolution,
                Err(AppError::Interrupted) => {
                    self.events.warning(
                        "Processamento interrompido",
                        format!("registro {} não foi gravado", index + 1),
                    );
                    break;
                }
                Err(err) => {
                    self.events
                        .error("Erro durante geocodificação", format!("Erro: {err}"));
                    RecordResolution {
                        result: GeocodeResult::error(),
                        provider_calls: 0,
                    }
                }
            };

            self.report(index, &resolution.result);
            self.state.stats.record(&resolution.result);
            dataset.set_result(index, resolution.result);
            self.state.cursor = index + 1;

            if self.state.cursor % self.checkpoint_every == 0 {
                self.take_checkpoint(dataset);
                self.persist_cache();
            }

            if resolution.provider_calls > 0 && self.state.cursor < total {
                // A stop during the delay is picked up at the top of the loop.
                let _ = self.control.sleep_unless_stopped(self.rate_limit).await;
            }
        }

        self.persist_cache();
        if let Err(err) = self.events.flush() {
            warn!(?err, "failed to flush event journal");
        }

        // A stop racing the last record leaves the run Stopped.
        let completed = self.state.cursor >= total && self.control.complete().is_ok();
        let state = if completed {
            self.take_checkpoint(dataset);
            self.events.success(
                "Processamento finalizado!",
                format!("Total processado: {total} registros"),
            );
            ControlState::Completed
        } else {
            self.take_checkpoint(dataset);
            ControlState::Stopped
        };

        Ok(RunSummary {
            state,
            cursor: self.state.cursor,
            total,
            stats: self.state.stats,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Turns panics inside a single resolution into an error result so one
    /// bad record cannot take the run down.
    async fn resolve_contained(
        &self,
        record: &AddressRecord,
        postal_field: Option<&str>,
    ) -> AppResult<RecordResolution> {
        match AssertUnwindSafe(self.strategy.resolve_record(record, postal_field))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(AppError::Panicked(message))
            }
        }
    }

    fn report(&self, index: usize, result: &GeocodeResult) {
        let coords = || match result.coordinate() {
            Some(c) => format!("Coords: {:.6}, {:.6}", c.lat, c.lon),
            None => String::new(),
        };
        let label = result.method.label();
        match result.status {
            OutcomeStatus::Cache => self
                .events
                .success(format!("Sucesso (Cache) - {label}"), coords()),
            OutcomeStatus::Success if result.is_postal_fallback() => self
                .events
                .success(format!("Sucesso (CEP) - {label}"), coords()),
            OutcomeStatus::Success => self
                .events
                .success(format!("Sucesso (Endereço) - {label}"), coords()),
            OutcomeStatus::Failed => self.events.error(
                "Falha na geocodificação",
                format!("registro {}: {label}", index + 1),
            ),
            OutcomeStatus::Error => self.events.error(
                "Erro durante geocodificação",
                format!("registro {}", index + 1),
            ),
        }
    }

    fn take_checkpoint(&mut self, dataset: &Dataset) {
        let checkpoint = self.checkpoints.checkpoint(
            dataset,
            self.state.cursor,
            dataset.len(),
            self.state.stats,
        );
        self.state.last_checkpoint_at = Some(checkpoint.created_at);
        self.events.info(
            format!(
                "Progresso salvo: {}/{} registros",
                checkpoint.cursor, checkpoint.total
            ),
            "",
        );
    }

    fn persist_cache(&self) {
        if let Err(err) = self.cache().persist_to_disk() {
            self.events
                .warning("Erro ao salvar cache", format!("{err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::{Coordinate, ResolutionMethod};
    use crate::providers::{GeocodingProvider, ProviderError, ProviderResult};
    use crate::retry::test_support::ScriptedProvider;

    const INSIDE: Coordinate = Coordinate {
        lat: -20.3155,
        lon: -40.3128,
    };

    fn config() -> GeocoderConfig {
        GeocoderConfig {
            backoff_unit_ms: 1,
            rate_limit_ms: 0,
            pause_poll_ms: 10,
            cache_file: None,
            ..GeocoderConfig::default()
        }
    }

    fn controller(provider: Arc<dyn GeocodingProvider>) -> BatchController {
        BatchController::new(
            &config(),
            ProviderChain::new(vec![provider]),
            Arc::new(GeocodeCache::in_memory()),
            EventLog::in_memory(),
        )
    }

    fn addresses(count: usize) -> Dataset {
        Dataset::new(
            vec!["endereco_completo".into()],
            (0..count)
                .map(|i| AddressRecord::new(Some(format!("Rua {i}, Vitória")), Vec::new()))
                .collect(),
        )
    }

    struct PanickingProvider;

    #[async_trait]
    impl GeocodingProvider for PanickingProvider {
        fn name(&self) -> &str {
            "Panicky"
        }

        async fn geocode(&self, query: &str, _timeout: Duration) -> ProviderResult<Option<Coordinate>> {
            if query.starts_with("Rua 1,") {
                panic!("parser exploded");
            }
            Ok(Some(INSIDE))
        }
    }

    /// Pauses the run from inside the provider once `pause_at` calls happened.
    struct PausingProvider {
        control: parking_lot::Mutex<Option<RunControl>>,
        pause_at: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GeocodingProvider for PausingProvider {
        fn name(&self) -> &str {
            "Pausing"
        }

        async fn geocode(&self, _query: &str, _timeout: Duration) -> ProviderResult<Option<Coordinate>> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls == self.pause_at {
                if let Some(control) = self.control.lock().as_ref() {
                    control.pause().unwrap();
                }
            }
            Ok(Some(INSIDE))
        }
    }

    #[tokio::test]
    async fn checkpoints_every_25_records() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let mut controller = controller(provider);
        let mut data = addresses(80);
        let summary = controller.run(&mut data).await.unwrap();

        assert_eq!(summary.state, ControlState::Completed);
        assert_eq!(summary.stats.success, 80);
        assert_eq!(summary.stats.processed, 80);
        let latest = controller.checkpoints().latest().unwrap();
        assert_eq!(latest.cursor, 80);
        assert!(latest.is_complete());

        let saved: Vec<String> = controller
            .events()
            .recent()
            .into_iter()
            .filter(|event| event.message.starts_with("Progresso salvo"))
            .map(|event| event.message)
            .collect();
        assert_eq!(
            saved,
            [
                "Progresso salvo: 25/80 registros",
                "Progresso salvo: 50/80 registros",
                "Progresso salvo: 75/80 registros",
                "Progresso salvo: 80/80 registros",
            ]
        );
    }

    #[tokio::test]
    async fn panics_are_contained_to_one_record() {
        let mut controller = controller(Arc::new(PanickingProvider));
        let mut data = addresses(3);
        let summary = controller.run(&mut data).await.unwrap();

        assert_eq!(summary.state, ControlState::Completed);
        assert_eq!(summary.stats.success, 2);
        assert_eq!(summary.stats.errors, 1);
        let failed = data.result(1).unwrap();
        assert_eq!(failed.status, OutcomeStatus::Error);
        assert_eq!(failed.method, ResolutionMethod::TransientError);
        assert_eq!(data.result(2).unwrap().status, OutcomeStatus::Success);
    }

    /// Stops the run from inside the call for the last record.
    struct StopOnLastRecord {
        control: parking_lot::Mutex<Option<RunControl>>,
        last_query: &'static str,
    }

    #[async_trait]
    impl GeocodingProvider for StopOnLastRecord {
        fn name(&self) -> &str {
            "StopOnLast"
        }

        async fn geocode(&self, query: &str, _timeout: Duration) -> ProviderResult<Option<Coordinate>> {
            if query == self.last_query {
                if let Some(control) = self.control.lock().as_ref() {
                    control.stop().unwrap();
                }
                return Err(ProviderError::Unexpected("bad payload".into()));
            }
            Ok(Some(INSIDE))
        }
    }

    #[tokio::test]
    async fn stop_on_last_record_still_returns_summary() {
        let provider = Arc::new(StopOnLastRecord {
            control: parking_lot::Mutex::new(None),
            last_query: "Rua 2, Vitória",
        });
        let mut controller = controller(provider.clone());
        *provider.control.lock() = Some(controller.control());
        let mut data = addresses(3);

        let summary = controller.run(&mut data).await.unwrap();
        assert_eq!(summary.state, ControlState::Stopped);
        assert_eq!(summary.cursor, 3);
        assert_eq!(summary.stats.success, 2);
        assert_eq!(
            data.result(2).unwrap().method,
            ResolutionMethod::AllProvidersFailed
        );
        assert_eq!(controller.control().state(), ControlState::Stopped);
    }

    #[tokio::test]
    async fn pause_holds_cursor_until_resume() {
        let provider = Arc::new(PausingProvider {
            control: parking_lot::Mutex::new(None),
            pause_at: 3,
            calls: AtomicU32::new(0),
        });
        let mut controller = controller(provider.clone());
        *provider.control.lock() = Some(controller.control());
        let control = controller.control();
        let checkpoints = controller.checkpoints();

        let handle = tokio::spawn(async move {
            let mut data = addresses(5);
            let summary = controller.run(&mut data).await.unwrap();
            (summary, data)
        });

        while control.state() != ControlState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        let paused = checkpoints.latest().unwrap();
        assert_eq!(paused.cursor, 3);

        control.resume().unwrap();
        let (summary, data) = handle.await.unwrap();
        assert_eq!(summary.state, ControlState::Completed);
        assert_eq!(summary.cursor, 5);
        assert!(data.result(4).is_some());
    }

    #[tokio::test]
    async fn stop_during_pause_ends_run() {
        let provider = Arc::new(PausingProvider {
            control: parking_lot::Mutex::new(None),
            pause_at: 2,
            calls: AtomicU32::new(0),
        });
        let mut controller = controller(provider.clone());
        *provider.control.lock() = Some(controller.control());
        let control = controller.control();

        let handle = tokio::spawn(async move {
            let mut data = addresses(5);
            let summary = controller.run(&mut data).await.unwrap();
            (summary, data)
        });

        while control.state() != ControlState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        control.stop().unwrap();
        let (summary, data) = handle.await.unwrap();

        assert_eq!(summary.state, ControlState::Stopped);
        assert_eq!(summary.cursor, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(data.result(2).is_none());
        assert_eq!(control.state(), ControlState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_leaves_record_untouched() {
        let provider = Arc::new(ScriptedProvider::always("Slow", ScriptedProvider::timeout()));
        let mut controller = BatchController::new(
            &GeocoderConfig {
                backoff_unit_ms: 10_000,
                cache_file: None,
                ..GeocoderConfig::default()
            },
            ProviderChain::new(vec![provider.clone() as Arc<dyn GeocodingProvider>]),
            Arc::new(GeocodeCache::in_memory()),
            EventLog::in_memory(),
        );
        let control = controller.control();
        let handle = tokio::spawn(async move {
            let mut data = addresses(2);
            let summary = controller.run(&mut data).await.unwrap();
            (summary, data)
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        control.stop().unwrap();
        let (summary, data) = handle.await.unwrap();

        assert_eq!(summary.state, ControlState::Stopped);
        assert_eq!(summary.cursor, 0);
        assert!(data.result(0).is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_of_same_dataset() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let mut first = controller(provider.clone());
        let mut data = addresses(4);
        first.run(&mut data).await.unwrap();
        let mut partial = (*first.checkpoints().latest().unwrap()).clone();
        partial.cursor = 2;

        let mut second = controller(provider.clone());
        let mut fresh = addresses(4);
        let summary = second.resume_from(&mut fresh, &partial).await.unwrap();
        assert_eq!(summary.state, ControlState::Completed);
        assert_eq!(summary.stats.processed, 4);
        assert_eq!(summary.stats.success, 4);
        assert_eq!(provider.calls(), 6);

        let mut other = addresses(3);
        assert!(matches!(
            second.resume_from(&mut other, &partial).await,
            Err(AppError::DatasetMismatch)
        ));
    }

    #[test]
    fn stats_rebuild_from_written_slots() {
        let mut data = addresses(4);
        data.set_result(
            0,
            GeocodeResult::resolved(INSIDE, ResolutionMethod::AddressProvider("P".into()), OutcomeStatus::Success),
        );
        data.set_result(
            1,
            GeocodeResult::resolved(INSIDE, ResolutionMethod::PostalProvider("P".into()), OutcomeStatus::Success),
        );
        data.set_result(
            2,
            GeocodeResult::resolved(INSIDE, ResolutionMethod::CacheHit("P".into()), OutcomeStatus::Cache),
        );
        data.set_result(3, GeocodeResult::failed(ResolutionMethod::NoAddress));
        let stats = RunStats::from_dataset(&data, 4);
        assert_eq!(
            (stats.success, stats.postal_fallback, stats.cache_hits, stats.errors),
            (1, 1, 1, 1)
        );
        assert_eq!(stats.success_rate(), 75.0);
    }
}
