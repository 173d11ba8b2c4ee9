//! Cycle orchestration: fetch one listing, evaluate it for every profile, record outcomes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lbw_adapters::{
    AdapterError, GeminiScorer, LastBottleScraper, ListingScraper, Notifier, Scorer, SmtpNotifier,
};
use lbw_core::{evaluate_filters, FilterDecision, Listing, ListingId, Outcome, PreferenceProfile};
use lbw_storage::{
    HttpClientConfig, HttpFetcher, ListingStore, ScoreStore, StoreError, WineDatabase,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod alert;
mod config;
mod profiles;

pub use alert::{render_alert, render_error_digest, RenderedMessage};
pub use config::{CycleConfig, CycleSettings};
pub use profiles::{load_profile_file, load_profiles_from_dir, LoadedProfiles, RejectedProfile};

pub const CRATE_NAME: &str = "lbw-cycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Profile,
    Scoring,
    Delivery,
    Store,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Profile => "profile",
            FailureKind::Scoring => "scoring",
            FailureKind::Delivery => "delivery",
            FailureKind::Store => "store",
        })
    }
}

/// Something that went wrong for one user or one profile file, for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct CycleFailure {
    pub kind: FailureKind,
    /// User id, or profile path for files that never became a user.
    pub subject: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    /// A new score record was written this cycle.
    Evaluated,
    /// Delivery of an earlier pending alert was attempted again.
    RetriedDelivery,
    /// A pending alert was dropped because the wine now matches a never-notify term.
    DeliveryWithdrawn,
    /// A record already existed; nothing to do.
    AlreadyProcessed,
    /// Store error; no record was written.
    Errored,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserCycleOutcome {
    pub user_id: String,
    pub action: UserAction,
    pub outcome: Option<Outcome>,
    pub score: Option<u8>,
    pub notify_attempts: u32,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listing: Listing,
    pub listing_id: ListingId,
    pub new_listing: bool,
    pub users: Vec<UserCycleOutcome>,
    pub failures: Vec<CycleFailure>,
    pub reports_dir: Option<String>,
}

impl CycleReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.users
            .iter()
            .filter(|u| u.action != UserAction::AlreadyProcessed && u.outcome == Some(outcome))
            .count()
    }
}

pub struct CyclePipeline<S> {
    store: S,
    scraper: Box<dyn ListingScraper>,
    scorer: Box<dyn Scorer>,
    notifier: Box<dyn Notifier>,
    settings: CycleSettings,
    cycle_lock: Mutex<()>,
}

impl<S> CyclePipeline<S>
where
    S: ListingStore + ScoreStore,
{
    pub fn new(
        store: S,
        scraper: Box<dyn ListingScraper>,
        scorer: Box<dyn Scorer>,
        notifier: Box<dyn Notifier>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            scraper,
            scorer,
            notifier,
            settings,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one cycle unless another is in flight, in which case `None`.
    pub async fn run_exclusive(&self) -> Option<Result<CycleReport>> {
        let _guard = self.cycle_lock.try_lock().ok()?;
        Some(self.run_once().await)
    }

    pub async fn run_once(&self) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        async {
            match self.execute(run_id).await {
                Ok(mut report) => {
                    if let Some(dir) = &self.settings.reports_dir {
                        match write_reports(dir, &report).await {
                            Ok(path) => report.reports_dir = Some(path.display().to_string()),
                            Err(err) => {
                                let error = format!("{err:#}");
                                warn!(%error, "writing cycle report failed");
                            }
                        }
                    }
                    info!(
                        new_listing = report.new_listing,
                        users = report.users.len(),
                        notified = report.count(Outcome::Notified),
                        failures = report.failures.len(),
                        "cycle complete"
                    );
                    if !report.failures.is_empty() {
                        self.send_error_digest(run_id, &report.failures, None).await;
                    }
                    Ok(report)
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    error!(%error, "cycle aborted");
                    self.send_error_digest(run_id, &[], Some(&error)).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid) -> Result<CycleReport> {
        let started_at = Utc::now();

        let fetched = timeout(self.settings.fetch_timeout, self.scraper.fetch_current()).await;
        let listing = match fetched {
            Ok(result) => result,
            Err(_) => Err(AdapterError::FetchFailure(format!(
                "timed out after {:?}",
                self.settings.fetch_timeout
            ))),
        }
        .with_context(|| format!("fetching listing from {}", self.scraper.source_id()))?;
        info!(
            wine = %listing.wine_name,
            price = listing.price,
            key = %listing.key,
            "fetched listing"
        );

        let loaded = load_profiles_from_dir(&self.settings.profiles_dir).await?;
        let mut failures: Vec<CycleFailure> = loaded
            .rejected
            .iter()
            .map(|r| CycleFailure {
                kind: FailureKind::Profile,
                subject: Some(r.path.display().to_string()),
                message: r.error.clone(),
            })
            .collect();

        let new_listing = !self.store.has_seen(&listing.key).await?;
        let listing_id = self.store.record(&listing).await?;
        if new_listing {
            info!(%listing_id, "new listing recorded");
        } else {
            debug!(%listing_id, "listing already known");
        }

        let mut users = Vec::with_capacity(loaded.profiles.len());
        for profile in &loaded.profiles {
            let user_span = info_span!("user", user_id = %profile.user_id);
            let result = self
                .process_user(&listing, listing_id, profile)
                .instrument(user_span)
                .await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    if matches!(err, StoreError::ConstraintViolation(_)) {
                        error!(
                            user_id = %profile.user_id,
                            error = %err,
                            "score store constraint violated; this is a bug"
                        );
                    } else {
                        error!(
                            user_id = %profile.user_id,
                            error = %err,
                            "recording outcome failed"
                        );
                    }
                    UserCycleOutcome {
                        user_id: profile.user_id.clone(),
                        action: UserAction::Errored,
                        outcome: None,
                        score: None,
                        notify_attempts: 0,
                        detail: Some(err.to_string()),
                    }
                }
            };
            if let Some(failure) = failure_for(&outcome) {
                failures.push(failure);
            }
            users.push(outcome);
        }

        Ok(CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            listing,
            listing_id,
            new_listing,
            users,
            failures,
            reports_dir: None,
        })
    }

    async fn process_user(
        &self,
        listing: &Listing,
        listing_id: ListingId,
        profile: &PreferenceProfile,
    ) -> Result<UserCycleOutcome, StoreError> {
        if let Some(existing) = self.store.score_record(&profile.user_id, listing_id).await? {
            if existing.outcome == Outcome::NotifyPending
                && existing.notify_attempts < self.settings.max_notify_attempts
            {
                return self
                    .retry_delivery(
                        listing,
                        listing_id,
                        profile,
                        existing.score,
                        existing.notify_attempts,
                    )
                    .await;
            }
            debug!(outcome = %existing.outcome, "already processed");
            return Ok(UserCycleOutcome {
                user_id: profile.user_id.clone(),
                action: UserAction::AlreadyProcessed,
                outcome: Some(existing.outcome),
                score: existing.score,
                notify_attempts: existing.notify_attempts,
                detail: None,
            });
        }

        let (score, outcome, detail) = match evaluate_filters(listing, profile) {
            FilterDecision::FilteredDeny { term } => {
                info!(%term, "never-notify match");
                let detail = format!("never-notify term `{term}`");
                (None, Outcome::FilteredDeny, Some(detail))
            }
            FilterDecision::FilteredPrice { price } => {
                info!(
                    range = %price.range,
                    matched_type = ?price.matched_type,
                    "outside price range"
                );
                let detail = format!("price outside {}", price.range);
                (None, Outcome::FilteredPrice, Some(detail))
            }
            FilterDecision::ForcedNotify { term } => {
                info!(%term, "always-notify match; skipping scorer");
                let message = render_alert(listing, None, Some(&term));
                match self.deliver(profile, &message).await {
                    Ok(()) => {
                        let detail = format!("always-notify term `{term}`");
                        (None, Outcome::Notified, Some(detail))
                    }
                    Err(err) => (None, self.after_failed_delivery(1), Some(err.to_string())),
                }
            }
            FilterDecision::Pass { .. } => match self.score(listing, profile).await {
                Err(err) => {
                    warn!(error = %err, "scoring failed");
                    (None, Outcome::ScoringError, Some(err.to_string()))
                }
                Ok(score) if score >= profile.notify_threshold => {
                    info!(score, threshold = profile.notify_threshold, "above threshold");
                    let message = render_alert(listing, Some(score), None);
                    match self.deliver(profile, &message).await {
                        Ok(()) => (Some(score), Outcome::Notified, None),
                        Err(err) => {
                            let outcome = self.after_failed_delivery(1);
                            (Some(score), outcome, Some(err.to_string()))
                        }
                    }
                }
                Ok(score) => {
                    info!(score, threshold = profile.notify_threshold, "below threshold");
                    (Some(score), Outcome::Suppressed, None)
                }
            },
        };

        let record = self
            .store
            .record_outcome(&profile.user_id, listing_id, score, outcome)
            .await?;
        Ok(UserCycleOutcome {
            user_id: profile.user_id.clone(),
            action: UserAction::Evaluated,
            outcome: Some(record.outcome),
            score: record.score,
            notify_attempts: record.notify_attempts,
            detail,
        })
    }

    async fn retry_delivery(
        &self,
        listing: &Listing,
        listing_id: ListingId,
        profile: &PreferenceProfile,
        score: Option<u8>,
        previous_attempts: u32,
    ) -> Result<UserCycleOutcome, StoreError> {
        let term = match (score, evaluate_filters(listing, profile)) {
            (_, FilterDecision::FilteredDeny { term }) => {
                info!(%term, "never-notify match on pending alert; withdrawing it");
                let record = self
                    .store
                    .update_delivery(
                        &profile.user_id,
                        listing_id,
                        Outcome::NotifyAbandoned,
                        previous_attempts,
                    )
                    .await?;
                return Ok(UserCycleOutcome {
                    user_id: profile.user_id.clone(),
                    action: UserAction::DeliveryWithdrawn,
                    outcome: Some(record.outcome),
                    score: record.score,
                    notify_attempts: record.notify_attempts,
                    detail: Some(format!("never-notify term `{term}`")),
                });
            }
            (None, FilterDecision::ForcedNotify { term }) => Some(term),
            _ => None,
        };
        let attempt = previous_attempts + 1;
        let message = render_alert(listing, score, term.as_deref());
        info!(attempt, "retrying pending delivery");

        let (outcome, detail) = match self.deliver(profile, &message).await {
            Ok(()) => (Outcome::Notified, None),
            Err(err) => (self.after_failed_delivery(attempt), Some(err.to_string())),
        };
        let record = self
            .store
            .update_delivery(&profile.user_id, listing_id, outcome, attempt)
            .await?;
        Ok(UserCycleOutcome {
            user_id: profile.user_id.clone(),
            action: UserAction::RetriedDelivery,
            outcome: Some(record.outcome),
            score: record.score,
            notify_attempts: record.notify_attempts,
            detail,
        })
    }

    fn after_failed_delivery(&self, attempts: u32) -> Outcome {
        if attempts >= self.settings.max_notify_attempts {
            Outcome::NotifyAbandoned
        } else {
            Outcome::NotifyPending
        }
    }

    async fn score(
        &self,
        listing: &Listing,
        profile: &PreferenceProfile,
    ) -> Result<u8, AdapterError> {
        match timeout(self.settings.score_timeout, self.scorer.score(listing, profile)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::ScoringUnavailable(format!(
                "timed out after {:?}",
                self.settings.score_timeout
            ))),
        }
    }

    async fn deliver(
        &self,
        profile: &PreferenceProfile,
        message: &RenderedMessage,
    ) -> Result<(), AdapterError> {
        let result = self.send(&profile.contact.email, message).await;
        if let Err(err) = &result {
            warn!(error = %err, "delivery failed");
        }
        result
    }

    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<(), AdapterError> {
        match timeout(
            self.settings.notify_timeout,
            self.notifier.notify(to, &message.subject, &message.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::DeliveryFailed(format!(
                "timed out after {:?}",
                self.settings.notify_timeout
            ))),
        }
    }

    async fn send_error_digest(
        &self,
        run_id: Uuid,
        failures: &[CycleFailure],
        fatal: Option<&str>,
    ) {
        let Some(operator) = &self.settings.operator_email else {
            return;
        };
        let digest = render_error_digest(run_id, failures, fatal);
        match self.send(operator, &digest).await {
            Ok(()) => info!(to = %operator, "error digest sent"),
            Err(err) => warn!(error = %err, "error digest not sent"),
        }
    }
}

fn failure_for(user: &UserCycleOutcome) -> Option<CycleFailure> {
    let kind = match (user.action, user.outcome) {
        (UserAction::AlreadyProcessed | UserAction::DeliveryWithdrawn, _) => return None,
        (UserAction::Errored, _) => FailureKind::Store,
        (_, Some(Outcome::ScoringError)) => FailureKind::Scoring,
        (_, Some(Outcome::NotifyPending | Outcome::NotifyAbandoned)) => FailureKind::Delivery,
        _ => return None,
    };
    Some(CycleFailure {
        kind,
        subject: Some(user.user_id.clone()),
        message: user
            .detail
            .clone()
            .unwrap_or_else(|| format!("{:?}", user.outcome)),
    })
}

async fn write_reports(reports_root: &Path, report: &CycleReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
    fs::write(reports_dir.join("cycle_report.json"), json)
        .await
        .context("writing cycle_report.json")?;

    let brief = format!(
        "# Last Bottle Watch Cycle\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Wine: {} (${:.2})\n- New listing: {}\n- Notified: {}\n- Failures: {}\n\n## Users\n{}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.listing.wine_name,
        report.listing.price,
        if report.new_listing { "yes" } else { "no" },
        report.count(Outcome::Notified),
        report.failures.len(),
        report
            .users
            .iter()
            .map(|u| {
                format!(
                    "- {}: {} ({}{})",
                    u.user_id,
                    u.outcome.map(|o| o.as_str()).unwrap_or("error"),
                    match u.action {
                        UserAction::Evaluated => "evaluated",
                        UserAction::RetriedDelivery => "delivery retried",
                        UserAction::DeliveryWithdrawn => "delivery withdrawn",
                        UserAction::AlreadyProcessed => "already processed",
                        UserAction::Errored => "errored",
                    },
                    u.score.map(|s| format!(", score {s}")).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(reports_dir.join("cycle_brief.md"), brief)
        .await
        .context("writing cycle_brief.md")?;

    Ok(reports_dir)
}

/// Wire the production adapters and the SQLite store from configuration.
pub async fn pipeline_from_config(config: &CycleConfig) -> Result<CyclePipeline<WineDatabase>> {
    let store = WineDatabase::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let gemini = config
        .gemini()
        .ok_or_else(|| anyhow!("GEMINI_API_KEY or GOOGLE_API_KEY must be set"))?;
    let notifier = SmtpNotifier::new(&config.smtp())?;

    Ok(CyclePipeline::new(
        store,
        Box::new(LastBottleScraper::new(http.clone(), config.listing_url.clone())),
        Box::new(GeminiScorer::new(http, gemini)),
        Box::new(notifier),
        config.settings(),
    ))
}

pub async fn run_cycle_once_from_env() -> Result<CycleReport> {
    let config = CycleConfig::from_env();
    let pipeline = pipeline_from_config(&config).await?;
    let report = pipeline.run_once().await;
    pipeline.store().close().await;
    report
}

/// Cron scheduler that runs one cycle per tick, skipping ticks that overlap a running cycle.
pub async fn build_scheduler<S>(
    pipeline: Arc<CyclePipeline<S>>,
    cron: &str,
) -> Result<JobScheduler>
where
    S: ListingStore + ScoreStore + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_exclusive().await {
                None => warn!("previous cycle still running; skipping tick"),
                Some(Ok(report)) => {
                    info!(run_id = %report.run_id, "scheduled cycle finished")
                }
                Some(Err(err)) => {
                    let error = format!("{err:#}");
                    error!(%error, "scheduled cycle failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct FakeScraper {
        listing: Option<Listing>,
    }

    #[async_trait]
    impl ListingScraper for FakeScraper {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn fetch_current(&self) -> Result<Listing, AdapterError> {
            self.listing
                .clone()
                .ok_or_else(|| AdapterError::FetchFailure("storefront down".into()))
        }
    }

    struct HangingScraper;

    #[async_trait]
    impl ListingScraper for HangingScraper {
        fn source_id(&self) -> &'static str {
            "hanging"
        }

        async fn fetch_current(&self) -> Result<Listing, AdapterError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct ScorerState {
        scores: HashMap<String, u8>,
        hanging: StdMutex<HashSet<String>>,
        calls: AtomicUsize,
    }

    struct FakeScorer(Arc<ScorerState>);

    #[async_trait]
    impl Scorer for FakeScorer {
        async fn score(
            &self,
            _listing: &Listing,
            profile: &PreferenceProfile,
        ) -> Result<u8, AdapterError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            let hang = self.0.hanging.lock().unwrap().contains(&profile.user_id);
            if hang {
                std::future::pending::<()>().await;
            }
            self.0
                .scores
                .get(&profile.user_id)
                .copied()
                .ok_or_else(|| AdapterError::ScoringUnavailable("model overloaded".into()))
        }
    }

    #[derive(Default)]
    struct NotifierState {
        sent: StdMutex<Vec<(String, String)>>,
        failing: StdMutex<HashSet<String>>,
        hanging: StdMutex<HashSet<String>>,
    }

    impl NotifierState {
        fn sent_to(&self, to: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(addr, _)| addr == to)
                .map(|(_, subject)| subject.clone())
                .collect()
        }

        fn set_failing(&self, to: &str, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(to.to_string());
            } else {
                set.remove(to);
            }
        }
    }

    struct FakeNotifier(Arc<NotifierState>);

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, to: &str, subject: &str, _body: &str) -> Result<(), AdapterError> {
            let hang = self.0.hanging.lock().unwrap().contains(to);
            if hang {
                std::future::pending::<()>().await;
            }
            if self.0.failing.lock().unwrap().contains(to) {
                return Err(AdapterError::DeliveryFailed("connection refused".into()));
            }
            self.0
                .sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    struct Harness {
        pipeline: CyclePipeline<WineDatabase>,
        scorer: Arc<ScorerState>,
        notifier: Arc<NotifierState>,
        profiles: TempDir,
    }

    fn profile_yaml(user: &str, threshold: u8, extra: &str) -> String {
        format!(
            "profile: Loves structured reds and crisp whites\n\
             types: [red, white]\n\
             price_range: [20, 100]\n\
             notify_threshold: {threshold}\n\
             contact:\n  email: {user}@example.com\n{extra}"
        )
    }

    fn wine(name: &str, price: f64, wine_type: &str) -> Listing {
        Listing::new(
            name,
            price,
            Some(wine_type.to_string()),
            "https://lastbottlewines.com/",
            Utc::now(),
        )
    }

    fn test_settings(profiles_dir: &Path) -> CycleSettings {
        CycleSettings {
            profiles_dir: profiles_dir.to_path_buf(),
            reports_dir: None,
            fetch_timeout: Duration::from_secs(5),
            score_timeout: Duration::from_secs(5),
            notify_timeout: Duration::from_secs(5),
            max_notify_attempts: 3,
            operator_email: None,
        }
    }

    async fn harness(
        listing: Option<Listing>,
        profiles: &[(&str, String)],
        scores: &[(&str, u8)],
        tweak: impl FnOnce(&mut CycleSettings),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        for (user, yaml) in profiles {
            std::fs::write(dir.path().join(format!("{user}.yaml")), yaml).unwrap();
        }
        let scorer = Arc::new(ScorerState {
            scores: scores.iter().map(|(u, s)| (u.to_string(), *s)).collect(),
            ..Default::default()
        });
        let notifier = Arc::new(NotifierState::default());
        let mut settings = test_settings(dir.path());
        tweak(&mut settings);

        let pipeline = CyclePipeline::new(
            WineDatabase::in_memory().await.unwrap(),
            Box::new(FakeScraper { listing }),
            Box::new(FakeScorer(Arc::clone(&scorer))),
            Box::new(FakeNotifier(Arc::clone(&notifier))),
            settings,
        );
        Harness {
            pipeline,
            scorer,
            notifier,
            profiles: dir,
        }
    }

    fn user<'a>(report: &'a CycleReport, user_id: &str) -> &'a UserCycleOutcome {
        report
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .unwrap()
    }

    #[tokio::test]
    async fn second_cycle_neither_rescores_nor_renotifies() {
        let h = harness(
            Some(wine("2019 Ridge Monte Bello", 95.0, "red")),
            &[("alice", profile_yaml("alice", 80, ""))],
            &[("alice", 90)],
            |_| {},
        )
        .await;

        let first = h.pipeline.run_once().await.unwrap();
        assert!(first.new_listing);
        assert_eq!(user(&first, "alice").outcome, Some(Outcome::Notified));

        let second = h.pipeline.run_once().await.unwrap();
        assert!(!second.new_listing);
        assert_eq!(second.listing_id, first.listing_id);
        assert_eq!(user(&second, "alice").action, UserAction::AlreadyProcessed);

        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.sent_to("alice@example.com").len(), 1);
        let records = h
            .pipeline
            .store()
            .scores_for_listing(first.listing_id)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].score, Some(90));
    }

    #[tokio::test]
    async fn never_notify_beats_always_notify() {
        let extra = "always_notify_for: [Opus One]\nnever_notify_for: [Yellow Tail]\n";
        let h = harness(
            Some(wine("Opus One x Yellow Tail Cuvee", 50.0, "red")),
            &[("alice", profile_yaml("alice", 80, extra))],
            &[("alice", 99)],
            |_| {},
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&report, "alice").outcome, Some(Outcome::FilteredDeny));
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
        assert!(h.notifier.sent_to("alice@example.com").is_empty());
    }

    #[tokio::test]
    async fn always_notify_skips_scorer_and_price_filter() {
        let h = harness(
            Some(wine("2018 Opus One", 450.0, "red")),
            &[(
                "alice",
                profile_yaml("alice", 80, "always_notify_for: [opus one]\n"),
            )],
            &[("alice", 0)],
            |_| {},
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.outcome, Some(Outcome::Notified));
        assert_eq!(alice.score, None);
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.notifier.sent_to("alice@example.com"),
            vec!["Last Bottle Alert: 2018 Opus One — Always-notify match".to_string()]
        );
    }

    #[tokio::test]
    async fn type_override_filters_expensive_red_before_scoring() {
        let h = harness(
            Some(wine("2019 Napa Cabernet Sauvignon", 80.0, "red")),
            &[(
                "alice",
                profile_yaml("alice", 50, "type_specific_price_ranges:\n  red: [20, 60]\n"),
            )],
            &[("alice", 99)],
            |_| {},
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&report, "alice").outcome, Some(Outcome::FilteredPrice));
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let h = harness(
            Some(wine("2020 Cakebread Chardonnay", 55.0, "white")),
            &[
                ("alice", profile_yaml("alice", 85, "")),
                ("bob", profile_yaml("bob", 86, "")),
            ],
            &[("alice", 85), ("bob", 85)],
            |_| {},
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&report, "alice").outcome, Some(Outcome::Notified));
        let bob = user(&report, "bob");
        assert_eq!(bob.outcome, Some(Outcome::Suppressed));
        assert_eq!(bob.score, Some(85));
        assert!(h.notifier.sent_to("bob@example.com").is_empty());
    }

    #[tokio::test]
    async fn one_users_scoring_failure_does_not_affect_others() {
        let h = harness(
            Some(wine("2019 Ridge Lytton Springs", 45.0, "red")),
            &[
                ("alice", profile_yaml("alice", 70, "")),
                ("bob", profile_yaml("bob", 70, "")),
                ("carol", profile_yaml("carol", 70, "")),
            ],
            &[("alice", 88), ("carol", 75)],
            |_| {},
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&report, "alice").outcome, Some(Outcome::Notified));
        assert_eq!(user(&report, "bob").outcome, Some(Outcome::ScoringError));
        assert_eq!(user(&report, "carol").outcome, Some(Outcome::Notified));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Scoring);
        assert_eq!(report.failures[0].subject.as_deref(), Some("bob"));

        // scoring errors are terminal
        let again = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&again, "bob").action, UserAction::AlreadyProcessed);
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_until_the_cap() {
        let h = harness(
            Some(wine("2016 Produttori Barbaresco", 49.0, "red")),
            &[("alice", profile_yaml("alice", 70, ""))],
            &[("alice", 92)],
            |_| {},
        )
        .await;
        h.notifier.set_failing("alice@example.com", true);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let report = h.pipeline.run_once().await.unwrap();
            let alice = user(&report, "alice");
            seen.push((alice.action, alice.outcome, alice.notify_attempts));
        }
        assert_eq!(
            seen,
            vec![
                (UserAction::Evaluated, Some(Outcome::NotifyPending), 1),
                (UserAction::RetriedDelivery, Some(Outcome::NotifyPending), 2),
                (UserAction::RetriedDelivery, Some(Outcome::NotifyAbandoned), 3),
                (UserAction::AlreadyProcessed, Some(Outcome::NotifyAbandoned), 3),
            ]
        );
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_delivers_with_the_stored_score() {
        let h = harness(
            Some(wine("2016 Produttori Barbaresco", 49.0, "red")),
            &[("alice", profile_yaml("alice", 70, ""))],
            &[("alice", 92)],
            |_| {},
        )
        .await;
        h.notifier.set_failing("alice@example.com", true);
        h.pipeline.run_once().await.unwrap();

        h.notifier.set_failing("alice@example.com", false);
        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.outcome, Some(Outcome::Notified));
        assert_eq!(alice.score, Some(92));
        assert_eq!(alice.notify_attempts, 2);
        assert_eq!(
            h.notifier.sent_to("alice@example.com"),
            vec!["Last Bottle Alert: 2016 Produttori Barbaresco — Score 92".to_string()]
        );
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_always_notify_alert_is_retried_without_scoring() {
        let h = harness(
            Some(wine("2018 Opus One", 450.0, "red")),
            &[(
                "alice",
                profile_yaml("alice", 80, "always_notify_for: [opus one]\n"),
            )],
            &[],
            |_| {},
        )
        .await;
        h.notifier.set_failing("alice@example.com", true);
        let first = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&first, "alice").outcome, Some(Outcome::NotifyPending));

        h.notifier.set_failing("alice@example.com", false);
        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.action, UserAction::RetriedDelivery);
        assert_eq!(alice.outcome, Some(Outcome::Notified));
        assert_eq!(alice.score, None);
        assert_eq!(
            h.notifier.sent_to("alice@example.com"),
            vec!["Last Bottle Alert: 2018 Opus One — Always-notify match".to_string()]
        );
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_alert_is_withdrawn_once_the_wine_is_denied() {
        let h = harness(
            Some(wine("2016 Produttori Barbaresco", 49.0, "red")),
            &[("alice", profile_yaml("alice", 70, ""))],
            &[("alice", 92)],
            |_| {},
        )
        .await;
        h.notifier.set_failing("alice@example.com", true);
        h.pipeline.run_once().await.unwrap();

        h.notifier.set_failing("alice@example.com", false);
        std::fs::write(
            h.profiles.path().join("alice.yaml"),
            profile_yaml("alice", 70, "never_notify_for: [barbaresco]\n"),
        )
        .unwrap();
        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.action, UserAction::DeliveryWithdrawn);
        assert_eq!(alice.outcome, Some(Outcome::NotifyAbandoned));
        assert_eq!(alice.notify_attempts, 1);
        assert!(report.failures.is_empty());
        assert!(h.notifier.sent_to("alice@example.com").is_empty());

        let again = h.pipeline.run_once().await.unwrap();
        assert_eq!(user(&again, "alice").action, UserAction::AlreadyProcessed);
        assert!(h.notifier.sent_to("alice@example.com").is_empty());
    }

    #[tokio::test]
    async fn hung_scorer_times_out_for_that_user_only() {
        let h = harness(
            Some(wine("2019 Ridge Lytton Springs", 45.0, "red")),
            &[
                ("alice", profile_yaml("alice", 70, "")),
                ("bob", profile_yaml("bob", 70, "")),
            ],
            &[("alice", 88), ("bob", 90)],
            |s| s.score_timeout = Duration::from_millis(20),
        )
        .await;
        h.scorer.hanging.lock().unwrap().insert("alice".into());

        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.outcome, Some(Outcome::ScoringError));
        assert!(alice.detail.as_deref().unwrap().contains("timed out"));
        assert_eq!(user(&report, "bob").outcome, Some(Outcome::Notified));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Scoring);
    }

    #[tokio::test]
    async fn hung_notifier_leaves_delivery_pending() {
        let h = harness(
            Some(wine("2019 Ridge Lytton Springs", 45.0, "red")),
            &[("alice", profile_yaml("alice", 70, ""))],
            &[("alice", 88)],
            |s| s.notify_timeout = Duration::from_millis(20),
        )
        .await;
        h.notifier
            .hanging
            .lock()
            .unwrap()
            .insert("alice@example.com".into());

        let report = h.pipeline.run_once().await.unwrap();
        let alice = user(&report, "alice");
        assert_eq!(alice.outcome, Some(Outcome::NotifyPending));
        assert_eq!(alice.score, Some(88));
        assert_eq!(alice.notify_attempts, 1);
        assert!(alice.detail.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn hung_scraper_aborts_the_cycle_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.yaml"), profile_yaml("alice", 70, "")).unwrap();
        let scorer = Arc::new(ScorerState::default());
        let mut settings = test_settings(dir.path());
        settings.fetch_timeout = Duration::from_millis(20);
        let pipeline = CyclePipeline::new(
            WineDatabase::in_memory().await.unwrap(),
            Box::new(HangingScraper),
            Box::new(FakeScorer(Arc::clone(&scorer))),
            Box::new(FakeNotifier(Arc::new(NotifierState::default()))),
            settings,
        );

        let err = pipeline.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
        assert!(pipeline.store().latest_listing().await.unwrap().is_none());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_the_store_untouched() {
        let h = harness(
            None,
            &[("alice", profile_yaml("alice", 70, ""))],
            &[("alice", 92)],
            |_| {},
        )
        .await;

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("storefront down"));
        assert!(h.pipeline.store().latest_listing().await.unwrap().is_none());
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_profiles_directory_aborts_before_any_write() {
        let h = harness(
            Some(wine("2019 Ridge Monte Bello", 95.0, "red")),
            &[],
            &[],
            |s| s.profiles_dir = s.profiles_dir.join("missing"),
        )
        .await;

        assert!(h.pipeline.run_once().await.is_err());
        assert!(h.pipeline.store().latest_listing().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn operator_receives_digest_of_failures() {
        let h = harness(
            Some(wine("2019 Ridge Lytton Springs", 45.0, "red")),
            &[
                ("alice", profile_yaml("alice", 70, "")),
                ("bob", profile_yaml("bob", 70, "")),
            ],
            &[("alice", 88)],
            |s| s.operator_email = Some("ops@example.com".into()),
        )
        .await;

        h.pipeline.run_once().await.unwrap();
        let digests = h.notifier.sent_to("ops@example.com");
        assert_eq!(digests.len(), 1);
        assert!(digests[0].contains("1 error in run"));
    }

    #[tokio::test]
    async fn reports_are_written_per_run() {
        let reports = tempfile::tempdir().unwrap();
        let reports_root = reports.path().to_path_buf();
        let h = harness(
            Some(wine("2019 Ridge Monte Bello", 95.0, "red")),
            &[("alice", profile_yaml("alice", 80, ""))],
            &[("alice", 90)],
            move |s| s.reports_dir = Some(reports_root),
        )
        .await;

        let report = h.pipeline.run_once().await.unwrap();
        let dir = reports.path().join(report.run_id.to_string());
        assert_eq!(report.reports_dir, Some(dir.display().to_string()));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("cycle_report.json")).unwrap())
                .unwrap();
        assert_eq!(json["users"][0]["outcome"], "notified");
        let brief = std::fs::read_to_string(dir.join("cycle_brief.md")).unwrap();
        assert!(brief.contains("- alice: notified (evaluated, score 90)"));
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let h = harness(
            Some(wine("2019 Ridge Monte Bello", 95.0, "red")),
            &[("alice", profile_yaml("alice", 80, ""))],
            &[("alice", 90)],
            |_| {},
        )
        .await;

        let held = h.pipeline.cycle_lock.lock().await;
        assert!(h.pipeline.run_exclusive().await.is_none());
        drop(held);
        assert!(h.pipeline.run_exclusive().await.unwrap().is_ok());
    }
}
