//! Matching pipeline
//!
//! Processes one query image against a candidate set:
//! 1. EXTRACTING: decode/prepare the query and get its descriptor set for
//!    every enabled detector (cache-backed, computed once)
//! 2. COMPARING: compare against every candidate, up to `max_workers`
//!    candidates at a time; candidate descriptors and per-detector results
//!    are cache-backed as well
//! 3. RANKED: fuse, sort and truncate to the preset's result batch
//!
//! Failure policy:
//! - query image undecodable, or no detector could describe it → item FAILED
//! - one detector failing on a pair → zero contribution for that detector
//! - candidate unusable (fetch/decode/cache failure, cache-only miss) →
//!   candidate skipped, item unaffected

pub mod candidates;

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};

use crate::cache::fingerprint::{
    comparison_key, content_fingerprint, descriptor_key, url_fingerprint,
};
use crate::cache::{decode, encode, CacheError, FeatureCache};
use crate::detectors::image_prep::{self, PrepareOptions, PreparedImage};
use crate::detectors::{DescriptorSet, Detector, DetectorError, DetectorKind, DetectorRegistry, DetectorStats};
use crate::fusion::fuse;
use crate::models::{Candidate, ConfigPreset, ItemOutcome, ItemStage, MatchResult, SkippedCandidate};
pub use candidates::{
    CandidateSource, FetchError, HttpImageFetcher, ImageFetcher, InlineCandidateSource,
};

/// Failure inside one pipeline step
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("{0}")]
    Candidate(String),

    #[error("Worker failure: {0}")]
    Worker(String),
}

/// A query image and its content fingerprint
#[derive(Debug, Clone)]
pub struct QueryImage {
    pub fingerprint: String,
    pub bytes: Arc<Vec<u8>>,
}

impl QueryImage {
    pub fn new(bytes: Arc<Vec<u8>>) -> Self {
        Self {
            fingerprint: content_fingerprint(&bytes),
            bytes,
        }
    }
}

struct QueryFeatures {
    fingerprint: String,
    descriptors: BTreeMap<DetectorKind, Arc<DescriptorSet>>,
}

/// Run CPU-bound work on the blocking pool, holding one worker permit
async fn run_blocking<T, F>(cpu: &Semaphore, f: F) -> Result<T, StepError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let _permit = cpu
        .acquire()
        .await
        .map_err(|_| StepError::Worker("worker pool closed".to_string()))?;
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StepError::Worker(e.to_string()))
}

fn candidate_fingerprint(candidate: &Candidate) -> Option<String> {
    match (&candidate.image, &candidate.url) {
        (Some(bytes), _) => Some(content_fingerprint(bytes)),
        (None, Some(url)) => Some(url_fingerprint(url)),
        (None, None) => None,
    }
}

pub struct MatchingPipeline {
    registry: Arc<DetectorRegistry>,
    cache: Arc<FeatureCache>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl MatchingPipeline {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        cache: Arc<FeatureCache>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            registry,
            cache,
            fetcher,
        }
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// Match one query image against `candidates`
    ///
    /// Never fails: problems are recorded in the returned outcome. `cpu`
    /// bounds concurrent CPU-bound work; `on_stage` observes stage changes.
    pub async fn process_item<F>(
        &self,
        query: &QueryImage,
        preset: &ConfigPreset,
        candidates: &[Candidate],
        cpu: &Semaphore,
        mut on_stage: F,
    ) -> ItemOutcome
    where
        F: FnMut(ItemStage) + Send,
    {
        on_stage(ItemStage::Extracting);
        let prep = preset.prepare_options();

        let bytes = query.bytes.clone();
        let prepared = match run_blocking(cpu, move || {
            image_prep::decode(&bytes).map(|image| image_prep::prepare(&image, prep))
        })
        .await
        {
            Ok(Ok(prepared)) => Arc::new(prepared),
            Ok(Err(e)) => return ItemOutcome::failed(format!("Query image unusable: {}", e)),
            Err(e) => return ItemOutcome::failed(e.to_string()),
        };

        let features = self.extract_query(query, &prepared, preset, cpu).await;
        if features.descriptors.is_empty() {
            return ItemOutcome::failed("No enabled detector could extract query features");
        }

        on_stage(ItemStage::Comparing);
        // Futures are built up front so the stream holds no borrowing closure
        let comparisons: Vec<_> = candidates
            .iter()
            .map(|candidate| self.compare_candidate(candidate, &features, preset, cpu))
            .collect();
        let results: Vec<Result<MatchResult, SkippedCandidate>> = stream::iter(comparisons)
            .buffer_unordered(preset.max_workers.max(1))
            .collect()
            .await;

        on_stage(ItemStage::Ranked);
        let mut matches = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for result in results {
            match result {
                Ok(m) => matches.push(m),
                Err(s) => skipped.push(s),
            }
        }
        ItemOutcome::ranked(matches, skipped, preset.result_batch)
    }

    async fn extract_query(
        &self,
        query: &QueryImage,
        prepared: &Arc<PreparedImage>,
        preset: &ConfigPreset,
        cpu: &Semaphore,
    ) -> QueryFeatures {
        let prep = preset.prepare_options();
        let mut descriptors = BTreeMap::new();

        for kind in preset.enabled_detectors() {
            let Some(detector) = self.registry.get(kind) else {
                tracing::warn!(detector = %kind, "{}", DetectorError::Unavailable(kind));
                continue;
            };

            let key = descriptor_key(kind, &prep, &query.fingerprint);
            let extracted = self
                .cache
                .get_or_compute(&key, || async {
                    let image = prepared.clone();
                    let set = run_blocking(cpu, move || detector.extract(&image)).await??;
                    Ok::<_, StepError>(encode(&set)?)
                })
                .await
                .and_then(|bytes| Ok(decode::<DescriptorSet>(&bytes)?));

            match extracted {
                Ok(set) => {
                    descriptors.insert(kind, Arc::new(set));
                }
                Err(e) => {
                    tracing::warn!(
                        detector = %kind,
                        fingerprint = %query.fingerprint,
                        error = %e,
                        "Query extraction failed; detector excluded for this image"
                    );
                }
            }
        }

        QueryFeatures {
            fingerprint: query.fingerprint.clone(),
            descriptors,
        }
    }

    async fn compare_candidate(
        &self,
        candidate: &Candidate,
        query: &QueryFeatures,
        preset: &ConfigPreset,
        cpu: &Semaphore,
    ) -> Result<MatchResult, SkippedCandidate> {
        let skip = |reason: String| {
            tracing::warn!(candidate_id = %candidate.id, reason = %reason, "Candidate skipped");
            SkippedCandidate {
                candidate_id: candidate.id.clone(),
                reason,
            }
        };

        let Some(candidate_fp) = candidate_fingerprint(candidate) else {
            return Err(skip("Candidate has neither image bytes nor url".to_string()));
        };

        let loaded: OnceCell<Arc<PreparedImage>> = OnceCell::new();
        let mut ran = BTreeMap::new();
        let mut breakdown = BTreeMap::new();
        let mut failed_detectors = Vec::new();

        for kind in preset.enabled_detectors() {
            let (Some(detector), Some(query_set)) =
                (self.registry.get(kind), query.descriptors.get(&kind))
            else {
                failed_detectors.push(kind);
                breakdown.insert(kind, DetectorStats::zero());
                continue;
            };

            let pair = PairContext {
                kind,
                detector,
                query_set: query_set.clone(),
                query_fp: &query.fingerprint,
                candidate,
                candidate_fp: &candidate_fp,
                loaded: &loaded,
            };
            match self.compare_pair(pair, preset, cpu).await {
                Ok(stats) if stats.similarity.is_finite() => {
                    ran.insert(kind, stats);
                    breakdown.insert(kind, stats);
                }
                Ok(_) => {
                    tracing::warn!(
                        detector = %kind,
                        candidate_id = %candidate.id,
                        "Detector returned a non-finite similarity; recorded as zero contribution"
                    );
                    failed_detectors.push(kind);
                    breakdown.insert(kind, DetectorStats::zero());
                }
                Err(StepError::Detector(e)) => {
                    tracing::warn!(
                        detector = %kind,
                        candidate_id = %candidate.id,
                        error = %e,
                        "Detector failed; recorded as zero contribution"
                    );
                    failed_detectors.push(kind);
                    breakdown.insert(kind, DetectorStats::zero());
                }
                Err(e) => return Err(skip(e.to_string())),
            }
        }

        let score = fuse(&ran, &preset.feature_weights, preset.similarity_threshold);
        Ok(MatchResult {
            candidate_id: candidate.id.clone(),
            url: candidate.url.clone(),
            similarity: score.overall,
            meets_threshold: score.meets_threshold,
            comparable: score.comparable,
            breakdown,
            failed_detectors,
        })
    }

    /// Comparison stats for one detector, through the `cmp` cache namespace
    async fn compare_pair(
        &self,
        pair: PairContext<'_>,
        preset: &ConfigPreset,
        cpu: &Semaphore,
    ) -> Result<DetectorStats, StepError> {
        let prep = preset.prepare_options();
        let advanced = preset.options.use_advanced_matching;
        let cache_only = preset.options.cache_only;
        let cmp_key = comparison_key(pair.kind, &prep, advanced, pair.query_fp, pair.candidate_fp);
        let desc_key = descriptor_key(pair.kind, &prep, pair.candidate_fp);

        let stats = self
            .cache
            .get_or_compute(&cmp_key, || async {
                let candidate_desc = if cache_only {
                    self.cache
                        .get_existing(&desc_key)
                        .await?
                        .ok_or_else(|| CacheError::Miss(desc_key.clone()))?
                } else {
                    self.cache
                        .get_or_compute(&desc_key, || async {
                            let image = pair
                                .loaded
                                .get_or_try_init(|| self.load_candidate(pair.candidate, prep, cpu))
                                .await?
                                .clone();
                            let detector = pair.detector.clone();
                            let set = run_blocking(cpu, move || detector.extract(&image)).await??;
                            Ok::<_, StepError>(encode(&set)?)
                        })
                        .await?
                };

                let candidate_set: DescriptorSet = decode(&candidate_desc)?;
                let detector = pair.detector.clone();
                let query_set = pair.query_set.clone();
                let stats = run_blocking(cpu, move || {
                    detector.compare(&query_set, &candidate_set, advanced)
                })
                .await??;
                Ok::<_, StepError>(encode(&stats)?)
            })
            .await?;

        Ok(decode(&stats)?)
    }

    async fn load_candidate(
        &self,
        candidate: &Candidate,
        prep: PrepareOptions,
        cpu: &Semaphore,
    ) -> Result<Arc<PreparedImage>, StepError> {
        let bytes = match (&candidate.image, &candidate.url) {
            (Some(bytes), _) => bytes.clone(),
            (None, Some(url)) => self
                .fetcher
                .fetch(url)
                .await
                .map_err(|e| StepError::Candidate(e.to_string()))?,
            (None, None) => {
                return Err(StepError::Candidate(
                    "Candidate has neither image bytes nor url".to_string(),
                ))
            }
        };

        let prepared = run_blocking(cpu, move || {
            image_prep::decode(&bytes).map(|image| image_prep::prepare(&image, prep))
        })
        .await?
        .map_err(|e| StepError::Candidate(format!("Candidate image unusable: {}", e)))?;
        Ok(Arc::new(prepared))
    }
}

/// Everything needed to compare one candidate under one detector
struct PairContext<'a> {
    kind: DetectorKind,
    detector: Arc<dyn Detector>,
    query_set: Arc<DescriptorSet>,
    query_fp: &'a str,
    candidate: &'a Candidate,
    candidate_fp: &'a str,
    loaded: &'a OnceCell<Arc<PreparedImage>>,
}
