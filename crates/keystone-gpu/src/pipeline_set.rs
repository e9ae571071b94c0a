//! Pipeline variants derived from one base pipeline.
//!
//! A [`PipelineSet`] owns a base pipeline plus every variant created from it by substituting
//! some of its [`DynamicState`] fields. Variants are cached, so equal requests always return the
//! same pipeline. Small variable sets are matched by linear scan; larger ones are hashed.

use crate::error::Result;
use crate::pipeline::{DynamicInfo, DynamicState, PipelineCreateInfo, PipelineFactory};
use ash::vk;
use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

/// Variable field count above which variants are looked up by hash.
pub const HASHING_THRESHOLD: usize = 5;

/// How a [`PipelineSet`] looks up its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Linear scan comparing every variable field.
    Matched,
    /// Hash of the variable fields, then comparison within the bucket.
    Hashed,
}

type Variant = (DynamicInfo, vk::Pipeline);

enum VariantCache {
    Matched(Mutex<Vec<Variant>>),
    Hashed {
        buckets: Mutex<HashMap<u64, Vec<Variant>>>,
        hasher: DefaultHashBuilder,
    },
}

fn fold_hash(hasher: &DefaultHashBuilder, variable: &[DynamicState], info: &DynamicInfo) -> u64 {
    let mut state = hasher.build_hasher();
    for field in variable {
        field.hash_into(info, &mut state);
    }
    state.finish()
}

fn find(
    variants: &[Variant],
    variable: &[DynamicState],
    request: &DynamicInfo,
) -> Option<vk::Pipeline> {
    variants
        .iter()
        .find(|(info, _)| variable.iter().all(|field| field.matches(info, request)))
        .map(|(_, pipeline)| *pipeline)
}

/// A base pipeline and its cached variants.
pub struct PipelineSet {
    factory: Arc<dyn PipelineFactory>,
    info: PipelineCreateInfo,
    base: vk::Pipeline,
    variable: Vec<DynamicState>,
    native: Vec<DynamicState>,
    cache: VariantCache,
}

impl PipelineSet {
    /// Create the base pipeline and prepare to derive variants over `variable_states`.
    ///
    /// States that `info` already makes natively dynamic need no variants and are dropped from
    /// the variable set. Fields not in the variable set always keep the base value.
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        info: PipelineCreateInfo,
        variable_states: &[DynamicState],
    ) -> Result<Self> {
        // SAFETY: the pipeline is destroyed when the set is dropped.
        let base = unsafe { factory.create_graphics_pipeline(&info, None) }?;

        let mut native = info.dynamic_states.clone();
        native.sort_unstable();
        native.dedup();

        let mut variable: Vec<DynamicState> = variable_states
            .iter()
            .copied()
            .filter(|state| !native.contains(state))
            .collect();
        variable.sort_unstable();
        variable.dedup();

        let seed = (info.dynamic.clone(), base);
        let cache = if variable.len() > HASHING_THRESHOLD {
            let hasher = DefaultHashBuilder::default();
            let mut buckets = HashMap::new();
            buckets.insert(fold_hash(&hasher, &variable, &seed.0), vec![seed]);
            VariantCache::Hashed {
                buckets: Mutex::new(buckets),
                hasher,
            }
        } else {
            VariantCache::Matched(Mutex::new(vec![seed]))
        };

        tracing::debug!(
            variable = variable.len(),
            native = native.len(),
            "Created pipeline set"
        );

        Ok(Self {
            factory,
            info,
            base,
            variable,
            native,
            cache,
        })
    }

    /// The pipeline whose variable fields equal those of `request`.
    ///
    /// Creates and caches the variant on first use.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn pipeline(&self, request: &DynamicInfo) -> Result<vk::Pipeline> {
        match &self.cache {
            VariantCache::Matched(variants) => {
                let mut variants = variants.lock();
                if let Some(pipeline) = find(&variants, &self.variable, request) {
                    return Ok(pipeline);
                }
                let variant = self.derive(request)?;
                let pipeline = variant.1;
                variants.push(variant);
                Ok(pipeline)
            }
            VariantCache::Hashed { buckets, hasher } => {
                let key = fold_hash(hasher, &self.variable, request);
                let mut buckets = buckets.lock();
                let bucket = buckets.entry(key).or_default();
                if let Some(pipeline) = find(bucket, &self.variable, request) {
                    return Ok(pipeline);
                }
                let variant = self.derive(request)?;
                let pipeline = variant.1;
                bucket.push(variant);
                Ok(pipeline)
            }
        }
    }

    fn derive(&self, request: &DynamicInfo) -> Result<Variant> {
        let mut info = self.info.clone();
        for field in &self.variable {
            field.apply(&mut info.dynamic, request);
        }

        // SAFETY: derived pipelines are destroyed together with the base when the set is dropped.
        let pipeline = unsafe { self.factory.create_graphics_pipeline(&info, Some(self.base)) }?;
        tracing::trace!(?pipeline, "Derived pipeline variant");
        Ok((info.dynamic, pipeline))
    }

    /// Number of cached pipelines, the base included.
    pub fn variant_count(&self) -> usize {
        match &self.cache {
            VariantCache::Matched(variants) => variants.lock().len(),
            VariantCache::Hashed { buckets, .. } => buckets.lock().values().map(Vec::len).sum(),
        }
    }

    /// The states that select between variants.
    pub fn variable_states(&self) -> &[DynamicState] {
        &self.variable
    }

    /// The states set at record time rather than baked in.
    pub fn native_dynamic_states(&self) -> &[DynamicState] {
        &self.native
    }

    pub fn base_pipeline(&self) -> vk::Pipeline {
        self.base
    }

    pub fn create_info(&self) -> &PipelineCreateInfo {
        &self.info
    }

    pub fn strategy(&self) -> CacheStrategy {
        match self.cache {
            VariantCache::Matched(_) => CacheStrategy::Matched,
            VariantCache::Hashed { .. } => CacheStrategy::Hashed,
        }
    }
}

impl Drop for PipelineSet {
    fn drop(&mut self) {
        // The base pipeline is the cache's seed entry, so this destroys it exactly once.
        let pipelines: Vec<vk::Pipeline> = match &mut self.cache {
            VariantCache::Matched(variants) => variants.get_mut().iter().map(|v| v.1).collect(),
            VariantCache::Hashed { buckets, .. } => buckets
                .get_mut()
                .values()
                .flatten()
                .map(|v| v.1)
                .collect(),
        };

        for pipeline in pipelines {
            // SAFETY: owners drop the set only once no command buffer uses its pipelines.
            unsafe { self.factory.destroy_pipeline(pipeline) };
        }
    }
}

impl std::fmt::Debug for PipelineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSet")
            .field("base", &self.base)
            .field("variable", &self.variable)
            .field("strategy", &self.strategy())
            .finish_non_exhaustive()
    }
}
