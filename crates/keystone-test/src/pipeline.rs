//! In-memory [`PipelineFactory`].

use crate::next_handle;
use ash::vk;
use ash::vk::Handle;
use hashbrown::HashMap;
use keystone_gpu::{DynamicInfo, DynamicState, PipelineCreateInfo, PipelineFactory, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// What a mock pipeline was created from.
#[derive(Debug, Clone)]
pub struct CreatedPipeline {
    pub dynamic: DynamicInfo,
    pub dynamic_states: Vec<DynamicState>,
    pub base: Option<vk::Pipeline>,
}

#[derive(Default)]
struct State {
    live: HashMap<vk::Pipeline, CreatedPipeline>,
    destroyed: Vec<vk::Pipeline>,
    creations: usize,
}

/// A [`PipelineFactory`] that remembers the merged info of every pipeline.
#[derive(Default)]
pub struct MockPipelineFactory {
    state: Mutex<State>,
}

impl MockPipelineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The creation parameters of a live pipeline.
    pub fn created(&self, pipeline: vk::Pipeline) -> Option<CreatedPipeline> {
        self.state.lock().live.get(&pipeline).cloned()
    }

    /// Total pipelines ever created.
    pub fn creation_count(&self) -> usize {
        self.state.lock().creations
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn destroyed(&self) -> Vec<vk::Pipeline> {
        self.state.lock().destroyed.clone()
    }
}

impl PipelineFactory for MockPipelineFactory {
    unsafe fn create_graphics_pipeline(
        &self,
        info: &PipelineCreateInfo,
        base: Option<vk::Pipeline>,
    ) -> Result<vk::Pipeline> {
        let pipeline = vk::Pipeline::from_raw(next_handle());
        let mut state = self.state.lock();
        state.creations += 1;
        state.live.insert(
            pipeline,
            CreatedPipeline {
                dynamic: info.dynamic.clone(),
                dynamic_states: info.dynamic_states.clone(),
                base,
            },
        );
        Ok(pipeline)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        state.live.remove(&pipeline);
        state.destroyed.push(pipeline);
    }
}

impl std::fmt::Debug for MockPipelineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockPipelineFactory")
            .field("live", &state.live.len())
            .field("creations", &state.creations)
            .finish()
    }
}
