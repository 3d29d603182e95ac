use std::sync::{Mutex, PoisonError};

use super::EngineResource;

#[derive(Default)]
struct State {
    is_recycling: bool,
    pending: Vec<EngineResource>,
}

/// Recycles resources, deferring recycles that are triggered while another recycle is
/// in progress.
///
/// Recycling a resource may release child resources, which would otherwise re-enter the
/// recycler. Deferred resources are recycled by the outermost call once it is done.
#[derive(Default)]
pub struct ResourceRecycler {
    state: Mutex<State>,
}

impl ResourceRecycler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recycle(&self, resource: EngineResource) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_recycling {
                state.pending.push(resource);
                return;
            }
            state.is_recycling = true;
        }

        let mut next = Some(resource);
        while let Some(resource) = next {
            if let Err(error) = resource.recycle() {
                tracing::warn!(
                    key = %resource.key(),
                    error = &error as &dyn std::error::Error,
                    "failed to recycle resource"
                );
            }

            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            next = state.pending.pop();
            if next.is_none() {
                state.is_recycling = false;
            }
        }
    }
}
