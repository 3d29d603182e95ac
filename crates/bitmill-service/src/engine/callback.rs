use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;

use crate::error::LoadError;
use crate::resource::EngineResource;
use crate::types::DataSource;

/// Receives the outcome of a load started with [`Engine::load`](super::Engine::load).
///
/// Exactly one of the methods is called per load, unless the load is cancelled first.
pub trait ResourceCallback: Send + Sync {
    /// The resource is acquired once on behalf of the callback, which must eventually
    /// [`release`](EngineResource::release) it.
    fn on_resource_ready(
        &self,
        resource: EngineResource,
        data_source: DataSource,
        is_loaded_from_alternate_cache_key: bool,
    );

    /// All callbacks waiting for the same load receive the same error.
    fn on_load_failed(&self, error: Arc<LoadError>);
}

/// A successfully loaded resource, together with where it came from.
#[derive(Debug)]
pub struct Loaded {
    pub resource: EngineResource,
    pub data_source: DataSource,
    pub is_loaded_from_alternate_cache_key: bool,
}

pub type LoadResult = Result<Loaded, Arc<LoadError>>;

/// Forwards the outcome of a load into a oneshot channel.
pub struct ChannelCallback {
    sender: Mutex<Option<oneshot::Sender<LoadResult>>>,
}

impl ChannelCallback {
    pub fn new() -> (Self, oneshot::Receiver<LoadResult>) {
        let (sender, receiver) = oneshot::channel();
        let callback = Self {
            sender: Mutex::new(Some(sender)),
        };
        (callback, receiver)
    }

    fn send(&self, result: LoadResult) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            tracing::warn!("load callback resolved twice");
            return release(result);
        };
        if let Err(result) = sender.send(result) {
            // nobody is waiting anymore, so nobody will release the resource either
            release(result);
        }
    }
}

fn release(result: LoadResult) {
    if let Ok(loaded) = result {
        if let Err(error) = loaded.resource.release() {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "failed to release resource"
            );
        }
    }
}

impl ResourceCallback for ChannelCallback {
    fn on_resource_ready(
        &self,
        resource: EngineResource,
        data_source: DataSource,
        is_loaded_from_alternate_cache_key: bool,
    ) {
        self.send(Ok(Loaded {
            resource,
            data_source,
            is_loaded_from_alternate_cache_key,
        }));
    }

    fn on_load_failed(&self, error: Arc<LoadError>) {
        self.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::resource::ResourceListener;
    use crate::resource::tests::{RecordingListener, counting_resource};

    #[test]
    fn test_dropped_receiver_releases() {
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn ResourceListener> = Arc::downgrade(&listener) as _;
        let (resource, _) = counting_resource("a", 1, weak);
        resource.acquire().unwrap();

        let (callback, receiver) = ChannelCallback::new();
        drop(receiver);
        callback.on_resource_ready(resource.clone(), DataSource::Local, false);

        assert_eq!(resource.acquired(), 0);
        assert_eq!(listener.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_forwards_failure() {
        let (callback, receiver) = ChannelCallback::new();
        callback.on_load_failed(Arc::new(LoadError::new("nope")));
        let error = futures::executor::block_on(receiver).unwrap().unwrap_err();
        assert_eq!(error.message(), "nope");
    }
}
