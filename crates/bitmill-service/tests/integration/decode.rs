use std::sync::Arc;

use bitmill_service::decode::{DecodeContext, DecodeJob, DecodeOutcome, LoadRequest};
use bitmill_service::error::LoadErrorKind;
use bitmill_service::registry::{
    BitmapDecoder, CenterCrop, Registry, Resize, StreamEncoder, Transformations,
};
use bitmill_service::resource::{Bitmap, BitmapConfig, BitmapPool};
use bitmill_service::types::{DataSource, DiskCacheStrategy, Options};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::utils::{
    Behavior, Event, RecordingCallback, Remote, RemoteLoader, context_from, decode_context, png,
    remote,
};

fn new_job(
    request: LoadRequest,
    context: &DecodeContext,
) -> (DecodeJob, Arc<RecordingCallback>, CancellationToken) {
    let callback = Arc::new(RecordingCallback::default());
    let token = CancellationToken::new();
    let job = DecodeJob::new(
        Arc::new(request),
        context.clone(),
        callback.clone(),
        token.clone(),
    );
    (job, callback, token)
}

/// Runs the job, following a single reschedule onto the source stage.
async fn run_to_end(job: DecodeJob, callback: &RecordingCallback) -> DecodeOutcome {
    match job.run().await {
        DecodeOutcome::Rescheduled => {
            let job = callback.take_rescheduled().unwrap();
            job.run().await
        }
        outcome => outcome,
    }
}

fn ready(events: Vec<Event>) -> (Bitmap, DataSource, bool) {
    match events.as_slice() {
        [Event::Ready {
            resource,
            data_source,
            is_alternate_cache_key,
        }] => (
            resource.downcast_ref::<Bitmap>().unwrap().clone(),
            *data_source,
            *is_alternate_cache_key,
        ),
        [Event::Failed(error)] => panic!("load failed: {error}"),
        _ => panic!("expected exactly one event, got {}", events.len()),
    }
}

#[tokio::test]
async fn test_resource_cache_skips_fetching() {
    let cache_dir = bitmill_test::tempdir();
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let context = decode_context(Some(cache_dir.path()), |registry, _| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });
    let request = || {
        LoadRequest::new(remote("a"))
            .size(8, 8)
            .disk_cache_strategy(DiskCacheStrategy::All)
    };

    // nothing cached yet, so the job moves over to the source executor
    let (first, callback, _) = new_job(request(), &context);
    assert_eq!(first.run().await, DecodeOutcome::Rescheduled);
    let first = callback.take_rescheduled().unwrap();
    assert_eq!(
        first.run().await,
        DecodeOutcome::Complete(DataSource::Remote)
    );
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!((bitmap.width(), bitmap.height()), (8, 8));
    assert_eq!(stats.fetches(), 1);

    let (second, callback, _) = new_job(request(), &context);
    assert_eq!(
        second.run().await,
        DecodeOutcome::Complete(DataSource::ResourceDiskCache)
    );
    assert!(callback.take_rescheduled().is_none());
    let (cached, data_source, _) = ready(callback.take_events());
    assert_eq!(data_source, DataSource::ResourceDiskCache);
    assert_eq!(cached.pixels(), bitmap.pixels());
    assert_eq!(stats.fetches(), 1);
}

#[tokio::test]
async fn test_data_cache_skips_fetching() {
    let cache_dir = bitmill_test::tempdir();
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let context = decode_context(Some(cache_dir.path()), |registry, _| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });
    let request = || {
        LoadRequest::new(remote("a"))
            .size(4, 4)
            .disk_cache_strategy(DiskCacheStrategy::Data)
    };

    let (first, callback, _) = new_job(request(), &context);
    assert_eq!(
        run_to_end(first, &callback).await,
        DecodeOutcome::Complete(DataSource::Remote)
    );

    // a different target size still hits the unmodified source data
    let (second, callback, _) = new_job(request().size(2, 2), &context);
    assert_eq!(
        second.run().await,
        DecodeOutcome::Complete(DataSource::DataDiskCache)
    );
    let (bitmap, _, is_alternate_cache_key) = ready(callback.take_events());
    assert_eq!((bitmap.width(), bitmap.height()), (2, 2));
    assert!(!is_alternate_cache_key);
    assert_eq!(stats.fetches(), 1);
}

#[tokio::test]
async fn test_failures_are_aggregated_in_order() {
    let context = decode_context(None, |registry, _| {
        for message in ["first", "second", "third"] {
            let (loader, _) = RemoteLoader::new(Behavior::Fail(message));
            registry.append_model_loader::<Remote, Bytes>(loader);
        }
    });
    let request = LoadRequest::new(remote("a")).disk_cache_strategy(DiskCacheStrategy::None);

    let (job, callback, _) = new_job(request, &context);
    assert_eq!(job.run().await, DecodeOutcome::Failed);
    assert!(callback.take_rescheduled().is_none());

    let events = callback.take_events();
    let [Event::Failed(error)] = events.as_slice() else {
        panic!("expected a single failure");
    };
    assert_eq!(error.kind(), LoadErrorKind::Failed);
    assert_eq!(error.causes().len(), 3);
    let roots: Vec<_> = error
        .root_causes()
        .into_iter()
        .map(|error| error.to_string())
        .collect();
    assert_eq!(roots, ["first", "second", "third"]);
}

#[tokio::test]
async fn test_cancelled_job_reports_nothing() {
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let context = decode_context(None, |registry, _| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let (job, callback, token) = new_job(LoadRequest::new(remote("a")), &context);
    token.cancel();
    assert_eq!(job.run().await, DecodeOutcome::Cancelled);
    assert!(callback.take_events().is_empty());
    assert_eq!(stats.fetches(), 0);
}

#[tokio::test]
async fn test_cancel_while_fetching_cancels_fetcher() {
    let token = CancellationToken::new();
    let (loader, stats) = RemoteLoader::new(Behavior::Cancel(token.clone()));
    let context = decode_context(None, |registry, _| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let callback = Arc::new(RecordingCallback::default());
    let request = LoadRequest::new(remote("a")).disk_cache_strategy(DiskCacheStrategy::None);
    let job = DecodeJob::new(Arc::new(request), context, callback.clone(), token);

    assert_eq!(job.run().await, DecodeOutcome::Cancelled);
    assert!(callback.take_events().is_empty());
    assert_eq!(stats.fetches(), 1);
    assert!(stats.cancelled());
}

#[tokio::test]
async fn test_only_retrieve_from_cache_never_fetches() {
    let cache_dir = bitmill_test::tempdir();
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let context = decode_context(Some(cache_dir.path()), |registry, _| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });
    let request = LoadRequest::new(remote("a")).only_retrieve_from_cache(true);

    let (job, callback, _) = new_job(request, &context);
    assert_eq!(job.run().await, DecodeOutcome::Failed);
    assert!(callback.take_rescheduled().is_none());
    assert!(matches!(
        callback.take_events().as_slice(),
        [Event::Failed(_)]
    ));
    assert_eq!(stats.fetches(), 0);
}

#[tokio::test]
async fn test_missing_result_encoder_is_fatal() {
    let pool = Arc::new(BitmapPool::new(0));
    let (loader, _) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let mut registry = Registry::new();
    registry
        .append_model_loader::<Remote, Bytes>(loader)
        .append_decoder::<Bytes, Bitmap>(BitmapDecoder::new(Arc::clone(&pool)))
        .append_encoder::<Bytes>(StreamEncoder);
    let context = context_from(None, registry, pool);

    let request = LoadRequest::new(remote("a")).disk_cache_strategy(DiskCacheStrategy::Resource);
    let (job, callback, _) = new_job(request, &context);
    assert_eq!(run_to_end(job, &callback).await, DecodeOutcome::Failed);

    let events = callback.take_events();
    let [Event::Failed(error)] = events.as_slice() else {
        panic!("expected a single failure");
    };
    assert_eq!(error.kind(), LoadErrorKind::NoResultEncoderAvailable);
}

#[tokio::test]
async fn test_hardware_config_only_without_transformations() {
    let context = decode_context(None, |_, _| {});
    let request = |transformations: Transformations| {
        LoadRequest::new(bitmill_service::registry::Model::new(png(8, 8)))
            .size(4, 4)
            .options(Options::new().with(Options::ALLOW_HARDWARE_CONFIG, true))
            .transformations(transformations)
            .disk_cache_strategy(DiskCacheStrategy::None)
    };

    let (job, callback, _) = new_job(request(Transformations::new()), &context);
    job.run().await;
    let (bitmap, data_source, _) = ready(callback.take_events());
    assert_eq!(data_source, DataSource::Local);
    assert_eq!(bitmap.config(), BitmapConfig::Hardware);

    let scale_only = Transformations::new().with::<Bitmap>(Resize);
    let (job, callback, _) = new_job(request(scale_only), &context);
    job.run().await;
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!(bitmap.config(), BitmapConfig::Hardware);

    let cropping = Transformations::new().with::<Bitmap>(CenterCrop);
    let (job, callback, _) = new_job(request(cropping), &context);
    job.run().await;
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!(bitmap.config(), BitmapConfig::Argb8888);
    assert_eq!((bitmap.width(), bitmap.height()), (4, 4));
}

#[tokio::test]
async fn test_hardware_config_defaults_to_safety() {
    let context = decode_context(None, |_, _| {});
    let request = |options: Options, transformations: Transformations| {
        LoadRequest::new(bitmill_service::registry::Model::new(png(8, 8)))
            .size(4, 4)
            .options(options)
            .transformations(transformations)
            .disk_cache_strategy(DiskCacheStrategy::None)
    };

    // unset, and nothing but scaling applies
    let (job, callback, _) = new_job(request(Options::new(), Transformations::new()), &context);
    job.run().await;
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!(bitmap.config(), BitmapConfig::Hardware);

    let cropping = Transformations::new().with::<Bitmap>(CenterCrop);
    let (job, callback, _) = new_job(request(Options::new(), cropping), &context);
    job.run().await;
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!(bitmap.config(), BitmapConfig::Argb8888);

    // explicitly disallowed even though it would be safe
    let disallowed = Options::new().with(Options::ALLOW_HARDWARE_CONFIG, false);
    let (job, callback, _) = new_job(request(disallowed, Transformations::new()), &context);
    job.run().await;
    let (bitmap, _, _) = ready(callback.take_events());
    assert_eq!(bitmap.config(), BitmapConfig::Argb8888);
}
