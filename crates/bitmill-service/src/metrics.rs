//! Reports engine metrics to statsd.
//!
//! Nothing is reported until [`configure_statsd`] was called. Until then, the [`metric!`]
//! macro is a no-op.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

thread_local! {
    static CURRENT_CLIENT: Option<&'static MetricsClient> = METRICS_CLIENT.get();
}

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,

    /// Sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// The tags sent with every metric: the custom tags, and the hostname if it is requested.
pub fn tags(config: &Metrics, hostname: Option<&str>) -> BTreeMap<String, String> {
    let mut tags = config.custom_tags.clone();
    if let Some((tag, hostname)) = config.hostname_tag.as_ref().zip(hostname) {
        tags.insert(tag.clone(), hostname.to_owned());
    }
    tags
}

/// Reports metrics to the statsd server in `config`, if there is one.
///
/// Returns whether statsd is configured. Calling this more than once keeps the first client.
pub fn configure_statsd(config: &Metrics, hostname: Option<&str>) -> io::Result<bool> {
    let Some(ref host) = config.statsd else {
        return Ok(false);
    };

    let addrs: Vec<_> = host.as_str().to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!(%addr, prefix = %config.prefix, "reporting metrics to statsd");
    }
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, sink),
        tags: tags(config, hostname),
    };
    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd metrics were already configured");
    }
    Ok(true)
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client {
            f(client)
        } else {
            Default::default()
        }
    })
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    // counters
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // gauges
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // timers
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // histograms, for sizes
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
