//! Metric helpers wrapping a statsd client.

use std::net::UdpSocket;
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Counted, Metric, NopMetricSink, QueuingMetricSink, StatsdClient,
};

pub use cadence::MetricError;

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub client: Option<Arc<StatsdClient>>,
}

impl Metrics {
    pub fn sink() -> StatsdClient {
        StatsdClient::builder("", NopMetricSink).build()
    }

    pub fn noop() -> Self {
        Self {
            client: Some(Arc::new(Self::sink())),
        }
    }

    // increment a counter with no tags data.
    pub fn incr(&self, label: &str) {
        self.count(label, 1)
    }

    pub fn count(&self, label: &str, count: i64) {
        if let Some(client) = self.client.as_ref() {
            match client.count(label, count) {
                Err(e) => {
                    // eat the metric, but log the error
                    warn!("⚠️ Metric {} error: {:?}", label, e);
                }
                Ok(v) => {
                    trace!("☑️ {:?}", v.as_metric_str());
                }
            }
        }
    }
}

pub fn metrics_from_opts(
    label: &str,
    host: Option<&str>,
    port: u16,
) -> Result<Arc<StatsdClient>, MetricError> {
    let builder = if let Some(statsd_host) = host {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let host = (statsd_host, port);
        let udp_sink = BufferedUdpMetricSink::from(host, socket)?;
        let sink = QueuingMetricSink::from(udp_sink);
        StatsdClient::builder(label, sink)
    } else {
        StatsdClient::builder(label, NopMetricSink)
    };
    Ok(Arc::new(
        builder
            .with_error_handler(|err| {
                warn!("⚠️ Metric send error: {:?}", err);
            })
            .build(),
    ))
}

impl From<&Arc<StatsdClient>> for Metrics {
    fn from(client: &Arc<StatsdClient>) -> Self {
        Metrics {
            client: Some(client.clone()),
        }
    }
}
