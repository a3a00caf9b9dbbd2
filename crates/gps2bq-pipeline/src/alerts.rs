// Alert sinks.
//
// Delivery transports (webhook, email) live outside the pipeline; the
// production default logs through tracing and relies on the ledger's
// alert ring for the HTTP surface.

use tracing::warn;

use gps2bq_core::{AlertEvent, AlertSink};

/// Logs every alert at warn level.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, event: AlertEvent) {
        match event.stream {
            Some(stream) => warn!(
                kind = event.kind.as_str(),
                stream = stream.as_str(),
                "{}",
                event.message
            ),
            None => warn!(kind = event.kind.as_str(), "{}", event.message),
        }
    }
}
