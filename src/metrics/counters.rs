//! Counter metrics

use super::labels;

/// A connection finished its handshake
pub(crate) fn connection_opened(secure: bool) {
    metrics::counter!(labels::CONNECTIONS_OPENED, "secure" => if secure { "true" } else { "false" })
        .increment(1);
}

/// A connection reached `Closed`
pub(crate) fn connection_closed(reason: &'static str) {
    metrics::counter!(labels::CONNECTIONS_CLOSED, "reason" => reason).increment(1);
}

/// A query settled
pub(crate) fn query_completed(status: &'static str) {
    metrics::counter!(labels::QUERIES, "status" => status).increment(1);
}

/// An error was returned to a caller
pub(crate) fn error(category: &'static str) {
    metrics::counter!(labels::ERRORS, "category" => category).increment(1);
}
