//! HTTP/2 stream-core metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "portico_h2/streams/opened",
    description = "Total streams created"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "portico_h2/streams/closed",
    description = "Total streams destroyed"
)]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "portico_h2/streams/active",
    description = "Streams currently alive"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "portico_h2/errors/protocol",
    description = "Stream-level protocol errors"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "portico_h2/errors/enhance_your_calm",
    description = "Streams rejected for abusive WINDOW_UPDATE cadence"
)]
pub static ENHANCE_YOUR_CALM: Counter = Counter::new();

#[metric(
    name = "portico_h2/callbacks/deferred",
    description = "Driver callbacks deferred on contention"
)]
pub static CALLBACK_DEFERRALS: Counter = Counter::new();

#[metric(
    name = "portico_h2/transactions/slow",
    description = "Transactions exceeding the slow-log threshold"
)]
pub static SLOW_TRANSACTIONS: Counter = Counter::new();
