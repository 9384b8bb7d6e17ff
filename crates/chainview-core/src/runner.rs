//! Handler runner — dispatches matched transactions and events to handlers.

use tracing::{error, warn};

use crate::context::{ExecutionContext, TxMeta};
use crate::handler::{EventMeta, HandlerPayload, HandlerSet};
use crate::matcher::MatchedTx;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Handler failures at which the runner stops.
    pub error_threshold: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { error_threshold: 50 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Successful handler invocations.
    pub processed: u64,
    pub errors: u64,
    /// The error threshold was reached and the remaining payloads were skipped.
    pub tripped: bool,
    pub last_error: Option<String>,
}

/// Invoke the handler of each matched entry, once per event, or once for the
/// transaction when it matched without events.
///
/// A failing invocation is counted and its buffered writes are discarded;
/// other invocations are unaffected.
pub async fn run(
    view: &str,
    handlers: &HandlerSet,
    matched: &[MatchedTx],
    ctx: &mut ExecutionContext,
    options: RunOptions,
) -> RunOutcome {
    let threshold = options.error_threshold.max(1);
    let mut outcome = RunOutcome::default();
    let height = ctx.block().height;

    for entry in matched {
        let Some(handler) = handlers.resolve(&entry.source_key) else {
            warn!(view, source_key = %entry.source_key, "No handler for source key; skipping");
            continue;
        };
        ctx.set_tx(TxMeta::from(&entry.tx));

        let payloads: Vec<HandlerPayload> = if entry.events.is_empty() {
            vec![HandlerPayload {
                tx: TxMeta::from(&entry.tx),
                block_height: height,
                event: None,
            }]
        } else {
            entry
                .events
                .iter()
                .map(|event| HandlerPayload {
                    tx: TxMeta::from(&entry.tx),
                    block_height: height,
                    event: Some(EventMeta::from(event)),
                })
                .collect()
        };

        for payload in &payloads {
            let mark = ctx.mark();
            match handler.handle(payload, ctx).await {
                Ok(()) => outcome.processed += 1,
                Err(e) => {
                    ctx.discard_from(mark);
                    outcome.errors += 1;
                    let message = format!("{e:#}");
                    error!(
                        view,
                        source_key = %entry.source_key,
                        tx_id = %payload.tx.tx_id,
                        event_id = payload.event_id().unwrap_or("-"),
                        height,
                        error = %message,
                        "Handler failed"
                    );
                    outcome.last_error = Some(message);
                    if outcome.errors >= threshold {
                        warn!(view, height, errors = outcome.errors, "Error threshold reached; stopping block");
                        outcome.tripped = true;
                        return outcome;
                    }
                }
            }
        }
    }
    outcome
}
