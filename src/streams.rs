use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{stream, Stream};
use hive_worker_shutdown_signal::ShutdownSignal;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::error;

use crate::dispatcher::{DispatchedJob, Dispatcher};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TickSource {
    Interval,
    /// A job finished and released its slot
    Wakeup,
}

struct TickStreamData {
    interval: tokio::time::Interval,
    wakeup: Option<Arc<Notify>>,
    shutdown_signal: ShutdownSignal,
}

/// Yields right away, then on every `period` and every time `wakeup` is
/// notified. Ends when the shutdown signal resolves.
pub(crate) fn tick_stream(
    period: Duration,
    wakeup: Option<Arc<Notify>>,
    shutdown_signal: ShutdownSignal,
) -> impl Stream<Item = TickSource> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let data = TickStreamData {
        interval,
        wakeup,
        shutdown_signal,
    };

    stream::unfold(data, |mut f| async {
        let wakeup = f.wakeup.clone();
        let notified = async move {
            match wakeup {
                Some(notify) => notify.notified().await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut f.shutdown_signal => None,
            _ = f.interval.tick() => Some((TickSource::Interval, f)),
            _ = notified => Some((TickSource::Wakeup, f)),
        }
    })
}

/// Jobs handed over by the dispatch loop. Ends once every sender is dropped.
pub(crate) fn dispatched_job_receiver_stream(
    receiver: mpsc::Receiver<DispatchedJob>,
) -> impl Stream<Item = DispatchedJob> {
    stream::unfold(receiver, |mut receiver| async {
        receiver.recv().await.map(|job| (job, receiver))
    })
}

/// Every job that can be dispatched right now, claiming more as earlier
/// ones are consumed. Ends when a dispatch pass comes back empty, on a store
/// error or when the shutdown signal resolves.
pub(crate) fn dispatched_job_stream(
    dispatcher: &Dispatcher,
    shutdown_signal: ShutdownSignal,
) -> impl Stream<Item = DispatchedJob> + '_ {
    stream::unfold(
        (VecDeque::new(), shutdown_signal),
        move |(mut buffer, shutdown_signal): (VecDeque<DispatchedJob>, ShutdownSignal)| async move {
            if let Some(job) = buffer.pop_front() {
                return Some((job, (buffer, shutdown_signal)));
            }

            let dispatch = dispatcher.dispatch(Utc::now());
            let batch = tokio::select! {
                res = dispatch => res,
                _ = shutdown_signal.clone() => return None,
            };

            match batch {
                Ok(batch) => {
                    buffer.extend(batch);
                    buffer
                        .pop_front()
                        .map(|job| (job, (buffer, shutdown_signal)))
                }
                Err(e) => {
                    error!(error = %e, "Could not dispatch jobs");
                    None
                }
            }
        },
    )
}
