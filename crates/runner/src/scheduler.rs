//! Control-cycle scheduler.
//!
//! One cycle per tick. The cycle itself is blocking (forecast read, solver),
//! so it runs on the blocking pool under a timeout. A cycle that times out
//! or panics counts as "do not irrigate" in the output log, and its result
//! is never committed to the carried moisture state. While a late cycle
//! still holds the engine, later ticks fail fast instead of queueing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use irrigation_engine::{ForecastProvider, OutputLog};

use crate::cycle::{CycleOutcome, Engine};

pub type SharedEngine<F> = Arc<Mutex<Engine<F>>>;

// Who settles a cycle: the blocking task commits, or the caller abandons it
// on timeout. Exactly one transition out of PENDING succeeds.
const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Local wall-clock time, falling back to UTC when the offset is unknown.
pub fn local_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Run one cycle at `now` on the blocking pool.
pub async fn run_cycle<F>(
    engine: &SharedEngine<F>,
    now: PrimitiveDateTime,
    timeout: Duration,
) -> Result<CycleOutcome>
where
    F: ForecastProvider + Send + 'static,
{
    let engine = Arc::clone(engine);
    let settled = Arc::new(AtomicU8::new(PENDING));
    let claim = Arc::clone(&settled);
    let mut task = tokio::task::spawn_blocking(move || {
        let mut engine = match engine.try_lock() {
            Ok(engine) => engine,
            Err(TryLockError::WouldBlock) => bail!("previous control cycle is still running"),
            Err(TryLockError::Poisoned(_)) => bail!("engine lock poisoned by an earlier cycle"),
        };
        engine
            .cycle_if(now, || {
                claim
                    .compare_exchange(PENDING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or_else(|| anyhow!("control cycle finished after its deadline, result discarded"))
    });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => bail!("control cycle panicked: {join}"),
        Err(_) => {
            let abandoned = settled
                .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if abandoned {
                bail!("control cycle exceeded {timeout:?}");
            }
            // Committed right at the deadline; the outcome is on its way.
            match task.await {
                Ok(result) => result,
                Err(join) => bail!("control cycle panicked: {join}"),
            }
        }
    }
}

/// Tick forever, or `max_cycles` times when given.
pub async fn run<F>(
    engine: SharedEngine<F>,
    interval: Duration,
    cycle_timeout: Duration,
    max_cycles: Option<usize>,
) -> OutputLog
where
    F: ForecastProvider + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut log = OutputLog::new();
    let mut cycles = 0usize;

    info!(
        interval_sec = interval.as_secs(),
        cycle_timeout_ms = cycle_timeout.as_millis() as u64,
        "scheduler started"
    );

    loop {
        ticker.tick().await;
        let now = local_now();

        let volume_ml = match run_cycle(&engine, now, cycle_timeout).await {
            Ok(outcome) => {
                info!(
                    %now,
                    volume_ml = outcome.command.volume_ml,
                    duration_s = outcome.command.duration_s,
                    moisture = outcome.moisture,
                    "cycle complete"
                );
                outcome.command.volume_ml
            }
            Err(e) => {
                error!(%now, "cycle failed, not irrigating: {e:#}");
                0.0
            }
        };

        if !log.push(now, volume_ml) {
            warn!(%now, "output row dropped (same minute or an earlier day)");
        }

        cycles += 1;
        if max_cycles.is_some_and(|max| cycles >= max) {
            break;
        }
    }

    log
}
