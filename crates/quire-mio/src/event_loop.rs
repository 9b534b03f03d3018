use std::{ops::ControlFlow, time::Duration};

use anyhow::Error;
use tracing::{event, instrument, Level};

use crate::{Ready, Registry};

/// Run the readiness loop until `step` breaks.
///
/// `step` is called once per poll with all readiness gathered in that poll, including an empty
/// list when `tick` elapses without any, so the owner can run timers such as idle sweeps.
#[instrument("mio-event-loop", skip_all)]
pub fn run_event_loop<F>(registry: &mut Registry, tick: Duration, mut step: F) -> Result<(), Error>
where
    F: FnMut(&mut Registry, Vec<Ready>) -> Result<ControlFlow<()>, Error>,
{
    loop {
        let ready = registry.poll(Some(tick))?;

        event!(Level::TRACE, count = ready.len(), "processing poll step");
        if step(registry, ready)?.is_break() {
            event!(Level::DEBUG, "event loop stopped");
            return Ok(());
        }
    }
}
