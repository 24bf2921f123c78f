// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Ordered teardown of the monitor.
//!
//! Teardown steps are independent: a failure in one is logged and the
//! remaining steps still run. Running teardown twice is safe; every step
//! is claimed or guarded so the second pass finds nothing to do.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::consumer::ConsumerHandle;
use crate::ddd::DddHandle;
use crate::setup::Context;
use crate::state::DaemonState;

/// Collects the live resources of the monitor for ordered release.
pub struct Shutdown {
    state: Arc<DaemonState>,
    context: Option<Arc<Context>>,
    ddd: Option<DddHandle>,
    consumer: Option<ConsumerHandle>,
}

impl Shutdown {
    #[must_use]
    pub fn new(
        state: Arc<DaemonState>,
        context: Arc<Context>,
        ddd: Option<DddHandle>,
        consumer: ConsumerHandle,
    ) -> Self {
        Self {
            state,
            context: Some(context),
            ddd,
            consumer: Some(consumer),
        }
    }

    /// Release everything: the notification channel reference first, then
    /// the discovery thread, then the scan consumer.
    pub async fn execute(&mut self) {
        if self.state.try_mark_channel_closed() {
            // Our reference goes away here; the channel descriptor closes
            // when the last holder drops theirs
            drop(self.context.take());
            debug!("notification channel reference released");
        }

        if let Some(ddd) = self.ddd.take() {
            if let Err(e) = ddd.stop() {
                warn!("directory discovery did not stop cleanly: {e}");
            }
        }

        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.stop().await {
                warn!("scan consumer did not stop cleanly: {e}");
            }
        }

        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::fanotify::Channel;
    use crate::queue::ScanQueue;
    use crate::scanner::{ScanVerdict, Scanner};
    use anyhow::Result;
    use std::os::fd::BorrowedFd;
    use std::path::Path;

    struct NullScanner;

    impl Scanner for NullScanner {
        fn validate_availability(&self) -> Result<()> {
            Ok(())
        }

        fn scan_fd(&self, _fd: BorrowedFd<'_>, _path: &Path) -> Result<ScanVerdict> {
            Ok(ScanVerdict::Clean)
        }
    }

    fn context() -> Arc<Context> {
        let (_rx, tx) =
            rustix::pipe::pipe_with(rustix::pipe::PipeFlags::NONBLOCK).expect("pipe");
        let config = Arc::new(MonitorConfig::default());
        Arc::new(Context {
            channel: Channel::from_fd(tx),
            mask: crate::setup::event_mask(&config),
            size_limit: config.max_file_size,
            extended_info: false,
            ddd_enabled: false,
            retry_on_error: config.retry_on_error,
            retry_attempts: config.retry_attempts,
            config,
        })
    }

    #[tokio::test]
    async fn teardown_twice_is_harmless() {
        let state = Arc::new(DaemonState::new().expect("state"));
        state.mark_channel_open();
        let ctx = context();

        let (queue, rx) = ScanQueue::bounded(4);
        let consumer = ConsumerHandle::spawn(Arc::clone(&ctx), Arc::new(NullScanner), rx);
        // Dropping the producer lets the consumer drain and exit
        drop(queue);

        let mut shutdown = Shutdown::new(state, ctx, None, consumer);
        shutdown.execute().await;
        shutdown.execute().await;
    }

    #[tokio::test]
    async fn teardown_runs_every_step() {
        let state = Arc::new(DaemonState::new().expect("state"));
        state.mark_channel_open();
        let ctx = context();

        let (queue, rx) = ScanQueue::bounded(4);
        let consumer = ConsumerHandle::spawn(Arc::clone(&ctx), Arc::new(NullScanner), rx);
        drop(queue);
        let ddd = DddHandle::spawn(Arc::clone(&ctx)).expect("ddd");

        let mut shutdown = Shutdown::new(Arc::clone(&state), ctx, Some(ddd), consumer);
        shutdown.execute().await;

        assert!(!state.channel_open());
    }
}
