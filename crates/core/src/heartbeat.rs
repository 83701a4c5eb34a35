//! Keep-alive heartbeats for the server-side terminal resource.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::resource::{TerminalCoordinate, TerminalMetadata, TerminalResourceClient};

/// Owned handle of the heartbeat loop.
///
/// Dropping the ticker stops the loop, so the coordinator disposes it in
/// the same step as the attach channel it belongs to. A failing heartbeat
/// call is logged and otherwise ignored; only the transport's own close
/// event is authoritative for disconnection.
pub struct HeartbeatTicker {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatTicker {
    /// Spawns the keep-alive loop; the first call happens one full
    /// `interval` from now.
    pub fn start(
        client: Arc<dyn TerminalResourceClient>,
        coordinate: TerminalCoordinate,
        metadata: TerminalMetadata,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(err) = client.heartbeat(&coordinate, &metadata).await {
                            error!(target: "podshell.heartbeat", error = %err, "heartbeat failed");
                        }
                    }
                }
            }
            debug!(target: "podshell.heartbeat", "heartbeat loop stopped");
        });
        Self { token, task }
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeResourceClient;

    fn coordinate() -> TerminalCoordinate {
        TerminalCoordinate {
            name: "dev-shell".to_string(),
            namespace: "garden-dev".to_string(),
            target: "shoot".to_string(),
        }
    }

    fn metadata() -> TerminalMetadata {
        TerminalMetadata {
            name: "term-abc".to_string(),
            namespace: "garden-dev".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_the_configured_interval() {
        let client = FakeResourceClient::new();
        let parent = CancellationToken::new();
        let _ticker = HeartbeatTicker::start(
            client.clone(),
            coordinate(),
            metadata(),
            Duration::from_secs(60),
            &parent,
        );

        assert_eq!(client.heartbeat_count(), 0);
        time::advance(Duration::from_secs(60)).await;
        client.wait_heartbeats(1).await;
        time::advance(Duration::from_secs(60)).await;
        client.wait_heartbeats(2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_calls_keep_the_loop_running() {
        let client = FakeResourceClient::new();
        client.fail_heartbeat(true);
        let parent = CancellationToken::new();
        let _ticker = HeartbeatTicker::start(
            client.clone(),
            coordinate(),
            metadata(),
            Duration::from_secs(60),
            &parent,
        );

        time::advance(Duration::from_secs(60)).await;
        client.wait_heartbeats(1).await;
        time::advance(Duration::from_secs(60)).await;
        client.wait_heartbeats(2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_ticker_stops_the_loop() {
        let client = FakeResourceClient::new();
        let parent = CancellationToken::new();
        let ticker = HeartbeatTicker::start(
            client.clone(),
            coordinate(),
            metadata(),
            Duration::from_secs(60),
            &parent,
        );

        time::advance(Duration::from_secs(60)).await;
        client.wait_heartbeats(1).await;

        drop(ticker);
        time::advance(Duration::from_secs(600)).await;
        assert_eq!(client.heartbeat_count(), 1);
    }
}
