//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Field session lifecycle driven by the redundancy role."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fgw_adapters::FieldAdapter;
use fgw_common::model::ConnectionConfig;
use fgw_ingest::UpdateQueue;
use fgw_redundancy::ActivityHandle;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opens field sessions while the instance may do field I/O and closes them
/// otherwise. Updates from open sessions go straight into the queue.
pub struct SessionManager {
    adapter: Arc<dyn FieldAdapter>,
    connections: Vec<ConnectionConfig>,
    queue: Arc<UpdateQueue>,
    activity: ActivityHandle,
    retry: Duration,
    pumps: HashMap<u32, JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(
        adapter: Arc<dyn FieldAdapter>,
        connections: Vec<ConnectionConfig>,
        queue: Arc<UpdateQueue>,
        activity: ActivityHandle,
        retry: Duration,
    ) -> Self {
        Self {
            adapter,
            connections,
            queue,
            activity,
            retry,
            pumps: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut retry = tokio::time::interval(self.retry);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                changed = self.activity.changed() => match changed {
                    Some(_) => self.reconcile().await,
                    None => break,
                },
                _ = retry.tick() => self.reconcile().await,
            }
        }
        self.close_all().await;
        debug!("session manager stopped");
    }

    async fn reconcile(&mut self) {
        if self.activity.keep_sessions_open() {
            self.open_missing().await;
        } else if !self.pumps.is_empty() {
            info!("instance is standby; closing field sessions");
            self.close_all().await;
        }
    }

    async fn open_missing(&mut self) {
        self.pumps.retain(|_, pump| !pump.is_finished());
        for connection in &self.connections {
            let number = connection.protocol_connection_number;
            if self.pumps.contains_key(&number) {
                continue;
            }
            match self.adapter.open_session(connection).await {
                Ok(mut stream) => {
                    let queue = self.queue.clone();
                    let pump = tokio::spawn(async move {
                        while let Some(update) = stream.next().await {
                            queue.enqueue(update);
                        }
                        debug!(connection = number, "field session stream ended");
                    });
                    self.pumps.insert(number, pump);
                }
                Err(err) => {
                    warn!(connection = number, name = %connection.name, error = %err, "field session could not be opened; will retry");
                }
            }
        }
    }

    async fn close_all(&mut self) {
        for (number, pump) in self.pumps.drain() {
            self.adapter.close_session(number).await;
            pump.abort();
        }
    }
}
