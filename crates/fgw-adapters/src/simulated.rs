//! ---
//! fgw_section: "05-field-adapters"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "In-process field adapter used by the SIMULATED driver and tests."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_common::model::{CauseOfTransmission, ConnectionConfig, ValueUpdate};
use futures::StreamExt;
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::Normal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{FieldAdapter, NativeValue, UpdateStream, WriteOutcome};

/// Random-walk acquisition parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    pub points: usize,
    pub period: Duration,
    pub step_sigma: f64,
    pub seed: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            points: 10,
            period: Duration::from_secs(1),
            step_sigma: 0.5,
            seed: 7,
        }
    }
}

/// Scripted answer for the next write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteScript {
    Reply(WriteOutcome),
    /// Transport failure.
    Fail(String),
    /// Never answer within the caller's timeout.
    Stall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub connection_number: u32,
    pub address: String,
    pub value: NativeValue,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    tx: mpsc::UnboundedSender<ValueUpdate>,
    live: bool,
    generator: Option<JoinHandle<()>>,
}

impl Session {
    fn stop(self) {
        if let Some(generator) = self.generator {
            generator.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    sessions: Mutex<HashMap<u32, Session>>,
    scripts: Mutex<VecDeque<WriteScript>>,
    writes: Mutex<Vec<RecordedWrite>>,
}

/// Field adapter without a wire protocol. Values come from [`publish`](Self::publish)
/// or an optional random-walk generator; writes are recorded and answered from a script.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    protocol: String,
    generator: Option<GeneratorSettings>,
    shared: Arc<Shared>,
}

impl SimulatedAdapter {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            generator: None,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_generator(mut self, settings: GeneratorSettings) -> Self {
        self.generator = Some(settings);
        self
    }

    /// Push an update into the session of its connection. Returns `false`
    /// when no session is open for it.
    pub fn publish(&self, update: ValueUpdate) -> bool {
        let sessions = self.shared.sessions.lock();
        match sessions.get(&update.connection_number) {
            Some(session) => session.tx.send(update).is_ok(),
            None => false,
        }
    }

    /// Toggle liveness of an open session without closing it.
    pub fn set_live(&self, connection_number: u32, live: bool) {
        if let Some(session) = self.shared.sessions.lock().get_mut(&connection_number) {
            session.live = live;
        }
    }

    /// Queue the answer for a future write; unscripted writes are accepted.
    pub fn script_write(&self, script: WriteScript) {
        self.shared.scripts.lock().push_back(script);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.shared.writes.lock().clone()
    }

    pub fn open_sessions(&self) -> Vec<u32> {
        let mut open: Vec<u32> = self.shared.sessions.lock().keys().copied().collect();
        open.sort_unstable();
        open
    }
}

#[async_trait]
impl FieldAdapter for SimulatedAdapter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn open_session(&self, connection: &ConnectionConfig) -> anyhow::Result<UpdateStream> {
        let number = connection.protocol_connection_number;
        let (tx, rx) = mpsc::unbounded_channel();

        let generator = match &self.generator {
            Some(settings) => {
                let noise = Normal::new(0.0, settings.step_sigma)
                    .map_err(|err| anyhow!("invalid random-walk sigma {}: {err}", settings.step_sigma))?;
                Some(tokio::spawn(random_walk(
                    number,
                    settings.clone(),
                    noise,
                    tx.clone(),
                )))
            }
            None => None,
        };

        let previous = self.shared.sessions.lock().insert(
            number,
            Session {
                tx,
                live: true,
                generator,
            },
        );
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(connection = number, name = %connection.name, protocol = %self.protocol, "simulated session opened");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        });
        Ok(stream.boxed())
    }

    async fn close_session(&self, connection_number: u32) {
        let session = self.shared.sessions.lock().remove(&connection_number);
        if let Some(session) = session {
            session.stop();
            info!(connection = connection_number, "simulated session closed");
        }
    }

    fn is_live(&self, connection_number: u32) -> bool {
        self.shared
            .sessions
            .lock()
            .get(&connection_number)
            .is_some_and(|session| session.live)
    }

    async fn write_command(
        &self,
        connection_number: u32,
        address: &str,
        value: NativeValue,
        timeout: Duration,
    ) -> anyhow::Result<WriteOutcome> {
        if !self.is_live(connection_number) {
            bail!("connection {connection_number} has no live session");
        }
        debug!(connection = connection_number, address, %value, "simulated write");
        self.shared.writes.lock().push(RecordedWrite {
            connection_number,
            address: address.to_owned(),
            value,
            at: Utc::now(),
        });

        let script = self.shared.scripts.lock().pop_front();
        match script.unwrap_or_else(|| WriteScript::Reply(WriteOutcome::accepted("Good"))) {
            WriteScript::Reply(outcome) => Ok(outcome),
            WriteScript::Fail(reason) => Err(anyhow!(reason)),
            WriteScript::Stall => {
                tokio::time::sleep(timeout).await;
                bail!("write to {address} timed out after {}ms", timeout.as_millis())
            }
        }
    }
}

async fn random_walk(
    connection_number: u32,
    settings: GeneratorSettings,
    noise: Normal<f64>,
    tx: mpsc::UnboundedSender<ValueUpdate>,
) {
    let mut rng = StdRng::seed_from_u64(settings.seed ^ u64::from(connection_number));
    let mut values: Vec<f64> = (0..settings.points).map(|n| 100.0 * (n + 1) as f64).collect();
    let mut ticker = tokio::time::interval(settings.period);
    loop {
        ticker.tick().await;
        for (n, value) in values.iter_mut().enumerate() {
            *value += noise.sample(&mut rng);
            let update = ValueUpdate::numeric(connection_number, format!("Sim.Analog.P{n}"), *value)
                .with_cause(CauseOfTransmission::Periodic);
            if tx.send(update).is_err() {
                return;
            }
        }
        let status = ValueUpdate::digital(connection_number, "Sim.Status.Running", rng.gen_bool(0.95));
        if tx.send(status).is_err() {
            return;
        }
    }
}
