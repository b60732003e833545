//! In-memory gateway
//!
//! Holds JSON rows per table and behaves like the hosted gateway: ids and
//! timestamps are assigned on insert, every mutation is broadcast to open
//! change feeds, and snapshots honour filters and ordering. Test hooks allow
//! holding subscription acknowledgements, injecting failures, delaying
//! snapshots and pushing arbitrary (duplicate or out-of-order) changes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{Channel, ChannelSender, ChannelStatus, Gateway, RawChange};
use crate::error::GatewayError;
use crate::models::row_id;
use crate::query::Query;

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    /// Acknowledged feeds
    channels: HashMap<String, Vec<ChannelSender>>,
    /// Feeds waiting for `acknowledge`
    held: HashMap<String, Vec<ChannelSender>>,
    channel_opens: HashMap<String, usize>,
    hold_acks: bool,
    query_delay: Option<Duration>,
    fail_query: Option<String>,
    fail_mutation: Option<String>,
    fail_subscribe: Option<String>,
}

/// Gateway backed by in-process tables
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table (builder form)
    pub fn with_rows(self, table: &str, rows: Vec<Value>) -> Self {
        self.seed(table, rows);
        self
    }

    /// Replace the rows of a table without emitting changes
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.lock().tables.insert(table.to_string(), rows);
    }

    /// Current rows of a table
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// How many times a change feed was opened for `table`
    pub fn channel_opens(&self, table: &str) -> usize {
        self.lock().channel_opens.get(table).copied().unwrap_or(0)
    }

    /// Change feeds for `table` whose receiver is still alive
    pub fn open_channels(&self, table: &str) -> usize {
        let state = self.lock();
        let live = |senders: Option<&Vec<ChannelSender>>| {
            senders.map_or(0, |s| s.iter().filter(|tx| !tx.is_closed()).count())
        };
        live(state.channels.get(table)) + live(state.held.get(table))
    }

    /// Stop acknowledging new feeds until `acknowledge` is called
    pub fn hold_acknowledgements(&self, hold: bool) {
        self.lock().hold_acks = hold;
    }

    /// Acknowledge held feeds for `table`, returning how many were released
    pub fn acknowledge(&self, table: &str) -> usize {
        let mut state = self.lock();
        let held = state.held.remove(table).unwrap_or_default();
        let mut released = 0;
        for sender in held {
            if sender.status(ChannelStatus::Subscribed) {
                state
                    .channels
                    .entry(table.to_string())
                    .or_default()
                    .push(sender);
                released += 1;
            }
        }
        released
    }

    /// Push a change to open feeds without touching stored rows
    ///
    /// Returns the number of feeds it was delivered to.
    pub fn emit(&self, table: &str, change: RawChange) -> usize {
        let mut state = self.lock();
        broadcast(&mut state, table, change)
    }

    /// Report a channel error on every feed for `table` and drop them
    pub fn fail_channel(&self, table: &str, message: &str) {
        let mut state = self.lock();
        let senders = state
            .channels
            .remove(table)
            .unwrap_or_default()
            .into_iter()
            .chain(state.held.remove(table).unwrap_or_default());
        for sender in senders {
            sender.status(ChannelStatus::ChannelError(message.to_string()));
        }
    }

    pub fn fail_next_query(&self, message: &str) {
        self.lock().fail_query = Some(message.to_string());
    }

    pub fn fail_next_mutation(&self, message: &str) {
        self.lock().fail_mutation = Some(message.to_string());
    }

    pub fn fail_next_subscribe(&self, message: &str) {
        self.lock().fail_subscribe = Some(message.to_string());
    }

    /// Delay snapshot responses; rows are captured before the delay
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.lock().query_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_mutation_failure(state: &mut MemoryState) -> Result<(), GatewayError> {
        match state.fail_mutation.take() {
            Some(message) => Err(GatewayError::Status {
                status: 500,
                message,
            }),
            None => Ok(()),
        }
    }
}

fn broadcast(state: &mut MemoryState, table: &str, change: RawChange) -> usize {
    let Some(senders) = state.channels.get_mut(table) else {
        return 0;
    };
    senders.retain(|sender| !sender.is_closed());
    senders
        .iter()
        .filter(|sender| sender.change(change.clone()))
        .count()
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, GatewayError> {
        let (rows, delay) = {
            let mut state = self.lock();
            if let Some(message) = state.fail_query.take() {
                return Err(GatewayError::Status {
                    status: 500,
                    message,
                });
            }

            let mut rows: Vec<Value> = state
                .tables
                .get(table)
                .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
                .unwrap_or_default();
            if let Some(order) = query.order {
                rows.sort_by(|a, b| order.compare(a, b));
            }
            (rows, state.query_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        debug!(table, rows = rows.len(), "Memory snapshot");
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, GatewayError> {
        let mut state = self.lock();
        Self::take_mutation_failure(&mut state)?;

        let Value::Object(mut row) = record else {
            return Err(GatewayError::Status {
                status: 400,
                message: "row must be an object".to_string(),
            });
        };

        let stamp = now();
        row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        row.insert("created_at".to_string(), stamp.clone());
        row.insert("updated_at".to_string(), stamp);
        let row = Value::Object(row);

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        broadcast(&mut state, table, RawChange::insert(row.clone()));

        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, GatewayError> {
        let mut state = self.lock();
        Self::take_mutation_failure(&mut state)?;

        let Value::Object(patch) = patch else {
            return Err(GatewayError::Status {
                status: 400,
                message: "patch must be an object".to_string(),
            });
        };

        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row_id(row).as_deref() == Some(id))
            })
            .ok_or_else(|| GatewayError::Status {
                status: 404,
                message: format!("no row with id '{}'", id),
            })?;

        if let Value::Object(fields) = row {
            for (key, value) in patch {
                fields.insert(key, value);
            }
            fields.insert("updated_at".to_string(), now());
        }
        let updated = row.clone();

        broadcast(
            &mut state,
            table,
            RawChange {
                old: Some(serde_json::json!({ "id": id })),
                ..RawChange::update(updated.clone())
            },
        );

        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        Self::take_mutation_failure(&mut state)?;

        let removed = state.tables.get_mut(table).is_some_and(|rows| {
            let before = rows.len();
            rows.retain(|row| row_id(row).as_deref() != Some(id));
            rows.len() != before
        });

        if removed {
            broadcast(&mut state, table, RawChange::delete(id));
        }
        Ok(())
    }

    async fn subscribe_changes(&self, table: &str) -> Result<Channel, GatewayError> {
        let mut state = self.lock();
        *state.channel_opens.entry(table.to_string()).or_default() += 1;

        if let Some(message) = state.fail_subscribe.take() {
            return Err(GatewayError::Realtime(message));
        }

        let (sender, channel) = Channel::pair();
        if state.hold_acks {
            state.held.entry(table.to_string()).or_default().push(sender);
        } else {
            sender.status(ChannelStatus::Subscribed);
            state
                .channels
                .entry(table.to_string())
                .or_default()
                .push(sender);
        }

        debug!(table, "Memory change feed opened");
        Ok(channel)
    }
}
