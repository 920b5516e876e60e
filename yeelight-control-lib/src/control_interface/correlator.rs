use std::collections::HashMap;

use derivative::Derivative;
use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::control_interface::protocol::{Command, Response};
use crate::error::{Result, YeelightError};

/// Completion handle of a pending command.
pub type Completion = oneshot::Sender<Result<Vec<Value>>>;

/// A command waiting for its response.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PendingCommand {
    pub command: Command,
    pub deadline: Instant,
    #[derivative(Debug = "ignore")]
    completion: Completion,
}

impl PendingCommand {
    /// Completes the command. Consumes the entry, so a command completes at most once.
    fn complete(self, outcome: Result<Vec<Value>>) {
        if self.completion.send(outcome).is_err() {
            debug!(
                "Caller of command {} ({}) is gone, dropping its outcome",
                self.command.id, self.command.method
            );
        }
    }
}

/// Owns the id sequence and the table of pending commands for one connection.
///
/// Whoever removes an entry from the table is the only party allowed to complete it.
#[derive(Debug)]
pub struct Correlator {
    next_id: u64,
    pending: HashMap<u64, PendingCommand>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Starts a new id sequence for a fresh connection.
    ///
    /// Must only be called once the previous connection has been drained.
    pub fn reset(&mut self) {
        debug_assert!(self.pending.is_empty());
        self.next_id = 1;
    }

    /// Allocates the next id and registers the command as pending.
    pub fn register(
        &mut self,
        method: &str,
        params: Vec<Value>,
        deadline: Instant,
    ) -> (Command, oneshot::Receiver<Result<Vec<Value>>>) {
        let id = self.next_id;
        // TODO: decide on a wrap policy once a session can plausibly exhaust u64 ids.
        self.next_id += 1;

        let command = Command::new(id, method, params);
        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCommand {
                command: command.clone(),
                deadline,
                completion,
            },
        );
        (command, receiver)
    }

    /// Resolves the pending command the response belongs to.
    ///
    /// Returns false for responses with unknown ids, which are dropped.
    pub fn resolve(&mut self, response: Response) -> bool {
        let Some(pending) = self.pending.remove(&response.id()) else {
            debug!("Dropping response for unknown id {}", response.id());
            return false;
        };
        let outcome = match response {
            Response::Result { values, .. } => Ok(values),
            Response::Error { code, message, .. } => {
                Err(YeelightError::DeviceError { code, message })
            }
        };
        pending.complete(outcome);
        true
    }

    /// Removes a pending command without completing it, used by the sender itself after
    /// a write failure or timeout. `None` means the command was already completed.
    pub fn remove(&mut self, id: u64) -> Option<PendingCommand> {
        self.pending.remove(&id)
    }

    /// Rejects every pending command with [`YeelightError::ConnectionClosed`].
    /// Returns the number of rejected commands.
    pub fn close_all(&mut self) -> usize {
        let drained: Vec<PendingCommand> = self.pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.complete(Err(YeelightError::ConnectionClosed));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// The id the next registered command will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut correlator = Correlator::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| correlator.register("toggle", vec![], deadline()).0.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(correlator.pending_count(), 5);
    }

    #[tokio::test]
    async fn test_response_resolves_only_matching_command() {
        let mut correlator = Correlator::new();
        let (_, mut first) = correlator.register("toggle", vec![], deadline());
        let (second_cmd, second) = correlator.register("get_prop", vec![json!("power")], deadline());
        let (_, mut third) = correlator.register("toggle", vec![], deadline());

        assert!(correlator.resolve(Response::Result {
            id: second_cmd.id,
            values: vec![json!("on")],
        }));

        assert_eq!(second.await.unwrap().unwrap(), vec![json!("on")]);
        assert!(first.try_recv().is_err());
        assert!(third.try_recv().is_err());
        assert_eq!(correlator.pending_count(), 2);
        assert!(!correlator.is_pending(second_cmd.id));
    }

    #[tokio::test]
    async fn test_error_response_becomes_device_error() {
        let mut correlator = Correlator::new();
        let (cmd, receiver) = correlator.register("set_scene", vec![], deadline());
        correlator.resolve(Response::Error {
            id: cmd.id,
            code: -1,
            message: "unsupported method".to_string(),
        });
        match receiver.await.unwrap() {
            Err(YeelightError::DeviceError { code, message }) => {
                assert_eq!(code, -1);
                assert_eq!(message, "unsupported method");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_repeated_ids_are_dropped() {
        let mut correlator = Correlator::new();
        let (cmd, _receiver) = correlator.register("toggle", vec![], deadline());
        let response = Response::Result {
            id: cmd.id,
            values: vec![json!("ok")],
        };
        assert!(!correlator.resolve(Response::Result {
            id: 42,
            values: vec![]
        }));
        assert!(correlator.resolve(response.clone()));
        assert!(!correlator.resolve(response));
    }

    #[tokio::test]
    async fn test_close_all_rejects_every_pending_command() {
        let mut correlator = Correlator::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| correlator.register("toggle", vec![], deadline()).1)
            .collect();

        assert_eq!(correlator.close_all(), 3);
        assert_eq!(correlator.pending_count(), 0);
        for receiver in receivers {
            assert!(matches!(
                receiver.await.unwrap(),
                Err(YeelightError::ConnectionClosed)
            ));
        }
        assert_eq!(correlator.close_all(), 0);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut correlator = Correlator::new();
        correlator.register("toggle", vec![], deadline());
        correlator.close_all();
        correlator.reset();
        assert_eq!(correlator.next_id(), 1);
    }

    #[test]
    fn test_remove_detaches_entry() {
        let mut correlator = Correlator::new();
        let (cmd, _receiver) = correlator.register("toggle", vec![], deadline());
        assert!(correlator.remove(cmd.id).is_some());
        assert!(correlator.remove(cmd.id).is_none());
    }
}
