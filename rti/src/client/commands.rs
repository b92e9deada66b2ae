//! Command execution and the session-bound command registry

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{RtiClient, naming};
use crate::constants::channel;
use crate::error::RtiResult;
use crate::proto::{Command, CommandParameter, CommandResponse, Commands, Empty, ExecuteCommand, commands};

/// Interval between checks while waiting for a command response
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default wait for a command response
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A command invocation
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub arguments: HashMap<String, String>,
    /// Deliver on the target client's private command channel
    pub client_id: Option<String>,
    /// Deliver on the entity's command channel
    pub entity_id: Option<String>,
    pub transaction_id: Option<String>,
    /// Wait for the response matching the transaction id
    pub wait: bool,
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: HashMap::new(),
            client_id: None,
            entity_id: None,
            transaction_id: None,
            wait: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.arguments.insert(name.into(), value.to_string());
        self
    }

    pub fn to_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn to_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Wait up to `timeout` for the response
    pub fn wait_for_response(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    /// Logical channel the execute envelope is published on
    pub fn channel(&self) -> String {
        let mut name = channel::COMMANDS.to_string();
        if let Some(entity_id) = self.entity_id.as_deref().filter(|e| !e.is_empty()) {
            name = format!("{}/{}", name, entity_id);
        }
        match self.client_id.as_deref().filter(|c| !c.is_empty()) {
            Some(client_id) => naming::identity_scoped(client_id, &name),
            None => name,
        }
    }
}

/// Command implementation: `Ok(message)` on success, `Err(message)` on failure
pub type CommandHandler = Arc<dyn Fn(&HashMap<String, String>) -> Result<String, String> + Send + Sync>;

struct RegisteredCommand {
    definition: Command,
    handler: CommandHandler,
}

/// Commands this session answers on the shared and private command channels
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, RegisteredCommand>>,
    serving: AtomicBool,
}

impl CommandRegistry {
    pub fn register(&self, name: &str, description: &str, parameters: &[&str], handler: CommandHandler) {
        debug!(%name, ?parameters, "CommandRegistry::register: called");
        let definition = Command {
            name: name.to_string(),
            description: description.to_string(),
            arguments: parameters
                .iter()
                .map(|p| CommandParameter {
                    name: p.to_string(),
                    required: true,
                    description: String::new(),
                })
                .collect(),
        };
        self.commands
            .write()
            .insert(name.to_string(), RegisteredCommand { definition, handler });
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.commands.write().remove(name).is_some()
    }

    pub fn definitions(&self) -> Vec<Command> {
        self.commands.read().values().map(|c| c.definition.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.read().contains_key(name)
    }

    /// Run a matching command
    ///
    /// Returns the response to publish when the request carries a transaction
    /// id; unknown commands are ignored.
    pub fn execute(&self, request: &ExecuteCommand) -> Option<CommandResponse> {
        let (definition, handler) = {
            let commands = self.commands.read();
            let command = commands.get(&request.name)?;
            (command.definition.clone(), command.handler.clone())
        };
        let missing = definition
            .arguments
            .iter()
            .filter(|p| p.required)
            .any(|p| !request.arguments.contains_key(&p.name));

        let (failed, message) = if missing {
            (true, "Missing parameter.".to_string())
        } else {
            match handler(&request.arguments) {
                Ok(message) => (false, message),
                Err(message) => (true, message),
            }
        };
        debug!(command = %request.name, failed, "CommandRegistry::execute: done");

        if request.transaction_id.is_empty() {
            None
        } else {
            Some(CommandResponse {
                transaction_id: request.transaction_id.clone(),
                failed,
                message,
            })
        }
    }
}

impl RtiClient {
    /// Commands registered on this session
    pub fn commands(&self) -> &CommandRegistry {
        &self.inner.commands
    }

    /// Register a command; the first registration starts answering on the command channels
    pub fn register_command<F>(&self, name: &str, description: &str, parameters: &[&str], handler: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<String, String> + Send + Sync + 'static,
    {
        self.inner.commands.register(name, description, parameters, Arc::new(handler));
        if !self.inner.commands.serving.swap(true, Ordering::SeqCst) {
            self.serve_commands();
        }
    }

    fn serve_commands(&self) {
        let private = naming::identity_scoped(&self.client_id(), channel::COMMANDS);
        for name in [channel::COMMANDS.to_string(), private] {
            let weak = Arc::downgrade(&self.inner);
            self.subscribe(&name, move |channel, message: Commands| {
                let Some(client) = weak.upgrade().map(|inner| RtiClient { inner }) else {
                    return Ok(());
                };
                match message.which {
                    Some(commands::Which::RequestCommands(_)) => client.publish_commands()?,
                    Some(commands::Which::Execute(request)) => {
                        if let Some(response) = client.inner.commands.execute(&request) {
                            client.publish(channel, &Commands::of(commands::Which::Response(response)))?;
                        }
                    }
                    _ => {}
                }
                Ok(())
            });
        }
    }

    /// Announce every registered command on the shared command channel
    pub fn publish_commands(&self) -> RtiResult<()> {
        for definition in self.inner.commands.definitions() {
            self.publish(channel::COMMANDS, &Commands::of(commands::Which::Command(definition)))?;
        }
        Ok(())
    }

    /// Ask peers to announce their commands
    pub fn request_commands(&self) -> RtiResult<()> {
        self.publish(channel::COMMANDS, &Commands::of(commands::Which::RequestCommands(Empty {})))
    }

    /// Publish an execute envelope, optionally waiting for the matching response
    ///
    /// With `wait`, a transaction id is allocated when none was given and the
    /// response channel is subscribed for the duration of the wait. `Ok(None)`
    /// means no response arrived in time, or `wait` was not requested.
    pub async fn execute_command(&self, request: CommandRequest) -> RtiResult<Option<CommandResponse>> {
        let channel = request.channel();
        let transaction_id = match (&request.transaction_id, request.wait) {
            (Some(id), _) => id.clone(),
            (None, true) => uuid::Uuid::new_v4().to_string(),
            (None, false) => String::new(),
        };
        debug!(command = %request.name, %channel, %transaction_id, wait = request.wait, "RtiClient::execute_command: called");

        let message = Commands::of(commands::Which::Execute(ExecuteCommand {
            name: request.name.clone(),
            arguments: request.arguments.clone(),
            transaction_id: transaction_id.clone(),
        }));

        if !request.wait {
            self.publish(&channel, &message)?;
            return Ok(None);
        }

        let response: Arc<Mutex<Option<CommandResponse>>> = Arc::new(Mutex::new(None));
        let slot = response.clone();
        let expected = transaction_id.clone();
        let subscription = self.subscribe(&channel, move |_, message: Commands| {
            if let Some(commands::Which::Response(r)) = message.which
                && r.transaction_id == expected
            {
                *slot.lock() = Some(r);
            }
            Ok(())
        });

        if let Err(e) = self.publish(&channel, &message) {
            self.unsubscribe(&subscription);
            return Err(e);
        }

        let deadline = tokio::time::Instant::now() + request.timeout;
        let result = loop {
            if let Some(r) = response.lock().take() {
                break Some(r);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(command = %request.name, %transaction_id, "No command response before timeout");
                break None;
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        };
        self.unsubscribe(&subscription);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::proto;

    #[test]
    fn test_request_channel_scoping() {
        assert_eq!(CommandRequest::new("go").channel(), "rti/commands");
        assert_eq!(CommandRequest::new("go").to_entity("tank-1").channel(), "rti/commands/tank-1");
        assert_eq!(CommandRequest::new("go").to_client("abc").channel(), "@abc:rti/commands");
        assert_eq!(
            CommandRequest::new("go").to_client("abc").to_entity("e").channel(),
            "@abc:rti/commands/e"
        );
    }

    #[test]
    fn test_registry_missing_parameter() {
        let registry = CommandRegistry::default();
        registry.register("spawn", "Spawn an entity", &["kind"], Arc::new(|_: &HashMap<String, String>| Ok("spawned".to_string())));

        let response = registry
            .execute(&ExecuteCommand {
                name: "spawn".to_string(),
                arguments: HashMap::new(),
                transaction_id: "t1".to_string(),
            })
            .unwrap();
        assert!(response.failed);
        assert_eq!(response.message, "Missing parameter.");

        let response = registry
            .execute(&ExecuteCommand {
                name: "spawn".to_string(),
                arguments: HashMap::from([("kind".to_string(), "tank".to_string())]),
                transaction_id: "t2".to_string(),
            })
            .unwrap();
        assert!(!response.failed);
        assert_eq!(response.message, "spawned");
        assert_eq!(response.transaction_id, "t2");
    }

    #[test]
    fn test_registry_without_transaction_runs_silently() {
        let registry = CommandRegistry::default();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        registry.register(
            "ping",
            "",
            &[],
            Arc::new(move |_: &HashMap<String, String>| {
                flag.store(true, Ordering::SeqCst);
                Err("nope".to_string())
            }),
        );
        let response = registry.execute(&ExecuteCommand {
            name: "ping".to_string(),
            ..Default::default()
        });
        assert!(response.is_none());
        assert!(ran.load(Ordering::SeqCst));
        assert!(
            registry
                .execute(&ExecuteCommand {
                    name: "unknown".to_string(),
                    transaction_id: "t".to_string(),
                    ..Default::default()
                })
                .is_none()
        );
    }

    #[test]
    fn test_registries_are_per_session() {
        let a = RtiClient::new(config("A"));
        let b = RtiClient::new(config("B"));
        a.register_command("only-a", "", &[], |_| Ok(String::new()));
        assert!(a.commands().contains("only-a"));
        assert!(!b.commands().contains("only-a"));
    }

    #[test]
    fn test_registered_command_answers_on_arrival_channel() {
        let client = RtiClient::new(config("Sim"));
        let mut wire = attach(&client);
        client.register_command("reset", "Reset the world", &[], |_| Ok("done".to_string()));
        wire.frames();

        let execute = Commands::of(commands::Which::Execute(ExecuteCommand {
            name: "reset".to_string(),
            arguments: HashMap::new(),
            transaction_id: "tx-1".to_string(),
        }));
        deliver_proto(&client, "@sim-id:rti/commands", &execute);

        let published = wire.published();
        let (channel, content) = published
            .iter()
            .find(|(c, _)| c == "@sim-id:rti/commands")
            .expect("response on private channel");
        assert_eq!(channel, "@sim-id:rti/commands");
        let reply: Commands = proto::decode(content).unwrap();
        match reply.which {
            Some(commands::Which::Response(r)) => {
                assert_eq!(r.transaction_id, "tx-1");
                assert!(!r.failed);
                assert_eq!(r.message, "done");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_wait_times_out() {
        let client = RtiClient::new(config("Ctl"));
        let mut wire = attach(&client);
        wire.frames();

        let started = tokio::time::Instant::now();
        let result = client
            .execute_command(CommandRequest::new("noop").wait_for_response(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(client.handler_count("rti/commands"), 0);
    }

    #[tokio::test]
    async fn test_execute_wait_returns_matching_response() {
        let client = RtiClient::new(config("Ctl"));
        let mut wire = attach(&client);
        wire.frames();

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .execute_command(
                        CommandRequest::new("status")
                            .to_entity("e1")
                            .with_transaction("tx-9")
                            .wait_for_response(Duration::from_secs(5)),
                    )
                    .await
            }
        });
        loop {
            tokio::task::yield_now().await;
            if wire.published().iter().any(|(c, _)| c == "rti/commands/e1") {
                break;
            }
        }
        let other = Commands::of(commands::Which::Response(CommandResponse {
            transaction_id: "someone-else".to_string(),
            ..Default::default()
        }));
        deliver_proto(&client, "rti/commands/e1", &other);
        let ours = Commands::of(commands::Which::Response(CommandResponse {
            transaction_id: "tx-9".to_string(),
            failed: false,
            message: "ok".to_string(),
        }));
        deliver_proto(&client, "rti/commands/e1", &ours);

        let response = call.await.unwrap().unwrap().unwrap();
        assert_eq!(response.transaction_id, "tx-9");
        assert_eq!(response.message, "ok");
    }
}
