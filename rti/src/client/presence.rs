//! Presence records, directory enumeration and client status messages

use std::sync::Arc;

use tracing::{debug, warn};

use super::RtiClient;
use crate::constants::{VERSION, channel};
use crate::error::RtiResult;
use crate::proto::{
    ChannelUsage, Channels, Client, ClientHeartbeat, ClientProgress, ClientValue, Clients, Empty, Measures,
    ParticipantRegistration, RuntimeControl, RuntimeError, RuntimeState, channels, clients, measures,
    runtime_control,
};

impl RtiClient {
    /// Subscribe the directory channels every client listens on
    pub(super) fn subscribe_directory(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.subscribe(channel::CLIENTS, move |_, message: Clients| {
            if let Some(client) = weak.upgrade().map(|inner| RtiClient { inner }) {
                client.handle_clients(message);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.inner);
        self.subscribe(channel::CHANNELS, move |_, message: Channels| {
            if let Some(client) = weak.upgrade().map(|inner| RtiClient { inner }) {
                client.handle_channels(message);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.inner);
        self.subscribe(channel::MEASURES, move |_, message: Measures| {
            if let Some(client) = weak.upgrade().map(|inner| RtiClient { inner }) {
                client.handle_measures(message);
            }
            Ok(())
        });
    }

    fn handle_clients(&self, message: Clients) {
        match message.which {
            Some(clients::Which::RequestClients(_)) => {
                if !self.inner.incognito {
                    self.publish_client();
                }
            }
            Some(clients::Which::Client(record)) => {
                self.inner.directory.write().known_clients.insert(record.id.clone(), record);
            }
            Some(clients::Which::RegisterParticipant(registration)) => {
                if self.registration_applies(&registration) {
                    debug!(participant = %registration.participant, role = %registration.role, "Participant assigned by peer");
                    self.register_participant(
                        &registration.participant,
                        &registration.role,
                        &registration.full_name,
                    );
                }
            }
            _ => {}
        }
    }

    /// A directive applies when every non-empty selector matches and it changes something
    fn registration_applies(&self, registration: &ParticipantRegistration) -> bool {
        let identity = self.inner.identity.read();
        let matches = |selector: &str, value: Option<&str>| selector.is_empty() || Some(selector) == value;
        matches(&registration.client_id, Some(identity.client_id.as_str()))
            && matches(&registration.host, identity.host.as_deref())
            && matches(&registration.station, identity.station.as_deref())
            && (Some(registration.participant.as_str()) != identity.participant.as_deref()
                || Some(registration.role.as_str()) != identity.role.as_deref())
    }

    fn handle_channels(&self, message: Channels) {
        match message.which {
            Some(channels::Which::RequestChannelUsage(_)) => {
                if self.inner.incognito {
                    return;
                }
                let usage = ChannelUsage {
                    client_id: self.client_id(),
                    usage: self.inner.directory.read().usage_snapshot(),
                };
                if let Err(e) = self.publish(channel::CHANNELS, &Channels::of(channels::Which::ChannelUsage(usage))) {
                    warn!(error = %e, "Failed to answer channel usage request");
                }
            }
            Some(channels::Which::ChannelUsage(usage)) => {
                let mut directory = self.inner.directory.write();
                for channel in usage.usage.iter().filter_map(|u| u.channel.as_ref()) {
                    directory.discover_channel(channel);
                }
            }
            Some(channels::Which::Channel(channel)) => {
                self.inner.directory.write().discover_channel(&channel);
            }
            None => {}
        }
    }

    fn handle_measures(&self, message: Measures) {
        match message.which {
            Some(measures::Which::RequestMeasures(_)) => {
                if !self.inner.incognito {
                    self.publish_measures();
                }
            }
            Some(measures::Which::Measure(measure)) => {
                self.inner
                    .directory
                    .write()
                    .known_measures
                    .insert(measure.id.clone(), measure);
            }
            None => {}
        }
    }

    /// Presence record describing this client
    pub fn client_record(&self) -> Client {
        let identity = self.inner.identity.read();
        let mut record = Client {
            id: identity.client_id.clone(),
            application: identity.application.clone(),
            application_version: identity.application_version.clone().unwrap_or_default(),
            engine_version: identity.engine_version.clone().unwrap_or_default(),
            integration_version: identity.integration_version.clone().unwrap_or_default(),
            client_library_version: VERSION.to_string(),
            host: identity.host.clone().unwrap_or_default(),
            station: identity.station.clone().unwrap_or_default(),
            user: identity.user.clone().unwrap_or_default(),
            participant: identity.participant.clone().unwrap_or_default(),
            role: identity.role.clone().unwrap_or_default(),
            full_name: identity.full_name.clone().unwrap_or_default(),
            capabilities: identity.capabilities.clone(),
            ..Default::default()
        };
        record.set_state(self.state());
        record
    }

    pub(super) fn publish_client(&self) {
        let record = self.client_record();
        if let Err(e) = self.publish(channel::CLIENTS, &Clients::of(clients::Which::Client(record))) {
            warn!(error = %e, "Failed to publish presence");
        }
    }

    pub(super) fn publish_measures(&self) {
        let used: Vec<_> = self.inner.directory.read().used_measures.values().cloned().collect();
        for measure in used {
            if let Err(e) = self.publish(channel::MEASURES, &Measures::of(measures::Which::Measure(measure))) {
                warn!(error = %e, "Failed to publish measure");
            }
        }
    }

    /// Take on a participant and role, announcing the change when connected
    pub fn register_participant(&self, participant: &str, role: &str, full_name: &str) {
        debug!(%participant, %role, "RtiClient::register_participant: called");
        {
            let mut identity = self.inner.identity.write();
            identity.participant = Some(participant.to_string()).filter(|s| !s.is_empty());
            identity.role = Some(role.to_string()).filter(|s| !s.is_empty());
            identity.full_name = Some(full_name.to_string()).filter(|s| !s.is_empty());
        }
        if self.is_connected() && !self.inner.incognito {
            self.publish_client();
        }
    }

    /// Ask matching peers to take on a participant and role
    pub fn assign_participant(&self, registration: ParticipantRegistration) -> RtiResult<()> {
        self.publish(
            channel::CLIENTS,
            &Clients::of(clients::Which::RegisterParticipant(registration)),
        )
    }

    pub fn request_clients(&self) -> RtiResult<()> {
        debug!("RtiClient::request_clients: called");
        self.publish(channel::CLIENTS, &Clients::of(clients::Which::RequestClients(Empty {})))
    }

    pub fn request_channels(&self) -> RtiResult<()> {
        debug!("RtiClient::request_channels: called");
        self.publish(
            channel::CHANNELS,
            &Channels::of(channels::Which::RequestChannelUsage(Empty {})),
        )
    }

    pub fn request_measures(&self) -> RtiResult<()> {
        debug!("RtiClient::request_measures: called");
        self.publish(channel::MEASURES, &Measures::of(measures::Which::RequestMeasures(Empty {})))
    }

    /// Report an error on the control channel, optionally with the state it left us in
    pub fn publish_error(&self, message: &str, state: Option<RuntimeState>) -> RtiResult<()> {
        let error = RuntimeError {
            client_id: self.client_id(),
            message: message.to_string(),
            state: state.map(|s| s as i32),
        };
        self.publish(channel::CONTROL, &RuntimeControl::of(runtime_control::Which::Error(error)))
    }

    pub fn publish_heartbeat(&self) -> RtiResult<()> {
        let heartbeat = ClientHeartbeat {
            client_id: self.client_id(),
        };
        self.publish(channel::CLIENTS, &Clients::of(clients::Which::Heartbeat(heartbeat)))
    }

    /// Report progress in percent; values above 100 are clamped
    pub fn publish_progress(&self, progress: u32) -> RtiResult<()> {
        let progress = ClientProgress {
            client_id: self.client_id(),
            progress: progress.min(100),
        };
        self.publish(channel::CLIENTS, &Clients::of(clients::Which::Progress(progress)))
    }

    pub fn publish_value(&self, value: impl ToString, highlight: bool, error: bool) -> RtiResult<()> {
        let value = ClientValue {
            client_id: self.client_id(),
            value: value.to_string(),
            highlight,
            error,
        };
        self.publish(channel::CLIENTS, &Clients::of(clients::Which::Value(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::ClientConfig;
    use crate::proto::{self, Channel, ChannelUse, Measure};

    fn peer(id: &str, application: &str, state: RuntimeState) -> Client {
        let mut record = Client {
            id: id.to_string(),
            application: application.to_string(),
            ..Default::default()
        };
        record.set_state(state);
        record
    }

    #[test]
    fn test_peer_presence_enters_directory() {
        let client = RtiClient::new(config("Viewer"));
        let _wire = attach(&client);
        deliver_proto(
            &client,
            channel::CLIENTS,
            &Clients::of(clients::Which::Client(peer("p1", "Sim", RuntimeState::Running))),
        );
        let known = client.known_clients();
        assert_eq!(known["p1"].state(), RuntimeState::Running);
        assert_eq!(client.clients_by_application("sim").len(), 1);
    }

    #[test]
    fn test_enumeration_request_answered() {
        let client = RtiClient::new(config("Viewer"));
        let mut wire = attach(&client);
        wire.frames();
        deliver_proto(&client, channel::CLIENTS, &Clients::of(clients::Which::RequestClients(Empty {})));
        let presence: Vec<Clients> = wire.published_on(channel::CLIENTS);
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn test_incognito_never_announces() {
        let client = RtiClient::new(ClientConfig {
            incognito: true,
            ..config("Spy")
        });
        let mut wire = attach(&client);
        assert!(client.is_connected());

        client.set_state(RuntimeState::Running);
        client.register_measure(Measure::new("fps"));
        client.register_channel(Channel::named("explicit"));
        deliver_proto(&client, channel::CLIENTS, &Clients::of(clients::Which::RequestClients(Empty {})));
        deliver_proto(
            &client,
            channel::CHANNELS,
            &Channels::of(channels::Which::RequestChannelUsage(Empty {})),
        );
        deliver_proto(
            &client,
            channel::MEASURES,
            &Measures::of(measures::Which::RequestMeasures(Empty {})),
        );
        deliver_proto(
            &client,
            channel::CLIENTS,
            &Clients::of(clients::Which::RegisterParticipant(ParticipantRegistration {
                participant: "alpha".to_string(),
                ..Default::default()
            })),
        );

        let published = wire.published();
        assert!(published.is_empty(), "incognito client published {:?}", published);
    }

    #[test]
    fn test_channel_usage_snapshot_merges() {
        let client = RtiClient::new(config("Viewer"));
        let _wire = attach(&client);
        let usage = ChannelUsage {
            client_id: "p1".to_string(),
            usage: vec![ChannelUse {
                channel: Some(Channel {
                    data_type: "json".to_string(),
                    ephemeral: true,
                    ..Channel::named("scores")
                }),
                publish: true,
                subscribe: false,
            }],
        };
        deliver_proto(&client, channel::CHANNELS, &Channels::of(channels::Which::ChannelUsage(usage)));
        deliver_proto(
            &client,
            channel::CHANNELS,
            &Channels::of(channels::Which::Channel(Channel {
                data_type: "text".to_string(),
                state: true,
                ..Channel::named("scores")
            })),
        );
        let known = &client.known_channels()["scores"];
        assert_eq!(known.data_type, "json");
        assert!(known.ephemeral);
        assert!(known.state);
    }

    #[test]
    fn test_channel_usage_request_answered() {
        let client = RtiClient::new(config("Viewer"));
        let mut wire = attach(&client);
        client.subscribe_text("chat", |_, _| Ok(()));
        wire.frames();
        deliver_proto(
            &client,
            channel::CHANNELS,
            &Channels::of(channels::Which::RequestChannelUsage(Empty {})),
        );
        let replies: Vec<Channels> = wire.published_on(channel::CHANNELS);
        let usage = replies
            .into_iter()
            .find_map(|c| match c.which {
                Some(channels::Which::ChannelUsage(u)) => Some(u),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.client_id, "viewer-id");
        assert!(usage.usage.iter().any(|u| u.channel.as_ref().map(|c| c.name.as_str()) == Some("chat")));
    }

    #[test]
    fn test_register_participant_directive_matching() {
        let client = RtiClient::new(ClientConfig {
            station: Some("bridge".to_string()),
            ..config("Viewer")
        });
        let mut wire = attach(&client);
        wire.frames();

        let directive = |client_id: &str, host: &str, station: &str| {
            Clients::of(clients::Which::RegisterParticipant(ParticipantRegistration {
                client_id: client_id.to_string(),
                host: host.to_string(),
                station: station.to_string(),
                participant: "alpha".to_string(),
                role: "pilot".to_string(),
                full_name: "Alpha One".to_string(),
            }))
        };

        deliver_proto(&client, channel::CLIENTS, &directive("someone-else", "", ""));
        assert_eq!(client.identity().participant, None);

        deliver_proto(&client, channel::CLIENTS, &directive("", "other-host", ""));
        assert_eq!(client.identity().participant, None);

        deliver_proto(&client, channel::CLIENTS, &directive("", "test-host", "bridge"));
        let identity = client.identity();
        assert_eq!(identity.participant.as_deref(), Some("alpha"));
        assert_eq!(identity.role.as_deref(), Some("pilot"));
        assert_eq!(identity.full_name.as_deref(), Some("Alpha One"));

        let presence: Vec<Clients> = wire.published_on(channel::CLIENTS);
        let announced = presence.iter().filter(|c| matches!(&c.which, Some(clients::Which::Client(_)))).count();
        assert_eq!(announced, 1);

        deliver_proto(&client, channel::CLIENTS, &directive("viewer-id", "", ""));
        let presence: Vec<Clients> = wire.published_on(channel::CLIENTS);
        assert!(presence.iter().all(|c| !matches!(&c.which, Some(clients::Which::Client(_)))));
    }

    #[test]
    fn test_status_messages() {
        let client = RtiClient::new(config("Viewer"));
        let mut wire = attach(&client);
        wire.frames();

        client.publish_heartbeat().unwrap();
        client.publish_progress(150).unwrap();
        client.publish_value(3.5, true, false).unwrap();
        client.publish_error("broken", Some(RuntimeState::Stopped)).unwrap();

        let published = wire.published();
        let on_clients: Vec<Clients> = published
            .iter()
            .filter(|(c, _)| c == channel::CLIENTS)
            .filter_map(|(_, content)| proto::decode(content).ok())
            .collect();
        assert!(matches!(on_clients[0].which, Some(clients::Which::Heartbeat(_))));
        match &on_clients[1].which {
            Some(clients::Which::Progress(p)) => assert_eq!(p.progress, 100),
            other => panic!("unexpected {:?}", other),
        }
        match &on_clients[2].which {
            Some(clients::Which::Value(v)) => {
                assert_eq!(v.value, "3.5");
                assert!(v.highlight);
            }
            other => panic!("unexpected {:?}", other),
        }
        let control: Vec<RuntimeControl> = published
            .iter()
            .filter(|(c, _)| c == channel::CONTROL)
            .filter_map(|(_, content)| proto::decode(content).ok())
            .collect();
        match &control[0].which {
            Some(runtime_control::Which::Error(e)) => {
                assert_eq!(e.message, "broken");
                assert_eq!(e.state, Some(RuntimeState::Stopped as i32));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
