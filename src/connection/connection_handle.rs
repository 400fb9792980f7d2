//! Connection task and its handle
//!
//! The task owns the `connected` flag, the active session and the pending
//! toggle. Everything that takes time (credential resolution, connect delay,
//! disconnect) runs on helper tasks which report back as [`TaskEvent`]s tagged
//! with the attempt that started them; events from superseded attempts are
//! dropped. A teardown aborts a resolution still in flight, so it cannot
//! persist a credential or start a second resolution behind the teardown.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bootstrapper::{
    BootstrapSettings, CredentialResolver, CredentialSources, STATUS_PROVISIONING_FAILED,
};
use super::{connected_status_line, BootstrapError, ConnectionSnapshot, Surface};
use crate::mqtt::{ConnectRequest, ConnectionStatus, MqttSession, SessionError};
use crate::persistence::{clear_credential, Credential};

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;
const STATUS_BUFFER: usize = 16;

const STATUS_DISCONNECTING: &str = "Disconnecting...";
const STATUS_DISCONNECTED: &str = "Disconnected";
const STATUS_FORGOTTEN: &str = "Stored certificate removed";

/// Result of a completed toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Connected {
        certificate_id: String,
        client_id: String,
    },
    Disconnected,
}

type ToggleReply = oneshot::Sender<Result<ToggleOutcome, BootstrapError>>;

#[derive(Debug)]
enum ConnectionCommand {
    Toggle {
        response_tx: ToggleReply,
    },
    Disconnect {
        response_tx: oneshot::Sender<ConnectionSnapshot>,
    },
    Forget {
        response_tx: oneshot::Sender<Result<(), BootstrapError>>,
    },
}

#[derive(Debug)]
enum TaskEvent {
    Progress {
        attempt: u64,
        line: String,
    },
    CredentialResolved {
        attempt: u64,
        result: Result<Credential, BootstrapError>,
    },
    SessionStatus {
        client_id: String,
        status: ConnectionStatus,
    },
    DisconnectFinished {
        attempt: u64,
        result: Result<(), SessionError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Resolving,
    Connecting,
    Disconnecting,
}

struct ActiveSession {
    client_id: String,
    certificate_id: String,
}

struct ConnectionTask {
    command_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<TaskEvent>,
    event_rx: mpsc::Receiver<TaskEvent>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    sources: CredentialSources,
    settings: BootstrapSettings,
    session: Arc<dyn MqttSession>,
    attempt: u64,
    phase: Phase,
    connected: bool,
    status: ConnectionStatus,
    status_line: String,
    active: Option<ActiveSession>,
    pending: Option<ToggleReply>,
    resolution: Option<JoinHandle<()>>,
}

impl ConnectionTask {
    async fn run(mut self) {
        info!("Connection task started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
            }
        }

        if let Some(resolution) = self.resolution.take() {
            resolution.abort();
        }
        if self.active.is_some() {
            if let Err(e) = self.session.disconnect().await {
                warn!("Failed to disconnect on shutdown: {}", e);
            }
        }
        info!("Connection task stopped");
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connected: self.connected,
            status: self.status,
            client_id: self.active.as_ref().map(|a| a.client_id.clone()),
            certificate_id: self.active.as_ref().map(|a| a.certificate_id.clone()),
            surface: if self.connected {
                Surface::Connected
            } else {
                Surface::PreConnect
            },
            status_line: self.status_line.clone(),
            busy: self.phase != Phase::Idle,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn set_status_line(&mut self, line: impl Into<String>) {
        self.status_line = line.into();
        self.publish();
    }

    fn finish_toggle(&mut self, result: Result<ToggleOutcome, BootstrapError>) {
        self.phase = Phase::Idle;
        self.publish();
        if let Some(reply) = self.pending.take() {
            if reply.send(result).is_err() {
                debug!("Toggle caller went away before completion");
            }
        }
    }

    fn reset_to_pre_connect(&mut self, line: &str) {
        self.connected = false;
        self.active = None;
        self.status = ConnectionStatus::Disconnected;
        self.status_line = line.to_string();
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Toggle { response_tx } => {
                if self.phase != Phase::Idle {
                    debug!("Toggle rejected, {:?} in progress", self.phase);
                    let _ = response_tx.send(Err(BootstrapError::Busy));
                    return;
                }
                self.pending = Some(response_tx);
                if self.connected {
                    self.start_disconnect();
                } else {
                    self.start_resolution();
                }
            }
            ConnectionCommand::Disconnect { response_tx } => {
                self.teardown().await;
                let _ = response_tx.send(self.snapshot());
            }
            ConnectionCommand::Forget { response_tx } => {
                let result = self.forget().await;
                let _ = response_tx.send(result);
            }
        }
    }

    async fn handle_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Progress { attempt, line } if attempt == self.attempt => {
                self.set_status_line(line);
            }
            TaskEvent::CredentialResolved { attempt, result }
                if attempt == self.attempt && self.phase == Phase::Resolving =>
            {
                self.resolution = None;
                match result {
                    Ok(credential) => self.connect(credential).await,
                    Err(e) => {
                        error!("Bootstrap failed: {}", e);
                        self.status_line = match e {
                            BootstrapError::ProvisioningFailed(_) => {
                                STATUS_PROVISIONING_FAILED.to_string()
                            }
                            _ => e.to_string(),
                        };
                        self.finish_toggle(Err(e));
                    }
                }
            }
            TaskEvent::SessionStatus { client_id, status } => {
                self.on_session_status(client_id, status);
            }
            TaskEvent::DisconnectFinished { attempt, result }
                if attempt == self.attempt && self.phase == Phase::Disconnecting =>
            {
                if let Err(e) = result {
                    warn!("Disconnect reported an error: {}", e);
                }
                self.reset_to_pre_connect(STATUS_DISCONNECTED);
                self.finish_toggle(Ok(ToggleOutcome::Disconnected));
            }
            stale => debug!("Ignoring superseded event {:?}", stale),
        }
    }

    fn start_resolution(&mut self) {
        self.attempt += 1;
        self.phase = Phase::Resolving;
        self.publish();

        let attempt = self.attempt;
        let events = self.event_tx.clone();
        let sources = self.sources.clone();
        let settings = self.settings.clone();

        self.resolution = Some(tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::channel(8);
            let resolution = CredentialResolver::create(sources, settings, progress_tx).resolve();
            tokio::pin!(resolution);

            let result = loop {
                tokio::select! {
                    biased;
                    Some(line) = progress_rx.recv() => {
                        let _ = events.send(TaskEvent::Progress { attempt, line }).await;
                    }
                    result = &mut resolution => break result,
                }
            };
            while let Ok(line) = progress_rx.try_recv() {
                let _ = events.send(TaskEvent::Progress { attempt, line }).await;
            }
            let _ = events
                .send(TaskEvent::CredentialResolved { attempt, result })
                .await;
        }));
    }

    async fn connect(&mut self, credential: Credential) {
        let client_id = Uuid::new_v4().to_string();
        let request = ConnectRequest {
            client_id: client_id.clone(),
            clean_session: true,
            certificate_id: credential.certificate_id.clone(),
        };

        let (status_tx, mut status_rx) = mpsc::channel(STATUS_BUFFER);
        let events = self.event_tx.clone();
        let tagged_id = client_id.clone();
        tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                let event = TaskEvent::SessionStatus {
                    client_id: tagged_id.clone(),
                    status,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        info!(client_id = %client_id, "Connecting with certificate {}", credential.certificate_id);
        self.active = Some(ActiveSession {
            client_id,
            certificate_id: credential.certificate_id,
        });
        self.phase = Phase::Connecting;
        self.status = ConnectionStatus::Connecting;
        self.set_status_line(ConnectionStatus::Connecting.to_string());

        if let Err(e) = self.session.connect(request, status_tx).await {
            error!("Failed to start connection: {}", e);
            self.active = None;
            self.status = ConnectionStatus::ConnectionError;
            self.status_line = e.to_string();
            self.finish_toggle(Err(BootstrapError::Session(e)));
        }
    }

    fn on_session_status(&mut self, client_id: String, status: ConnectionStatus) {
        let certificate_id = match self.active.as_ref() {
            Some(active) if active.client_id == client_id => active.certificate_id.clone(),
            Some(_) => {
                debug!("Ignoring status {} from stale client {}", status, client_id);
                return;
            }
            None => {
                debug!("Status {} for {} without active session", status, client_id);
                return;
            }
        };

        self.status = status;
        match status {
            ConnectionStatus::Idle => {}
            ConnectionStatus::Connecting => self.set_status_line(status.to_string()),
            ConnectionStatus::Connected => {
                if self.phase != Phase::Connecting {
                    self.publish();
                    return;
                }
                self.connected = true;
                info!("Connected as {}", client_id);
                self.status_line = connected_status_line(&certificate_id, &client_id);
                let outcome = ToggleOutcome::Connected {
                    certificate_id,
                    client_id,
                };
                self.finish_toggle(Ok(outcome));
            }
            ConnectionStatus::Disconnected
            | ConnectionStatus::Refused
            | ConnectionStatus::ConnectionError
            | ConnectionStatus::ProtocolError => match self.phase {
                Phase::Connecting => {
                    warn!("Connect attempt ended with {}", status);
                    self.connected = false;
                    self.active = None;
                    self.status_line = status.to_string();
                    self.finish_toggle(Err(BootstrapError::from_status(status)));
                }
                Phase::Disconnecting => self.publish(),
                Phase::Idle | Phase::Resolving => {
                    warn!("Connection lost: {}", status);
                    self.reset_to_pre_connect(&status.to_string());
                    self.status = status;
                    self.publish();
                }
            },
        }
    }

    fn start_disconnect(&mut self) {
        self.attempt += 1;
        self.phase = Phase::Disconnecting;
        self.set_status_line(STATUS_DISCONNECTING);

        let attempt = self.attempt;
        let events = self.event_tx.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            let result = session.disconnect().await;
            let _ = events
                .send(TaskEvent::DisconnectFinished { attempt, result })
                .await;
        });
    }

    /// Drops the stored credential so the next connect bootstraps again.
    /// Only allowed while idle and disconnected.
    async fn forget(&mut self) -> Result<(), BootstrapError> {
        if self.phase != Phase::Idle || self.connected {
            return Err(BootstrapError::Busy);
        }
        clear_credential(self.sources.store.as_ref()).await?;
        info!("Stored credential cleared");
        self.set_status_line(STATUS_FORGOTTEN);
        Ok(())
    }

    /// Unconditional teardown. Supersedes whatever toggle is in flight.
    async fn teardown(&mut self) {
        self.attempt += 1;
        if let Some(resolution) = self.resolution.take() {
            if !resolution.is_finished() {
                info!("Cancelling credential resolution");
                resolution.abort();
            }
        }
        if self.active.is_some() || self.phase == Phase::Disconnecting {
            info!("Tearing down connection");
            if let Err(e) = self.session.disconnect().await {
                warn!("Disconnect reported an error: {}", e);
            }
        }
        self.reset_to_pre_connect(STATUS_DISCONNECTED);
        self.finish_toggle(Ok(ToggleOutcome::Disconnected));
    }
}

/// Cloneable entry point to the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// Spawns the connection task. It runs until every handle is dropped.
    pub fn spawn(
        sources: CredentialSources,
        settings: BootstrapSettings,
        session: Arc<dyn MqttSession>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let task = ConnectionTask {
            command_rx,
            event_tx,
            event_rx,
            snapshot_tx,
            sources,
            settings,
            session,
            attempt: 0,
            phase: Phase::Idle,
            connected: false,
            status: ConnectionStatus::Idle,
            status_line: String::new(),
            active: None,
            pending: None,
            resolution: None,
        };
        tokio::spawn(task.run());

        Self {
            command_tx,
            snapshot_rx,
        }
    }

    /// Connects when disconnected, disconnects when connected. Completes once
    /// the toggle reached a terminal state.
    pub async fn toggle(&self) -> Result<ToggleOutcome, BootstrapError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Toggle { response_tx })
            .await
            .map_err(|_| BootstrapError::ChannelClosed)?;
        response_rx.await.map_err(|_| BootstrapError::ChannelClosed)?
    }

    /// Tears the connection down regardless of its state and returns the
    /// resulting pre-connect snapshot.
    pub async fn disconnect(&self) -> Result<ConnectionSnapshot, BootstrapError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Disconnect { response_tx })
            .await
            .map_err(|_| BootstrapError::ChannelClosed)?;
        response_rx.await.map_err(|_| BootstrapError::ChannelClosed)
    }

    /// Removes the stored credential. Fails with [`BootstrapError::Busy`]
    /// unless the connection is idle and disconnected.
    pub async fn forget_credential(&self) -> Result<(), BootstrapError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Forget { response_tx })
            .await
            .map_err(|_| BootstrapError::ChannelClosed)?;
        response_rx.await.map_err(|_| BootstrapError::ChannelClosed)?
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisioningConfig;
    use crate::mqtt::MockMqttSession;
    use crate::persistence::identity_vault::tests::sample_identity;
    use crate::persistence::{
        load_credential, persist_credential, FileCredentialStore, FileIdentityVault,
    };
    use crate::provisioning::{
        IssuedCertificate, MockProvisioningService, ProvisioningRequest,
    };
    use mockall::Sequence;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    type Connects = Arc<StdMutex<Vec<(ConnectRequest, mpsc::Sender<ConnectionStatus>)>>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(dir: &TempDir) -> BootstrapSettings {
        BootstrapSettings {
            bundle_dir: dir.path().join("bundle"),
            bundle_extension: "pem".to_string(),
            request: ProvisioningRequest::from(&ProvisioningConfig::default()),
            policy_name: "IoTDemoPolicy".to_string(),
            connect_delay: Duration::ZERO,
        }
    }

    fn sources(dir: &TempDir, provisioning: MockProvisioningService) -> CredentialSources {
        CredentialSources {
            store: Arc::new(FileCredentialStore::in_dir(dir.path())),
            vault: Arc::new(FileIdentityVault::in_dir(dir.path())),
            provisioning: Arc::new(provisioning),
        }
    }

    async fn with_stored_credential(dir: &TempDir) {
        let store = FileCredentialStore::in_dir(dir.path());
        persist_credential(&store, &Credential::issued("stored-cert", "arn:stored"))
            .await
            .unwrap();
    }

    fn no_provisioning() -> MockProvisioningService {
        let mut provisioning = MockProvisioningService::new();
        provisioning.expect_issue_certificate().never();
        provisioning
    }

    /// Session mock that records each connect and answers with `reply`, if any.
    fn recording_session(
        session: &mut MockMqttSession,
        reply: Option<ConnectionStatus>,
    ) -> Connects {
        let connects: Connects = Arc::new(StdMutex::new(Vec::new()));
        let recorded = connects.clone();
        session.expect_connect().returning(move |request, status_tx| {
            if let Some(status) = reply {
                status_tx.try_send(status).unwrap();
            }
            recorded.lock().unwrap().push((request, status_tx));
            Ok(())
        });
        connects
    }

    async fn wait_for(
        handle: &ConnectionHandle,
        condition: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> ConnectionSnapshot {
        let mut rx = handle.subscribe();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(condition))
            .await
            .unwrap()
            .unwrap()
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn first_connect_provisions_before_connecting() {
        let dir = TempDir::new().unwrap();
        let mut seq = Sequence::new();

        let mut provisioning = MockProvisioningService::new();
        provisioning
            .expect_issue_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let (certificate_pem, private_key_pem) = sample_identity();
                Ok(IssuedCertificate {
                    certificate_id: "issued-cert".to_string(),
                    certificate_arn: "arn:issued".to_string(),
                    certificate_pem,
                    private_key_pem,
                })
            });
        provisioning
            .expect_attach_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut session = MockMqttSession::new();
        session
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|request, status_tx| {
                assert_eq!(request.certificate_id, "issued-cert");
                status_tx.try_send(ConnectionStatus::Connected).unwrap();
                Ok(())
            });

        let handle = ConnectionHandle::spawn(
            sources(&dir, provisioning),
            settings(&dir),
            Arc::new(session),
        );

        let outcome = handle.toggle().await.unwrap();
        let ToggleOutcome::Connected {
            certificate_id,
            client_id,
        } = outcome
        else {
            panic!("expected connected outcome");
        };
        assert_eq!(certificate_id, "issued-cert");

        let snapshot = handle.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.surface, Surface::Connected);
        assert_eq!(
            snapshot.status_line,
            connected_status_line("issued-cert", &client_id)
        );
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn every_connect_uses_a_fresh_client_id() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        let connects = recording_session(&mut session, Some(ConnectionStatus::Connected));
        session.expect_disconnect().times(1).returning(|| Ok(()));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );

        assert!(matches!(
            handle.toggle().await.unwrap(),
            ToggleOutcome::Connected { .. }
        ));
        assert_eq!(handle.toggle().await.unwrap(), ToggleOutcome::Disconnected);
        assert!(matches!(
            handle.toggle().await.unwrap(),
            ToggleOutcome::Connected { .. }
        ));

        let connects = connects.lock().unwrap();
        assert_eq!(connects.len(), 2);
        let (first, second) = (&connects[0].0, &connects[1].0);
        assert_ne!(first.client_id, second.client_id);
        for request in [first, second] {
            assert!(Uuid::parse_str(&request.client_id).is_ok());
            assert!(request.clean_session);
            assert_eq!(request.certificate_id, "stored-cert");
        }
    }

    #[tokio::test]
    async fn toggle_disconnect_restores_pre_connect_surface() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        recording_session(&mut session, Some(ConnectionStatus::Connected));
        session.expect_disconnect().times(1).returning(|| Ok(()));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );
        handle.toggle().await.unwrap();
        handle.toggle().await.unwrap();

        let snapshot = handle.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.surface, Surface::PreConnect);
        assert_eq!(snapshot.client_id, None);
        assert_eq!(snapshot.status_line, STATUS_DISCONNECTED);
    }

    #[tokio::test]
    async fn teardown_during_connect_restores_pre_connect_surface() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        recording_session(&mut session, None);
        session.expect_disconnect().times(1).returning(|| Ok(()));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );
        let toggling = handle.clone();
        let pending = tokio::spawn(async move { toggling.toggle().await });
        wait_for(&handle, |s| s.status == ConnectionStatus::Connecting).await;

        let snapshot = handle.disconnect().await.unwrap();

        assert_eq!(snapshot.surface, Surface::PreConnect);
        assert!(!snapshot.connected);
        assert!(!snapshot.busy);
        assert_eq!(pending.await.unwrap().unwrap(), ToggleOutcome::Disconnected);
    }

    #[tokio::test]
    async fn toggle_while_connecting_is_busy() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        let connects = recording_session(&mut session, None);

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );
        let toggling = handle.clone();
        let pending = tokio::spawn(async move { toggling.toggle().await });
        wait_for(&handle, |s| s.status == ConnectionStatus::Connecting).await;

        assert!(matches!(handle.toggle().await, Err(BootstrapError::Busy)));

        let status_tx = connects.lock().unwrap()[0].1.clone();
        status_tx.send(ConnectionStatus::Connected).await.unwrap();
        assert!(matches!(
            pending.await.unwrap().unwrap(),
            ToggleOutcome::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn refused_connection_stays_disconnected() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        recording_session(&mut session, Some(ConnectionStatus::Refused));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );

        assert!(matches!(
            handle.toggle().await,
            Err(BootstrapError::ConnectionRefused)
        ));
        let snapshot = handle.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.surface, Surface::PreConnect);
        assert_eq!(snapshot.status_line, "Connection Refused");
    }

    #[tokio::test]
    async fn connect_failures_map_to_their_errors() {
        for (status, line) in [
            (ConnectionStatus::ConnectionError, "Connection Error"),
            (ConnectionStatus::ProtocolError, "Protocol Error"),
        ] {
            let dir = TempDir::new().unwrap();
            with_stored_credential(&dir).await;

            let mut session = MockMqttSession::new();
            recording_session(&mut session, Some(status));

            let handle = ConnectionHandle::spawn(
                sources(&dir, no_provisioning()),
                settings(&dir),
                Arc::new(session),
            );

            let result = handle.toggle().await;
            match status {
                ConnectionStatus::ProtocolError => {
                    assert!(matches!(result, Err(BootstrapError::ProtocolError)))
                }
                _ => assert!(matches!(result, Err(BootstrapError::ConnectionError))),
            }
            let snapshot = handle.snapshot();
            assert!(!snapshot.connected);
            assert_eq!(snapshot.surface, Surface::PreConnect);
            assert_eq!(snapshot.status_line, line);
            assert!(!snapshot.busy);
        }
    }

    #[tokio::test]
    async fn teardown_during_provisioning_cancels_resolution() {
        let dir = TempDir::new().unwrap();
        let (attached_tx, mut attached_rx) = mpsc::channel(1);

        let mut provisioning = MockProvisioningService::new();
        provisioning
            .expect_issue_certificate()
            .times(1)
            .returning(|_| {
                let (certificate_pem, private_key_pem) = sample_identity();
                Ok(IssuedCertificate {
                    certificate_id: "issued-cert".to_string(),
                    certificate_arn: "arn:issued".to_string(),
                    certificate_pem,
                    private_key_pem,
                })
            });
        provisioning
            .expect_attach_policy()
            .times(1)
            .returning(move |_, _| {
                let _ = attached_tx.try_send(());
                Ok(())
            });
        let provisioning = Arc::new(provisioning);

        let mut session = MockMqttSession::new();
        session.expect_connect().never();
        session.expect_disconnect().never();

        let mut settings = settings(&dir);
        settings.connect_delay = Duration::from_secs(60);
        let sources = CredentialSources {
            store: Arc::new(FileCredentialStore::in_dir(dir.path())),
            vault: Arc::new(FileIdentityVault::in_dir(dir.path())),
            provisioning: provisioning.clone(),
        };
        let handle = ConnectionHandle::spawn(sources, settings, Arc::new(session));

        let toggling = handle.clone();
        let pending = tokio::spawn(async move { toggling.toggle().await });
        tokio::time::timeout(WAIT, attached_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(handle.snapshot().busy);

        let snapshot = handle.disconnect().await.unwrap();
        assert_eq!(snapshot.surface, Surface::PreConnect);
        assert!(!snapshot.connected);
        assert!(!snapshot.busy);
        assert_eq!(snapshot.status_line, STATUS_DISCONNECTED);
        assert_eq!(pending.await.unwrap().unwrap(), ToggleOutcome::Disconnected);

        // The aborted resolver drops its clone of the sources
        tokio::time::timeout(WAIT, async {
            while Arc::strong_count(&provisioning) > 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lost_connection_returns_to_pre_connect() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        let connects = recording_session(&mut session, Some(ConnectionStatus::Connected));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );
        handle.toggle().await.unwrap();

        let status_tx = connects.lock().unwrap()[0].1.clone();
        status_tx
            .send(ConnectionStatus::ConnectionError)
            .await
            .unwrap();

        let snapshot = wait_for(&handle, |s| !s.connected).await;
        assert_eq!(snapshot.surface, Surface::PreConnect);
        assert_eq!(snapshot.status, ConnectionStatus::ConnectionError);
        assert_eq!(snapshot.status_line, "Connection Error");
    }

    #[tokio::test]
    async fn provisioning_failure_reports_status_line() {
        let dir = TempDir::new().unwrap();
        let mut provisioning = MockProvisioningService::new();
        provisioning.expect_issue_certificate().times(1).returning(|_| {
            Err(crate::provisioning::ProvisioningError::Http(
                "unreachable".to_string(),
            ))
        });
        let mut session = MockMqttSession::new();
        session.expect_connect().never();

        let handle = ConnectionHandle::spawn(
            sources(&dir, provisioning),
            settings(&dir),
            Arc::new(session),
        );

        assert!(matches!(
            handle.toggle().await,
            Err(BootstrapError::ProvisioningFailed(_))
        ));
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status_line, STATUS_PROVISIONING_FAILED);
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn forget_is_refused_while_connected() {
        let dir = TempDir::new().unwrap();
        with_stored_credential(&dir).await;

        let mut session = MockMqttSession::new();
        recording_session(&mut session, Some(ConnectionStatus::Connected));
        session.expect_disconnect().times(1).returning(|| Ok(()));

        let handle = ConnectionHandle::spawn(
            sources(&dir, no_provisioning()),
            settings(&dir),
            Arc::new(session),
        );
        handle.toggle().await.unwrap();
        assert!(matches!(
            handle.forget_credential().await,
            Err(BootstrapError::Busy)
        ));

        handle.toggle().await.unwrap();
        handle.forget_credential().await.unwrap();

        let store = FileCredentialStore::in_dir(dir.path());
        assert_eq!(load_credential(&store).await.unwrap(), None);
        assert_eq!(handle.snapshot().status_line, STATUS_FORGOTTEN);
    }
}
