//! # Connection Lifecycle
//!
//! State machine driving one cloud connection after another:
//!
//! ```text
//! WaitingForClaim → Bootstrapping → Connecting → Connected → Popcorning
//!        ↑                                                        ↓
//!    BackingOff  ←  Disconnecting  ←──────────  Serving  ←────────┘
//! ```
//!
//! Statum verifies at compile time that each step only runs in its state.
//! The machine owns the MQTT client and its event loop; every other thread
//! sees the connection only through the shared atomics. Any failure path
//! funnels into `BackingOff`, which applies the truncated exponential
//! backoff (or a cloud-dictated block) before the next round.

use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::dispatch::router::Dispatcher;
use crate::identity::AgentIdentity;
use crate::net::proxy::{self, ProxyConfig};
use crate::otp::{self, BootstrapError, Encoding, MqttCredentials};
use crate::session::backoff::{Backoff, BackoffParams, DISABLED_RUNTIME_DELAY, PUBACKS_CONN_STABLE};
use crate::session::topics::{TopicCache, TopicId};
use crate::tx;
use crate::LinkShared;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Packet, QoS, Transport,
};

/// Poll slice for the claim-wait and backoff loops; shutdown is observed at
/// this cadence.
const IDLE_SLICE: Duration = Duration::from_millis(250);
/// How often the claim directory is re-read while unclaimed.
const CLAIM_RECHECK: Duration = Duration::from_secs(2);
/// Transport service slice inside the serving loop.
const SERVICE_SLICE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for the final reachable=false PUBACK before force-closing.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Credentials and transport endpoint of the session being established.
/// Rebuilt from a fresh `/env` descriptor on every attempt.
struct SessionAuth {
    creds: MqttCredentials,
    endpoint: String,
}

#[state]
pub enum LinkState {
    WaitingForClaim,
    Bootstrapping,
    Connecting,
    Connected,
    Popcorning,
    Serving,
    Disconnecting,
    BackingOff,
}

#[machine]
pub struct CloudLink<LinkState> {
    shared: Arc<LinkShared>,
    dispatcher: Arc<Dispatcher>,
    backoff: Backoff,
    identity: Option<AgentIdentity>,
    session: Option<SessionAuth>,
    client: Option<AsyncClient>,
    transport: Option<rumqttc::EventLoop>,
}

enum ServiceOutcome {
    /// One transport event was processed.
    Event,
    /// The slice expired without traffic.
    Idle,
    /// The transport reported an error; the connection is gone.
    Error,
}

impl<LinkState> CloudLink<LinkState> {
    /// Drives the transport for at most `slice`, feeding publishes to the
    /// router and PUBACKs to the stability counter.
    async fn service_transport(&mut self, slice: Duration) -> ServiceOutcome {
        let polled = {
            let Some(transport) = self.transport.as_mut() else {
                return ServiceOutcome::Error;
            };
            tokio::time::timeout(slice, transport.poll()).await
        };
        match polled {
            Err(_) => ServiceOutcome::Idle,
            Ok(Err(e)) => {
                warn!("Transport error: {e}");
                ServiceOutcome::Error
            }
            Ok(Ok(event)) => {
                self.on_transport_event(event);
                ServiceOutcome::Event
            }
        }
    }

    fn on_transport_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.dispatcher
                    .handle(&self.shared, &publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::PubAck(_)) => {
                let acked = self.shared.puback_received();
                if acked == PUBACKS_CONN_STABLE {
                    info!("Connection considered stable, backoff reset");
                    self.backoff.reset();
                }
            }
            _ => {
                // pings, subacks and outgoing confirmations are protocol noise
            }
        }
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        match proxy::resolve(&self.shared.config.proxy) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Ignoring unusable proxy configuration: {e}");
                None
            }
        }
    }
}

impl CloudLink<WaitingForClaim> {
    pub fn create(shared: Arc<LinkShared>, dispatcher: Arc<Dispatcher>) -> Self {
        Self::new(
            shared,
            dispatcher,
            Backoff::new(BackoffParams::default()),
            None,
            None,
            None,
            None,
        )
    }

    /// Idles until the agent is claimed and the cloud is enabled. Returns
    /// `None` on shutdown. While the cloud has permanently disabled the
    /// link, this state never exits.
    pub async fn wait_ready(mut self) -> Option<CloudLink<Bootstrapping>> {
        let mut since_check = CLAIM_RECHECK;
        loop {
            if self.shared.shutdown.is_cancelled() {
                return None;
            }
            tokio::time::sleep(IDLE_SLICE).await;
            since_check += IDLE_SLICE;
            if since_check < CLAIM_RECHECK {
                continue;
            }
            since_check = Duration::ZERO;

            if self.shared.is_disabled() {
                continue;
            }
            if self.shared.blocked_remaining().is_some() {
                continue;
            }

            match AgentIdentity::load(
                &self.shared.config.claim_dir,
                self.shared.config.machine_guid,
            ) {
                Ok(Some(identity)) => {
                    self.shared.set_claim_id(identity.claim_id_str());
                    self.identity = Some(identity);
                    return Some(self.transition());
                }
                Ok(None) => {
                    debug!("Agent not claimed yet, waiting");
                }
                Err(e) => {
                    // claimed but unusable key material: nothing to retry
                    // against the network, a human has to fix the directory
                    error!("Refusing to connect: {e}");
                }
            }
        }
    }
}

impl CloudLink<Bootstrapping> {
    /// Runs `/env` discovery and the OTP exchange, builds the topic cache
    /// and validates the environment against what this link supports.
    pub async fn bootstrap(mut self) -> Result<CloudLink<Connecting>, CloudLink<BackingOff>> {
        let Some(identity) = self.identity.clone() else {
            return Err(self.transition());
        };
        let proxy = self.proxy();
        let cloud_url = self.shared.cloud_url.clone();
        let version = self.shared.config.agent_version.clone();

        let env = {
            let identity = identity.clone();
            let proxy = proxy.clone();
            tokio::task::spawn_blocking(move || {
                otp::fetch_env(&cloud_url, &identity, &version, proxy.as_ref())
            })
            .await
        };
        let env = match flatten(env) {
            Ok(env) => env,
            Err(e) => return Err(self.bootstrap_failed(e)),
        };

        if env.encoding != Encoding::Proto {
            warn!("Cloud selected an encoding this link does not speak, retrying later");
            return Err(self.transition());
        }
        if !env.has_capability("proto") {
            warn!("Cloud environment misses the proto capability, retrying later");
            return Err(self.transition());
        }
        let Some(transport) = env.select_transport() else {
            warn!("{}", BootstrapError::NoUsableTransport);
            return Err(self.transition());
        };
        let endpoint = transport.endpoint.clone();
        self.backoff.set_params(env.backoff);

        let creds = {
            let identity = identity.clone();
            let auth = env.auth_endpoint.clone();
            let proxy = proxy.clone();
            tokio::task::spawn_blocking(move || {
                otp::otp_exchange(&auth, &identity, proxy.as_ref())
            })
            .await
        };
        let creds = match flatten(creds) {
            Ok(creds) => creds,
            Err(e) => return Err(self.bootstrap_failed(e)),
        };

        let cache = match TopicCache::build(&creds.topics, &identity.claim_id_str()) {
            Ok(cache) => cache,
            Err(e) => {
                error!("Cannot use topic list from cloud: {e}");
                return Err(self.transition());
            }
        };
        self.shared.install_topics(Arc::new(cache));

        self.session = Some(SessionAuth { creds, endpoint });
        Ok(self.transition())
    }

    /// Applies the cloud's global directives before failing over to backoff.
    fn bootstrap_failed(self, error: BootstrapError) -> CloudLink<BackingOff> {
        error!("Bootstrap failed: {error}");
        if let BootstrapError::Cloud {
            non_retryable,
            retry_delay,
            ..
        } = &error
        {
            if *non_retryable {
                error!("Cloud error is non-retryable, disabling the link until restart");
                self.shared.disable_runtime();
            }
            if let Some(delay) = retry_delay {
                info!("Cloud asked to delay reconnection by {delay:?}");
                self.shared.block_for(*delay);
            }
        }
        self.transition()
    }
}

fn flatten<T>(
    joined: Result<Result<T, BootstrapError>, tokio::task::JoinError>,
) -> Result<T, BootstrapError> {
    match joined {
        Ok(inner) => inner,
        Err(e) => Err(BootstrapError::Malformed {
            endpoint: "bootstrap",
            reason: format!("worker failed: {e}"),
        }),
    }
}

impl CloudLink<Connecting> {
    /// Establishes the MQTT-over-WSS session: LWT armed, QoS-1, keep-alive
    /// 60 s, waiting for the broker's CONNACK.
    pub async fn connect(mut self) -> Result<CloudLink<Connected>, CloudLink<BackingOff>> {
        // same policy as the bootstrap HTTPS path: a resolved SOCKS proxy is
        // refused, not silently skipped
        let proxy = match proxy::require_http(self.proxy()) {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("Cannot reach the broker through the configured proxy: {e}");
                return Err(self.transition());
            }
        };
        let Some(session) = self.session.take() else {
            return Err(self.transition());
        };
        let Some(claim_id) = self.shared.claim_id() else {
            return Err(self.transition());
        };
        let Some(topics) = self.shared.topics() else {
            return Err(self.transition());
        };
        let Some(lwt_topic) = topics.topic_for(TopicId::AgentConnection).map(String::from)
        else {
            return Err(self.transition());
        };

        let session_id = self.shared.begin_session();
        let lwt_payload = tx::agent_connection_payload(
            &claim_id,
            session_id,
            false,
            true,
            self.shared.capabilities(),
        );

        let port = Url::parse(&session.endpoint)
            .ok()
            .and_then(|u| u.port())
            .unwrap_or(443);
        info!("Connecting MQTT over WSS to {}", session.endpoint);

        let mut options = MqttOptions::new(
            session.creds.client_id.clone(),
            session.endpoint.clone(),
            port,
        );
        options
            .set_transport(Transport::wss_with_default_config())
            .set_credentials(session.creds.username.clone(), session.creds.password.clone())
            .set_keep_alive(MQTT_KEEP_ALIVE)
            .set_last_will(LastWill::new(
                lwt_topic,
                lwt_payload,
                QoS::AtLeastOnce,
                false,
            ));
        if let Some(proxy) = proxy {
            options.set_proxy(rumqttc::Proxy {
                ty: rumqttc::ProxyType::Http,
                auth: match proxy.credentials {
                    Some((username, password)) => rumqttc::ProxyAuth::Basic { username, password },
                    None => rumqttc::ProxyAuth::None,
                },
                addr: proxy.host,
                port: proxy.port,
            });
        }

        let (client, mut transport) = AsyncClient::new(options, 64);

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("MQTT connect timed out");
                return Err(self.transition());
            }
            match tokio::time::timeout(remaining, transport.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    warn!("Broker refused connection: {:?}", ack.code);
                    return Err(self.transition());
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!("MQTT connect failed: {e}");
                    return Err(self.transition());
                }
                Err(_) => {
                    warn!("MQTT connect timed out");
                    return Err(self.transition());
                }
            }
        }

        self.shared.install_client(client.clone());
        self.shared.connection_established();
        info!(
            "Connected to cloud (connection #{})",
            self.shared.reconnect_count() + 1
        );
        self.client = Some(client);
        self.transport = Some(transport);
        self.session = Some(session);
        Ok(self.transition())
    }
}

impl CloudLink<Connected> {
    /// Subscribes to the command inbox before anything is announced.
    pub async fn establish(self) -> Result<CloudLink<Popcorning>, CloudLink<BackingOff>> {
        let Some(client) = self.client.clone() else {
            return Err(self.transition());
        };
        let Some(topics) = self.shared.topics() else {
            return Err(self.transition());
        };
        let Some(inbox) = topics.topic_for(TopicId::CommandNgV1).map(String::from) else {
            error!("No command inbox topic in the cache");
            return Err(self.transition());
        };
        if let Err(e) = client.subscribe(&inbox, QoS::AtLeastOnce).await {
            error!("Could not subscribe to the command inbox: {e}");
            return Err(self.transition());
        }
        debug!("Subscribed to {inbox}");
        Ok(self.transition())
    }
}

impl CloudLink<Popcorning> {
    /// Optional grace window before announcing readiness, then the
    /// reachable=true update that makes the agent visible.
    pub async fn announce(mut self) -> Result<CloudLink<Serving>, CloudLink<Disconnecting>> {
        let grace = Duration::from_millis(self.shared.config.popcorn_grace_ms);
        if !grace.is_zero() {
            debug!("Popcorning for {grace:?} before announcing readiness");
            let until = Instant::now() + grace;
            while Instant::now() < until {
                if self.shared.shutdown.is_cancelled() || self.shared.disconnect_requested() {
                    return Err(self.transition());
                }
                let slice = until
                    .saturating_duration_since(Instant::now())
                    .min(SERVICE_SLICE);
                if let ServiceOutcome::Error = self.service_transport(slice).await {
                    return Err(self.transition());
                }
            }
        }

        let Some(claim_id) = self.shared.claim_id() else {
            return Err(self.transition());
        };
        let payload = crate::queue::BinPayload {
            topic: TopicId::AgentConnection,
            msg_name: "UpdateAgentConnection",
            bytes: tx::agent_connection_payload(
                &claim_id,
                self.shared.session_id(),
                true,
                false,
                self.shared.capabilities(),
            ),
        };
        if let Err(e) = tx::publish_bin(&self.shared, &payload).await {
            error!("Could not announce readiness: {e}");
            return Err(self.transition());
        }
        self.shared.set_online(true);
        info!("Agent announced as reachable");
        Ok(self.transition())
    }
}

impl CloudLink<Serving> {
    /// The steady state: service the transport in bounded slices, wake the
    /// query consumer once a second, leave on any stop signal or transport
    /// error.
    pub async fn serve(mut self) -> CloudLink<Disconnecting> {
        let mut last_wake = Instant::now();
        loop {
            if self.shared.shutdown.is_cancelled()
                || self.shared.disconnect_requested()
                || self.shared.kill_link_requested()
            {
                break;
            }
            if let ServiceOutcome::Error = self.service_transport(SERVICE_SLICE).await {
                break;
            }
            if last_wake.elapsed() >= Duration::from_secs(1) {
                last_wake = Instant::now();
                self.shared.queue.wake_consumer();
            }
        }
        self.transition()
    }
}

impl CloudLink<Disconnecting> {
    /// Graceful teardown: reachable=false, a short wait for its PUBACK,
    /// then the MQTT disconnect.
    pub async fn disconnect(mut self) -> CloudLink<BackingOff> {
        self.shared.set_online(false);

        let farewell_sent = match self.shared.claim_id() {
            Some(claim_id) => {
                let payload = crate::queue::BinPayload {
                    topic: TopicId::AgentConnection,
                    msg_name: "UpdateAgentConnection",
                    bytes: tx::agent_connection_payload(
                        &claim_id,
                        self.shared.session_id(),
                        false,
                        false,
                        self.shared.capabilities(),
                    ),
                };
                tx::publish_bin(&self.shared, &payload).await.is_ok()
            }
            None => false,
        };

        if farewell_sent {
            let before = self.shared.pubacks();
            let until = Instant::now() + DISCONNECT_GRACE;
            while Instant::now() < until && self.shared.pubacks() == before {
                let slice = until
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_SLICE);
                if let ServiceOutcome::Error = self.service_transport(slice).await {
                    break;
                }
            }
        }

        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.transport = None;
        self.session = None;
        self.shared.connection_lost();
        info!("Disconnected from cloud");
        self.transition()
    }
}

impl CloudLink<BackingOff> {
    /// Applies the reconnection delay. A cloud-dictated block always wins
    /// over the computed truncated-exponential delay, and a runtime-disabled
    /// link uses a fixed long delay.
    pub async fn wait_out(mut self) -> CloudLink<WaitingForClaim> {
        let computed = if self.shared.is_disabled() {
            DISABLED_RUNTIME_DELAY
        } else {
            self.backoff.next_delay()
        };
        let delay = self.shared.blocked_remaining().unwrap_or(computed);
        if !delay.is_zero() {
            info!(
                "Reconnecting in {delay:?} (attempt {})",
                self.backoff.attempt()
            );
        }
        let until = Instant::now() + delay;
        while Instant::now() < until {
            if self.shared.shutdown.is_cancelled() {
                break;
            }
            tokio::time::sleep(
                until
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_SLICE),
            )
            .await;
        }
        self.transition()
    }
}

/// Runs connection after connection until shutdown.
pub async fn run_lifecycle(shared: Arc<LinkShared>, dispatcher: Arc<Dispatcher>) {
    let mut waiting = CloudLink::create(shared, dispatcher);
    loop {
        let Some(bootstrapping) = waiting.wait_ready().await else {
            info!("Connection lifecycle stopped");
            return;
        };
        let connecting = match bootstrapping.bootstrap().await {
            Ok(connecting) => connecting,
            Err(backing_off) => {
                waiting = backing_off.wait_out().await;
                continue;
            }
        };
        let connected = match connecting.connect().await {
            Ok(connected) => connected,
            Err(backing_off) => {
                waiting = backing_off.wait_out().await;
                continue;
            }
        };
        let popcorning = match connected.establish().await {
            Ok(popcorning) => popcorning,
            Err(backing_off) => {
                waiting = backing_off.wait_out().await;
                continue;
            }
        };
        let serving = match popcorning.announce().await {
            Ok(serving) => serving,
            Err(disconnecting) => {
                waiting = disconnecting.disconnect().await.wait_out().await;
                continue;
            }
        };
        let disconnecting = serving.serve().await;
        waiting = disconnecting.disconnect().await.wait_out().await;
    }
}
