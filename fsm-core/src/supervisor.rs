//! Supervisor ("FSM") service: command dispatch on its own endpoint plus a
//! fixed-rate loop that refreshes peer liveness and status.
//!
//! Each tick handles at most one inbound command and then does at most one
//! exchange per peer, in registry order. Dead peers are skipped entirely, so
//! an unreachable module cannot starve the others.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::{Reply, SupervisorRequest, REPLY_SUCCESS};
use crate::peer::{PeerConnection, PeerError, PeerSummary};
use crate::registry::PeerRegistry;
use crate::transport::InboundRequest;

/// Default loop period (2 Hz).
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(500);

/// Consecutive failures after which a disconnected peer is declared dead.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub tick_period: Duration,
    pub failure_threshold: u32,
    /// Peer that power-cycles other modules on `reboot`.
    pub power_controller: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            power_controller: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Help,
    Status,
    Reconnect,
    Reboot,
    Quit,
    Info,
    Relay,
    Query,
}

const BUILTIN_COMMANDS: &[(&str, CommandKind, &str)] = &[
    ("help", CommandKind::Help, "List available commands"),
    (
        "status",
        CommandKind::Status,
        "Cached alive/connected state of every peer",
    ),
    (
        "reconnect",
        CommandKind::Reconnect,
        "reconnect <peer>: clear errors and resume polling a peer",
    ),
    (
        "reboot",
        CommandKind::Reboot,
        "reboot <peer>: power-cycle a peer through the power controller",
    ),
    ("quit", CommandKind::Quit, "Shut the supervisor down"),
    (
        "info",
        CommandKind::Info,
        "info <peer>: endpoint, error count and last status of a peer",
    ),
    (
        "relay",
        CommandKind::Relay,
        "relay <peer> <command> [args...]: forward a text command to a peer",
    ),
    (
        "query",
        CommandKind::Query,
        "query <peer> <command> [args...]: forward a command expecting a typed reply",
    ),
];

/// Command name to handler, built once when the supervisor is constructed.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: BTreeMap<&'static str, (CommandKind, &'static str)>,
}

impl CommandTable {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_COMMANDS
                .iter()
                .map(|&(name, kind, description)| (name, (kind, description)))
                .collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn describe(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, (_, description))| (name.to_string(), description.to_string()))
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<CommandKind> {
        self.entries.get(name).map(|(kind, _)| *kind)
    }
}

pub struct Supervisor {
    registry: PeerRegistry,
    commands: CommandTable,
    inbound: mpsc::Receiver<InboundRequest>,
    config: SupervisorConfig,
    running: bool,
    ticks: u64,
}

impl Supervisor {
    pub fn new(
        registry: PeerRegistry,
        inbound: mpsc::Receiver<InboundRequest>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            commands: CommandTable::builtin(),
            inbound,
            config,
            running: true,
            ticks: 0,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PeerRegistry {
        &mut self.registry
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run ticks at the configured cadence until `quit`.
    pub async fn run(&mut self) {
        info!(
            peers = self.registry.len(),
            tick_ms = self.config.tick_period.as_millis() as u64,
            "supervisor running"
        );
        while self.running {
            let started = Instant::now();
            self.tick().await;
            if !self.running {
                break;
            }
            let elapsed = started.elapsed();
            if let Some(rest) = self.config.tick_period.checked_sub(elapsed) {
                tokio::time::sleep(rest).await;
            } else {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tick overran its period"
                );
            }
        }
        info!(ticks = self.ticks, "supervisor shut down");
    }

    /// One loop iteration: at most one inbound command, then one pass over the peers.
    pub async fn tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
        self.handle_inbound().await;
        self.poll_peers().await;
    }

    async fn handle_inbound(&mut self) {
        match self.inbound.try_recv() {
            Ok(req) => {
                let line = String::from_utf8_lossy(&req.payload).into_owned();
                let reply = self.dispatch(&line).await;
                req.respond(reply.into_bytes());
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                debug!("command endpoint closed");
            }
        }
    }

    async fn poll_peers(&mut self) {
        let threshold = self.config.failure_threshold;
        for peer in self.registry.iter_mut() {
            if !peer.is_alive() {
                continue;
            }
            if peer.is_connected() {
                if let Err(e) = peer.query_status().await {
                    warn!(peer = %peer.name(), error = %e, "status refresh failed");
                }
            } else if peer.error_count() < threshold {
                if let Err(e) = peer.send("").await {
                    debug!(peer = %peer.name(), error = %e, "reconnect attempt failed");
                }
            } else {
                peer.mark_dead();
                error!(
                    peer = %peer.name(),
                    endpoint = %peer.endpoint(),
                    error_count = peer.error_count(),
                    "peer declared dead, polling stopped until reconnect"
                );
            }
        }
    }

    /// Handle one command line and produce its reply. Every line gets exactly one reply.
    pub async fn dispatch(&mut self, line: &str) -> String {
        let req = match SupervisorRequest::parse(line) {
            Ok(req) => req,
            Err(e) => return format!("Error processing command: {}", e),
        };
        let Some(kind) = self.commands.lookup(&req.command) else {
            return format!("Unknown command: {}", req.command);
        };
        match self.invoke(kind, &req.args).await {
            Ok(Value::String(s)) => s,
            Ok(value) => value.to_string(),
            Err(e) => {
                warn!(command = %req.command, error = %e, "command failed");
                format!("Error processing command: {}", e)
            }
        }
    }

    async fn invoke(&mut self, kind: CommandKind, args: &[String]) -> Result<Value, DispatchError> {
        match kind {
            CommandKind::Help => Ok(serde_json::to_value(self.help())?),
            CommandKind::Status => Ok(serde_json::to_value(self.status())?),
            CommandKind::Reconnect => {
                self.reconnect(arg(args, 0, "peer")?)?;
                Ok(Value::String(REPLY_SUCCESS.to_string()))
            }
            CommandKind::Reboot => Ok(Value::String(self.reboot(arg(args, 0, "peer")?).await?)),
            CommandKind::Quit => {
                self.quit();
                Ok(Value::String(REPLY_SUCCESS.to_string()))
            }
            CommandKind::Info => self.info(arg(args, 0, "peer")?),
            CommandKind::Relay => {
                let (peer, command) = (arg(args, 0, "peer")?, arg(args, 1, "command")?);
                let reply = self.relay(peer, command, rest(args, 2)).await?;
                Ok(Value::String(reply.to_string()))
            }
            CommandKind::Query => {
                let (peer, command) = (arg(args, 0, "peer")?, arg(args, 1, "command")?);
                Ok(Value::String(self.query(peer, command, rest(args, 2)).await?))
            }
        }
    }

    /// Command name to one-line description.
    pub fn help(&self) -> BTreeMap<String, String> {
        self.commands.describe()
    }

    /// Cached liveness of every peer. Never touches the network.
    pub fn status(&self) -> BTreeMap<String, PeerSummary> {
        self.registry
            .iter()
            .map(|p| (p.name().to_string(), p.summary()))
            .collect()
    }

    /// Clear the error count and mark the peer alive. The next tick attempts an exchange.
    pub fn reconnect(&mut self, name: &str) -> Result<(), DispatchError> {
        let peer = self
            .registry
            .get_mut(name)
            .ok_or_else(|| DispatchError::UnknownPeer(name.to_string()))?;
        peer.revive();
        info!(peer = %name, "peer revived by operator");
        Ok(())
    }

    /// Ask the power controller (if any) to power-cycle `name`, then reset its
    /// supervision state so the loop reconnects. No liveness is guaranteed afterwards.
    pub async fn reboot(&mut self, name: &str) -> Result<String, DispatchError> {
        if self.registry.get(name).is_none() {
            return Err(DispatchError::UnknownPeer(name.to_string()));
        }
        let outcome = match self.config.power_controller.clone() {
            Some(controller) if controller == name => {
                return Err(DispatchError::InvalidArgument(format!(
                    "{} is the power controller and cannot power-cycle itself",
                    name
                )));
            }
            Some(controller) => {
                let power = live_peer(&mut self.registry, &controller)?;
                let cmd = power.command("power_cycle").arg(name).encode();
                match power.send(&cmd).await? {
                    Reply::Bool(false) => return Err(DispatchError::RebootFailed(name.to_string())),
                    reply => reply.to_string(),
                }
            }
            None => {
                warn!(peer = %name, "no power controller configured, resetting supervision state only");
                REPLY_SUCCESS.to_string()
            }
        };
        if let Some(peer) = self.registry.get_mut(name) {
            peer.reset_after_reboot();
        }
        info!(peer = %name, "reboot requested");
        Ok(outcome)
    }

    /// Stop the loop; observed before the next tick starts.
    pub fn quit(&mut self) {
        info!("quit requested");
        self.running = false;
    }

    /// Endpoint, liveness, error count and last cached status of one peer.
    pub fn info(&self, name: &str) -> Result<Value, DispatchError> {
        let peer = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownPeer(name.to_string()))?;
        Ok(json!({
            "endpoint": peer.endpoint().to_string(),
            "prefix": peer.prefix(),
            "alive": peer.is_alive(),
            "connected": peer.is_connected(),
            "error_count": peer.error_count(),
            "status": peer.status(),
        }))
    }

    /// Forward `<prefix>.<command> <csv-args>` to a live peer and return its text reply.
    pub async fn relay(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<Reply, DispatchError> {
        let peer = live_peer(&mut self.registry, name)?;
        let line = args
            .iter()
            .fold(peer.command(command), |cmd, a| cmd.arg(a.as_str()))
            .encode();
        Ok(peer.send(&line).await?)
    }

    /// Like [`relay`](Self::relay) but decodes a typed binary reply and returns its summary.
    pub async fn query(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, DispatchError> {
        let peer = live_peer(&mut self.registry, name)?;
        let line = args
            .iter()
            .fold(peer.command(command), |cmd, a| cmd.arg(a.as_str()))
            .encode();
        Ok(peer.send_typed(&line).await?.to_string())
    }
}

fn live_peer<'a>(
    registry: &'a mut PeerRegistry,
    name: &str,
) -> Result<&'a mut PeerConnection, DispatchError> {
    let peer = registry
        .get_mut(name)
        .ok_or_else(|| DispatchError::UnknownPeer(name.to_string()))?;
    if !peer.is_alive() {
        return Err(DispatchError::PeerDead(name.to_string()));
    }
    Ok(peer)
}

fn rest(args: &[String], from: usize) -> &[String] {
    args.get(from..).unwrap_or(&[])
}

fn arg<'a>(args: &'a [String], idx: usize, what: &'static str) -> Result<&'a str, DispatchError> {
    args.get(idx)
        .map(String::as_str)
        .ok_or(DispatchError::MissingArgument(what))
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("missing argument <{0}>")]
    MissingArgument(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("peer {0} is dead; reconnect it first")]
    PeerDead(String),
    #[error("power controller refused to power-cycle {0}")]
    RebootFailed(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("could not encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTimings;
    use crate::response::{encode_response, Response};
    use crate::transport::testing::{ScriptHandle, ScriptedConnector, Step};
    use crate::transport::Endpoint;

    const NAVIS: &str = "NavisRobotControl";

    struct Harness {
        sup: Supervisor,
        connector: ScriptedConnector,
        commands: mpsc::Sender<InboundRequest>,
    }

    impl Harness {
        fn new(peers: &[(&str, u16, &str)], config: SupervisorConfig) -> Self {
            let connector = ScriptedConnector::default();
            let mut registry = PeerRegistry::new(connector.clone(), PeerTimings::default());
            for &(name, port, prefix) in peers {
                registry
                    .add(name, Endpoint::new("127.0.0.1", port), prefix)
                    .unwrap();
            }
            let (tx, rx) = mpsc::channel(8);
            Self {
                sup: Supervisor::new(registry, rx, config),
                connector,
                commands: tx,
            }
        }

        fn script(&self, name: &str) -> ScriptHandle {
            let peer = self.sup.registry().get(name).unwrap();
            self.connector.script(peer.endpoint())
        }

        fn summary(&self, name: &str) -> PeerSummary {
            self.sup.status()[name]
        }

        async fn command(&mut self, line: &str) -> String {
            let (req, rx) = InboundRequest::new(line.as_bytes().to_vec());
            self.commands.send(req).await.unwrap();
            self.sup.tick().await;
            String::from_utf8(rx.await.unwrap()).unwrap()
        }
    }

    fn navis() -> Harness {
        Harness::new(&[(NAVIS, 5560, "navis")], SupervisorConfig::default())
    }

    #[tokio::test]
    async fn navis_dies_after_five_failures_and_recovers() {
        let mut h = navis();
        let script = h.script(NAVIS);
        assert_eq!(
            h.summary(NAVIS),
            PeerSummary {
                alive: true,
                connected: false
            }
        );

        for tick in 1..=5 {
            h.sup.tick().await;
            assert_eq!(h.sup.registry().get(NAVIS).unwrap().error_count(), tick);
            assert!(h.summary(NAVIS).alive, "still alive after {} failures", tick);
        }
        h.sup.tick().await;
        assert_eq!(
            h.command("status").await,
            format!("{{\"{}\":{{\"alive\":false,\"connected\":false}}}}", NAVIS)
        );

        // Dead peers see no traffic at all.
        let before = script.activity();
        h.sup.tick().await;
        h.sup.tick().await;
        assert_eq!(script.activity(), before);

        script.push_text("buffered reply");
        assert_eq!(h.command(&format!("reconnect {}", NAVIS)).await, "success");
        assert_eq!(
            h.summary(NAVIS),
            PeerSummary {
                alive: true,
                connected: true
            }
        );
        assert_eq!(h.sup.registry().get(NAVIS).unwrap().error_count(), 0);
    }

    #[tokio::test]
    async fn connected_peer_status_is_refreshed() {
        let mut h = navis();
        let script = h.script(NAVIS);
        script.push_text("hello");
        script.push_text("{\"position\": 12.5}");
        h.sup.tick().await;
        assert!(h.summary(NAVIS).connected);
        h.sup.tick().await;
        assert_eq!(script.sent(), vec!["navis.status"]);
        let peer = h.sup.registry().get(NAVIS).unwrap();
        assert_eq!(peer.status().unwrap()["position"], 12.5);
    }

    #[tokio::test]
    async fn one_dead_peer_does_not_disturb_another() {
        let mut h = Harness::new(
            &[("Broken", 6000, "broken"), ("Andor", 6001, "andor")],
            SupervisorConfig::default(),
        );
        let andor = h.script("Andor");
        andor.set_fallback(Some("{\"cooler\": \"on\"}"));

        for _ in 0..8 {
            h.sup.tick().await;
            assert_eq!(
                h.summary("Andor"),
                PeerSummary {
                    alive: true,
                    connected: true
                }
            );
        }
        assert!(!h.summary("Broken").alive);
        let peer = h.sup.registry().get("Andor").unwrap();
        assert_eq!(peer.status().unwrap()["cooler"], "on");
        assert_eq!(peer.error_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_is_idempotent_and_local() {
        let mut h = Harness::new(
            &[(NAVIS, 5560, "navis"), ("Led", 5570, "led")],
            SupervisorConfig::default(),
        );
        h.script(NAVIS).set_fallback(Some("{}"));
        h.sup.tick().await;
        h.sup.tick().await;
        let led_before = (h.summary("Led"), h.sup.registry().get("Led").unwrap().error_count());

        h.sup.reconnect(NAVIS).unwrap();
        h.sup.reconnect(NAVIS).unwrap();
        let navis = h.sup.registry().get(NAVIS).unwrap();
        assert_eq!(navis.error_count(), 0);
        assert!(navis.is_connected());
        assert_eq!(
            (h.summary("Led"), h.sup.registry().get("Led").unwrap().error_count()),
            led_before
        );
    }

    #[tokio::test]
    async fn unknown_peer_and_command() {
        let mut h = navis();
        assert_eq!(h.command("launch").await, "Unknown command: launch");
        assert_eq!(
            h.command("reconnect Nobody").await,
            "Error processing command: unknown peer Nobody"
        );
        assert!(matches!(
            h.sup.reconnect("Nobody"),
            Err(DispatchError::UnknownPeer(_))
        ));
        assert_eq!(
            h.command("reconnect").await,
            "Error processing command: missing argument <peer>"
        );
    }

    #[tokio::test]
    async fn help_lists_every_command_and_each_answers() {
        let mut h = navis();
        let help: BTreeMap<String, String> =
            serde_json::from_str(&h.command("help").await).unwrap();
        let names: Vec<&str> = h.sup.commands().names().collect();
        assert_eq!(help.keys().map(String::as_str).collect::<Vec<_>>(), names);

        for name in names {
            if name == "quit" {
                continue;
            }
            for line in [name.to_string(), format!("{} %%garbage%% 1,2", name)] {
                let reply = h.command(&line).await;
                assert!(!reply.is_empty(), "{} gave an empty reply", line);
            }
        }
        assert!(h.sup.is_running());
        assert_eq!(h.command("quit").await, "success");
        assert!(!h.sup.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn run_holds_cadence_and_stops_on_quit() {
        let mut h = navis();
        h.script(NAVIS).set_fallback(Some("{}"));
        let (req, rx) = InboundRequest::new(b"quit".to_vec());
        let started = Instant::now();

        let sender = h.commands.clone();
        let (_, reply) = tokio::join!(h.sup.run(), async move {
            tokio::time::sleep(Duration::from_millis(1600)).await;
            sender.send(req).await.unwrap();
            rx.await.unwrap()
        });

        assert_eq!(reply, b"success");
        // Ticks at 0, 500, 1000, 1500 ms; quit is picked up by the tick at 2000 ms.
        assert_eq!(h.sup.ticks(), 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000) && elapsed < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn reboot_goes_through_power_controller() {
        let config = SupervisorConfig {
            power_controller: Some("Power".into()),
            ..SupervisorConfig::default()
        };
        let mut h = Harness::new(&[(NAVIS, 5560, "navis"), ("Power", 5580, "pdu")], config);
        let power = h.script("Power");
        power.set_fallback(Some("success"));
        h.sup.tick().await;
        assert!(h.summary("Power").connected);

        h.script(NAVIS).set_fallback(Some("{}"));
        h.sup.tick().await;
        assert!(h.summary(NAVIS).connected);

        assert_eq!(h.command(&format!("reboot {}", NAVIS)).await, "success");
        assert!(power
            .sent()
            .contains(&format!("pdu.power_cycle {}", NAVIS)));
        let navis = h.sup.registry().get(NAVIS).unwrap();
        assert!(navis.is_alive());
        assert_eq!(navis.error_count(), 0);

        assert!(matches!(
            h.sup.reboot("Power").await,
            Err(DispatchError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn reboot_without_controller_only_resets() {
        let mut h = navis();
        for _ in 0..6 {
            h.sup.tick().await;
        }
        assert!(!h.summary(NAVIS).alive);
        assert_eq!(h.sup.reboot(NAVIS).await.unwrap(), "success");
        assert_eq!(
            h.summary(NAVIS),
            PeerSummary {
                alive: true,
                connected: false
            }
        );
    }

    #[tokio::test]
    async fn rebooted_peer_stays_disconnected_until_it_answers() {
        let mut h = navis();
        let script = h.script(NAVIS);
        script.push_text("hello");
        h.sup.tick().await;
        assert!(h.summary(NAVIS).connected);

        h.sup.reboot(NAVIS).await.unwrap();
        assert_eq!(script.resets(), 1);
        // Module is still power-cycling: nothing answers.
        h.sup.tick().await;
        assert_eq!(
            h.summary(NAVIS),
            PeerSummary {
                alive: true,
                connected: false
            }
        );
        assert_eq!(h.sup.registry().get(NAVIS).unwrap().error_count(), 1);

        script.push_text("");
        h.sup.tick().await;
        assert!(h.summary(NAVIS).connected);
    }

    #[tokio::test]
    async fn relay_and_query_forward_to_peer() {
        let mut h = navis();
        let script = h.script(NAVIS);
        script.push_text("hi");
        h.sup.tick().await;

        script.push_text("success");
        assert_eq!(h.command(&format!("relay {} move 10 20", NAVIS)).await, "success");
        assert!(script.sent().contains(&"navis.move 10,20".to_string()));

        script.push(Step::Reply(encode_response(&Response::Float(1.25)).unwrap()));
        assert_eq!(h.command(&format!("query {} focus", NAVIS)).await, "1.25");
    }

    #[tokio::test]
    async fn relay_refuses_dead_peer() {
        let mut h = navis();
        for _ in 0..6 {
            h.sup.tick().await;
        }
        assert!(matches!(
            h.sup.relay(NAVIS, "status", &[]).await,
            Err(DispatchError::PeerDead(_))
        ));
    }

    #[tokio::test]
    async fn info_reports_cached_state() {
        let mut h = navis();
        h.sup.tick().await;
        let info: Value = serde_json::from_str(&h.command(&format!("info {}", NAVIS)).await).unwrap();
        assert_eq!(info["endpoint"], "127.0.0.1:5560");
        // The command is served before that tick's poll.
        assert_eq!(info["error_count"], 1);
        assert_eq!(info["status"], Value::Null);
    }
}
