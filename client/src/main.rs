use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
    time::Duration,
};
use url::Url;
use uuid::Uuid;

use lockstep_client::{
    config::{ClientConfig, Endpoint},
    constants::VERSION,
    invite::{build_invite_url, parse_invite_url},
    protocol::Message,
    utils::{format_time, parse_time},
    RelayClient, Role, RoomSession, SessionEvent, SessionHandle, SimulatedMedia,
};

#[derive(Debug, Clone)]
enum Intent {
    Create { media_url: String },
    Join { room_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_client=debug,info".into()),
        )
        .init();

    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    let intent = parse_arguments(&mut config)?;
    tracing::info!("Lockstep {VERSION} starting");

    let relay = RelayClient::new();
    let (server_tx, server_rx) = mpsc::unbounded_channel::<Message>();
    let mut app = App::new(relay, config, intent);
    app.run(server_tx, server_rx).await
}

fn parse_arguments(config: &mut ClientConfig) -> Result<Intent> {
    let mut args = std::env::args().skip(1);
    let mut intent = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--create" => {
                let media_url = args.next().context("--create needs a media URL")?;
                intent = Some(Intent::Create { media_url });
            }
            "--join" => {
                let room_id = args.next().context("--join needs a room code")?;
                intent = Some(Intent::Join { room_id });
            }
            "--server" => {
                config.server_url = Some(args.next().context("--server needs a URL")?);
            }
            other
                if other.starts_with("lockstep://")
                    || other.starts_with("http://")
                    || other.starts_with("https://") =>
            {
                let invite = parse_invite_url(other).context("Invalid invite link")?;
                if let Some(server) = invite.server_url {
                    config.server_url = Some(server);
                }
                intent = Some(Intent::Join {
                    room_id: invite.room_id,
                });
            }
            other => bail!("Unknown argument: {other}"),
        }
    }
    intent.context(
        "Usage: lockstep --create <media-url> | --join <room> | <invite-link> [--server <ws-url>]",
    )
}

struct App {
    relay: RelayClient,
    config: ClientConfig,
    intent: Intent,
    room_id: Option<String>,
    client_id: Option<Uuid>,
    endpoint: Option<String>,
    session: Option<SessionHandle>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    quit: bool,
}

impl App {
    fn new(relay: RelayClient, config: ClientConfig, intent: Intent) -> Self {
        Self {
            relay,
            config,
            intent,
            room_id: None,
            client_id: None,
            endpoint: None,
            session: None,
            events: None,
            quit: false,
        }
    }

    async fn run(
        &mut self,
        server_tx: mpsc::UnboundedSender<Message>,
        mut server_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Result<()> {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        while !self.quit {
            let mut disconnected = self.connect(&server_tx).await;
            if !self.request_room() {
                continue;
            }

            loop {
                tokio::select! {
                    Some(msg) = server_rx.recv() => self.handle_server_message(msg).await,
                    Some(event) = next_event(&mut self.events) => self.handle_session_event(event),
                    line = stdin.next_line(), if stdin_open => match line {
                        Ok(Some(line)) => self.handle_input(line.trim()).await,
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            tracing::warn!("Failed to read stdin: {e}");
                            stdin_open = false;
                        }
                    },
                    _ = &mut disconnected => {
                        tracing::warn!("Lost connection to relay");
                        self.relay.mark_disconnected();
                        self.end_session().await;
                        break;
                    }
                }
                if self.quit {
                    break;
                }
            }
        }

        if self.room_id.is_some() {
            let _ = self.relay.leave_room();
        }
        self.end_session().await;
        Ok(())
    }

    async fn connect(
        &mut self,
        server_tx: &mpsc::UnboundedSender<Message>,
    ) -> oneshot::Receiver<()> {
        let endpoints = self.config.endpoints();
        let mut attempt: u32 = 0;

        loop {
            for endpoint in &endpoints {
                attempt += 1;
                tracing::info!("Connecting to {} relay (attempt {attempt})...", endpoint.label);
                if !endpoint.is_local() {
                    warm_up_backend(endpoint).await;
                }

                let tx = server_tx.clone();
                match self
                    .relay
                    .connect(&endpoint.url, move |msg| {
                        let _ = tx.send(msg);
                    })
                    .await
                {
                    Ok(disconnected) => {
                        tracing::info!("Connected to {} relay at {}", endpoint.label, endpoint.url);
                        self.relay.mark_connected(&endpoint.label);
                        self.endpoint = Some(endpoint.url.clone());
                        return disconnected;
                    }
                    Err(e) => {
                        tracing::warn!("{} relay unavailable: {e}", endpoint.label);
                    }
                }

                let capped_attempt = attempt.min(6);
                tokio::time::sleep(Duration::from_secs(5 * capped_attempt as u64)).await;
            }
        }
    }

    /// After (re)connecting: rejoin the room we were in, or act on the CLI intent.
    /// Returns false when the connection went away before the request was sent.
    fn request_room(&mut self) -> bool {
        match self.enter_room() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Connection dropped before the room request went out: {e:#}");
                self.relay.mark_disconnected();
                false
            }
        }
    }

    fn enter_room(&mut self) -> Result<()> {
        let request = match (&self.room_id, &self.intent) {
            (Some(room_id), _) => self.relay.join_room(room_id.clone()),
            (None, Intent::Join { room_id }) => self.relay.join_room(room_id.clone()),
            (None, Intent::Create { media_url }) => self.relay.create_room(media_url.clone()),
        };
        request.context("Failed to send room request")
    }

    async fn handle_server_message(&mut self, msg: Message) {
        match msg {
            Message::RoomCreated {
                room_id,
                client_id,
                media_url,
            } => {
                println!("Room created: {room_id}");
                println!("Invite: {}", build_invite_url(&room_id, self.endpoint.as_deref()));
                self.begin_session(room_id, client_id, Role::Leader, media_url)
                    .await;
            }
            Message::RoomJoined {
                room_id,
                client_id,
                is_leader,
                media_url,
            } => {
                println!(
                    "Joined room {room_id} ({})",
                    if is_leader { "leader" } else { "follower" }
                );
                self.begin_session(room_id, client_id, Role::from_leader_flag(is_leader), media_url)
                    .await;
            }
            Message::MediaChanged { room_id, media_url } => {
                let (Some(client_id), Some(session)) = (self.client_id, self.session.as_ref())
                else {
                    return;
                };
                let role = session.snapshot().role;
                println!("Media changed to {media_url}");
                self.begin_session(room_id, client_id, role, media_url).await;
            }
            Message::RoomLeft => {
                println!("Left room");
                self.room_id = None;
                self.end_session().await;
                self.quit = true;
            }
            Message::RoomNotFound => {
                eprintln!("Room not found");
                self.room_id = None;
                self.quit = true;
            }
            Message::RoomMemberUpdate { room_id, members } => {
                tracing::info!("Room {room_id} now has {members} member(s)");
            }
            Message::Error { message } => {
                tracing::warn!("Relay error: {message}");
            }
            other => {
                tracing::warn!("Unexpected message from relay: {:?}", other);
            }
        }
    }

    /// A new session replaces the previous one; nothing is mutated in place.
    async fn begin_session(
        &mut self,
        room_id: String,
        client_id: Uuid,
        role: Role,
        media_url: String,
    ) {
        self.end_session().await;

        let room = RoomSession {
            room_id: room_id.clone(),
            client_id: client_id.to_string(),
            role,
            media_url,
        };
        let media = SimulatedMedia::new();
        match lockstep_client::start(room, Arc::new(self.relay.clone()), media, &self.config.sync) {
            Ok(mut session) => {
                self.events = session.take_events();
                self.session = Some(session);
                self.room_id = Some(room_id);
                self.client_id = Some(client_id);
            }
            Err(e) => tracing::error!("Failed to start session: {e}"),
        }
    }

    async fn end_session(&mut self) {
        self.events = None;
        if let Some(session) = self.session.take() {
            session.end().await;
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RoleChanged(Role::Leader) => println!("You now control playback"),
            SessionEvent::RoleChanged(Role::Follower) => {
                println!("Another member now controls playback")
            }
            SessionEvent::PlaybackRejected { reason } => {
                println!("Playback was blocked ({reason}). Type `play` to resume.")
            }
            SessionEvent::MediaFailed { reason } => eprintln!("Unable to load media: {reason}"),
            SessionEvent::Bootstrapped { position, is_playing } => println!(
                "Synchronized at {} ({})",
                format_time(position),
                if is_playing { "playing" } else { "paused" }
            ),
        }
    }

    async fn handle_input(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return;
        };
        let argument = parts.next();

        let result = match (command, argument) {
            ("play", _) => self.with_session(|s| s.play()),
            ("pause", _) => self.with_session(|s| s.pause()),
            ("seek", Some(time)) => match parse_time(time) {
                Some(time) => self.with_session(|s| s.seek(time)),
                None => {
                    println!("Cannot parse time `{time}`");
                    Ok(())
                }
            },
            ("status", _) => {
                self.print_status();
                Ok(())
            }
            ("handoff", Some(id)) => match Uuid::parse_str(id) {
                Ok(id) => self.relay.hand_off(id),
                Err(e) => {
                    println!("Invalid member id: {e}");
                    Ok(())
                }
            },
            ("media", Some(url)) => self.relay.select_media(url.to_string()),
            ("invite", _) => {
                if let Some(room_id) = &self.room_id {
                    println!("{}", build_invite_url(room_id, self.endpoint.as_deref()));
                }
                Ok(())
            }
            ("leave", _) => self.relay.leave_room(),
            ("quit", _) => {
                self.quit = true;
                Ok(())
            }
            _ => {
                println!(
                    "Commands: play | pause | seek <time> | status | handoff <id> \
                     | media <url> | invite | leave | quit"
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Command `{command}` failed: {e}");
        }
    }

    fn with_session(
        &self,
        f: impl FnOnce(&SessionHandle) -> lockstep_client::Result<()>,
    ) -> lockstep_client::Result<()> {
        match &self.session {
            Some(session) => f(session),
            None => {
                println!("Not in a room yet");
                Ok(())
            }
        }
    }

    fn print_status(&self) {
        if let Some(session) = &self.session {
            let snapshot = session.snapshot();
            println!(
                "Room {} | {:?} | {} | {} | bootstrap {:?}",
                session.room_id(),
                snapshot.role,
                format_time(snapshot.position),
                if snapshot.is_playing { "playing" } else { "paused" },
                snapshot.bootstrap,
            );
        }
        let stats = self.relay.stats_snapshot();
        println!(
            "Relay {} | out {} msgs / {} B | in {} msgs / {} B | rtt {} | reconnects {}",
            stats.endpoint_label.as_deref().unwrap_or("-"),
            stats.messages_out,
            stats.bytes_out,
            stats.messages_in,
            stats.bytes_in,
            stats
                .last_rtt_ms
                .map(|ms| format!("{ms:.0} ms"))
                .unwrap_or_else(|| "-".to_string()),
            stats.reconnect_attempts,
        );
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn warm_up_backend(endpoint: &Endpoint) {
    let Some(health_url) = health_url_from_ws(&endpoint.url) else {
        return;
    };

    tracing::info!("Warming up {} backend...", endpoint.label);
    let client = reqwest::Client::new();
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => tracing::info!(
            "Warmup request to {} returned {}",
            health_url,
            response.status()
        ),
        Err(e) => tracing::warn!("Warmup request to {} failed: {}", health_url, e),
    }
}

fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}
