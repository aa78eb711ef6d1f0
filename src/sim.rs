#![forbid(unsafe_code)]

// Simulated user - drives one user through signup, waiting room, redirect
// and the chatroom loop, capturing its own result

use crate::api::{self, ApiClient, ApiError};
use crate::client::{ChannelError, EventChannel};
use crate::driver::SimConfig;
use crate::protocol::{ChatMessage, Destination, ServerEvent, CHATROOM, ROOT, WAITING_ROOM};
use crate::stats::SimStats;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pause between a received pong and the next ping in connection-test mode.
const PING_REPLY_DELAY: Duration = Duration::from_secs(1);

/// Treatment group plus the initial view text a user submits.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub treatment: u32,
    pub view: String,
}

/// Built-in roster cycled across users when no override is given.
pub fn default_profiles() -> Vec<UserProfile> {
    vec![
        UserProfile {
            treatment: 1,
            view: "cats make far better companions than dogs".to_string(),
        },
        UserProfile {
            treatment: 5,
            view: "dogs are clearly the superior pet".to_string(),
        },
    ]
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Everything one user task needs, injected by the driver.
pub struct UserCtx {
    pub index: usize,
    pub api: ApiClient,
    pub profile: UserProfile,
    pub stats: SimStats,
    pub config: Arc<SimConfig>,
    pub deadline: tokio::time::Instant,
}

/// Outcome of one lifecycle. Failures are captured here, never propagated,
/// so one user's failure cannot abort its siblings.
#[derive(Debug, Serialize)]
pub struct UserReport {
    pub token: String,
    pub user_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub destination: Option<String>,
    pub sent: u64,
    pub received_partner: u64,
    pub received_self: u64,
    pub transcript: Vec<String>,
    pub error: Option<String>,
}

impl UserReport {
    fn new(token: String) -> Self {
        Self {
            token,
            user_id: None,
            partner_id: None,
            destination: None,
            sent: 0,
            received_partner: 0,
            received_self: 0,
            transcript: Vec::new(),
            error: None,
        }
    }

    /// Key used for the transcript output file: the numeric id when the user
    /// record was fetched, else the signup token.
    pub fn output_key(&self) -> String {
        match self.user_id {
            Some(id) => id.to_string(),
            None => self.token.clone(),
        }
    }
}

/// Runs one simulated user to completion, capturing any failure in the
/// returned report.
pub async fn run_user(ctx: UserCtx) -> UserReport {
    let token = api::new_token();
    let mut report = UserReport::new(token.clone());
    if let Err(e) = run_user_inner(&ctx, &token, &mut report).await {
        ctx.stats.inc_errors();
        warn!("user {}: {}", ctx.index, e);
        report.error = Some(e.to_string());
    }
    report
}

async fn run_user_inner(
    ctx: &UserCtx,
    token: &str,
    report: &mut UserReport,
) -> Result<(), SimError> {
    // Spread signups out so a batch does not thundering-herd the endpoint
    let (lo, hi) = ctx.config.start_jitter_secs;
    if hi > 0 {
        let jitter = rand::thread_rng().gen_range(lo..=hi);
        tokio::time::sleep(Duration::from_secs(jitter)).await;
    }

    ctx.api.post_signup(token, ctx.profile.treatment).await?;
    ctx.stats.inc_signups();
    ctx.api.post_initial_view(token, &ctx.profile.view).await?;
    debug!(
        "user {}: signed up (treatment {}), entering waiting room",
        ctx.index, ctx.profile.treatment
    );

    let destination = {
        let mut room = EventChannel::connect(ctx.api.base_url(), WAITING_ROOM, Some(token)).await?;
        let _waiting = ctx.stats.waiting_guard();
        let destination = room.await_redirect().await?;
        room.close().await;
        destination
    };
    report.destination = Some(destination.as_str().to_string());
    info!("user {}: redirected to {}", ctx.index, destination.as_str());

    match destination {
        Destination::View => {
            // The view stage just re-submits the initial view; the endpoint
            // is idempotent
            ctx.api.post_initial_view(token, &ctx.profile.view).await?;
        }
        Destination::Chatroom => {
            let record = ctx.api.fetch_user(token).await?;
            report.user_id = Some(record.id);
            chat_loop(ctx, token, record.id, report).await?;
        }
    }
    Ok(())
}

async fn chat_loop(
    ctx: &UserCtx,
    token: &str,
    own_id: i64,
    report: &mut UserReport,
) -> Result<(), SimError> {
    let mut chan = EventChannel::connect(ctx.api.base_url(), CHATROOM, Some(token)).await?;
    let _chatting = ctx.stats.chatting_guard();
    let mut partner_id: Option<i64> = None;

    chan.emit_message(&random_message()).await?;
    ctx.stats.inc_sent();
    report.sent += 1;

    if ctx.config.passive {
        // Reply to every partner message until the run deadline
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(ctx.deadline) => break,
                event = chan.next_event() => match event? {
                    Some(event) => {
                        if handle_incoming(event, own_id, &mut partner_id, ctx, report) {
                            chan.emit_message(&random_message()).await?;
                            ctx.stats.inc_sent();
                            report.sent += 1;
                        }
                    }
                    None => {
                        debug!("user {}: chatroom closed", ctx.index);
                        return Ok(());
                    }
                },
            }
        }
    } else {
        // Emit a fixed count at the configured cadence, draining incoming
        // frames between emissions
        for _ in 0..ctx.config.messages_per_user {
            let wake = tokio::time::Instant::now()
                + jittered(ctx.config.message_interval, ctx.config.message_jitter);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => break,
                    event = chan.next_event() => match event? {
                        Some(event) => {
                            handle_incoming(event, own_id, &mut partner_id, ctx, report);
                        }
                        None => {
                            warn!("user {}: chatroom closed early", ctx.index);
                            return Ok(());
                        }
                    },
                }
            }
            chan.emit_message(&random_message()).await?;
            ctx.stats.inc_sent();
            report.sent += 1;
        }
    }

    chan.close().await;
    Ok(())
}

/// Attributes an incoming frame to self or partner, updating counters and
/// the transcript. Returns true when a partner message warrants a reply in
/// passive mode.
fn handle_incoming(
    event: ServerEvent,
    own_id: i64,
    partner_id: &mut Option<i64>,
    ctx: &UserCtx,
    report: &mut UserReport,
) -> bool {
    match event {
        ServerEvent::Messages { messages } => {
            // The first batch with at least two messages fixes the partner id
            if partner_id.is_none() && messages.len() >= 2 {
                *partner_id = messages.iter().map(|m| m.sender_id).find(|id| *id != own_id);
                if let Some(id) = partner_id {
                    debug!("user {}: partner identified as {}", ctx.index, id);
                    report.partner_id = Some(*id);
                }
            }
            for message in messages {
                record_message(message, own_id, ctx, report);
            }
            false
        }
        ServerEvent::NewMessage { message } => {
            let from_partner = message.sender_id != own_id;
            record_message(message, own_id, ctx, report);
            from_partner
        }
        ServerEvent::Disconnect { reason } => {
            debug!("user {}: server disconnect: {}", ctx.index, reason);
            false
        }
        ServerEvent::Error { message } => {
            warn!("user {}: server error: {}", ctx.index, message);
            false
        }
        other => {
            debug!("user {}: ignoring frame {:?}", ctx.index, other);
            false
        }
    }
}

fn record_message(message: ChatMessage, own_id: i64, ctx: &UserCtx, report: &mut UserReport) {
    let from_self = message.sender_id == own_id;
    ctx.stats.inc_received(from_self);
    if from_self {
        report.received_self += 1;
    } else {
        report.received_partner += 1;
    }
    report.transcript.push(message.body);
}

/// Connection-test lifecycle: ping the echo server, ping again one second
/// after each pong, until the run deadline.
pub async fn run_pinger(ctx: UserCtx) -> UserReport {
    let mut report = UserReport::new(format!("pinger-{}", ctx.index));
    if let Err(e) = run_pinger_inner(&ctx, &mut report).await {
        ctx.stats.inc_errors();
        warn!("pinger {}: {}", ctx.index, e);
        report.error = Some(e.to_string());
    }
    report
}

async fn run_pinger_inner(ctx: &UserCtx, report: &mut UserReport) -> Result<(), SimError> {
    let mut chan = EventChannel::connect(ctx.api.base_url(), ROOT, None).await?;
    let _connected = ctx.stats.connected_guard();

    chan.emit_ping().await?;
    ctx.stats.inc_sent();
    report.sent += 1;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(ctx.deadline) => break,
            event = chan.next_event() => match event? {
                Some(ServerEvent::Pong) => {
                    ctx.stats.inc_received(false);
                    report.received_partner += 1;
                    // the pause between pings must not overshoot the deadline
                    tokio::select! {
                        _ = tokio::time::sleep_until(ctx.deadline) => break,
                        _ = tokio::time::sleep(PING_REPLY_DELAY) => {}
                    }
                    chan.emit_ping().await?;
                    ctx.stats.inc_sent();
                    report.sent += 1;
                }
                Some(other) => {
                    debug!("pinger {}: ignoring frame {:?}", ctx.index, other);
                }
                None => break,
            },
        }
    }

    chan.close().await;
    Ok(())
}

/// Randomized chat text: a phrase from a small pool plus a discriminator so
/// payloads differ across emissions.
pub fn random_message() -> String {
    const PHRASES: &[&str] = &[
        "interesting point",
        "I completely disagree",
        "what makes you say that?",
        "fair enough",
        "have you considered the opposite?",
        "that matches my experience",
    ];
    let mut rng = rand::thread_rng();
    let phrase = PHRASES[rng.gen_range(0..PHRASES.len())];
    format!("{phrase} ({})", rng.gen_range(0..10_000))
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let spread = jitter.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = interval.as_millis() as i64 + offset;
    Duration::from_millis(millis.max(0) as u64)
}
