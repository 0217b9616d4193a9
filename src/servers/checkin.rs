//! Server-list check-in.
//!
//! Every period the server reports its name and address to the configured
//! list over HTTP. The list answers with tab-separated status lines that can
//! change the period, raise warnings, or ban the server from the list.

use std::time::Duration;

use reqwest::Url;

use super::world::Game;
use crate::bridge::{WorkError, WorkResult};
use crate::config::ServerConfig;
use crate::timer::TimerScheduler;

pub const PERIOD_MIN: Duration = Duration::from_secs(45);
pub const PERIOD_MAX: Duration = Duration::from_secs(900);

/// One parsed status line of a check-in reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    /// `104 ... <secs>`: check in again after this many seconds
    Period(u64),
    /// `300 retry <secs>`: the list wants a different period
    Retry(u64),
    /// Any 2xx code. The list refuses this server.
    Banished(u16),
    /// 3xx, 4xx and 5xx codes other than a retry
    Warning(u16, String),
    /// Informational or unknown
    Other(u16),
}

/// Parse a reply body. Blank and unparsable lines are skipped.
pub fn parse_reply(body: &str) -> Vec<ReplyLine> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                return None;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            let code: u16 = parts.first()?.trim().parse().ok()?;
            let field = |i: usize| parts.get(i).copied().unwrap_or("");
            Some(match (code / 100, code) {
                (1, 104) => field(2).parse().map(ReplyLine::Period).unwrap_or(ReplyLine::Other(code)),
                (2, _) => ReplyLine::Banished(code),
                (3, 300) if field(2) == "retry" => match field(3).parse() {
                    Ok(secs) => ReplyLine::Retry(secs),
                    Err(_) => ReplyLine::Warning(code, field(4).to_string()),
                },
                (3, 300) => ReplyLine::Warning(code, field(4).to_string()),
                (3..=5, _) => {
                    let message = parts[1..]
                        .iter()
                        .rev()
                        .find(|p| !p.is_empty())
                        .copied()
                        .unwrap_or("unknown error");
                    ReplyLine::Warning(code, message.to_string())
                }
                _ => ReplyLine::Other(code),
            })
        })
        .collect()
}

/// Check-in schedule: the current period, failure backoff, and whether the
/// list has banned us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckinState {
    period: Duration,
    backoff: Duration,
    failures: u32,
    stopped: bool,
    running: bool,
}

fn clamp_period(period: Duration) -> Duration {
    period.clamp(PERIOD_MIN, PERIOD_MAX)
}

impl CheckinState {
    pub fn new(period_secs: u64) -> Self {
        Self {
            period: clamp_period(Duration::from_secs(period_secs)),
            backoff: PERIOD_MIN,
            failures: 0,
            stopped: false,
            running: false,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Apply a successful reply. Returns the delay before the next check-in,
    /// or `None` once the list has banned this server.
    pub fn on_reply(&mut self, lines: &[ReplyLine]) -> Option<Duration> {
        self.failures = 0;
        self.backoff = PERIOD_MIN;
        for line in lines {
            match line {
                ReplyLine::Period(secs) | ReplyLine::Retry(secs) => {
                    self.period = clamp_period(Duration::from_secs(*secs));
                }
                ReplyLine::Banished(code) => {
                    tracing::error!("[checkin] ({}) server banned from the list, check-ins stopped", code);
                    self.stopped = true;
                }
                ReplyLine::Warning(code, message) => {
                    tracing::warn!("[checkin] ({}) {}", code, message);
                }
                ReplyLine::Other(code) => {
                    tracing::trace!("[checkin] ({}) ignored", code);
                }
            }
        }
        if self.stopped {
            self.running = false;
            None
        } else {
            Some(self.period)
        }
    }

    /// Record a failed attempt. The retry delay doubles each time, capped at
    /// the longest period.
    pub fn on_failure(&mut self) -> Duration {
        self.failures += 1;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(PERIOD_MAX);
        delay
    }
}

impl Default for CheckinState {
    fn default() -> Self {
        Self::new(PERIOD_MIN.as_secs())
    }
}

/// Check-in URL with the server's details in the query string.
pub fn checkin_url(config: &ServerConfig, period: Duration) -> anyhow::Result<Url> {
    let checkin = &config.checkin;
    let mut url = Url::parse(&checkin.url)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("software", env!("CARGO_PKG_NAME"))
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("retry", &period.as_secs().to_string());
        let host = if checkin.host.is_empty() {
            &config.bind_ip
        } else {
            &checkin.host
        };
        query
            .append_pair("hostname", host)
            .append_pair("port", &config.port.to_string())
            .append_pair("name", &checkin.server_name);
        if !checkin.site.is_empty() {
            query.append_pair("website", &checkin.site);
        }
        if !checkin.zone.is_empty() {
            query.append_pair("zone", &checkin.zone);
        }
    }
    Ok(url)
}

/// Begin checking in if enabled and not already running.
pub fn start(game: &mut Game, timers: &mut TimerScheduler<Game>) {
    if !game.config.checkin.enabled || game.checkin.running || game.checkin.stopped {
        return;
    }
    game.checkin = CheckinState::new(game.config.checkin.period_secs);
    game.checkin.running = true;
    timers.schedule(Duration::ZERO, |game, timers, _| check_in(game, timers));
}

fn schedule_next(timers: &mut TimerScheduler<Game>, delay: Duration) {
    tracing::debug!("[checkin] next check-in in {}s", delay.as_secs());
    timers.schedule(delay, |game, timers, _| check_in(game, timers));
}

fn check_in(game: &mut Game, timers: &mut TimerScheduler<Game>) {
    if !game.config.checkin.enabled {
        tracing::info!("[checkin] disabled, stopping");
        game.checkin.running = false;
        return;
    }

    let url = match checkin_url(&game.config, game.checkin.period()) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("[checkin] bad url {}: {}", game.config.checkin.url, e);
            game.checkin.running = false;
            return;
        }
    };
    let budget = Duration::from_secs(game.config.checkin.deadline_secs.max(1));

    game.bridge.run_async(
        "checkin",
        budget,
        move |deadline| async move {
            let client = reqwest::Client::builder()
                .timeout(deadline.remaining())
                .build()
                .map_err(|e| WorkError::Failed(e.to_string()))?;
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| WorkError::Failed(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(WorkError::Failed(format!("HTTP {}", status)));
            }
            response
                .text()
                .await
                .map_err(|e| WorkError::Failed(e.to_string()))
        },
        |game: &mut Game, timers: &mut TimerScheduler<Game>, result: WorkResult<String>| {
            consume_reply(game, timers, result)
        },
    );
}

fn consume_reply(game: &mut Game, timers: &mut TimerScheduler<Game>, result: WorkResult<String>) {
    match result {
        Ok(body) => {
            tracing::debug!("[checkin] reply {} bytes", body.len());
            if let Some(delay) = game.checkin.on_reply(&parse_reply(&body)) {
                schedule_next(timers, delay);
            }
        }
        Err(e) => {
            let delay = game.checkin.on_failure();
            tracing::warn!(
                "[checkin] failed ({} in a row): {}, retrying in {}s",
                game.checkin.failures(),
                e,
                delay.as_secs()
            );
            schedule_next(timers, delay);
        }
    }
}
