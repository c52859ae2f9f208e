use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior, Sleep};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    Ping,
    Expired,
}

/// Pinger and watchdog for one open transport. Dropping it cancels both.
pub struct HeartbeatMonitor {
    timeout: Duration,
    pinger: Interval,
    watchdog: Pin<Box<Sleep>>,
}

impl HeartbeatMonitor {
    /// Starts both timers. The first ping is due one full interval from now.
    pub fn start(config: HeartbeatConfig) -> Self {
        let ping_interval = config.ping_interval.max(Duration::from_millis(1));
        let now = Instant::now();
        let mut pinger = interval_at(now + ping_interval, ping_interval);
        pinger.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            timeout: config.timeout,
            pinger,
            watchdog: Box::pin(sleep_until(now + config.timeout)),
        }
    }

    /// Re-arms the watchdog for a full window. Call on every server heartbeat.
    pub fn reset_watchdog(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.watchdog.as_mut().reset(deadline);
    }

    pub fn watchdog_deadline(&self) -> Instant {
        self.watchdog.deadline()
    }

    /// Waits for the next timer event. Cancel-safe, so it can sit in a
    /// `select!` next to transport reads. When both are due, expiry wins.
    pub async fn tick(&mut self) -> HeartbeatTick {
        tokio::select! {
            biased;
            _ = self.watchdog.as_mut() => HeartbeatTick::Expired,
            _ = self.pinger.tick() => HeartbeatTick::Ping,
        }
    }
}
