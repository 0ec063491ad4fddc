//! Simulated replies
//!
//! Answers every local send with a canned response after a short delay, through the
//! injection scheduler so pending replies can be cancelled like any other injection.

use crate::config::AutoReplyConfig;
use crate::injection::{InjectionHandle, InjectionScheduler};
use crate::model::MessageId;
use crate::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Schedules a canned reply after each send
#[derive(Clone)]
pub struct AutoResponder {
    scheduler: InjectionScheduler,
    config: AutoReplyConfig,
}

impl AutoResponder {
    pub fn new(scheduler: InjectionScheduler, config: AutoReplyConfig) -> Self {
        Self { scheduler, config }
    }

    /// Responder using the engine's own auto-reply settings
    pub fn from_scheduler(scheduler: InjectionScheduler) -> Self {
        let config = scheduler.engine().config().auto_reply.clone();
        Self::new(scheduler, config)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.responses().next().is_some()
    }

    pub fn scheduler(&self) -> &InjectionScheduler {
        &self.scheduler
    }

    /// Schedule a reply from `contact_id`; `None` when disabled
    pub fn reply_to(&self, contact_id: &str) -> Result<Option<InjectionHandle>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let (text, delay) = {
            let mut rng = rand::thread_rng();
            let candidates: Vec<&str> = self.responses().collect();
            let text = candidates
                .choose(&mut rng)
                .map(|s| s.to_string())
                .unwrap_or_default();
            (text, pick_delay(&self.config, &mut rng))
        };

        debug!(%contact_id, delay_ms = delay.as_millis() as u64, "Scheduling auto-reply");
        self.scheduler.schedule(contact_id, text, delay).map(Some)
    }

    /// Send a message and schedule the reply to it
    pub fn send_and_reply(
        &self,
        contact_id: &str,
        text: &str,
    ) -> Result<(MessageId, Option<InjectionHandle>)> {
        let message_id = self.scheduler.engine().send_message(contact_id, text)?;
        let reply = self.reply_to(contact_id)?;
        Ok((message_id, reply))
    }

    fn responses(&self) -> impl Iterator<Item = &str> {
        self.config
            .responses
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
    }
}

/// Uniform delay within the configured range
fn pick_delay(config: &AutoReplyConfig, rng: &mut impl Rng) -> Duration {
    let min = config.min_delay_ms;
    let max = config.max_delay_ms.max(min);
    Duration::from_millis(rng.gen_range(min..=max))
}
