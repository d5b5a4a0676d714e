use crate::protocol::{auto_poll_request, AutoPollParams, Request};

pub const GROUP_COUNT: usize = 4;
pub const DEFAULT_POLL_RATE_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeGroup {
    pub id: String,
    pub poll_rate_seconds: f64,
    pub auto_poll_active: bool,
}

// The four change groups of one client. `auto_poll_active` only ever goes
// from false to true; a fresh registry is the only way back.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    groups: [ChangeGroup; GROUP_COUNT],
}

impl SubscriptionRegistry {
    pub fn new(poll_rates: [f64; GROUP_COUNT]) -> Self {
        let groups = std::array::from_fn(|i| ChangeGroup {
            id: group_id(i),
            poll_rate_seconds: poll_rates[i],
            auto_poll_active: false,
        });
        Self { groups }
    }

    pub fn enable_auto_poll(&mut self, index: usize) -> Option<Request<AutoPollParams>> {
        let group = self.groups.get_mut(index)?;
        if group.auto_poll_active {
            return None;
        }
        group.auto_poll_active = true;
        Some(auto_poll_request(&group.id, group.poll_rate_seconds))
    }

    pub fn group(&self, index: usize) -> Option<&ChangeGroup> {
        self.groups.get(index)
    }

    pub fn groups(&self) -> &[ChangeGroup] {
        &self.groups
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new([DEFAULT_POLL_RATE_SECONDS; GROUP_COUNT])
    }
}

pub fn group_id(index: usize) -> String {
    format!("group {}", index + 1)
}
