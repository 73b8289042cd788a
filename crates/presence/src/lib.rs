use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use fluux_core::event::{ContactStatus, PresenceShow};

/// Presence of one connected resource of a contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePresence {
    pub resource: String,
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: i8,
    /// XEP-0319 last user interaction, if advertised.
    pub last_interaction: Option<DateTime<Utc>>,
    /// Client software advertised by the resource (caps node).
    pub client: Option<String>,
    pub last_updated: DateTime<Utc>,
    /// Monotonic update order; wall-clock timestamps can collide.
    sequence: u64,
}

/// One inbound presence for `jid/resource`.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    /// Bare JID of the contact.
    pub jid: String,
    /// Empty when the presence came from the bare JID.
    pub resource: String,
    pub show: PresenceShow,
    pub priority: i8,
    pub status: Option<String>,
    pub last_interaction: Option<DateTime<Utc>>,
    pub client: Option<String>,
}

impl PresenceUpdate {
    pub fn new(jid: impl Into<String>, resource: impl Into<String>, show: PresenceShow) -> Self {
        Self {
            jid: jid.into(),
            resource: resource.into(),
            show,
            priority: 0,
            status: None,
            last_interaction: None,
            client: None,
        }
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_last_interaction(mut self, at: DateTime<Utc>) -> Self {
        self.last_interaction = Some(at);
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

/// The contact-level view derived from its resource table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedPresence {
    pub jid: String,
    pub status: ContactStatus,
    pub status_message: Option<String>,
    /// Resource the status was taken from; `None` when offline.
    pub resource: Option<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

impl AggregatedPresence {
    pub fn offline(jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            status: ContactStatus::Offline,
            status_message: None,
            resource: None,
            last_interaction: None,
        }
    }

    fn from_resource(jid: &str, resource: &ResourcePresence) -> Self {
        Self {
            jid: jid.to_string(),
            status: ContactStatus::from(resource.show),
            status_message: resource.status.clone(),
            resource: Some(resource.resource.clone()),
            last_interaction: resource.last_interaction,
        }
    }

    /// Whether two views differ in what the store displays.
    fn differs_from(&self, other: &AggregatedPresence) -> bool {
        self.status != other.status || self.status_message != other.status_message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOutcome {
    pub presence: AggregatedPresence,
    /// True only when status or status message changed.
    pub changed: bool,
}

#[derive(Debug, Default)]
struct ContactEntry {
    resources: HashMap<String, ResourcePresence>,
    error: Option<String>,
}

/// Per-contact resource tables. Bare JID -> (resource -> presence).
#[derive(Debug, Default)]
pub struct PresenceAggregator {
    contacts: HashMap<String, ContactEntry>,
    sequence: u64,
}

impl PresenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one resource's presence and recompute the contact view.
    ///
    /// `Unavailable` removes the resource; an unavailable presence from the
    /// bare JID (empty resource) removes every resource of the contact.
    pub fn apply_presence(&mut self, update: PresenceUpdate) -> PresenceOutcome {
        let before = self.aggregated(&update.jid);

        if matches!(update.show, PresenceShow::Unavailable) {
            if let Some(entry) = self.contacts.get_mut(&update.jid) {
                if update.resource.is_empty() {
                    entry.resources.clear();
                } else {
                    entry.resources.remove(&update.resource);
                }
                if entry.resources.is_empty() && entry.error.is_none() {
                    self.contacts.remove(&update.jid);
                }
            }
        } else {
            self.sequence += 1;
            let entry = self.contacts.entry(update.jid.clone()).or_default();
            entry.error = None;
            entry.resources.insert(
                update.resource.clone(),
                ResourcePresence {
                    resource: update.resource.clone(),
                    show: update.show,
                    status: update.status.clone(),
                    priority: update.priority,
                    last_interaction: update.last_interaction,
                    client: update.client.clone(),
                    last_updated: Utc::now(),
                    sequence: self.sequence,
                },
            );
        }

        let presence = self.aggregated(&update.jid);
        let changed = presence.differs_from(&before);
        debug!(
            jid = %update.jid,
            resource = %update.resource,
            show = ?update.show,
            priority = update.priority,
            status = %presence.status,
            changed,
            "presence applied"
        );

        PresenceOutcome { presence, changed }
    }

    /// Record a presence error (e.g. a failed subscription). The resource
    /// table is left untouched. Returns whether the stored error changed.
    pub fn apply_error(&mut self, jid: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let entry = self.contacts.entry(jid.to_string()).or_default();
        if entry.error.as_deref() == Some(error.as_str()) {
            return false;
        }
        debug!(jid = %jid, error = %error, "presence error recorded");
        entry.error = Some(error);
        true
    }

    pub fn presence_error(&self, jid: &str) -> Option<&str> {
        self.contacts
            .get(jid)
            .and_then(|entry| entry.error.as_deref())
    }

    pub fn aggregated(&self, jid: &str) -> AggregatedPresence {
        self.contacts
            .get(jid)
            .and_then(|entry| select_best_resource(entry.resources.values()))
            .map(|best| AggregatedPresence::from_resource(jid, best))
            .unwrap_or_else(|| AggregatedPresence::offline(jid))
    }

    /// Resources of a contact, best first.
    pub fn resources(&self, jid: &str) -> Vec<&ResourcePresence> {
        let mut resources: Vec<_> = self
            .contacts
            .get(jid)
            .map(|entry| entry.resources.values().collect())
            .unwrap_or_default();
        resources.sort_by(|a, b| rank(b).cmp(&rank(a)));
        resources
    }

    pub fn is_online(&self, jid: &str) -> bool {
        self.contacts
            .get(jid)
            .is_some_and(|entry| !entry.resources.is_empty())
    }

    /// Bare JIDs with at least one online resource.
    pub fn online_contacts(&self) -> impl Iterator<Item = &str> {
        self.contacts
            .iter()
            .filter(|(_, entry)| !entry.resources.is_empty())
            .map(|(jid, _)| jid.as_str())
    }

    /// Forget everything, e.g. when the session ends.
    pub fn clear(&mut self) {
        self.contacts.clear();
    }
}

fn rank(resource: &ResourcePresence) -> (i8, u64) {
    (resource.priority, resource.sequence)
}

/// Select the resource whose presence represents the contact: highest
/// priority, ties broken by most recent update. `None` for an empty table.
pub fn select_best_resource<'a>(
    resources: impl IntoIterator<Item = &'a ResourcePresence>,
) -> Option<&'a ResourcePresence> {
    resources
        .into_iter()
        .filter(|r| !matches!(r.show, PresenceShow::Unavailable))
        .max_by_key(|r| rank(r))
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    const ALICE: &str = "alice@example.com";

    fn available(resource: &str, priority: i8) -> PresenceUpdate {
        PresenceUpdate::new(ALICE, resource, PresenceShow::Available).with_priority(priority)
    }

    fn unavailable(resource: &str) -> PresenceUpdate {
        PresenceUpdate::new(ALICE, resource, PresenceShow::Unavailable)
    }

    #[test]
    fn unknown_contact_is_offline() {
        let aggregator = PresenceAggregator::new();
        let presence = aggregator.aggregated("nobody@example.com");
        assert_eq!(presence.status, ContactStatus::Offline);
        assert_eq!(presence.status_message, None);
        assert_eq!(presence.jid, "nobody@example.com");
    }

    #[test]
    fn first_presence_is_an_implicit_add() {
        let mut aggregator = PresenceAggregator::new();
        let outcome = aggregator.apply_presence(available("laptop", 0));

        assert!(outcome.changed);
        assert_eq!(outcome.presence.status, ContactStatus::Online);
        assert_eq!(outcome.presence.resource.as_deref(), Some("laptop"));
        assert!(aggregator.is_online(ALICE));
    }

    #[test]
    fn higher_priority_resource_wins() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away)
                .with_priority(10)
                .with_status("In a meeting"),
        );
        let outcome = aggregator.apply_presence(available("mobile", 5));

        assert_eq!(outcome.presence.status, ContactStatus::Away);
        assert_eq!(outcome.presence.resource.as_deref(), Some("desktop"));
        assert!(!outcome.changed, "lower priority resource must not change the view");
    }

    #[test]
    fn equal_priority_most_recent_update_wins() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("desktop", 5));
        let outcome = aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "mobile", PresenceShow::Dnd).with_priority(5),
        );
        assert_eq!(outcome.presence.status, ContactStatus::Dnd);
        assert_eq!(outcome.presence.resource.as_deref(), Some("mobile"));

        // Desktop refreshes its presence and becomes the most recent again.
        let outcome = aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Xa).with_priority(5),
        );
        assert_eq!(outcome.presence.status, ContactStatus::Xa);
        assert_eq!(outcome.presence.resource.as_deref(), Some("desktop"));
        assert!(outcome.changed);
    }

    #[test]
    fn availability_does_not_outrank_priority() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "phone", PresenceShow::Xa).with_priority(20),
        );
        let outcome = aggregator.apply_presence(available("desktop", 1));
        assert_eq!(outcome.presence.status, ContactStatus::Xa);
    }

    #[test]
    fn removing_last_resource_goes_offline_and_clears_message() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away).with_status("brb"),
        );

        let outcome = aggregator.apply_presence(unavailable("desktop"));
        assert!(outcome.changed);
        assert_eq!(outcome.presence, AggregatedPresence::offline(ALICE));
        assert!(!aggregator.is_online(ALICE));
    }

    #[test]
    fn every_sequence_ending_in_all_unavailable_is_offline() {
        let resources = ["desktop", "mobile", "tablet"];
        let shows = [
            PresenceShow::Available,
            PresenceShow::Chat,
            PresenceShow::Away,
            PresenceShow::Xa,
            PresenceShow::Dnd,
        ];

        for rotation in 0..resources.len() {
            let mut aggregator = PresenceAggregator::new();
            for (step, show) in shows.iter().enumerate() {
                let resource = resources[(step + rotation) % resources.len()];
                aggregator.apply_presence(
                    PresenceUpdate::new(ALICE, resource, *show)
                        .with_priority((step as i8) - 2)
                        .with_status(format!("step {step}")),
                );
            }
            // Leave in a rotated order; a repeated unavailable is harmless.
            for offset in 0..=resources.len() {
                let resource = resources[(offset + rotation) % resources.len()];
                aggregator.apply_presence(unavailable(resource));
            }

            let presence = aggregator.aggregated(ALICE);
            assert_eq!(presence.status, ContactStatus::Offline, "rotation {rotation}");
            assert_eq!(presence.status_message, None);
        }
    }

    #[test]
    fn bare_unavailable_removes_all_resources() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("desktop", 1));
        aggregator.apply_presence(available("mobile", 2));

        let outcome = aggregator.apply_presence(unavailable(""));
        assert_eq!(outcome.presence.status, ContactStatus::Offline);
        assert!(aggregator.resources(ALICE).is_empty());
    }

    #[test]
    fn unavailable_for_unknown_contact_is_not_a_change() {
        let mut aggregator = PresenceAggregator::new();
        let outcome = aggregator.apply_presence(unavailable("desktop"));
        assert!(!outcome.changed);
        assert_eq!(outcome.presence.status, ContactStatus::Offline);
    }

    #[test]
    fn identical_update_reports_unchanged() {
        let mut aggregator = PresenceAggregator::new();
        let update = PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away).with_status("lunch");
        assert!(aggregator.apply_presence(update.clone()).changed);
        assert!(!aggregator.apply_presence(update).changed);
    }

    #[test]
    fn status_message_change_alone_is_a_change() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away).with_status("lunch"),
        );
        let outcome = aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away).with_status("meeting"),
        );
        assert!(outcome.changed);
        assert_eq!(outcome.presence.status_message.as_deref(), Some("meeting"));
    }

    #[test]
    #[traced_test]
    fn presence_error_leaves_resource_table_untouched() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("desktop", 0));

        assert!(aggregator.apply_error(ALICE, "forbidden"));
        assert!(!aggregator.apply_error(ALICE, "forbidden"));
        assert_eq!(aggregator.presence_error(ALICE), Some("forbidden"));
        assert_eq!(aggregator.aggregated(ALICE).status, ContactStatus::Online);
        assert_eq!(aggregator.resources(ALICE).len(), 1);
        assert!(logs_contain("presence error recorded"));
    }

    #[test]
    fn presence_error_for_unknown_contact_keeps_it_offline() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_error("bob@example.com", "remote-server-not-found");
        assert_eq!(
            aggregator.aggregated("bob@example.com").status,
            ContactStatus::Offline
        );
        assert_eq!(
            aggregator.presence_error("bob@example.com"),
            Some("remote-server-not-found")
        );
        assert!(aggregator.online_contacts().next().is_none());
    }

    #[test]
    fn available_presence_clears_previous_error() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_error(ALICE, "forbidden");
        aggregator.apply_presence(available("desktop", 0));
        assert_eq!(aggregator.presence_error(ALICE), None);
    }

    #[test]
    fn alice_desktop_and_mobile_scenario() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("mobile", 5));
        let outcome = aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away)
                .with_priority(10)
                .with_status("In a meeting"),
        );
        assert_eq!(outcome.presence.status, ContactStatus::Away);
        assert_eq!(outcome.presence.status_message.as_deref(), Some("In a meeting"));

        let outcome = aggregator.apply_presence(unavailable("desktop"));
        assert!(outcome.changed);
        assert_eq!(outcome.presence.status, ContactStatus::Online);
        assert_eq!(outcome.presence.status_message, None);
        assert_eq!(outcome.presence.resource.as_deref(), Some("mobile"));
    }

    #[test]
    fn resources_are_listed_best_first() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("low", -5));
        aggregator.apply_presence(available("high", 50));
        aggregator.apply_presence(available("mid", 0).with_client("https://gajim.org"));

        let order: Vec<_> = aggregator
            .resources(ALICE)
            .into_iter()
            .map(|r| r.resource.as_str())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert_eq!(
            aggregator.resources(ALICE)[1].client.as_deref(),
            Some("https://gajim.org")
        );
    }

    #[test]
    fn contacts_are_tracked_independently() {
        let mut aggregator = PresenceAggregator::new();
        aggregator.apply_presence(available("desktop", 0));
        aggregator.apply_presence(PresenceUpdate::new(
            "bob@example.com",
            "phone",
            PresenceShow::Dnd,
        ));

        assert_eq!(aggregator.aggregated(ALICE).status, ContactStatus::Online);
        assert_eq!(
            aggregator.aggregated("bob@example.com").status,
            ContactStatus::Dnd
        );

        aggregator.clear();
        assert!(aggregator.online_contacts().next().is_none());
    }

    #[test]
    fn select_best_resource_empty_is_none() {
        let empty: Vec<ResourcePresence> = Vec::new();
        assert!(select_best_resource(&empty).is_none());
    }

    #[test]
    fn last_interaction_follows_selected_resource() {
        let idle_since = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut aggregator = PresenceAggregator::new();
        let outcome = aggregator.apply_presence(
            PresenceUpdate::new(ALICE, "desktop", PresenceShow::Away)
                .with_last_interaction(idle_since),
        );
        assert_eq!(outcome.presence.last_interaction, Some(idle_since));
    }
}
