//! Event type routing.
//!
//! A subscription lists event type patterns. A pattern is either an exact
//! event type (`user.created`), a prefix ending in `*` (`blog.*`), or the
//! catch-all `*`. A subscription with no patterns receives nothing.

use hookline_core::Subscription;

/// Whether a single pattern selects `event_type`.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// Whether an active subscription wants events of `event_type`.
pub fn subscription_matches(subscription: &Subscription, event_type: &str) -> bool {
    subscription.active
        && subscription.event_types.iter().any(|pattern| pattern_matches(pattern, event_type))
}

/// Selects the subscriptions that should receive an event.
pub fn match_subscriptions<'a, I>(event_type: &str, subscriptions: I) -> Vec<&'a Subscription>
where
    I: IntoIterator<Item = &'a Subscription>,
{
    subscriptions.into_iter().filter(|s| subscription_matches(s, event_type)).collect()
}
