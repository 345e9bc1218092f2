//! Channel keys and join bookkeeping.
//!
//! Joins are never acknowledged by the server, so the registry records
//! intent: which keys some feature currently wants, how many features want
//! each, and which payloads they joined with. The client replays that intent
//! after every (re)connect.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::messages::Envelope;

/// Order chat channel key.
pub const ORDERS_CHANNEL: &str = "orders";

/// Account channel key.
pub const USER_CHANNEL: &str = "users/me";

/// Exchange-rate channel key: `exchange_rates/{buy}` or
/// `exchange_rates/{buy}/{for}`.
#[must_use]
pub fn exchange_rate_channel(buy: &str, for_currency: Option<&str>) -> String {
    match for_currency {
        Some(for_currency) => format!("exchange_rates/{buy}/{for_currency}"),
        None => format!("exchange_rates/{buy}"),
    }
}

/// Advert list channel key.
#[must_use]
pub fn advert_channel(account_currency: &str, local_currency: &str, advert_type: AdvertType) -> String {
    format!("adverts/currency/{account_currency}/{local_currency}/{advert_type}")
}

/// Side of an advert list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertType {
    /// Adverts offering to buy.
    Buy,
    /// Adverts offering to sell.
    Sell,
}

impl AdvertType {
    /// Parses `buy` or `sell`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdvertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Known channel shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Order chat.
    Orders,

    /// Live exchange rate for a currency, optionally against one other.
    ExchangeRates {
        /// Currency being bought.
        buy: String,
        /// Counter currency.
        for_currency: Option<String>,
    },

    /// Advert list updates.
    Adverts {
        /// Account currency.
        account_currency: String,
        /// Local currency.
        local_currency: String,
        /// List side.
        advert_type: AdvertType,
    },

    /// Account push notifications.
    User,
}

impl Channel {
    /// Parses a channel key.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            ORDERS_CHANNEL => return Some(Self::Orders),
            USER_CHANNEL => return Some(Self::User),
            _ => {}
        }

        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            ["exchange_rates", buy] if !buy.is_empty() => Some(Self::ExchangeRates {
                buy: (*buy).to_string(),
                for_currency: None,
            }),
            ["exchange_rates", buy, for_currency] if !buy.is_empty() && !for_currency.is_empty() => {
                Some(Self::ExchangeRates {
                    buy: (*buy).to_string(),
                    for_currency: Some((*for_currency).to_string()),
                })
            }
            ["adverts", "currency", account, local, advert_type]
                if !account.is_empty() && !local.is_empty() =>
            {
                Some(Self::Adverts {
                    account_currency: (*account).to_string(),
                    local_currency: (*local).to_string(),
                    advert_type: AdvertType::parse(advert_type)?,
                })
            }
            _ => None,
        }
    }

    /// Returns the channel family as a string.
    #[must_use]
    pub const fn channel_type(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::ExchangeRates { .. } => "exchange_rates",
            Self::Adverts { .. } => "adverts",
            Self::User => "users",
        }
    }

    /// Returns true if joining needs an authenticated socket.
    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        matches!(self, Self::Orders | Self::User)
    }

    /// Returns the wire key.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orders => f.write_str(ORDERS_CHANNEL),
            Self::ExchangeRates { buy, for_currency } => {
                f.write_str(&exchange_rate_channel(buy, for_currency.as_deref()))
            }
            Self::Adverts {
                account_currency,
                local_currency,
                advert_type,
            } => f.write_str(&advert_channel(
                account_currency,
                local_currency,
                *advert_type,
            )),
            Self::User => f.write_str(USER_CHANNEL),
        }
    }
}

/// What happened to a channel on `leave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Nobody held the channel.
    NotJoined,
    /// Other holders remain; no leave frame is due.
    Released {
        /// Holders still wanting the channel.
        remaining: usize,
    },
    /// The last holder left.
    Left,
}

impl LeaveOutcome {
    /// Returns true if a `leave` frame should go on the wire.
    #[must_use]
    pub const fn sends_leave(&self) -> bool {
        !matches!(self, Self::Released { .. })
    }
}

/// Join intent for one channel key. Holds one payload per holder.
#[derive(Debug, Clone, Default, PartialEq)]
struct Membership {
    holders: usize,
    payloads: Vec<Value>,
    push_requests: usize,
}

/// Reference-counted join intent per channel key.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    memberships: Mutex<BTreeMap<String, Membership>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Membership>> {
        self.memberships.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one more holder of `channel`. Returns the holder count.
    pub fn join(&self, channel: &str, payload: &Value) -> usize {
        let mut memberships = self.lock();
        let membership = memberships.entry(channel.to_string()).or_default();
        membership.holders += 1;
        membership.payloads.push(payload.clone());
        membership.holders
    }

    /// Releases one holder of `channel`.
    ///
    /// When `payload` is given, the holder that joined with it is released;
    /// otherwise the most recent holder is.
    pub fn leave(&self, channel: &str, payload: Option<&Value>) -> LeaveOutcome {
        let mut memberships = self.lock();
        let Some(membership) = memberships.get_mut(channel) else {
            return LeaveOutcome::NotJoined;
        };

        let position = payload
            .and_then(|payload| membership.payloads.iter().rposition(|held| held == payload));
        match position {
            Some(index) => {
                membership.payloads.remove(index);
            }
            None => {
                membership.payloads.pop();
            }
        }
        membership.holders = membership.holders.saturating_sub(1);
        if membership.holders == 0 {
            memberships.remove(channel);
            LeaveOutcome::Left
        } else {
            LeaveOutcome::Released {
                remaining: membership.holders,
            }
        }
    }

    /// Records one more request for push updates on a joined channel.
    ///
    /// Returns the request count, or `None` if the channel is not joined.
    pub fn request_push(&self, channel: &str) -> Option<usize> {
        let mut memberships = self.lock();
        let membership = memberships.get_mut(channel)?;
        membership.push_requests += 1;
        Some(membership.push_requests)
    }

    /// Releases one push request. Returns the requests still outstanding.
    pub fn release_push(&self, channel: &str) -> usize {
        match self.lock().get_mut(channel) {
            Some(membership) => {
                membership.push_requests = membership.push_requests.saturating_sub(1);
                membership.push_requests
            }
            None => 0,
        }
    }

    /// Returns true if push updates are wanted on `channel`.
    #[must_use]
    pub fn push_updates(&self, channel: &str) -> bool {
        self.lock()
            .get(channel)
            .is_some_and(|membership| membership.push_requests > 0)
    }

    /// Returns the number of holders of `channel`.
    #[must_use]
    pub fn holders(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map_or(0, |membership| membership.holders)
    }

    /// Returns true if any feature holds `channel`.
    #[must_use]
    pub fn is_joined(&self, channel: &str) -> bool {
        self.holders(channel) > 0
    }

    /// Returns the joined channel keys.
    #[must_use]
    pub fn joined_channels(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Frames that restore every held channel on a fresh socket.
    #[must_use]
    pub fn resync_envelopes(&self) -> Vec<Envelope> {
        let memberships = self.lock();
        let mut envelopes = Vec::new();
        for (channel, membership) in memberships.iter() {
            for (index, payload) in membership.payloads.iter().enumerate() {
                if !membership.payloads[..index].contains(payload) {
                    envelopes.push(Envelope::join(channel.clone(), payload.clone()));
                }
            }
            if membership.push_requests > 0 {
                envelopes.push(Envelope::subscribe(channel.clone()));
            }
        }
        envelopes
    }

    /// Forgets all intent.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ws::messages::Action;

    #[test]
    fn test_exchange_rate_channel() {
        assert_eq!(exchange_rate_channel("USD", Some("IDR")), "exchange_rates/USD/IDR");
        assert_eq!(exchange_rate_channel("USD", None), "exchange_rates/USD");
    }

    #[test]
    fn test_advert_channel() {
        assert_eq!(
            advert_channel("USD", "IDR", AdvertType::Sell),
            "adverts/currency/USD/IDR/sell"
        );
    }

    #[test]
    fn test_channel_parse_known_keys() {
        assert_eq!(Channel::parse("orders"), Some(Channel::Orders));
        assert_eq!(Channel::parse("users/me"), Some(Channel::User));
        assert_eq!(
            Channel::parse("exchange_rates/USD"),
            Some(Channel::ExchangeRates {
                buy: "USD".to_string(),
                for_currency: None,
            })
        );
        assert_eq!(
            Channel::parse("adverts/currency/USD/IDR/buy"),
            Some(Channel::Adverts {
                account_currency: "USD".to_string(),
                local_currency: "IDR".to_string(),
                advert_type: AdvertType::Buy,
            })
        );
    }

    #[test]
    fn test_channel_parse_invalid() {
        assert_eq!(Channel::parse("exchange_rates"), None);
        assert_eq!(Channel::parse("exchange_rates//IDR"), None);
        assert_eq!(Channel::parse("adverts/currency/USD/IDR/hold"), None);
        assert_eq!(Channel::parse("users/other"), None);
    }

    #[test]
    fn test_channel_to_string_round_trip() {
        let channel = Channel::ExchangeRates {
            buy: "USD".to_string(),
            for_currency: Some("IDR".to_string()),
        };
        assert_eq!(channel.key(), "exchange_rates/USD/IDR");
        assert_eq!(Channel::parse(&channel.key()), Some(channel));
    }

    #[test]
    fn test_channel_requires_auth() {
        assert!(Channel::Orders.requires_auth());
        assert!(Channel::User.requires_auth());
        assert!(!Channel::ExchangeRates {
            buy: "USD".to_string(),
            for_currency: None,
        }
        .requires_auth());
        assert_eq!(Channel::User.channel_type(), "users");
    }

    #[test]
    fn test_registry_ref_counts() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.join("orders", &json!({ "order_id": 1 })), 1);
        assert_eq!(registry.join("orders", &json!({ "order_id": 2 })), 2);

        assert_eq!(
            registry.leave("orders", None),
            LeaveOutcome::Released { remaining: 1 }
        );
        assert!(registry.is_joined("orders"));
        assert_eq!(registry.leave("orders", None), LeaveOutcome::Left);
        assert!(!registry.is_joined("orders"));
        assert_eq!(registry.leave("orders", None), LeaveOutcome::NotJoined);
    }

    #[test]
    fn test_registry_resync_tracks_live_holders_after_churn() {
        let registry = ChannelRegistry::new();
        registry.join("orders", &json!({ "order_id": 1 }));
        for order_id in 2..=50 {
            registry.join("orders", &json!({ "order_id": order_id }));
            registry.leave("orders", None);
        }

        assert_eq!(registry.holders("orders"), 1);
        assert_eq!(
            registry.resync_envelopes(),
            vec![Envelope::join("orders", json!({ "order_id": 1 }))]
        );
    }

    #[test]
    fn test_registry_leave_releases_named_payload() {
        let registry = ChannelRegistry::new();
        registry.join("orders", &json!({ "order_id": 1 }));
        registry.join("orders", &json!({ "order_id": 2 }));
        registry.join("orders", &json!({ "order_id": 3 }));

        assert_eq!(
            registry.leave("orders", Some(&json!({ "order_id": 2 }))),
            LeaveOutcome::Released { remaining: 2 }
        );
        assert_eq!(
            registry.resync_envelopes(),
            vec![
                Envelope::join("orders", json!({ "order_id": 1 })),
                Envelope::join("orders", json!({ "order_id": 3 })),
            ]
        );

        // Unknown payload still releases one holder.
        registry.leave("orders", Some(&json!({ "order_id": 9 })));
        assert_eq!(
            registry.resync_envelopes(),
            vec![Envelope::join("orders", json!({ "order_id": 1 }))]
        );
    }

    #[test]
    fn test_registry_shared_payload_survives_partial_leave() {
        let registry = ChannelRegistry::new();
        registry.join("orders", &json!({ "order_id": 1 }));
        registry.join("orders", &json!({ "order_id": 1 }));
        registry.leave("orders", Some(&json!({ "order_id": 1 })));

        assert_eq!(registry.holders("orders"), 1);
        assert_eq!(registry.resync_envelopes().len(), 1);
    }

    #[test]
    fn test_leave_outcome_sends_leave() {
        assert!(LeaveOutcome::Left.sends_leave());
        assert!(LeaveOutcome::NotJoined.sends_leave());
        assert!(!LeaveOutcome::Released { remaining: 1 }.sends_leave());
    }

    #[test]
    fn test_registry_resync_envelopes() {
        let registry = ChannelRegistry::new();
        registry.join("orders", &json!({ "order_id": 1 }));
        registry.join("orders", &json!({ "order_id": 1 }));
        registry.join("users/me", &json!({}));
        assert_eq!(registry.request_push("users/me"), Some(1));

        let envelopes = registry.resync_envelopes();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0], Envelope::join("orders", json!({ "order_id": 1 })));
        assert_eq!(envelopes[1], Envelope::join("users/me", json!({})));
        assert_eq!(envelopes[2].action, Action::Subscribe);
        assert_eq!(envelopes[2].channel(), Some("users/me"));
    }

    #[test]
    fn test_registry_push_requires_join() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.request_push("users/me"), None);
        assert!(!registry.push_updates("users/me"));
    }

    #[test]
    fn test_registry_push_ref_counts() {
        let registry = ChannelRegistry::new();
        registry.join("users/me", &json!({}));
        registry.request_push("users/me");
        registry.request_push("users/me");
        assert_eq!(registry.release_push("users/me"), 1);
        assert!(registry.push_updates("users/me"));
        assert_eq!(registry.release_push("users/me"), 0);
        assert!(!registry.push_updates("users/me"));
        assert_eq!(registry.release_push("users/me"), 0);
    }

    #[test]
    fn test_registry_joined_channels_and_clear() {
        let registry = ChannelRegistry::new();
        registry.join("users/me", &json!({}));
        registry.join("exchange_rates/USD", &json!({}));
        assert_eq!(
            registry.joined_channels(),
            vec!["exchange_rates/USD".to_string(), "users/me".to_string()]
        );
        registry.clear();
        assert!(registry.joined_channels().is_empty());
    }
}
